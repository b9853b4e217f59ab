//! Media storage services.
//!
//! Large payloads are moved here by the externalizer and fetched back by the
//! loader. References are opaque strings: `mem://<n>` for the in-memory
//! store and `file://<id>` for the filesystem store.

use crate::types::{MediaContent, MediaSource};
use crate::{Result, TurnError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Where a stored payload came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub conversation_id: String,
    pub message_index: usize,
    pub part_index: usize,
    pub mime_type: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MediaStorageService: Send + Sync {
    /// Persist an inline payload and return its reference
    async fn store(&self, media: &MediaContent, metadata: &MediaMetadata) -> Result<String>;

    /// Fetch a payload back as inline media
    async fn retrieve(&self, reference: &str) -> Result<MediaContent>;
}

fn inline_payload(media: &MediaContent) -> Result<&str> {
    media
        .inline_data()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| TurnError::Storage("only inline media with data can be stored".into()))
}

/// DashMap-backed store, shared across turns
#[derive(Default)]
pub struct InMemoryMediaStore {
    items: DashMap<String, (MediaContent, MediaMetadata)>,
    next_id: AtomicU64,
}

impl InMemoryMediaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn metadata(&self, reference: &str) -> Option<MediaMetadata> {
        self.items.get(reference).map(|e| e.value().1.clone())
    }
}

#[async_trait]
impl MediaStorageService for InMemoryMediaStore {
    async fn store(&self, media: &MediaContent, metadata: &MediaMetadata) -> Result<String> {
        inline_payload(media)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let reference = format!("mem://{id}");
        self.items
            .insert(reference.clone(), (media.clone(), metadata.clone()));
        Ok(reference)
    }

    async fn retrieve(&self, reference: &str) -> Result<MediaContent> {
        self.items
            .get(reference)
            .map(|e| e.value().0.clone())
            .ok_or_else(|| TurnError::Storage(format!("media reference not found: {reference}")))
    }
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    mime_type: String,
    metadata: MediaMetadata,
}

/// Filesystem store: raw payload at `<root>/<id>.bin`, JSON sidecar at `<root>/<id>.json`
pub struct FileMediaStore {
    root: PathBuf,
    next_id: AtomicU64,
}

impl FileMediaStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Arc::new(Self {
            root,
            next_id: AtomicU64::new(0),
        }))
    }

    fn id_from_reference(reference: &str) -> Result<&str> {
        let id = reference
            .strip_prefix("file://")
            .ok_or_else(|| TurnError::Storage(format!("not a file store reference: {reference}")))?;
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TurnError::Storage(format!("invalid media reference: {reference}")));
        }
        Ok(id)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[async_trait]
impl MediaStorageService for FileMediaStore {
    async fn store(&self, media: &MediaContent, metadata: &MediaMetadata) -> Result<String> {
        let data = inline_payload(media)?;
        let bytes = STANDARD
            .decode(data)
            .map_err(|e| TurnError::Storage(format!("invalid base64 payload: {e}")))?;

        let id = format!(
            "{}-{}-{}-{}-{}",
            sanitize(&metadata.conversation_id),
            metadata.message_index,
            metadata.part_index,
            metadata.timestamp.timestamp_millis(),
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let sidecar = Sidecar {
            mime_type: media.mime_type.clone().unwrap_or_else(|| metadata.mime_type.clone()),
            metadata: metadata.clone(),
        };
        tokio::fs::write(self.root.join(format!("{id}.bin")), &bytes).await?;
        tokio::fs::write(
            self.root.join(format!("{id}.json")),
            serde_json::to_vec_pretty(&sidecar)?,
        )
        .await?;
        debug!(target: "media_storage", id = %id, bytes = bytes.len(), "Stored media payload");
        Ok(format!("file://{id}"))
    }

    async fn retrieve(&self, reference: &str) -> Result<MediaContent> {
        let id = Self::id_from_reference(reference)?;
        let bytes = tokio::fs::read(self.root.join(format!("{id}.bin")))
            .await
            .map_err(|e| TurnError::Storage(format!("{reference}: {e}")))?;
        let sidecar: Sidecar = serde_json::from_slice(
            &tokio::fs::read(self.root.join(format!("{id}.json")))
                .await
                .map_err(|e| TurnError::Storage(format!("{reference}: {e}")))?,
        )?;
        Ok(MediaContent {
            source: MediaSource::Inline(STANDARD.encode(bytes)),
            mime_type: Some(sidecar.mime_type),
            detail: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MediaMetadata {
        MediaMetadata {
            conversation_id: "conv/1".into(),
            message_index: 3,
            part_index: 0,
            mime_type: "image/png".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = InMemoryMediaStore::new();
        let media = MediaContent::inline("aGVsbG8=", "image/png");
        let reference = store.store(&media, &meta()).await.unwrap();
        assert!(reference.starts_with("mem://"));
        assert_eq!(store.retrieve(&reference).await.unwrap(), media);
        assert_eq!(store.metadata(&reference).unwrap().message_index, 3);
        assert!(store.retrieve("mem://999").await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_reference_checks() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMediaStore::open(dir.path()).await.unwrap();
        let media = MediaContent::inline("aGVsbG8=", "image/png");

        let reference = store.store(&media, &meta()).await.unwrap();
        let back = store.retrieve(&reference).await.unwrap();
        assert_eq!(back.inline_data(), Some("aGVsbG8="));
        assert_eq!(back.mime_type.as_deref(), Some("image/png"));

        assert!(store.retrieve("file://../etc/passwd").await.is_err());
        assert!(store.retrieve("mem://0").await.is_err());
    }

    #[tokio::test]
    async fn test_store_rejects_non_inline() {
        let store = InMemoryMediaStore::new();
        let media = MediaContent::new(MediaSource::Url("https://x.test/a.png".into()));
        assert!(store.store(&media, &meta()).await.is_err());
    }
}
