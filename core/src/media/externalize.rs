//! Moves large inline payloads to media storage before state is persisted.

use super::error::MediaError;
use super::storage::{MediaMetadata, MediaStorageService};
use crate::pipeline::{keys, Stage, StageInput, StageKind, StageOutput};
use crate::types::{MediaContent, MediaSource, Message};
use crate::{Result, TurnError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalizerConfig {
    pub enabled: bool,
    /// Minimum decoded size in KB; 0 externalizes every inline payload
    pub threshold_kb: u64,
}

impl Default for ExternalizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_kb: 100,
        }
    }
}

/// Decoded size estimate of a base64 payload, in KB
fn estimated_kb(data: &str) -> u64 {
    (data.len() as u64 * 3 / 4) / 1024
}

pub struct MediaExternalizer {
    config: ExternalizerConfig,
    storage: Arc<dyn MediaStorageService>,
}

impl MediaExternalizer {
    pub fn new(config: ExternalizerConfig, storage: Arc<dyn MediaStorageService>) -> Self {
        Self { config, storage }
    }

    pub fn config(&self) -> &ExternalizerConfig {
        &self.config
    }

    pub fn should_externalize(&self, media: &MediaContent) -> bool {
        match media.inline_data() {
            Some(data) if !data.is_empty() => {
                self.config.threshold_kb == 0 || estimated_kb(data) >= self.config.threshold_kb
            }
            _ => false,
        }
    }

    /// Replace large inline parts of `message` with storage references.
    /// Returns how many parts were moved.
    pub async fn externalize_message(
        &self,
        message: &mut Message,
        conversation_id: &str,
        message_index: usize,
    ) -> std::result::Result<usize, MediaError> {
        let mut moved = 0;
        for (part_index, part) in message.parts.iter_mut().enumerate() {
            let ct = part.content_type();
            let Some(media) = part.media_mut() else {
                continue;
            };
            if !self.should_externalize(media) {
                continue;
            }

            let mime = media.mime_type.clone().unwrap_or_default();
            let metadata = MediaMetadata {
                conversation_id: conversation_id.to_string(),
                message_index,
                part_index,
                mime_type: mime.clone(),
                timestamp: Utc::now(),
            };
            let reference = self.storage.store(media, &metadata).await.map_err(|e| {
                MediaError::storage(
                    part_index,
                    ct.as_str(),
                    &media.source.describe(),
                    format!("failed to externalize media at message {message_index}: {e}"),
                )
            })?;
            debug!(target: "media_externalizer", message_index, part_index, reference = %reference, "Externalized media");
            media.source = MediaSource::Storage(reference);
            moved += 1;
        }
        Ok(moved)
    }

    /// Fetch storage references in `message` back into inline data
    pub async fn reinline_message(&self, message: &mut Message) -> std::result::Result<usize, MediaError> {
        let mut restored = 0;
        for (part_index, part) in message.parts.iter_mut().enumerate() {
            let ct = part.content_type();
            let Some(media) = part.media_mut() else {
                continue;
            };
            let MediaSource::Storage(reference) = &media.source else {
                continue;
            };
            let fetched = self.storage.retrieve(reference).await.map_err(|e| {
                MediaError::storage(part_index, ct.as_str(), reference, format!("failed to retrieve from storage: {e}"))
            })?;
            let Some(data) = fetched.inline_data().filter(|d| !d.is_empty()) else {
                return Err(MediaError::validation(
                    part_index,
                    ct.as_str(),
                    reference,
                    "storage returned media without data",
                ));
            };
            media.source = MediaSource::Inline(data.to_string());
            if media.mime_type.is_none() {
                media.mime_type = fetched.mime_type.clone();
            }
            restored += 1;
        }
        Ok(restored)
    }
}

/// Externalizes large media in this turn's messages.
///
/// History messages are forwarded untouched; they were externalized when
/// their own turn ran. A storage failure fails the turn.
pub struct MediaExternalizerStage {
    externalizer: Option<MediaExternalizer>,
}

impl MediaExternalizerStage {
    pub fn new(externalizer: MediaExternalizer) -> Self {
        Self {
            externalizer: Some(externalizer),
        }
    }

    /// Stage that forwards everything unchanged
    pub fn disabled() -> Self {
        Self { externalizer: None }
    }
}

#[async_trait]
impl Stage for MediaExternalizerStage {
    fn name(&self) -> &str {
        "media_externalizer"
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        let externalizer = match &self.externalizer {
            Some(e) if e.config.enabled => e,
            _ => {
                while let Some(elem) = input.recv().await {
                    output.send(elem).await?;
                }
                return Ok(());
            }
        };

        let mut message_index = 0;
        let mut total = 0;
        while let Some(mut elem) = input.recv().await {
            let from_history = elem.is_from_history();
            let conversation_id = elem.metadata_str(keys::CONVERSATION_ID).unwrap_or_default().to_string();
            if let Some(msg) = elem.message.as_mut() {
                if !from_history {
                    match externalizer.externalize_message(msg, &conversation_id, message_index).await {
                        Ok(n) => total += n,
                        Err(e) => {
                            error!(target: "media_externalizer", error = %e, "Failed to externalize media");
                            return Err(TurnError::Media(e));
                        }
                    }
                }
                message_index += 1;
            }
            output.send(elem).await?;
        }
        if total > 0 {
            info!(target: "media_externalizer", parts = total, "Moved inline media to storage");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::InMemoryMediaStore;
    use crate::pipeline::{Pipeline, StreamElement};
    use crate::types::ContentPart;
    use serde_json::json;

    fn big_image(kb: usize) -> ContentPart {
        // 4 base64 chars decode to 3 bytes
        ContentPart::Image {
            media: MediaContent::inline("A".repeat(kb * 1024 * 4 / 3 + 4), "image/png"),
        }
    }

    #[tokio::test]
    async fn test_threshold_decides_what_moves() {
        let store = InMemoryMediaStore::new();
        let ext = MediaExternalizer::new(ExternalizerConfig::default(), store.clone());
        let mut msg = Message::assistant("").with_parts(vec![
            ContentPart::text("here"),
            big_image(150),
            big_image(10),
        ]);

        assert_eq!(ext.externalize_message(&mut msg, "c1", 2).await.unwrap(), 1);
        assert!(matches!(msg.parts[1].media().unwrap().source, MediaSource::Storage(_)));
        assert!(msg.parts[2].media().unwrap().inline_data().is_some());
        assert_eq!(store.len(), 1);

        // Already referenced parts are skipped
        assert_eq!(ext.externalize_message(&mut msg, "c1", 2).await.unwrap(), 0);

        let MediaSource::Storage(reference) = &msg.parts[1].media().unwrap().source else {
            unreachable!()
        };
        let meta = store.metadata(reference).unwrap();
        assert_eq!((meta.message_index, meta.part_index), (2, 1));
        assert_eq!(meta.conversation_id, "c1");
    }

    #[tokio::test]
    async fn test_reinline_restores_payload() {
        let store = InMemoryMediaStore::new();
        let ext = MediaExternalizer::new(
            ExternalizerConfig {
                threshold_kb: 0,
                ..Default::default()
            },
            store,
        );
        let original = Message::assistant("").with_parts(vec![big_image(1)]);
        let mut msg = original.clone();
        ext.externalize_message(&mut msg, "c", 0).await.unwrap();
        assert_ne!(msg, original);
        assert_eq!(ext.reinline_message(&mut msg).await.unwrap(), 1);
        assert_eq!(msg.parts, original.parts);
    }

    #[tokio::test]
    async fn test_stage_skips_history() {
        let store = InMemoryMediaStore::new();
        let ext = MediaExternalizer::new(
            ExternalizerConfig {
                threshold_kb: 0,
                ..Default::default()
            },
            store.clone(),
        );
        let pipeline = Pipeline::builder()
            .stage(MediaExternalizerStage::new(ext))
            .build()
            .unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let history = Message::user("").with_parts(vec![big_image(1)]);
        tx.send(StreamElement::from_message(history).with_metadata(keys::FROM_HISTORY, json!(true)))
            .await
            .unwrap();
        tx.send(StreamElement::from_message(Message::assistant("").with_parts(vec![big_image(1)])))
            .await
            .unwrap();
        drop(tx);

        let mut stream = pipeline.execute(rx);
        let first = stream.next().await.unwrap().message.unwrap();
        let second = stream.next().await.unwrap().message.unwrap();
        assert!(first.parts[0].media().unwrap().inline_data().is_some());
        assert!(matches!(second.parts[0].media().unwrap().source, MediaSource::Storage(_)));
        assert_eq!(store.len(), 1);
    }
}
