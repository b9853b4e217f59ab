//! Media loading from inline data, files, URLs and storage references.

use super::error::MediaError;
use super::mime::{detect_mime_type, essence};
use super::storage::MediaStorageService;
use super::validate::{validate_file_path, validate_file_size, validate_media};
use super::wav::{wrap_pcm_in_wav, DEFAULT_BIT_DEPTH, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::types::{ContentType, MediaContent, MediaSource};
use crate::{Result, TurnError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct MediaLoaderConfig {
    /// Directory file paths are resolved against and confined to
    pub base_dir: Option<PathBuf>,
    pub http_timeout: Duration,
    pub max_url_bytes: u64,
    pub max_file_bytes: u64,
}

impl Default for MediaLoaderConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            http_timeout: Duration::from_secs(30),
            max_url_bytes: 50 * 1024 * 1024,
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Turns any media source into inline base64 data
pub struct MediaLoader {
    config: MediaLoaderConfig,
    client: reqwest::Client,
    storage: Option<Arc<dyn MediaStorageService>>,
}

impl MediaLoader {
    pub fn new(config: MediaLoaderConfig, storage: Option<Arc<dyn MediaStorageService>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| TurnError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            storage,
        })
    }

    pub fn config(&self) -> &MediaLoaderConfig {
        &self.config
    }

    /// Validate `media` and return an inline copy.
    ///
    /// `index` is the position of the part in its message and is carried in
    /// every error together with `content_type` and the source.
    #[instrument(name = "media.load", skip(self, media), fields(source = media.source.kind()))]
    pub async fn load(
        &self,
        media: &MediaContent,
        content_type: ContentType,
        index: usize,
    ) -> std::result::Result<MediaContent, MediaError> {
        validate_media(media, content_type, index)?;
        match &media.source {
            MediaSource::Inline(_) => Ok(media.clone()),
            MediaSource::File(path) => self.load_file(path, media, content_type, index).await,
            MediaSource::Url(url) => self.load_url(url, media, content_type, index).await,
            MediaSource::Storage(reference) => self.load_storage(reference, media, content_type, index).await,
        }
    }

    async fn load_file(
        &self,
        file_path: &str,
        media: &MediaContent,
        content_type: ContentType,
        index: usize,
    ) -> std::result::Result<MediaContent, MediaError> {
        let ct = content_type.as_str();
        let path = validate_file_path(file_path, self.config.base_dir.as_deref()).map_err(|e| e.at(index, ct))?;
        validate_file_size(&path, self.config.max_file_bytes).map_err(|e| MediaError {
            origin: file_path.to_string(),
            ..e.at(index, ct)
        })?;

        let mut bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| MediaError::file(index, ct, file_path, format!("failed to read file: {e}")))?;
        let mut mime = media
            .mime_type
            .clone()
            .unwrap_or_else(|| detect_mime_type(file_path).to_string());

        if content_type == ContentType::Audio && is_raw_pcm(&path) {
            bytes = wrap_pcm_in_wav(&bytes, DEFAULT_SAMPLE_RATE, DEFAULT_BIT_DEPTH, DEFAULT_CHANNELS);
            mime = "audio/wav".to_string();
        }

        debug!(target: "media_loader", path = %path.display(), bytes = bytes.len(), mime = %mime, "Loaded media file");
        Ok(MediaContent {
            source: MediaSource::Inline(STANDARD.encode(&bytes)),
            mime_type: Some(mime),
            detail: media.detail.clone(),
        })
    }

    async fn load_url(
        &self,
        url: &str,
        media: &MediaContent,
        content_type: ContentType,
        index: usize,
    ) -> std::result::Result<MediaContent, MediaError> {
        let ct = content_type.as_str();
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| MediaError::validation(index, ct, url, format!("invalid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(MediaError::validation(
                index,
                ct,
                url,
                format!("unsupported URL scheme '{}' (only http and https)", parsed.scheme()),
            ));
        }

        let network = |e: reqwest::Error| {
            let message = if e.is_timeout() {
                "request canceled or timed out".to_string()
            } else {
                format!("failed to fetch URL: {e}")
            };
            MediaError::network(index, ct, url, message)
        };

        let mut response = self.client.get(parsed).send().await.map_err(network)?;
        if response.status() != StatusCode::OK {
            return Err(MediaError::network(
                index,
                ct,
                url,
                format!("HTTP request failed with status {}", response.status()),
            ));
        }

        let max = self.config.max_url_bytes;
        if let Some(declared) = response.content_length() {
            if declared > max {
                return Err(MediaError::size(
                    index,
                    ct,
                    url,
                    format!("content length {declared} bytes exceeds maximum {max} bytes"),
                ));
            }
        }
        let header_mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(essence)
            .filter(|m| !m.is_empty());

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(network)? {
            if (body.len() + chunk.len()) as u64 > max {
                return Err(MediaError::size(
                    index,
                    ct,
                    url,
                    format!("response body exceeds maximum {max} bytes"),
                ));
            }
            body.extend_from_slice(&chunk);
        }

        let mime = media
            .mime_type
            .clone()
            .or(header_mime)
            .unwrap_or_else(|| detect_mime_type(url).to_string());
        debug!(target: "media_loader", url = %url, bytes = body.len(), mime = %mime, "Fetched media URL");
        Ok(MediaContent {
            source: MediaSource::Inline(STANDARD.encode(&body)),
            mime_type: Some(mime),
            detail: media.detail.clone(),
        })
    }

    async fn load_storage(
        &self,
        reference: &str,
        media: &MediaContent,
        content_type: ContentType,
        index: usize,
    ) -> std::result::Result<MediaContent, MediaError> {
        let ct = content_type.as_str();
        let storage = self.storage.as_ref().ok_or_else(|| {
            MediaError::storage(
                index,
                ct,
                reference,
                "storage reference specified but storage service not available",
            )
        })?;
        let mut retrieved = storage.retrieve(reference).await.map_err(|e| {
            MediaError::storage(index, ct, reference, format!("failed to retrieve from storage: {e}"))
        })?;
        if retrieved.inline_data().map_or(true, str::is_empty) {
            return Err(MediaError::validation(
                index,
                ct,
                reference,
                "storage returned media without data",
            ));
        }
        if retrieved.mime_type.is_none() {
            retrieved.mime_type = media.mime_type.clone();
        }
        if media.detail.is_some() {
            retrieved.detail = media.detail.clone();
        }
        debug!(target: "media_loader", reference = %reference, "Retrieved media from storage");
        Ok(retrieved)
    }
}

fn is_raw_pcm(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pcm"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{InMemoryMediaStore, MediaErrorKind, MediaMetadata};
    use async_trait::async_trait;

    fn loader_in(dir: &Path) -> MediaLoader {
        MediaLoader::new(
            MediaLoaderConfig {
                base_dir: Some(dir.to_path_buf()),
                ..Default::default()
            },
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_inline_is_returned_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let media = MediaContent::inline("aGVsbG8=", "image/png");
        let loaded = loader_in(dir.path()).load(&media, ContentType::Image, 0).await.unwrap();
        assert_eq!(loaded, media);
    }

    #[tokio::test]
    async fn test_file_is_encoded_and_mime_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pic.png"), b"hello").unwrap();
        let media = MediaContent::new(MediaSource::File("pic.png".into()));
        let loaded = loader_in(dir.path()).load(&media, ContentType::Image, 1).await.unwrap();
        assert_eq!(loaded.inline_data(), Some("aGVsbG8="));
        assert_eq!(loaded.mime_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_pcm_file_is_wrapped_in_wav() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("voice.pcm"), [0u8; 100]).unwrap();
        let media = MediaContent::new(MediaSource::File("voice.pcm".into()));
        let loaded = loader_in(dir.path()).load(&media, ContentType::Audio, 0).await.unwrap();
        assert_eq!(loaded.mime_type.as_deref(), Some("audio/wav"));
        let bytes = STANDARD.decode(loaded.inline_data().unwrap()).unwrap();
        assert_eq!(bytes.len(), 144);
        assert_eq!(&bytes[0..4], b"RIFF");
    }

    #[tokio::test]
    async fn test_file_errors_carry_part_index() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_in(dir.path());

        let traversal = MediaContent::new(MediaSource::File("../secret.txt".into()));
        let err = loader.load(&traversal, ContentType::Image, 4).await.unwrap_err();
        assert_eq!(err.kind, MediaErrorKind::Validation);
        assert_eq!(err.index, 4);
        assert_eq!(err.content_type, "image");

        std::fs::write(dir.path().join("big.png"), vec![0u8; 64]).unwrap();
        let small = MediaLoader::new(
            MediaLoaderConfig {
                base_dir: Some(dir.path().to_path_buf()),
                max_file_bytes: 16,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let big = MediaContent::new(MediaSource::File("big.png".into()));
        let err = small.load(&big, ContentType::Image, 2).await.unwrap_err();
        assert_eq!(err.kind, MediaErrorKind::Size);
        assert_eq!(err.origin, "big.png");
    }

    #[tokio::test]
    async fn test_url_scheme_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let media = MediaContent::new(MediaSource::Url("ftp://example.test/a.png".into()));
        let err = loader_in(dir.path()).load(&media, ContentType::Image, 0).await.unwrap_err();
        assert!(err.message.contains("unsupported URL scheme"));
    }

    struct EmptyStore;

    #[async_trait]
    impl MediaStorageService for EmptyStore {
        async fn store(&self, _: &MediaContent, _: &MediaMetadata) -> Result<String> {
            Ok("empty://0".into())
        }

        async fn retrieve(&self, _: &str) -> Result<MediaContent> {
            Ok(MediaContent::new(MediaSource::Inline(String::new())))
        }
    }

    #[tokio::test]
    async fn test_storage_references() {
        let store = InMemoryMediaStore::new();
        let original = MediaContent::inline("aGVsbG8=", "audio/wav");
        let meta = MediaMetadata {
            conversation_id: "c".into(),
            message_index: 0,
            part_index: 0,
            mime_type: "audio/wav".into(),
            timestamp: chrono::Utc::now(),
        };
        let reference = store.store(&original, &meta).await.unwrap();

        let loader = MediaLoader::new(MediaLoaderConfig::default(), Some(store)).unwrap();
        let media = MediaContent::new(MediaSource::Storage(reference));
        let loaded = loader.load(&media, ContentType::Audio, 0).await.unwrap();
        assert_eq!(loaded.inline_data(), Some("aGVsbG8="));

        let no_service = MediaLoader::new(MediaLoaderConfig::default(), None).unwrap();
        assert_eq!(
            no_service.load(&media, ContentType::Audio, 0).await.unwrap_err().kind,
            MediaErrorKind::Storage
        );

        let empty = MediaLoader::new(MediaLoaderConfig::default(), Some(Arc::new(EmptyStore))).unwrap();
        let err = empty.load(&media, ContentType::Audio, 0).await.unwrap_err();
        assert!(err.message.contains("without data"));
    }
}
