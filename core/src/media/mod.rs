//! Multimodal media handling
//!
//! Validation and loading of media sources, format conversion for providers
//! with restricted inputs, WAV/PCM audio decoding, and externalization of
//! large payloads to media storage.

pub mod convert;
pub mod error;
pub mod externalize;
pub mod loader;
pub mod mime;
pub mod resolve;
pub mod storage;
pub mod validate;
pub mod wav;

pub use convert::{AudioConverter, MediaConvertConfig, MediaConvertStage, MediaConverter};
pub use error::{MediaError, MediaErrorKind};
pub use externalize::{ExternalizerConfig, MediaExternalizer, MediaExternalizerStage};
pub use loader::{MediaLoader, MediaLoaderConfig};
pub use mime::{detect_mime_type, is_supported, matches_content_type};
pub use resolve::MediaResolveStage;
pub use storage::{FileMediaStore, InMemoryMediaStore, MediaMetadata, MediaStorageService};
pub use validate::{validate_file_path, validate_file_size, validate_media, MAX_PATH_LENGTH};
pub use wav::{convert_to_pcm16, wrap_pcm_in_wav, AudioFileSource, AudioFormat};
