use std::fmt;
use thiserror::Error;

/// Category of a media failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    Validation,
    File,
    Network,
    Size,
    Storage,
    Conversion,
}

impl fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation",
            Self::File => "file",
            Self::Network => "network",
            Self::Size => "size",
            Self::Storage => "storage",
            Self::Conversion => "conversion",
        })
    }
}

/// A media failure located by part index, content type and source
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} error in {content_type} part {index} ({origin}): {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub index: usize,
    pub content_type: String,
    /// URL, path, storage reference or a short inline description
    pub origin: String,
    pub message: String,
}

impl MediaError {
    pub fn new(
        kind: MediaErrorKind,
        index: usize,
        content_type: impl Into<String>,
        origin: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            index,
            content_type: content_type.into(),
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn validation(index: usize, content_type: &str, origin: &str, message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Validation, index, content_type, origin, message)
    }

    pub fn file(index: usize, content_type: &str, origin: &str, message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::File, index, content_type, origin, message)
    }

    pub fn network(index: usize, content_type: &str, origin: &str, message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Network, index, content_type, origin, message)
    }

    pub fn size(index: usize, content_type: &str, origin: &str, message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Size, index, content_type, origin, message)
    }

    pub fn storage(index: usize, content_type: &str, origin: &str, message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Storage, index, content_type, origin, message)
    }

    pub fn conversion(index: usize, content_type: &str, origin: &str, message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Conversion, index, content_type, origin, message)
    }

    /// Re-locate an error raised without part context
    pub fn at(mut self, index: usize, content_type: &str) -> Self {
        self.index = index;
        self.content_type = content_type.to_string();
        self
    }
}
