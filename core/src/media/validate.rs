//! Fail-closed validation of media references and file paths.

use super::error::MediaError;
use super::mime::matches_content_type;
use crate::types::{ContentType, MediaContent, MediaSource};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

pub const MAX_PATH_LENGTH: usize = 4096;

/// Check one media value before anything is loaded.
///
/// A source must be present and non-empty, inline data needs a MIME type,
/// and a declared MIME type must belong to `expected`.
pub fn validate_media(media: &MediaContent, expected: ContentType, index: usize) -> Result<(), MediaError> {
    let ct = expected.as_str();
    let origin = media.source.describe();
    let value = match &media.source {
        MediaSource::Url(v) | MediaSource::File(v) | MediaSource::Inline(v) | MediaSource::Storage(v) => v,
    };
    if value.trim().is_empty() {
        return Err(MediaError::validation(index, ct, &origin, "media has no source"));
    }
    if matches!(media.source, MediaSource::Inline(_)) && media.mime_type.is_none() {
        return Err(MediaError::validation(
            index,
            ct,
            &origin,
            "inline data specified but mime_type is missing",
        ));
    }
    if let Some(mime) = &media.mime_type {
        if !matches_content_type(mime, expected) {
            return Err(MediaError::validation(
                index,
                ct,
                &origin,
                format!("mime_type {mime} does not match content type {ct}"),
            ));
        }
    }
    Ok(())
}

/// Resolve `file_path` against `base_dir` and make sure it is a regular file
/// that stays inside the base directory, following symlinks.
///
/// Errors carry index 0 and content type `file`; callers relocate them with
/// [`MediaError::at`].
pub fn validate_file_path(file_path: &str, base_dir: Option<&Path>) -> Result<PathBuf, MediaError> {
    let fail = |msg: String| MediaError::validation(0, "file", file_path, msg);

    if file_path.trim().is_empty() {
        return Err(fail("file path is empty".into()));
    }
    if file_path.len() > MAX_PATH_LENGTH {
        return Err(fail(format!(
            "file path exceeds maximum length of {MAX_PATH_LENGTH} characters"
        )));
    }
    let path = Path::new(file_path);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(fail("path traversal ('..') is not allowed".into()));
    }

    let base = match base_dir.filter(|b| !b.as_os_str().is_empty()) {
        Some(b) => Some(
            fs::canonicalize(b).map_err(|e| fail(format!("base directory {}: {e}", b.display())))?,
        ),
        None => None,
    };
    let resolved = match (&base, path.is_absolute()) {
        (Some(base), false) => base.join(path),
        _ => path.to_path_buf(),
    };

    let link_meta = fs::symlink_metadata(&resolved).map_err(|e| match e.kind() {
        ErrorKind::NotFound => MediaError::file(0, "file", file_path, "file does not exist"),
        _ => MediaError::file(0, "file", file_path, format!("cannot stat file: {e}")),
    })?;

    // Resolves every link in the chain; a dangling link shows up as NotFound
    let target = fs::canonicalize(&resolved).map_err(|e| match e.kind() {
        ErrorKind::NotFound => MediaError::file(0, "file", file_path, "symlink target does not exist"),
        _ => MediaError::file(0, "file", file_path, format!("cannot resolve path: {e}")),
    })?;

    if let Some(base) = &base {
        if !target.starts_with(base) {
            let what = if link_meta.file_type().is_symlink() {
                "symlink target escapes base directory"
            } else {
                "path escapes base directory"
            };
            return Err(fail(what.into()));
        }
    }

    let meta = fs::metadata(&target)
        .map_err(|e| MediaError::file(0, "file", file_path, format!("cannot stat file: {e}")))?;
    if !meta.is_file() {
        return Err(fail("path is not a regular file".into()));
    }
    Ok(resolved)
}

/// File size in bytes, rejecting files above `max_bytes`
pub fn validate_file_size(path: &Path, max_bytes: u64) -> Result<u64, MediaError> {
    let origin = path.display().to_string();
    let meta = fs::metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => MediaError::file(0, "file", &origin, "file does not exist"),
        _ => MediaError::file(0, "file", &origin, format!("cannot stat file: {e}")),
    })?;
    if meta.len() > max_bytes {
        return Err(MediaError::size(
            0,
            "file",
            &origin,
            format!("file size {} bytes exceeds maximum {max_bytes} bytes", meta.len()),
        ));
    }
    Ok(meta.len())
}
