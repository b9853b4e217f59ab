//! MIME detection and category checks.

use crate::types::ContentType;
use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

const SUPPORTED_IMAGE: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
const SUPPORTED_AUDIO: &[&str] = &[
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "audio/mp4",
    "audio/pcm",
    "audio/webm",
];
const SUPPORTED_VIDEO: &[&str] = &["video/mp4", "video/webm", "video/quicktime"];

/// MIME type from a path or URL extension, `application/octet-stream` when unknown
pub fn detect_mime_type(path: &str) -> &'static str {
    // URLs may carry a query string or fragment after the file name
    let trimmed = path.split(['?', '#']).next().unwrap_or(path);
    let ext = Path::new(trimmed)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "pcm" => "audio/pcm",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        _ => OCTET_STREAM,
    }
}

/// Drop parameters such as `; charset=utf-8` and lowercase
pub fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Canonical spelling for common aliases
pub fn normalize(mime: &str) -> String {
    let base = essence(mime);
    match base.as_str() {
        "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => "audio/wav".into(),
        "audio/l16" | "audio/x-pcm" => "audio/pcm".into(),
        "audio/mp3" => "audio/mpeg".into(),
        "image/jpg" => "image/jpeg".into(),
        _ => base,
    }
}

/// Whether the primary token of `mime` matches the expected category
pub fn matches_content_type(mime: &str, expected: ContentType) -> bool {
    let base = essence(mime);
    let primary = base.split('/').next().unwrap_or("");
    primary == expected.as_str()
}

pub fn is_supported(mime: &str, content_type: ContentType) -> bool {
    let mime = normalize(mime);
    match content_type {
        ContentType::Image => SUPPORTED_IMAGE.contains(&mime.as_str()),
        ContentType::Audio => SUPPORTED_AUDIO.contains(&mime.as_str()),
        ContentType::Video => SUPPORTED_VIDEO.contains(&mime.as_str()),
        ContentType::Text => mime.starts_with("text/"),
    }
}
