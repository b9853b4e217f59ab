use loom_turn::media::{wrap_pcm_in_wav, AudioFileSource, AudioFormat, MediaLoader, MediaLoaderConfig};
use loom_turn::types::{ContentType, MediaContent, MediaSource};
use loom_turn::MediaErrorKind;
use std::os::unix::fs::symlink;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn loader(base: Option<&Path>, max_bytes: u64) -> MediaLoader {
    MediaLoader::new(
        MediaLoaderConfig {
            base_dir: base.map(Path::to_path_buf),
            max_url_bytes: max_bytes,
            max_file_bytes: max_bytes,
            ..Default::default()
        },
        None,
    )
    .unwrap()
}

fn file(path: &str) -> MediaContent {
    MediaContent::new(MediaSource::File(path.into()))
}

/// Serve one canned HTTP response and return its URL
async fn serve_once(head: String, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&body).await;
        let _ = socket.shutdown().await;
    });
    format!("http://{addr}/clip.png")
}

/// Answer `/hop/N` with a redirect to `/hop/N+1` until `hops`, which serves the body
async fn serve_redirect_chain(hops: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = [0u8; 1024];
            let n = socket.read(&mut request).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&request[..n]);
            let hop: usize = request
                .split_whitespace()
                .nth(1)
                .and_then(|path| path.strip_prefix("/hop/"))
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            let response = if hop < hops {
                format!(
                    "HTTP/1.1 302 Found\r\nLocation: /hop/{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    hop + 1
                )
            } else {
                "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
                    .to_string()
            };
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}/hop/0")
}

#[tokio::test]
async fn test_parent_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("media");
    std::fs::create_dir(&base).unwrap();
    std::fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();

    let err = loader(Some(&base), 1024)
        .load(&file("../secret.txt"), ContentType::Image, 2)
        .await
        .unwrap_err();
    assert_eq!(err.kind, MediaErrorKind::Validation);
    assert_eq!(err.index, 2);
    assert!(err.message.contains(".."));
}

#[tokio::test]
async fn test_symlink_escaping_base_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("media");
    std::fs::create_dir(&base).unwrap();
    let outside = dir.path().join("secret.png");
    std::fs::write(&outside, b"not yours").unwrap();
    symlink(&outside, base.join("innocent.png")).unwrap();

    let err = loader(Some(&base), 1024)
        .load(&file("innocent.png"), ContentType::Image, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind, MediaErrorKind::Validation);
    assert!(err.message.contains("symlink target escapes base directory"));
}

#[tokio::test]
async fn test_symlink_inside_base_is_followed() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();
    std::fs::create_dir(base.join("real")).unwrap();
    std::fs::write(base.join("real/pic.png"), b"hello").unwrap();
    symlink(base.join("real/pic.png"), base.join("alias.png")).unwrap();

    let loaded = loader(Some(base), 1024)
        .load(&file("alias.png"), ContentType::Image, 0)
        .await
        .unwrap();
    assert_eq!(loaded.inline_data(), Some("aGVsbG8="));
    assert_eq!(loaded.mime_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn test_oversized_file_is_a_size_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("big.png"), vec![0u8; 2048]).unwrap();

    let err = loader(Some(dir.path()), 1024)
        .load(&file("big.png"), ContentType::Image, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind, MediaErrorKind::Size);
    assert_eq!(err.origin, "big.png");
}

#[tokio::test]
async fn test_url_body_over_limit_without_length_is_rejected() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nConnection: close\r\n\r\n".into(),
        vec![7u8; 4096],
    )
    .await;

    let err = loader(None, 1024)
        .load(&MediaContent::new(MediaSource::Url(url.clone())), ContentType::Image, 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind, MediaErrorKind::Size);
    assert_eq!(err.origin, url);
    assert_eq!(err.index, 1);
}

#[tokio::test]
async fn test_url_declared_length_over_limit_is_rejected() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Length: 5000\r\nConnection: close\r\n\r\n".into(),
        vec![7u8; 16],
    )
    .await;

    let err = loader(None, 1024)
        .load(&MediaContent::new(MediaSource::Url(url)), ContentType::Image, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind, MediaErrorKind::Size);
    assert!(err.message.contains("5000"));
}

#[tokio::test]
async fn test_url_within_limit_uses_header_mime() {
    let url = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg; charset=binary\r\nContent-Length: 5\r\nConnection: close\r\n\r\n"
            .into(),
        b"hello".to_vec(),
    )
    .await;

    let loaded = loader(None, 1024)
        .load(&MediaContent::new(MediaSource::Url(url)), ContentType::Image, 0)
        .await
        .unwrap();
    assert_eq!(loaded.inline_data(), Some("aGVsbG8="));
    assert_eq!(loaded.mime_type.as_deref(), Some("image/jpeg"));
}

#[tokio::test]
async fn test_non_ok_status_is_a_network_error() {
    let url = serve_once(
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
        Vec::new(),
    )
    .await;

    let err = loader(None, 1024)
        .load(&MediaContent::new(MediaSource::Url(url)), ContentType::Image, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind, MediaErrorKind::Network);
    assert!(err.message.contains("404"));
}

#[test]
fn test_24_bit_wav_file_reads_as_pcm16() {
    let dir = tempfile::tempdir().unwrap();
    let pcm = vec![0x11u8; 3000];
    std::fs::write(dir.path().join("take.wav"), wrap_pcm_in_wav(&pcm, 48_000, 24, 1)).unwrap();

    let mut source = AudioFileSource::open("take.wav", Some(dir.path())).unwrap();
    assert_eq!(source.format(), AudioFormat::Pcm24);
    assert_eq!(source.sample_rate(), 48_000);
    assert_eq!(source.read_all().unwrap().len(), 2000);
}

#[test]
fn test_audio_source_refuses_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let err = AudioFileSource::open("../take.wav", Some(dir.path())).err().unwrap();
    assert_eq!(err.kind, MediaErrorKind::Validation);
    assert_eq!(err.content_type, "audio");
}

#[tokio::test]
async fn test_redirects_within_limit_are_followed() {
    let url = serve_redirect_chain(3).await;

    let loaded = loader(None, 1024)
        .load(&MediaContent::new(MediaSource::Url(url)), ContentType::Image, 0)
        .await
        .unwrap();
    assert_eq!(loaded.inline_data(), Some("aGVsbG8="));
    assert_eq!(loaded.mime_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn test_redirect_chain_past_limit_is_a_network_error() {
    let url = serve_redirect_chain(11).await;

    let err = loader(None, 1024)
        .load(&MediaContent::new(MediaSource::Url(url)), ContentType::Image, 4)
        .await
        .unwrap_err();
    assert_eq!(err.kind, MediaErrorKind::Network);
    assert_eq!(err.index, 4);
}
