// Media download
// Streams remote media into the work directory under URL-derived names

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::MediaError;

const KNOWN_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "mp4"];

/// Calculate SHA256 hash of a URL, hex encoded
pub fn url_digest(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable local file name for a media URL: a digest prefix plus the URL's
/// extension, or `fallback_ext` when it has none we recognise
pub fn media_filename(url: &str, fallback_ext: &str) -> String {
    let ext = reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|last| last.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .filter(|ext| KNOWN_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or_else(|| fallback_ext.to_string());

    format!("{}.{}", &url_digest(url)[..16], ext)
}

/// Download `url` to `dest`, streaming the body in chunks
pub async fn download_media(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<PathBuf, MediaError> {
    let mut response = client.get(url).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(MediaError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    match write_body(&mut response, dest).await {
        Ok(bytes) => {
            log::info!("Downloaded media from {} to {} ({} bytes)", url, dest.display(), bytes);
            Ok(dest.to_path_buf())
        }
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(dest).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove partial {}: {}", dest.display(), remove_err);
                }
            }
            Err(e)
        }
    }
}

async fn write_body(response: &mut reqwest::Response, dest: &Path) -> Result<usize, MediaError> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut bytes = 0usize;
    while let Some(chunk) = response.chunk().await? {
        bytes += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_url_digest() {
        assert_eq!(
            url_digest("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_media_filename_extension() {
        let name = media_filename("https://i.redd.it/abc.PNG", "jpg");
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), 16 + 4);

        let name = media_filename("https://preview.redd.it/abc.jpg?width=640&s=x", "bin");
        assert!(name.ends_with(".jpg"));

        let name = media_filename("https://v.redd.it/xyz/DASH_720.mp4?source=fallback", "mp4");
        assert!(name.ends_with(".mp4"));

        let name = media_filename("https://example.com/image", "jpg");
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn test_media_filename_distinct_per_url() {
        assert_ne!(
            media_filename("https://i.redd.it/a.jpg", "jpg"),
            media_filename("https://i.redd.it/b.jpg", "jpg")
        );
    }

    #[tokio::test]
    async fn test_download_writes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 20_000]))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("a.jpg");
        let client = reqwest::Client::new();

        let written = download_media(&client, &format!("{}/a.jpg", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(written, dest);
        assert_eq!(std::fs::read(&dest).unwrap().len(), 20_000);
    }

    #[tokio::test]
    async fn test_download_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("gone.jpg");
        let client = reqwest::Client::new();

        let result = download_media(&client, &format!("{}/gone.jpg", server.uri()), &dest).await;
        assert!(matches!(result, Err(MediaError::Status { status: 404, .. })));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_truncated_download_removes_partial_file() {
        use std::io::{Read, Write};

        // Promises 1000 bytes, sends 7, then hangs up
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial");
            }
        });

        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("cut.mp4");
        let client = reqwest::Client::new();

        let result = download_media(&client, &format!("http://{}/cut.mp4", addr), &dest).await;
        assert!(matches!(result, Err(MediaError::Http(_))));
        assert!(!dest.exists());
    }
}
