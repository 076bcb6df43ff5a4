//! reqwest-backed transport for a path-addressed object store.

use super::transport::{RemoteTransport, TransferRequest};
use crate::cancel::CancellationToken;
use crate::config::{CacheConfig, NetworkConfig};
use crate::error::{MediaCacheError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

/// Authenticated GET against `<base_url>/<reference>`.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).map_err(|e| MediaCacheError::Config {
            message: format!("Invalid remote base URL '{}': {}", base_url, e),
        })?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(MediaCacheError::Config {
                message: format!("Remote base URL must be http(s): {}", base_url),
            });
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| MediaCacheError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            base_url: base,
            timeout,
        })
    }

    /// Build from `remote_base_url` and `request_timeout_secs`.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let base_url = config
            .remote_base_url
            .as_deref()
            .ok_or_else(|| MediaCacheError::Config {
                message: "remote_base_url is not set".into(),
            })?;
        Self::new(base_url, config.request_timeout())
    }

    /// URL of `reference`, each path segment percent-encoded.
    pub fn object_url(&self, reference: &str) -> Result<Url> {
        let mut segments = Vec::new();
        for segment in reference.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(MediaCacheError::invalid_argument(
                    "reference",
                    format!("relative path segment in {}", reference),
                ));
            }
            segments.push(urlencoding::encode(segment).into_owned());
        }
        if segments.is_empty() {
            return Err(MediaCacheError::invalid_argument(
                "reference",
                "remote reference has no path segments",
            ));
        }

        self.base_url
            .join(&segments.join("/"))
            .map_err(|e| MediaCacheError::invalid_argument("reference", e.to_string()))
    }

    fn request_error(&self, reference: &str, err: reqwest::Error) -> MediaCacheError {
        if err.is_timeout() {
            MediaCacheError::Timeout(self.timeout)
        } else {
            MediaCacheError::Network {
                message: format!("GET {} failed: {}", reference, err),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn fetch(
        &self,
        request: &TransferRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let url = self.object_url(&request.reference)?;
        let mut builder = self.client.get(url);
        if !request.credential.is_empty() {
            builder = builder.bearer_auth(&request.credential);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MediaCacheError::Cancelled),
            sent = builder.send() => sent.map_err(|e| self.request_error(&request.reference, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(MediaCacheError::DownloadFailed {
                reference: request.reference.clone(),
                status: Some(status.as_u16()),
                message: format!("status {}", status),
            });
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| MediaCacheError::io_with_path(e, dest))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MediaCacheError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| self.request_error(&request.reference, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| MediaCacheError::io_with_path(e, dest))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| MediaCacheError::io_with_path(e, dest))?;
        file.sync_all()
            .await
            .map_err(|e| MediaCacheError::io_with_path(e, dest))?;

        debug!(reference = %request.reference, bytes = written, "Transfer complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer exactly one request with `status_line` and `body`, yielding the
    /// raw request head.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                status_line,
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&head).to_string()
        });
        (format!("http://{}/media", addr), handle)
    }

    fn request(credential: &str, reference: &str) -> TransferRequest {
        TransferRequest {
            credential: credential.to_string(),
            reference: reference.to_string(),
        }
    }

    #[test]
    fn test_object_url_encodes_segments() {
        let transport = HttpTransport::new("https://cdn.example.com/bucket", Duration::from_secs(5)).unwrap();
        let url = transport.object_url("albums/summer 2024/a#1.jpg").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cdn.example.com/bucket/albums/summer%202024/a%231.jpg"
        );
    }

    #[test]
    fn test_object_url_rejects_dot_segments() {
        let transport = HttpTransport::new("https://cdn.example.com/", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            transport.object_url("a/../b.jpg"),
            Err(MediaCacheError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpTransport::new("not a url", Duration::from_secs(5)),
            Err(MediaCacheError::Config { .. })
        ));
        assert!(HttpTransport::new("ftp://example.com/", Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_fetch_streams_body_with_bearer_auth() {
        let (base, server) = serve_once("200 OK", b"jpeg-bytes").await;
        let transport = HttpTransport::new(&base, Duration::from_secs(5)).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("dl.part");

        let written = transport
            .fetch(&request("secret-token", "x/y z.jpg"), &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"jpeg-bytes");

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /media/x/y%20z.jpg http/1.1"));
        assert!(head.contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn test_empty_credential_sends_no_auth_header() {
        let (base, server) = serve_once("200 OK", b"ok").await;
        let transport = HttpTransport::new(&base, Duration::from_secs(5)).unwrap();
        let temp_dir = TempDir::new().unwrap();

        transport
            .fetch(&request("", "a.png"), &temp_dir.path().join("a"), &CancellationToken::new())
            .await
            .unwrap();

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(!head.contains("authorization:"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_download_failure() {
        let (base, _server) = serve_once("404 Not Found", b"").await;
        let transport = HttpTransport::new(&base, Duration::from_secs(5)).unwrap();
        let temp_dir = TempDir::new().unwrap();

        let err = transport
            .fetch(&request("t", "missing.jpg"), &temp_dir.path().join("m"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            MediaCacheError::DownloadFailed { status, reference, .. } => {
                assert_eq!(status, Some(404));
                assert_eq!(reference, "missing.jpg");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let transport = HttpTransport::new("http://127.0.0.1:9/", Duration::from_secs(5)).unwrap();
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .fetch(&request("t", "a.jpg"), &temp_dir.path().join("a"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaCacheError::Cancelled));
    }
}
