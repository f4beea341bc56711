//! Client for the platform sync workers.
//!
//! Workers are plain HTTP endpoints under a shared base URL; a continuation is
//! a POST of the payload to `{base_url}/{endpoint}`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Longest worker error body carried into errors, logs and sync state.
pub const MAX_ERROR_BODY_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("no worker base URL configured")]
    NotConfigured,
    #[error("network error: {0}")]
    Network(String),
    #[error("worker error ({0}): {1}")]
    Api(u16, String),
    #[error("worker did not respond within {0:?}")]
    Timeout(Duration),
}

/// Sends continuation (and retry) payloads to platform workers.
#[async_trait]
pub trait PlatformWorkerClient: Send + Sync {
    /// POST `payload` to the worker behind `endpoint`. Any non-2xx answer is an error.
    async fn send(&self, endpoint: &str, payload: &Value) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
    timeout: Duration,
}

impl HttpWorkerClient {
    pub fn new(
        base_url: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            token,
            timeout,
        })
    }

    fn url(&self, endpoint: &str) -> Result<String, WorkerError> {
        let base = self.base_url.as_deref().ok_or(WorkerError::NotConfigured)?;
        Ok(format!("{}/{}", base, endpoint.trim_start_matches('/')))
    }
}

#[async_trait]
impl PlatformWorkerClient for HttpWorkerClient {
    async fn send(&self, endpoint: &str, payload: &Value) -> Result<(), WorkerError> {
        let url = self.url(endpoint)?;
        let mut req = self.client.post(&url).json(payload);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                WorkerError::Timeout(self.timeout)
            } else {
                WorkerError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(WorkerError::Api(status.as_u16(), error_excerpt(resp).await));
        }

        debug!(%url, status = status.as_u16(), "worker accepted payload");
        Ok(())
    }
}

/// Read at most [`MAX_ERROR_BODY_BYTES`] of an error body.
async fn error_excerpt(mut resp: reqwest::Response) -> String {
    let mut body = Vec::new();
    while body.len() <= MAX_ERROR_BODY_BYTES {
        match resp.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    excerpt(&body)
}

fn excerpt(body: &[u8]) -> String {
    let end = body.len().min(MAX_ERROR_BODY_BYTES);
    let text = String::from_utf8_lossy(&body[..end]);
    let text = text.trim();
    if body.len() > MAX_ERROR_BODY_BYTES {
        format!("{text}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering every request with `status` and `body`.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn short_error_bodies_are_kept_whole() {
        assert_eq!(excerpt(b"  rate limited\n"), "rate limited");
    }

    #[test]
    fn long_error_bodies_are_cut() {
        let body = "x".repeat(10_000);
        let text = excerpt(body.as_bytes());
        assert_eq!(text.len(), MAX_ERROR_BODY_BYTES + 3);
        assert!(text.ends_with("..."));
    }

    #[tokio::test]
    async fn api_errors_carry_a_bounded_body() {
        let base = serve_once("502 Bad Gateway", "<html>".repeat(50_000)).await;
        let client = HttpWorkerClient::new(Some(base), None, Duration::from_secs(5)).unwrap();

        let err = client.send("smartlead-sync", &Value::Null).await.unwrap_err();
        let (status, body) = match err {
            WorkerError::Api(status, body) => (status, body),
            other => panic!("expected an API error, got {other:?}"),
        };
        assert_eq!(status, 502);
        assert!(body.len() <= MAX_ERROR_BODY_BYTES + 3);
        assert!(body.starts_with("<html>"));
    }

    #[test]
    fn url_joins_base_and_endpoint() {
        let client = HttpWorkerClient::new(
            Some("http://workers.local/functions/".to_string()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.url("/smartlead-sync").unwrap(),
            "http://workers.local/functions/smartlead-sync"
        );
    }

    #[tokio::test]
    async fn missing_base_url_is_reported() {
        let client = HttpWorkerClient::new(None, None, Duration::from_secs(5)).unwrap();
        let err = client.send("replyio-sync", &Value::Null).await.unwrap_err();
        assert_eq!(err, WorkerError::NotConfigured);
    }
}
