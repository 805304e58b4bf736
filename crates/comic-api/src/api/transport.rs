//! Network transport used by the HTTP client.

use super::error::RawError;
use super::types::{Method, RequestDescriptor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Performs one physical request and returns the decoded JSON body
///
/// Non-success statuses come back as [`RawError::Status`]; implementations do
/// not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<Value, RawError>;
}

/// reqwest-backed transport bound to a single base URL
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("comic-api/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    async fn status_error(response: Response) -> RawError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        // Servers usually explain failures in a JSON `message` field
        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string));

        RawError::Status {
            status,
            message,
            retry_after,
        }
    }
}

fn transport_error(e: reqwest::Error) -> RawError {
    RawError::Transport {
        timeout: e.is_timeout(),
        message: e.to_string(),
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Value, RawError> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = self
            .client
            .request(Self::method(request.method), &url)
            .query(&request.params);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| RawError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response and return the base URL
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\nretry-after: 7\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });

        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_success_returns_json() {
        let base = serve_once("200 OK", r#"{"status":"success","data":[1]}"#).await;
        let transport = ReqwestTransport::new(base, Duration::from_secs(5)).unwrap();

        let value = transport
            .send(&RequestDescriptor::get("/popular", "popular"))
            .await
            .unwrap();
        assert_eq!(value["data"][0], 1);
    }

    #[tokio::test]
    async fn test_error_status_keeps_message_and_retry_after() {
        let base = serve_once("429 Too Many Requests", r#"{"message":"slow down"}"#).await;
        let transport = ReqwestTransport::new(base, Duration::from_secs(5)).unwrap();

        let err = transport
            .send(&RequestDescriptor::get("/search", "search").with_param("keyword", "abc"))
            .await
            .unwrap_err();
        match err {
            RawError::Status {
                status,
                message,
                retry_after,
            } => {
                assert_eq!(status, 429);
                assert_eq!(message.as_deref(), Some("slow down"));
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            ReqwestTransport::new(format!("http://{addr}"), Duration::from_secs(5)).unwrap();
        let err = transport
            .send(&RequestDescriptor::get("/genre", "genre"))
            .await
            .unwrap_err();
        assert!(matches!(err, RawError::Transport { timeout: false, .. }));
    }
}
