//! Target trait definition and the HTTP implementation

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures; recorded as outcomes without a status
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid HTTP client configuration: {0}")]
    Client(String),
}

/// What the engine reads from a response: status and body size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetResponse {
    pub status: u16,
    pub bytes: u64,
}

/// Trait for systems under load (a real HTTP API or an in-process stub)
#[async_trait]
pub trait Target: Send + Sync {
    /// Issue one GET for `path` and read the full response
    async fn get(&self, path: &str) -> Result<TargetResponse, TransportError>;
}

/// HTTP target rooted at a base URL
pub struct HttpTarget {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTarget {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(Duration::ZERO)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl Target for HttpTarget {
    async fn get(&self, path: &str) -> Result<TargetResponse, TransportError> {
        let resp = self
            .client
            .get(self.url_for(path))
            .send()
            .await
            .map_err(Self::classify)?;

        let status = resp.status().as_u16();
        // Latency covers the full body, not just the headers
        let body = resp.bytes().await.map_err(Self::classify)?;

        Ok(TargetResponse {
            status,
            bytes: body.len() as u64,
        })
    }
}
