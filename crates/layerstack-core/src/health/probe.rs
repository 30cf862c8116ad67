//! Direct (tier 1) HTTP probing.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

impl ProbeResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Connection refused, DNS failure and similar.
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The request reached the server but failed otherwise.
    #[error("request failed: {0}")]
    Request(String),
}

impl ProbeError {
    /// Whether the endpoint could not be reached at all. Only these failures
    /// escalate to remote probing.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProbeError::Unreachable(_) | ProbeError::Timeout(_))
    }
}

#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<ProbeResponse, ProbeError>;
}

/// `reqwest`-backed probe client.
#[derive(Debug, Clone, Default)]
pub struct HttpProbeClient {
    client: reqwest::Client,
}

impl HttpProbeClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn get(&self, url: &str, timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout.as_millis() as u64)
            } else if e.is_connect() {
                ProbeError::Unreachable(e.to_string())
            } else {
                ProbeError::Request(e.to_string())
            }
        };

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(ProbeResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        assert!(ProbeError::Unreachable("refused".into()).is_unreachable());
        assert!(ProbeError::Timeout(100).is_unreachable());
        assert!(!ProbeError::Request("bad body".into()).is_unreachable());
    }

    #[test]
    fn test_response_success_range() {
        assert!(ProbeResponse::ok("{}").is_success());
        assert!(!ProbeResponse {
            status: 503,
            body: String::new()
        }
        .is_success());
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = HttpProbeClient::new()
            .get(&format!("http://127.0.0.1:{port}/health"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "got {err:?}");
    }
}
