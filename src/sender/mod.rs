//! Outbound HTTP seam and the response taxonomy the drain loop dispatches
//! on.

pub mod backoff;

pub use backoff::Backoff;

use crate::spool::Transmission;
use reqwest::ClientBuilder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// What the drain loop does with a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpResult {
    /// 2xx; the stored file can go.
    Success { status: u16 },
    /// Worth another attempt later: 408, 429, 5xx, or no response at all.
    Retryable {
        status: Option<u16>,
        reason: String,
    },
    /// The server will never take this payload; drop it.
    Permanent { status: u16 },
}

impl HttpResult {
    pub fn from_status(status: u16) -> Self {
        if (200..300).contains(&status) {
            HttpResult::Success { status }
        } else if status == 408 || status == 429 || status >= 500 {
            HttpResult::Retryable {
                status: Some(status),
                reason: format!("http {status}"),
            }
        } else {
            HttpResult::Permanent { status }
        }
    }
}

pub trait HttpSender: Send + Sync + 'static {
    fn post(
        &self,
        transmission: &Transmission,
        timeout: Duration,
    ) -> impl Future<Output = HttpResult> + Send;
}

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub connect_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub max_idle_connections: usize,
    pub user_agent: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(60),
            max_idle_connections: 4,
            user_agent: format!("beacon-telemetry/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Pooled reqwest client posting transmissions to their own endpoint.
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new(config: SenderConfig) -> Result<Self, SenderError> {
        let client = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.keep_alive_timeout)
            .pool_max_idle_per_host(config.max_idle_connections)
            .user_agent(&config.user_agent)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpSender for ReqwestSender {
    fn post(
        &self,
        transmission: &Transmission,
        timeout: Duration,
    ) -> impl Future<Output = HttpResult> + Send {
        let mut request = self
            .client
            .post(transmission.endpoint_url().clone())
            .timeout(timeout)
            .header(CONTENT_TYPE, transmission.content_type())
            .body(transmission.payload().clone());
        if !transmission.content_encoding().is_empty() {
            request = request.header(CONTENT_ENCODING, transmission.content_encoding());
        }
        async move {
            match request.send().await {
                Ok(response) => HttpResult::from_status(response.status().as_u16()),
                Err(e) => HttpResult::Retryable {
                    status: e.status().map(|s| s.as_u16()),
                    reason: e.to_string(),
                },
            }
        }
    }
}
