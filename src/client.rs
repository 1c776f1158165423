//! HTTP client for the ingestion sink.
//!
//! One record is one POST. Retrying is not done here: a failed send is handed
//! back to the pod's delivery layer, which queues it and tries again after a
//! fixed backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Errors that can occur while posting to the sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Server returned a non-success status code
    #[error("Sink error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SinkError::Timeout
        } else {
            SinkError::Request(err)
        }
    }
}

/// Destination for serialized envelopes.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    /// Ship one serialized envelope. Any error means "not delivered".
    async fn send(&self, body: &[u8]) -> Result<(), SinkError>;
}

/// Sink client posting JSON envelopes over HTTP.
///
/// The underlying `reqwest::Client` is reused for connection pooling across
/// all pods of the process.
#[derive(Debug, Clone)]
pub struct SinkClient {
    client: Client,
    sink_url: String,
    timeout: Duration,
}

impl SinkClient {
    /// Create a sink client from the process configuration.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        Self::with_settings(config.sink_url.clone(), config.request_timeout)
    }

    /// Create a sink client with custom settings.
    pub fn with_settings(
        sink_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| SinkError::Config(e.to_string()))?;

        Ok(Self {
            client,
            sink_url: sink_url.into(),
            timeout,
        })
    }

    pub fn sink_url(&self) -> &str {
        &self.sink_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl LogSink for SinkClient {
    async fn send(&self, body: &[u8]) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.sink_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status, bytes = body.len(), "Record accepted by sink");
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        Err(SinkError::Status {
            code: status,
            message,
        })
    }
}
