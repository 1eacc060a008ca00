//! Search sink client with retry and backoff.
//!
//! `forward` submits batched index documents here. Network-level faults
//! (refused connection, timeout, 5xx) retry with exponential backoff up to a
//! bound; everything else fails fast. A missing base URL is a configuration
//! error raised before any network attempt.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use docpipe_core::config::SinkConfig;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One document handed to the search sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
  pub content: String,
  pub metadata: serde_json::Value,
}

/// Sink accounting for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
  pub success: bool,
  pub total_indexed: u64,
  pub total_submitted: u64,
  pub message: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
  #[error("search sink URL is not configured")]
  MissingUrl,

  #[error("sink request failed: {0}")]
  Network(String),

  #[error("sink request timed out")]
  Timeout,

  #[error("sink rejected the request with status {status}")]
  Rejected { status: u16 },

  #[error("unrecognized sink response: {0}")]
  UnrecognizedResponse(String),
}

/// Whether an error is expected to self-heal on retry.
pub fn is_retryable_error(error: &SinkError) -> bool {
  match error {
    SinkError::Network(_) | SinkError::Timeout => true,
    SinkError::Rejected { status } => *status == 429 || *status >= 500,
    SinkError::MissingUrl | SinkError::UnrecognizedResponse(_) => false,
  }
}

/// Submits index documents to the search sink.
#[async_trait]
pub trait IndexSink: Send + Sync {
  async fn submit(&self, documents: &[IndexDocument], index_name: &str) -> Result<SinkResponse, SinkError>;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawSinkResponse {
  success: Option<bool>,
  total_indexed: Option<u64>,
  total_submitted: Option<u64>,
  message: Option<String>,
}

/// `POST {base}/submit` sink client.
pub struct HttpSink {
  client: reqwest::Client,
  base_url: String,
}

impl HttpSink {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: base_url.into(),
    }
  }
}

#[async_trait]
impl IndexSink for HttpSink {
  async fn submit(&self, documents: &[IndexDocument], index_name: &str) -> Result<SinkResponse, SinkError> {
    let url = format!("{}/submit", self.base_url.trim_end_matches('/'));
    let body = serde_json::json!({
      "documents": documents,
      "index_name": index_name,
    });

    let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
      if e.is_timeout() {
        SinkError::Timeout
      } else {
        SinkError::Network(e.to_string())
      }
    })?;

    let status = response.status();
    if !status.is_success() {
      return Err(SinkError::Rejected { status: status.as_u16() });
    }

    let raw: RawSinkResponse = response
      .json()
      .await
      .map_err(|e| SinkError::UnrecognizedResponse(e.to_string()))?;

    // A response without a success flag is an unrecognized shape, treated
    // as fatal by the caller rather than silently assumed successful.
    let Some(success) = raw.success else {
      return Err(SinkError::UnrecognizedResponse("missing success flag".to_string()));
    };

    Ok(SinkResponse {
      success,
      total_indexed: raw.total_indexed.unwrap_or(0),
      total_submitted: raw.total_submitted.unwrap_or(0),
      message: raw.message,
    })
  }
}

// ============================================================================
// Retry wrapper
// ============================================================================

/// Retry/backoff policy for sink submissions.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub backoff_multiplier: f64,
  pub request_timeout: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(30),
      backoff_multiplier: 2.0,
      request_timeout: Duration::from_secs(30),
    }
  }
}

impl RetryConfig {
  /// Backoff before retry number `attempt + 1`, growing per attempt up to
  /// the configured cap.
  pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
    let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
    Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()))
  }
}

impl From<&SinkConfig> for RetryConfig {
  fn from(config: &SinkConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      initial_backoff: Duration::from_millis(config.initial_backoff_ms),
      max_backoff: Duration::from_millis(config.max_backoff_ms),
      backoff_multiplier: config.backoff_multiplier,
      request_timeout: Duration::from_secs(config.request_timeout_secs),
    }
  }
}

/// Wraps any [`IndexSink`] with bounded retry on transient failures.
pub struct ResilientSink<S: IndexSink> {
  inner: S,
  config: RetryConfig,
}

impl<S: IndexSink> ResilientSink<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      config: RetryConfig::default(),
    }
  }

  pub fn with_config(inner: S, config: RetryConfig) -> Self {
    Self { inner, config }
  }
}

#[async_trait]
impl<S: IndexSink> IndexSink for ResilientSink<S> {
  async fn submit(&self, documents: &[IndexDocument], index_name: &str) -> Result<SinkResponse, SinkError> {
    let max_retries = self.config.max_retries;
    let mut last_error = None;

    for attempt in 0..=max_retries {
      if attempt > 0 {
        let backoff = self.config.backoff_for_attempt(attempt - 1);
        debug!(
          attempt,
          max_retries,
          backoff_ms = backoff.as_millis(),
          "Retrying sink submission after backoff"
        );
        sleep(backoff).await;
      }

      match tokio::time::timeout(self.config.request_timeout, self.inner.submit(documents, index_name)).await {
        Ok(Ok(response)) => {
          if attempt > 0 {
            info!(attempt, "Sink submission succeeded after retry");
          }
          return Ok(response);
        }
        Ok(Err(e)) => {
          if is_retryable_error(&e) && attempt < max_retries {
            warn!(attempt = attempt + 1, max_retries, err = %e, "Retryable sink error, will retry");
            last_error = Some(e);
            continue;
          }
          return Err(e);
        }
        Err(_) => {
          warn!(
            attempt = attempt + 1,
            max_retries,
            timeout_ms = self.config.request_timeout.as_millis(),
            "Sink request timed out"
          );
          last_error = Some(SinkError::Timeout);
        }
      }
    }

    warn!(max_retries, "All sink retries exhausted");
    Err(last_error.unwrap_or(SinkError::Timeout))
  }
}

/// Build the configured sink client: an HTTP sink wrapped with the retry
/// policy, or `None` when no URL is set (`forward` then fails before any
/// network attempt).
pub fn sink_from_config(config: &SinkConfig) -> Option<Arc<dyn IndexSink>> {
  config.url.as_ref().map(|url| {
    Arc::new(ResilientSink::with_config(HttpSink::new(url.clone()), RetryConfig::from(config))) as Arc<dyn IndexSink>
  })
}
