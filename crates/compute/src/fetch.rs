//! Byte-source fetchers.
//!
//! Local sources are read directly after an existence check; networked
//! object sources go through the [`ByteFetcher`] seam, whose real
//! implementation lives outside this system.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

/// Errors from a byte-source fetch. Callers treat any error the same as a
/// missing object (fatal upstream).
#[derive(Debug)]
pub struct FetchError {
  pub source: String,
  pub reason: String,
}

impl std::fmt::Display for FetchError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "fetch failed for {}: {}", self.source, self.reason)
  }
}

impl std::error::Error for FetchError {}

/// Fetches raw bytes for a non-local source.
///
/// `Ok(None)` means the object does not exist; callers surface that as a
/// file-not-found condition.
#[async_trait]
pub trait ByteFetcher: Send + Sync {
  async fn fetch(&self, source: &str) -> Result<Option<Vec<u8>>, FetchError>;
}

/// Read a local file, returning `None` when the path does not exist.
pub async fn read_local(source: &str) -> Result<Option<Vec<u8>>, FetchError> {
  let path = Path::new(source);
  if !path.exists() {
    return Ok(None);
  }

  match tokio::fs::read(path).await {
    Ok(bytes) => {
      debug!(source, bytes = bytes.len(), "Read local source");
      Ok(Some(bytes))
    }
    Err(e) => Err(FetchError {
      source: source.to_string(),
      reason: e.to_string(),
    }),
  }
}

/// HTTP object fetcher used for object-store sources addressed by URL.
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }
}

impl Default for HttpFetcher {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
  async fn fetch(&self, source: &str) -> Result<Option<Vec<u8>>, FetchError> {
    let response = self.client.get(source).send().await.map_err(|e| FetchError {
      source: source.to_string(),
      reason: e.to_string(),
    })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }

    let response = response.error_for_status().map_err(|e| FetchError {
      source: source.to_string(),
      reason: e.to_string(),
    })?;

    let bytes = response.bytes().await.map_err(|e| FetchError {
      source: source.to_string(),
      reason: e.to_string(),
    })?;

    debug!(source, bytes = bytes.len(), "Fetched object source");
    Ok(Some(bytes.to_vec()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_read_local_missing_is_none() {
    assert!(read_local("/tmp/definitely-not-here-12345.txt").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_read_local_existing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.txt");
    std::fs::write(&path, "contents").unwrap();

    let bytes = read_local(path.to_str().unwrap()).await.unwrap().unwrap();
    assert_eq!(bytes, b"contents");
  }
}
