use std::sync::Arc;

use docpipe_core::{CACHE_TTL_SECS, ChunkRecord};
use tracing::{debug, warn};

use crate::{CacheBackend, CacheError, RedisBackend};

/// Handle to the intermediate chunk cache.
///
/// May be unconfigured (no URL): writes then report `false` without raising,
/// and reads fail with [`CacheError::Unconfigured`].
#[derive(Clone)]
pub struct ChunkCache {
  backend: Option<Arc<dyn CacheBackend>>,
}

impl ChunkCache {
  /// A cache handle with no backend. Writes no-op, reads error.
  pub fn unconfigured() -> Self {
    Self { backend: None }
  }

  /// Connect to Redis at the given URL. Client construction failure is
  /// fatal to the caller.
  pub fn connect(url: &str) -> Result<Self, CacheError> {
    let backend = RedisBackend::connect(url)?;
    Ok(Self::with_backend(Arc::new(backend)))
  }

  /// Connect if a URL is configured, otherwise return an unconfigured handle.
  pub fn from_url(url: Option<&str>) -> Result<Self, CacheError> {
    match url {
      Some(url) => Self::connect(url),
      None => Ok(Self::unconfigured()),
    }
  }

  /// Wrap an explicit backend (tests inject [`crate::MemoryBackend`] here).
  pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
    Self {
      backend: Some(backend),
    }
  }

  pub fn is_configured(&self) -> bool {
    self.backend.is_some()
  }

  /// Persist a chunk array under `key` with the fixed TTL.
  ///
  /// Serializes to compact UTF-8 JSON (non-ASCII preserved). `None`
  /// normalizes to `[]`, and a serialization failure also stores `[]` so a
  /// broken value never lands at the key. Returns `false` without raising
  /// when the cache is unconfigured or the write fails; repeated writes to
  /// the same key overwrite.
  pub async fn store_chunks(&self, key: &str, chunks: Option<&[ChunkRecord]>) -> bool {
    let Some(ref backend) = self.backend else {
      warn!(key, "Cache not configured, skipping chunk persistence");
      return false;
    };

    let payload = match chunks {
      None => "[]".to_string(),
      Some(chunks) => serde_json::to_string(chunks).unwrap_or_else(|e| {
        warn!(key, error = %e, "Chunk serialization failed, storing empty array");
        "[]".to_string()
      }),
    };

    match backend.set_ex(key, &payload, CACHE_TTL_SECS).await {
      Ok(()) => {
        debug!(key, bytes = payload.len(), "Stored chunk payload");
        true
      }
      Err(e) => {
        warn!(key, error = %e, "Failed to store chunk payload");
        false
      }
    }
  }

  /// Read the raw value at `key`. `Ok(None)` means the key is not (yet)
  /// visible, which callers treat as transient.
  pub async fn load_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
    let backend = self.backend.as_ref().ok_or(CacheError::Unconfigured)?;
    backend.get(key).await
  }

  /// Read and decode the chunk array at `key`.
  ///
  /// `Ok(None)` is a cache miss (transient); a present but undecodable
  /// value is [`CacheError::MalformedValue`] (fatal).
  pub async fn load_chunks(&self, key: &str) -> Result<Option<Vec<ChunkRecord>>, CacheError> {
    let Some(raw) = self.load_raw(key).await? else {
      return Ok(None);
    };

    serde_json::from_str(&raw)
      .map(Some)
      .map_err(|e| CacheError::MalformedValue {
        key: key.to_string(),
        reason: e.to_string(),
      })
  }

  /// Connectivity check used by worker pre-flight validation.
  pub async fn ping(&self) -> Result<(), CacheError> {
    let backend = self.backend.as_ref().ok_or(CacheError::Unconfigured)?;
    backend.ping().await
  }
}
