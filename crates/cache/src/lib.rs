//! Intermediate chunk cache between pipeline stages.
//!
//! The `process` stage persists its chunk array here under a task-derived
//! key (`dp:<task_id>:chunks`); the `forward` stage reads it back, retrying
//! briefly because the write may not yet be visible. Entries carry a fixed
//! TTL and are never deleted explicitly.
//!
//! The backend is a trait so tests run against an in-memory store while
//! production uses Redis.

mod backend;
mod chunks;

pub use backend::{CacheBackend, MemoryBackend, RedisBackend};
pub use chunks::ChunkCache;

/// Errors from the intermediate cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// No connection URL configured. Fatal when a cache key must be resolved.
  #[error("cache is not configured (missing connection URL)")]
  Unconfigured,

  /// Client construction failed (bad URL, unavailable driver). Fatal.
  #[error("failed to construct cache client: {0}")]
  Client(String),

  /// Command-level failure talking to the backend.
  #[error("cache backend error: {0}")]
  Backend(String),

  /// The cached value is not a valid JSON chunk array. Fatal.
  #[error("cached value at {key} is malformed: {reason}")]
  MalformedValue { key: String, reason: String },
}
