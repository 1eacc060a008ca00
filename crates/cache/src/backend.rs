use std::{
  collections::HashMap,
  sync::Mutex,
  time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::CacheError;

/// Key/value store with per-key TTL.
///
/// Only the three operations the pipeline needs: SET with expiry, GET, PING.
#[async_trait]
pub trait CacheBackend: Send + Sync {
  async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError>;
  async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
  async fn ping(&self) -> Result<(), CacheError>;
}

// ============================================================================
// Redis
// ============================================================================

/// Redis-backed store using a multiplexed async connection per command.
pub struct RedisBackend {
  client: redis::Client,
}

impl RedisBackend {
  /// Construct a client for the given connection URL.
  ///
  /// Construction validates the URL only; connectivity failures surface on
  /// the first command (or via [`CacheBackend::ping`]).
  pub fn connect(url: &str) -> Result<Self, CacheError> {
    let client = redis::Client::open(url).map_err(|e| CacheError::Client(e.to_string()))?;
    Ok(Self { client })
  }

  async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
    self
      .client
      .get_multiplexed_async_connection()
      .await
      .map_err(|e| CacheError::Backend(e.to_string()))
  }
}

#[async_trait]
impl CacheBackend for RedisBackend {
  async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
    use redis::AsyncCommands;

    let mut conn = self.connection().await?;
    let _: () = conn
      .set_ex(key, value, ttl_secs)
      .await
      .map_err(|e| CacheError::Backend(e.to_string()))?;
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
    use redis::AsyncCommands;

    let mut conn = self.connection().await?;
    let value: Option<String> = conn.get(key).await.map_err(|e| CacheError::Backend(e.to_string()))?;
    Ok(value)
  }

  async fn ping(&self) -> Result<(), CacheError> {
    let mut conn = self.connection().await?;
    let pong: String = redis::cmd("PING")
      .query_async(&mut conn)
      .await
      .map_err(|e| CacheError::Backend(e.to_string()))?;

    if pong == "PONG" {
      Ok(())
    } else {
      Err(CacheError::Backend(format!("unexpected ping reply: {pong}")))
    }
  }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory store honoring TTLs, used as a test double across the workspace.
#[derive(Default)]
pub struct MemoryBackend {
  entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of live (unexpired) entries.
  pub fn len(&self) -> usize {
    let now = Instant::now();
    self
      .entries
      .lock()
      .map(|entries| entries.values().filter(|(_, expires)| *expires > now).count())
      .unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
  async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
    let expires = Instant::now() + Duration::from_secs(ttl_secs);
    let mut entries = self.entries.lock().map_err(|_| CacheError::Backend("poisoned".into()))?;
    entries.insert(key.to_string(), (value.to_string(), expires));
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
    let entries = self.entries.lock().map_err(|_| CacheError::Backend("poisoned".into()))?;
    Ok(
      entries
        .get(key)
        .filter(|(_, expires)| *expires > Instant::now())
        .map(|(value, _)| value.clone()),
    )
  }

  async fn ping(&self) -> Result<(), CacheError> {
    Ok(())
  }
}
