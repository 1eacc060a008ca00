//! Configuration for the docpipe pipeline.
//!
//! Config is loaded from a TOML file (`DOCPIPE_CONFIG` env var or
//! `docpipe.toml` in the working directory), then environment overrides are
//! applied. Every section has sensible defaults so a bare worker starts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ============================================================================
// Cache
// ============================================================================

/// Intermediate cache (Redis) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Redis connection URL. When unset, chunk persistence is disabled and
  /// `forward` fails fatally if handed a cache key.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,

  /// Total read attempts for the process→forward cache-visibility race:
  /// one read per task delivery, re-delivered by the broker until this
  /// bound is spent.
  pub read_attempts: u32,

  /// Fixed delay between cache-visibility attempts, in milliseconds.
  pub read_delay_ms: u64,

  /// Short timeout for connectivity pings, in seconds.
  pub ping_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      url: None,
      read_attempts: 5,
      read_delay_ms: 500,
      ping_timeout_secs: 3,
    }
  }
}

// ============================================================================
// Search sink
// ============================================================================

/// Search sink (indexing service) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
  /// Base URL of the search sink. Missing URL is a fatal configuration
  /// error, checked before any network attempt.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,

  /// Maximum retry attempts for transient network failures.
  pub max_retries: u32,

  /// Initial backoff in milliseconds; grows per attempt.
  pub initial_backoff_ms: u64,

  /// Upper bound on backoff in milliseconds.
  pub max_backoff_ms: u64,

  /// Exponential backoff multiplier.
  pub backoff_multiplier: f64,

  /// Per-request timeout in seconds.
  pub request_timeout_secs: u64,
}

impl Default for SinkConfig {
  fn default() -> Self {
    Self {
      url: None,
      max_retries: 3,
      initial_backoff_ms: 1000,
      max_backoff_ms: 30_000,
      backoff_multiplier: 2.0,
      request_timeout_secs: 30,
    }
  }
}

// ============================================================================
// Queues
// ============================================================================

/// Queue and worker-pool configuration, consumed at worker start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Default queue for asynchronous processing chains.
  pub default_queue: String,

  /// High-priority queue serving the synchronous path.
  pub sync_queue: String,

  /// Concurrent task executions per worker process.
  pub concurrency: usize,

  /// Optional wall-clock limit per task execution, in seconds.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub task_time_limit_secs: Option<u64>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      default_queue: "processing".to_string(),
      sync_queue: "processing_sync".to_string(),
      concurrency: 4,
      task_time_limit_secs: None,
    }
  }
}

// ============================================================================
// Compute cluster
// ============================================================================

/// Compute cluster bring-up/join configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
  /// Remote cluster address to join. When unset, a local cluster is
  /// brought up on demand.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,

  /// CPU slots for a local bring-up. Defaults to all host cores.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub num_cpus: Option<usize>,

  /// CPU slots reserved per compute actor instance.
  pub cpus_per_actor: usize,

  /// Object-store memory for a local bring-up, in gigabytes.
  pub object_store_memory_gb: u64,

  /// Temp/spill directory for the local object store.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub temp_dir: Option<PathBuf>,

  /// Dashboard toggle. Always passed explicitly on bring-up because the
  /// underlying runtime defaults to dashboard-on when omitted.
  pub include_dashboard: bool,

  pub dashboard_host: String,
  pub dashboard_port: u16,
}

impl Default for ClusterConfig {
  fn default() -> Self {
    Self {
      address: None,
      num_cpus: None,
      cpus_per_actor: 1,
      object_store_memory_gb: 1,
      temp_dir: None,
      include_dashboard: false,
      dashboard_host: "127.0.0.1".to_string(),
      dashboard_port: 8265,
    }
  }
}

// ============================================================================
// Worker
// ============================================================================

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Custom worker hostname. Defaults to `worker-<pid>@<host>`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub hostname: Option<String>,

  /// Log level: "error", "warn", "info", "debug", "trace".
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never".
  pub log_rotation: String,

  /// Run in foreground mode (console logging, no file).
  pub foreground: bool,

  /// Directory for background log files.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub log_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      hostname: None,
      log_level: "info".to_string(),
      log_rotation: "daily".to_string(),
      foreground: false,
      log_dir: None,
    }
  }
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration for all pipeline components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub sink: SinkConfig,
  pub queues: QueueConfig,
  pub cluster: ClusterConfig,
  pub worker: WorkerConfig,
}

impl Config {
  /// Load config from the conventional locations, then apply env overrides.
  ///
  /// Order: `DOCPIPE_CONFIG` path if set, else `docpipe.toml` in the working
  /// directory, else defaults. A malformed file logs a warning and falls
  /// back to defaults rather than failing startup.
  pub fn load() -> Self {
    let path = std::env::var("DOCPIPE_CONFIG")
      .map(PathBuf::from)
      .unwrap_or_else(|_| PathBuf::from("docpipe.toml"));

    let mut config = Self::load_from(&path);
    config.apply_env_overrides();
    config
  }

  /// Load from an explicit path without env overrides.
  pub fn load_from(path: &Path) -> Self {
    if !path.exists() {
      return Self::default();
    }

    match std::fs::read_to_string(path) {
      Ok(content) => match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
          tracing::warn!("Malformed config file {:?}: {}", path, e);
          Self::default()
        }
      },
      Err(e) => {
        tracing::warn!("Failed to read config file {:?}: {}", path, e);
        Self::default()
      }
    }
  }

  /// Apply environment variable overrides on top of file values.
  pub fn apply_env_overrides(&mut self) {
    if let Ok(url) = std::env::var("DOCPIPE_REDIS_URL") {
      self.cache.url = Some(url);
    }
    if let Ok(url) = std::env::var("DOCPIPE_SINK_URL") {
      self.sink.url = Some(url);
    }
    if let Ok(address) = std::env::var("DOCPIPE_CLUSTER_ADDRESS") {
      self.cluster.address = Some(address);
    }
    if let Ok(queue) = std::env::var("DOCPIPE_QUEUE") {
      self.queues.default_queue = queue;
    }
    if let Ok(queue) = std::env::var("DOCPIPE_SYNC_QUEUE") {
      self.queues.sync_queue = queue;
    }
    if let Ok(concurrency) = std::env::var("DOCPIPE_CONCURRENCY")
      && let Ok(n) = concurrency.parse()
    {
      self.queues.concurrency = n;
    }
    if let Ok(hostname) = std::env::var("DOCPIPE_WORKER_HOSTNAME") {
      self.worker.hostname = Some(hostname);
    }
  }
}
