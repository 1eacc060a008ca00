//! Worker startup sequence.
//!
//! Pre-flight: cache connectivity is validated with a short-timeout ping (a
//! missing cache client is a soft failure, a failing ping is hard). Cluster
//! setup is idempotent and falls back from a join to a local bring-up.
//! Shutdown is cooperative: in-flight tasks drain, nothing is force-cancelled.

use std::{sync::Arc, time::Duration};

use cache::{CacheError, ChunkCache};
use compute::{ClusterManager, ComputeDeps};
use docpipe_core::config::Config;
use orchestrator::{Broker, Pipeline, TaskRegistry, TaskStateStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::WorkerState;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
  #[error("cache validation failed: {0}")]
  Cache(#[from] CacheError),

  #[error("cache ping timed out after {0:?}")]
  CachePingTimeout(Duration),

  #[error("compute cluster initialization failed")]
  Cluster,

  #[error("compute cluster has no actor pool")]
  ClusterUnavailable,
}

/// One worker process: config, cache handle, cluster manager, shared state.
pub struct Worker {
  config: Config,
  cache: ChunkCache,
  cluster: Arc<ClusterManager>,
  state: Arc<WorkerState>,
}

impl Worker {
  /// Build a worker from configuration. Cache client construction failure
  /// (a malformed URL) is fatal here.
  pub fn new(config: Config) -> Result<Self, BootstrapError> {
    let cache = ChunkCache::from_url(config.cache.url.as_deref())?;
    let cluster = Arc::new(ClusterManager::new(config.cluster.clone(), ComputeDeps::with_defaults()));
    Ok(Self::with_parts(config, cache, cluster))
  }

  /// Assemble from explicit parts (tests inject an in-memory cache here).
  pub fn with_parts(config: Config, cache: ChunkCache, cluster: Arc<ClusterManager>) -> Self {
    Self {
      config,
      cache,
      cluster,
      state: Arc::new(WorkerState::new()),
    }
  }

  pub fn state(&self) -> Arc<WorkerState> {
    self.state.clone()
  }

  /// Short-timeout connectivity ping.
  ///
  /// `Ok(false)` when no cache client is configured (soft failure); a ping
  /// that fails or times out is an error.
  pub async fn validate_cache_connection(&self) -> Result<bool, BootstrapError> {
    if !self.cache.is_configured() {
      warn!("Cache client not configured, skipping connectivity check");
      return Ok(false);
    }

    let timeout = Duration::from_secs(self.config.cache.ping_timeout_secs);
    match tokio::time::timeout(timeout, self.cache.ping()).await {
      Ok(Ok(())) => Ok(true),
      Ok(Err(e)) => Err(BootstrapError::Cache(e)),
      Err(_) => Err(BootstrapError::CachePingTimeout(timeout)),
    }
  }

  /// Pre-flight gate, not a hard requirement: any validation error converts
  /// to `false`.
  pub async fn validate_service_connections(&self) -> bool {
    match self.validate_cache_connection().await {
      Ok(ok) => ok,
      Err(e) => {
        warn!(error = %e, "Service connection validation failed");
        false
      }
    }
  }

  /// Ensure the compute cluster is up. Idempotent; joins first and falls
  /// back to a direct local bring-up. Failure here aborts worker start.
  pub async fn setup_worker_environment(&self) -> Result<(), BootstrapError> {
    if self.cluster.is_initialized() {
      return Ok(());
    }

    if self.cluster.init_for_worker("auto") {
      return Ok(());
    }

    warn!("Cluster join failed, starting local cluster");
    if self.cluster.start_local_cluster(None, false, None) {
      return Ok(());
    }

    Err(BootstrapError::Cluster)
  }

  /// Validate connections (errors propagate, a soft `false` does not) and
  /// record the OS process id in shared worker state.
  pub async fn setup_worker_process_resources(&self) -> Result<(), BootstrapError> {
    let connected = self.validate_cache_connection().await?;
    if !connected {
      warn!("Starting without a validated cache connection");
    }
    self.state.record_pid(std::process::id());
    Ok(())
  }

  /// Effective worker hostname: custom, or `worker-<pid>@<host>`.
  pub fn worker_hostname(&self) -> String {
    self
      .config
      .worker
      .hostname
      .clone()
      .unwrap_or_else(|| format!("worker-{}@{}", std::process::id(), host_name()))
  }

  /// Run the worker until interrupted or cancelled.
  ///
  /// Brings up the environment, wires the pipeline tasks into the broker,
  /// marks ready, and then waits. On shutdown the broker workers drain the
  /// job in hand and the final counters are logged.
  pub async fn start(&self, cancel: CancellationToken) -> Result<(), BootstrapError> {
    self.setup_worker_environment().await?;
    self.setup_worker_process_resources().await?;

    let pool = self.cluster.handle().ok_or(BootstrapError::ClusterUnavailable)?;
    let pipeline = Pipeline::new(
      self.config.clone(),
      pool,
      self.cache.clone(),
      orchestrator::sink_from_config(&self.config.sink),
      TaskStateStore::new(),
    );

    let mut registry = TaskRegistry::new();
    pipeline.register_tasks(&mut registry);

    let task_time_limit = self.config.queues.task_time_limit_secs.map(Duration::from_secs);
    let broker = Broker::new(Arc::new(registry), pipeline.state().clone(), task_time_limit);
    broker.start(
      self.config.queues.concurrency,
      Some(self.state.clone()),
      cancel.clone(),
    );

    self.state.mark_ready();
    info!(
      hostname = %self.worker_hostname(),
      default_queue = %self.config.queues.default_queue,
      sync_queue = %self.config.queues.sync_queue,
      concurrency = self.config.queues.concurrency,
      "Worker started"
    );

    tokio::select! {
      _ = cancel.cancelled() => {}
      result = signal::ctrl_c() => {
        if let Err(e) = result {
          warn!(error = %e, "Failed to listen for interrupt");
        } else {
          info!("Received interrupt, shutting down");
        }
      }
    }

    cancel.cancel();
    self.cluster.shutdown();
    self.state.log_final_counters();
    Ok(())
  }
}

fn host_name() -> String {
  std::env::var("HOSTNAME")
    .ok()
    .filter(|h| !h.is_empty())
    .unwrap_or_else(|| "localhost".to_string())
}
