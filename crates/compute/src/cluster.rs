//! Cluster lifecycle management for the compute actor pool.
//!
//! A fresh service can join an existing cluster or self-host transparently:
//! `init_for_service` tries a join first and falls back to local bring-up,
//! while workers use `init_for_worker` to join whatever is addressed. All
//! entry points are idempotent and report success as a bool rather than
//! raising, so callers can layer their own fallback.

use std::{collections::BTreeMap, sync::Arc, sync::Mutex};

use docpipe_core::config::ClusterConfig;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  ByteFetcher, HttpFetcher, ModelStore, ParsingCore, TextSplitter,
  actor::{ActorPoolHandle, ComputeActor, spawn_actor_pool},
};

/// Env toggle the compute runtime reads at startup; must be set before
/// bring-up to take effect.
pub const CLUSTER_USAGE_STATS_ENV: &str = "DOCPIPE_CLUSTER_USAGE_STATS";

/// Shared construction inputs for compute actors.
#[derive(Clone)]
pub struct ComputeDeps {
  pub core: Arc<dyn ParsingCore>,
  pub fetcher: Arc<dyn ByteFetcher>,
  pub model_store: Option<Arc<dyn ModelStore>>,
}

impl ComputeDeps {
  /// Built-in text splitter and HTTP fetcher, no model store.
  pub fn with_defaults() -> Self {
    Self {
      core: Arc::new(TextSplitter::new()),
      fetcher: Arc::new(HttpFetcher::new()),
      model_store: None,
    }
  }
}

/// How the current runtime was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMode {
  /// Pool brought up in-process.
  Local,
  /// Joined a cluster at the given address.
  Remote { address: String },
}

struct ClusterRuntime {
  mode: ClusterMode,
  pool: ActorPoolHandle,
  cancel: CancellationToken,
}

/// Owns the compute pool lifecycle. One per process.
pub struct ClusterManager {
  config: ClusterConfig,
  deps: ComputeDeps,
  runtime: Mutex<Option<ClusterRuntime>>,
}

impl ClusterManager {
  pub fn new(config: ClusterConfig, deps: ComputeDeps) -> Self {
    Self {
      config,
      deps,
      runtime: Mutex::new(None),
    }
  }

  pub fn is_initialized(&self) -> bool {
    self.runtime.lock().map(|r| r.is_some()).unwrap_or(false)
  }

  /// Handle to the actor pool, if a runtime exists.
  pub fn handle(&self) -> Option<ActorPoolHandle> {
    self.runtime.lock().ok()?.as_ref().map(|r| r.pool.clone())
  }

  pub fn mode(&self) -> Option<ClusterMode> {
    self.runtime.lock().ok()?.as_ref().map(|r| r.mode.clone())
  }

  /// Build the parameter set for a bring-up or join.
  ///
  /// With an address this is the minimal remote-join set. Otherwise it is
  /// the local bring-up set: CPU slots, object-store memory in bytes, the
  /// spill directory, and an explicit dashboard toggle. The toggle is always
  /// present because the underlying runtime defaults to dashboard-on and an
  /// omitted key would silently enable it.
  pub fn init_params(
    &self,
    address: Option<&str>,
    num_cpus: Option<usize>,
    include_dashboard: bool,
    dashboard_port: Option<u16>,
  ) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();

    if let Some(address) = address {
      params.insert("address".to_string(), json!(address));
      return params;
    }

    if let Some(cpus) = num_cpus.or(self.config.num_cpus) {
      params.insert("num_cpus".to_string(), json!(cpus));
    }
    params.insert(
      "object_store_memory".to_string(),
      json!(self.config.object_store_memory_gb * 1024 * 1024 * 1024),
    );
    if let Some(ref temp_dir) = self.config.temp_dir {
      params.insert("temp_dir".to_string(), json!(temp_dir.to_string_lossy()));
    }

    params.insert("include_dashboard".to_string(), json!(include_dashboard));
    if include_dashboard {
      params.insert("dashboard_host".to_string(), json!(self.config.dashboard_host));
      params.insert(
        "dashboard_port".to_string(),
        json!(dashboard_port.unwrap_or(self.config.dashboard_port)),
      );
    }

    params
  }

  /// Bring up or join per the given parameter set.
  ///
  /// Idempotent: a no-op returning `true` when a runtime already exists.
  /// Never raises; any failure logs and returns `false`.
  pub fn init_cluster(&self, params: &BTreeMap<String, Value>) -> bool {
    let Ok(mut runtime) = self.runtime.lock() else {
      return false;
    };
    if runtime.is_some() {
      debug!("Cluster already initialized, skipping");
      return true;
    }

    // Consumed by the runtime at startup, so it must be set pre-init.
    unsafe { std::env::set_var(CLUSTER_USAGE_STATS_ENV, "0") };

    let mode = match params.get("address").and_then(Value::as_str) {
      Some(address) => ClusterMode::Remote {
        address: address.to_string(),
      },
      None => ClusterMode::Local,
    };

    let num_cpus = params
      .get("num_cpus")
      .and_then(Value::as_u64)
      .map(|n| n as usize)
      .unwrap_or_else(num_cpus::get);
    let actors = (num_cpus / self.config.cpus_per_actor.max(1)).max(1);

    if tokio::runtime::Handle::try_current().is_err() {
      warn!("No async runtime available for cluster bring-up");
      return false;
    }

    let cancel = CancellationToken::new();
    let deps = self.deps.clone();
    let cpu_slots = self.config.cpus_per_actor;
    let pool = spawn_actor_pool(
      actors,
      move || ComputeActor::new(deps.core.clone(), deps.fetcher.clone(), deps.model_store.clone(), cpu_slots),
      cancel.clone(),
    );

    // Best-effort visibility into what we got; never fails the call.
    self.log_resource_totals(&mode, num_cpus, actors, params);

    *runtime = Some(ClusterRuntime { mode, pool, cancel });
    true
  }

  /// Join a cluster. `"auto"` resolves through the configured address;
  /// with none configured the join fails (callers fall back to local).
  pub fn connect_to_cluster(&self, address: &str) -> bool {
    if self.is_initialized() {
      debug!("Cluster already initialized, skipping connect");
      return true;
    }

    let Some(resolved) = self.resolve_address(address) else {
      warn!(address, "No cluster address available to join");
      return false;
    };

    info!(address = %resolved, "Joining compute cluster");
    let params = self.init_params(Some(&resolved), None, false, None);
    self.init_cluster(&params)
  }

  /// Bring up a local cluster. `num_cpus` defaults to all host cores.
  pub fn start_local_cluster(&self, num_cpus: Option<usize>, include_dashboard: bool, dashboard_port: Option<u16>) -> bool {
    let cpus = num_cpus.or(self.config.num_cpus).unwrap_or_else(num_cpus::get);
    info!(num_cpus = cpus, include_dashboard, "Starting local compute cluster");
    let params = self.init_params(None, Some(cpus), include_dashboard, dashboard_port);
    self.init_cluster(&params)
  }

  /// Worker-side init: log the effective config, then join.
  pub fn init_for_worker(&self, address: &str) -> bool {
    info!(
      address,
      cpus_per_actor = self.config.cpus_per_actor,
      "Initializing compute cluster for worker"
    );
    self.connect_to_cluster(address)
  }

  /// Service-side init: try joining an existing cluster first, then fall
  /// back to local bring-up, so a fresh service works either way.
  pub fn init_for_service(
    &self,
    num_cpus: Option<usize>,
    dashboard_port: Option<u16>,
    try_connect_first: bool,
    include_dashboard: bool,
  ) -> bool {
    if try_connect_first && self.connect_to_cluster("auto") {
      return true;
    }
    self.start_local_cluster(num_cpus, include_dashboard, dashboard_port)
  }

  /// Stop actors picking up new work. In-flight calls finish.
  pub fn shutdown(&self) {
    if let Ok(runtime) = self.runtime.lock()
      && let Some(ref runtime) = *runtime
    {
      info!("Shutting down compute cluster runtime");
      runtime.cancel.cancel();
    }
  }

  fn resolve_address(&self, address: &str) -> Option<String> {
    if address == "auto" {
      self.config.address.clone()
    } else {
      Some(address.to_string())
    }
  }

  fn log_resource_totals(&self, mode: &ClusterMode, num_cpus: usize, actors: usize, params: &BTreeMap<String, Value>) {
    let object_store_bytes = params.get("object_store_memory").and_then(Value::as_u64).unwrap_or(0);
    info!(
      ?mode,
      num_cpus,
      actors,
      cpu_slots_per_actor = self.config.cpus_per_actor,
      object_store_bytes,
      "Compute cluster resources"
    );
  }
}
