//! Compute actor pool and cluster lifecycle.
//!
//! Each compute actor wraps one parsing-core instance, constructed once and
//! reused so warm-up cost is amortized across calls. Actors communicate via
//! bounded `mpsc` channels; a call returns a [`ResultHandle`] promise that
//! the caller either awaits inline or resolves with a timeout.
//!
//! The [`ClusterManager`] owns bring-up/join of the pool and is idempotent:
//! repeated init calls are no-ops once a runtime exists.

pub mod actor;
pub mod cluster;
pub mod fetch;
pub mod model;
pub mod parsing;

pub use actor::{ActorPoolHandle, ComputeActor, ProcessFileRequest, ResultHandle, spawn_actor_pool};
pub use cluster::{ClusterManager, ClusterMode, ComputeDeps};
pub use fetch::{ByteFetcher, FetchError, HttpFetcher};
pub use model::{ModelConfig, ModelStore, ModelStoreError, StaticModelStore};
pub use parsing::{ParsingCore, TextSplitter};

/// Errors surfaced by compute actor calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComputeError {
  /// Source bytes could not be obtained (missing file, failed fetch).
  /// Fatal upstream, never retried.
  #[error("source not found or fetch failed: {0}")]
  FileNotFound(String),

  /// The actor pool has shut down and can no longer accept or answer calls.
  #[error("compute actor pool has shut down")]
  ActorGone,
}
