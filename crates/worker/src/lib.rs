//! Worker bootstrap: connectivity validation, cluster setup, lifecycle
//! counters, and the `docpipe-worker` process entry point.
//!
//! The worker's only external surface is its exit code: 0 for a clean
//! shutdown, 1 for a startup or validation failure.

pub mod bootstrap;
pub mod logging;
pub mod state;

pub use bootstrap::{BootstrapError, Worker};
pub use state::WorkerState;
