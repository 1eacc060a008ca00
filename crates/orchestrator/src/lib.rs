//! Task orchestration: registry, broker, state reporting, and the pipeline
//! task bodies (`process`, `forward`, `process_and_forward`, `process_sync`).
//!
//! The broker pulls from two named queues (a default queue and a
//! high-priority queue for the synchronous path) and dispatches by task name
//! through an explicit registry. Chains compose `process` → `forward` so the
//! downstream stage only runs once the upstream succeeds, receiving its
//! result. Fatal failures serialize as `{"stage": ..., "message": ...}` JSON
//! through [`docpipe_core::TaskFailure`].

pub mod broker;
pub mod registry;
pub mod sink;
pub mod state;
pub mod tasks;

pub use broker::{Broker, BrokerError, TaskObserver};
pub use registry::{QueueKind, TaskContext, TaskError, TaskHandler, TaskOutcome, TaskRegistry, TaskSpec};
pub use sink::{HttpSink, IndexDocument, IndexSink, ResilientSink, RetryConfig, SinkError, SinkResponse, sink_from_config};
pub use state::{TaskRecord, TaskStateStore};
pub use tasks::{
  FORWARD_TASK, ForwardArgs, PROCESS_TASK, Pipeline, ProcessArgs, ProcessOutcome, SYNC_TASK, SyncArgs, SyncError,
};
