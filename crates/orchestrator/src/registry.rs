//! Explicit task registry.
//!
//! Tasks register by name with their queue, retry policy, and handler; the
//! broker dispatches by name. A handler signals either a fatal failure
//! (terminal FAILURE) or a transient one (RETRY and re-dispatch, bounded by
//! the task's policy).

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use docpipe_core::TaskFailure;
use serde_json::Value;

/// Which broker queue a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
  /// Default queue for asynchronous processing chains.
  Default,
  /// High-priority queue serving the synchronous path.
  Sync,
}

/// Error surfaced by a task body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
  /// Terminal failure. Serialized as `{stage, message}` JSON.
  #[error("{0}")]
  Fatal(TaskFailure),

  /// Expected to self-heal; the broker re-dispatches within the task's
  /// retry bound, then fails terminally.
  #[error("transient failure in {stage}: {message}")]
  Transient { stage: String, message: String },
}

impl TaskError {
  pub fn fatal(stage: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Fatal(TaskFailure::new(stage, message))
  }

  pub fn transient(stage: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Transient {
      stage: stage.into(),
      message: message.into(),
    }
  }

  /// The failure recorded when this error terminates the task.
  pub fn into_failure(self) -> TaskFailure {
    match self {
      Self::Fatal(failure) => failure,
      Self::Transient { stage, message } => TaskFailure::new(stage, format!("retries exhausted: {message}")),
    }
  }
}

/// Successful task output.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
  /// Value bound into the next chain member's payload.
  pub chain_value: Value,
  /// Value recorded with the SUCCESS state.
  pub report: Value,
}

impl TaskOutcome {
  /// Chain value and report are the same.
  pub fn uniform(value: Value) -> Self {
    Self {
      chain_value: value.clone(),
      report: value,
    }
  }
}

/// Execution context handed to a task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub task_id: String,
  /// Zero-based delivery attempt; > 0 means this is a retry.
  pub attempt: u32,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
  async fn run(&self, ctx: TaskContext, payload: Value) -> Result<TaskOutcome, TaskError>;
}

/// Registered task: queue placement, retry policy, handler.
#[derive(Clone)]
pub struct TaskSpec {
  pub queue: QueueKind,
  pub max_retries: u32,
  pub retry_delay: Duration,
  pub handler: Arc<dyn TaskHandler>,
}

/// Name → spec registry consulted by the broker at dispatch time.
#[derive(Default)]
pub struct TaskRegistry {
  tasks: HashMap<String, TaskSpec>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, name: impl Into<String>, spec: TaskSpec) {
    self.tasks.insert(name.into(), spec);
  }

  pub fn get(&self, name: &str) -> Option<&TaskSpec> {
    self.tasks.get(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.tasks.keys().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Noop;

  #[async_trait]
  impl TaskHandler for Noop {
    async fn run(&self, _ctx: TaskContext, _payload: Value) -> Result<TaskOutcome, TaskError> {
      Ok(TaskOutcome::uniform(Value::Null))
    }
  }

  #[test]
  fn test_register_and_lookup() {
    let mut registry = TaskRegistry::new();
    registry.register(
      "process",
      TaskSpec {
        queue: QueueKind::Default,
        max_retries: 0,
        retry_delay: Duration::ZERO,
        handler: Arc::new(Noop),
      },
    );

    assert!(registry.get("process").is_some());
    assert!(registry.get("unknown").is_none());
  }

  #[test]
  fn test_transient_exhaustion_failure_shape() {
    let failure = TaskError::transient("forward_failed", "chunks not yet visible").into_failure();
    assert_eq!(failure.stage, "forward_failed");
    assert!(failure.message.contains("retries exhausted"));

    let parsed: serde_json::Value = serde_json::from_str(&failure.to_json()).unwrap();
    assert_eq!(parsed["stage"], "forward_failed");
  }
}
