//! Shared task state store.
//!
//! Every submitted task gets a record keyed by its id. Records are mutated
//! only by the executing worker (STARTED/SUCCESS/FAILURE/RETRY) or by a
//! supervisory revoke, which only lands on non-terminal states.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use docpipe_core::{TaskFailure, TaskState};
use tracing::debug;

/// One task's lifecycle record.
#[derive(Debug, Clone)]
pub struct TaskRecord {
  pub name: String,
  pub state: TaskState,
  pub submitted_at: DateTime<Utc>,
  /// Result payload reported on SUCCESS.
  pub result: Option<serde_json::Value>,
  /// Failure details reported on FAILURE.
  pub failure: Option<TaskFailure>,
}

/// Concurrent map of task id → record. Cheap to clone.
#[derive(Clone, Default)]
pub struct TaskStateStore {
  records: Arc<DashMap<String, TaskRecord>>,
}

impl TaskStateStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a freshly submitted task as PENDING.
  pub fn create_pending(&self, task_id: &str, name: &str) {
    self.records.insert(
      task_id.to_string(),
      TaskRecord {
        name: name.to_string(),
        state: TaskState::Pending,
        submitted_at: Utc::now(),
        result: None,
        failure: None,
      },
    );
  }

  pub fn set_started(&self, task_id: &str) {
    self.transition(task_id, TaskState::Started, None, None);
  }

  pub fn set_retry(&self, task_id: &str) {
    self.transition(task_id, TaskState::Retry, None, None);
  }

  pub fn set_success(&self, task_id: &str, result: serde_json::Value) {
    self.transition(task_id, TaskState::Success, Some(result), None);
  }

  pub fn set_failure(&self, task_id: &str, failure: TaskFailure) {
    self.transition(task_id, TaskState::Failure, None, Some(failure));
  }

  /// Supervisory cancel. Succeeds only from a non-terminal state.
  pub fn revoke(&self, task_id: &str) -> bool {
    match self.records.get_mut(task_id) {
      Some(mut record) if !record.state.is_terminal() => {
        debug!(task_id, from = ?record.state, "Task revoked");
        record.state = TaskState::Revoked;
        true
      }
      _ => false,
    }
  }

  pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
    self.records.get(task_id).map(|r| r.clone())
  }

  pub fn state_of(&self, task_id: &str) -> Option<TaskState> {
    self.records.get(task_id).map(|r| r.state)
  }

  /// Point-in-time copy of all records.
  pub fn snapshot(&self) -> Vec<(String, TaskRecord)> {
    self.records.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
  }

  fn transition(&self, task_id: &str, state: TaskState, result: Option<serde_json::Value>, failure: Option<TaskFailure>) {
    if let Some(mut record) = self.records.get_mut(task_id) {
      debug!(task_id, from = ?record.state, to = ?state, "Task state transition");
      record.state = state;
      if result.is_some() {
        record.result = result;
      }
      if failure.is_some() {
        record.failure = failure;
      }
    }
  }
}
