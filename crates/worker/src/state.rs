//! Process-local worker state.
//!
//! An explicit state struct injected into lifecycle handlers rather than a
//! package-level singleton: ready flag, start time, pid, and task counters.
//! Completed increments only on terminal SUCCESS; failed increments on every
//! failed delivery, including ones that are later retried.

use std::{
  sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
  time::{Duration, SystemTime, UNIX_EPOCH},
};

use docpipe_core::TaskState;
use orchestrator::TaskObserver;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct WorkerState {
  ready: AtomicBool,
  /// Unix epoch seconds at readiness; 0 means not yet ready.
  started_at_epoch: AtomicU64,
  pid: AtomicU32,
  completed: AtomicU64,
  failed: AtomicU64,
}

impl WorkerState {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mark the worker ready and record the uptime start.
  pub fn mark_ready(&self) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    self.started_at_epoch.store(now, Ordering::SeqCst);
    self.ready.store(true, Ordering::SeqCst);
    info!(pid = self.pid(), "Worker ready");
  }

  pub fn is_ready(&self) -> bool {
    self.ready.load(Ordering::SeqCst)
  }

  pub fn record_pid(&self, pid: u32) {
    self.pid.store(pid, Ordering::SeqCst);
  }

  pub fn pid(&self) -> u32 {
    self.pid.load(Ordering::SeqCst)
  }

  /// Uptime since readiness, if ready.
  pub fn uptime(&self) -> Option<Duration> {
    let started = self.started_at_epoch.load(Ordering::SeqCst);
    if started == 0 {
      return None;
    }
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    Some(Duration::from_secs(now.saturating_sub(started)))
  }

  pub fn completed(&self) -> u64 {
    self.completed.load(Ordering::SeqCst)
  }

  pub fn failed(&self) -> u64 {
    self.failed.load(Ordering::SeqCst)
  }

  /// Log the final counters at shutdown.
  pub fn log_final_counters(&self) {
    info!(
      completed = self.completed(),
      failed = self.failed(),
      uptime_secs = self.uptime().map(|u| u.as_secs()).unwrap_or(0),
      "Worker shutting down"
    );
  }
}

impl TaskObserver for WorkerState {
  fn on_task_start(&self, name: &str, task_id: &str) {
    debug!(name, task_id, "Task starting");
  }

  fn on_task_finished(&self, name: &str, task_id: &str, state: TaskState) {
    match state {
      TaskState::Success => {
        self.completed.fetch_add(1, Ordering::SeqCst);
      }
      TaskState::Failure | TaskState::Retry => {
        self.failed.fetch_add(1, Ordering::SeqCst);
      }
      _ => {}
    }
    debug!(name, task_id, ?state, "Task finished");
  }
}
