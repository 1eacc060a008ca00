//! In-process task broker with named priority queues.
//!
//! Two queues: the default queue for asynchronous processing chains and a
//! high-priority queue for the synchronous path; workers always drain the
//! sync queue first. Chains enqueue the downstream task only after the
//! upstream succeeds, binding its result into the downstream payload under
//! `processed_data`. Shutdown is cooperative: workers finish the job in
//! hand, then stop pulling.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use docpipe_core::TaskState;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  registry::{QueueKind, TaskContext, TaskError, TaskRegistry},
  state::TaskStateStore,
};

/// Payload key a chain binds the upstream result to.
pub const CHAIN_RESULT_KEY: &str = "processed_data";

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
  #[error("unknown task name: {0}")]
  UnknownTask(String),
}

/// Lifecycle hooks for worker-side accounting.
pub trait TaskObserver: Send + Sync {
  fn on_task_start(&self, _name: &str, _task_id: &str) {}
  fn on_task_finished(&self, _name: &str, _task_id: &str, _state: TaskState) {}
}

#[derive(Debug, Clone)]
struct ChainLink {
  task_id: String,
  name: String,
  payload: Value,
}

#[derive(Debug, Clone)]
struct Job {
  task_id: String,
  name: String,
  payload: Value,
  attempt: u32,
  /// Downstream links still to run after this job succeeds.
  chain: VecDeque<ChainLink>,
}

// ============================================================================
// Queues
// ============================================================================

#[derive(Default)]
struct JobQueues {
  sync: Mutex<VecDeque<Job>>,
  default: Mutex<VecDeque<Job>>,
  notify: Notify,
}

impl JobQueues {
  async fn push(&self, queue: QueueKind, job: Job) {
    match queue {
      QueueKind::Sync => self.sync.lock().await.push_back(job),
      QueueKind::Default => self.default.lock().await.push_back(job),
    }
    self.notify.notify_one();
  }

  /// Pop the next job, sync queue first.
  async fn pop(&self) -> Job {
    loop {
      // Arm the waiter before checking so a concurrent push is not lost.
      let notified = self.notify.notified();
      if let Some(job) = self.sync.lock().await.pop_front() {
        return job;
      }
      if let Some(job) = self.default.lock().await.pop_front() {
        return job;
      }
      notified.await;
    }
  }
}

// ============================================================================
// Broker
// ============================================================================

/// Task broker. Cheap to clone; all clones share queues and state.
#[derive(Clone)]
pub struct Broker {
  registry: Arc<TaskRegistry>,
  state: TaskStateStore,
  queues: Arc<JobQueues>,
  task_time_limit: Option<Duration>,
}

impl Broker {
  pub fn new(registry: Arc<TaskRegistry>, state: TaskStateStore, task_time_limit: Option<Duration>) -> Self {
    Self {
      registry,
      state,
      queues: Arc::new(JobQueues::default()),
      task_time_limit,
    }
  }

  pub fn state(&self) -> &TaskStateStore {
    &self.state
  }

  /// Submit a single task. Records PENDING and returns the task id.
  pub async fn submit(&self, name: &str, payload: Value) -> Result<String, BrokerError> {
    self.submit_chain(&[(name, payload)]).await.map(|id| {
      // A one-link chain always yields an id.
      id.unwrap_or_default()
    })
  }

  /// Submit a chain: each task runs only after its predecessor succeeds,
  /// receiving the predecessor's result under `processed_data`. Returns the
  /// leading task id, or `None` for an empty chain.
  pub async fn submit_chain(&self, links: &[(&str, Value)]) -> Result<Option<String>, BrokerError> {
    for (name, _) in links {
      if self.registry.get(name).is_none() {
        return Err(BrokerError::UnknownTask(name.to_string()));
      }
    }

    if links.is_empty() {
      return Ok(None);
    }

    let mut ids = Vec::with_capacity(links.len());
    for (name, _) in links {
      let task_id = Uuid::new_v4().to_string();
      self.state.create_pending(&task_id, name);
      ids.push(task_id);
    }

    let (head_name, head_payload) = &links[0];
    let head_id = &ids[0];

    let chain = links
      .iter()
      .zip(&ids)
      .skip(1)
      .map(|((name, payload), task_id)| ChainLink {
        task_id: task_id.clone(),
        name: name.to_string(),
        payload: payload.clone(),
      })
      .collect();

    let job = Job {
      task_id: head_id.clone(),
      name: head_name.to_string(),
      payload: head_payload.clone(),
      attempt: 0,
      chain,
    };

    debug!(task_id = %job.task_id, name = %job.name, chain_len = job.chain.len(), "Task chain submitted");
    self.enqueue(job).await;
    Ok(Some(head_id.clone()))
  }

  /// Supervisory cancel; only lands on non-terminal tasks. A revoked job
  /// still in a queue is skipped when a worker picks it up.
  pub fn revoke(&self, task_id: &str) -> bool {
    self.state.revoke(task_id)
  }

  /// Spawn `concurrency` worker loops pulling from the queues.
  pub fn start(&self, concurrency: usize, observer: Option<Arc<dyn TaskObserver>>, cancel: CancellationToken) {
    info!(concurrency, "Starting broker workers");
    for worker_id in 0..concurrency.max(1) {
      let broker = self.clone();
      let observer = observer.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move {
        broker.worker_loop(worker_id, observer, cancel).await;
      });
    }
  }

  async fn enqueue(&self, job: Job) {
    let queue = self.registry.get(&job.name).map(|spec| spec.queue).unwrap_or(QueueKind::Default);
    self.queues.push(queue, job).await;
  }

  async fn worker_loop(&self, worker_id: usize, observer: Option<Arc<dyn TaskObserver>>, cancel: CancellationToken) {
    loop {
      let job = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          debug!(worker_id, "Broker worker stopping");
          break;
        }
        job = self.queues.pop() => job,
      };

      self.run_job(job, observer.as_deref()).await;
    }
  }

  async fn run_job(&self, job: Job, observer: Option<&dyn TaskObserver>) {
    if self.state.state_of(&job.task_id) == Some(TaskState::Revoked) {
      debug!(task_id = %job.task_id, "Skipping revoked task");
      return;
    }

    let Some(spec) = self.registry.get(&job.name).cloned() else {
      // Registration was validated at submit time; reaching here means the
      // registry changed under us.
      error!(name = %job.name, task_id = %job.task_id, "Task name no longer registered");
      return;
    };

    self.state.set_started(&job.task_id);
    if let Some(observer) = observer {
      observer.on_task_start(&job.name, &job.task_id);
    }

    let ctx = TaskContext {
      task_id: job.task_id.clone(),
      attempt: job.attempt,
    };
    let run = spec.handler.run(ctx, job.payload.clone());
    let result = match self.task_time_limit {
      Some(limit) => tokio::time::timeout(limit, run)
        .await
        .unwrap_or_else(|_| Err(TaskError::fatal(format!("{}_failed", job.name), "task time limit exceeded"))),
      None => run.await,
    };

    match result {
      Ok(outcome) => {
        self.state.set_success(&job.task_id, outcome.report);
        if let Some(observer) = observer {
          observer.on_task_finished(&job.name, &job.task_id, TaskState::Success);
        }
        self.advance_chain(job, outcome.chain_value).await;
      }
      Err(TaskError::Transient { stage, message }) if job.attempt < spec.max_retries => {
        warn!(
          task_id = %job.task_id,
          name = %job.name,
          attempt = job.attempt + 1,
          max_retries = spec.max_retries,
          %stage,
          %message,
          "Transient task failure, re-dispatching"
        );
        self.state.set_retry(&job.task_id);
        if let Some(observer) = observer {
          observer.on_task_finished(&job.name, &job.task_id, TaskState::Retry);
        }

        let broker = self.clone();
        let retry = Job {
          attempt: job.attempt + 1,
          ..job
        };
        tokio::spawn(async move {
          tokio::time::sleep(spec.retry_delay).await;
          broker.enqueue(retry).await;
        });
      }
      Err(e) => {
        let failure = e.into_failure();
        warn!(task_id = %job.task_id, name = %job.name, failure = %failure, "Task failed");
        self.state.set_failure(&job.task_id, failure);
        if let Some(observer) = observer {
          observer.on_task_finished(&job.name, &job.task_id, TaskState::Failure);
        }
        // Downstream chain members never run; they stay PENDING.
      }
    }
  }

  /// Enqueue the next chain member with the upstream result bound in.
  async fn advance_chain(&self, mut job: Job, chain_value: Value) {
    let Some(next) = job.chain.pop_front() else {
      return;
    };

    let mut payload = next.payload;
    match payload {
      Value::Object(ref mut map) => {
        map.insert(CHAIN_RESULT_KEY.to_string(), chain_value);
      }
      _ => {
        payload = serde_json::json!({ CHAIN_RESULT_KEY: chain_value });
      }
    }

    debug!(task_id = %next.task_id, name = %next.name, "Advancing chain");
    self
      .enqueue(Job {
        task_id: next.task_id,
        name: next.name,
        payload,
        attempt: 0,
        chain: job.chain,
      })
      .await;
  }
}
