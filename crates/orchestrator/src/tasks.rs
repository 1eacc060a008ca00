//! The pipeline task bodies: `process`, `forward`, `process_and_forward`,
//! and the synchronous path `process_sync`.
//!
//! `process` dispatches to the compute actor pool and always persists the
//! resulting chunk array to the intermediate cache; `forward` loads it back
//! (tolerating the write-visibility race with a bounded fixed-delay retry),
//! filters blanks, and submits batched documents to the search sink with
//! partial-failure accounting.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use cache::ChunkCache;
use chrono::Utc;
use compute::{ActorPoolHandle, ComputeError, ProcessFileRequest};
use docpipe_core::{
  ChunkRecord, ChunkingParams, ForwardResult, ProcessResult, SourceKind, SyncProcessResult, TaskFailure, TaskState,
  chunk_cache_key, config::Config,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  broker::{Broker, BrokerError},
  registry::{QueueKind, TaskContext, TaskError, TaskHandler, TaskOutcome, TaskRegistry, TaskSpec},
  sink::{IndexDocument, IndexSink},
  state::TaskStateStore,
};

pub const PROCESS_TASK: &str = "process";
pub const FORWARD_TASK: &str = "forward";
pub const SYNC_TASK: &str = "process_sync";

const PROCESS_STAGE: &str = "process_failed";
const FORWARD_STAGE: &str = "forward_failed";
const SYNC_STAGE: &str = "sync_processing_failed";

// ============================================================================
// Payloads
// ============================================================================

/// `process` task payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessArgs {
  pub source: String,
  pub source_type: String,
  pub chunking_strategy: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub index_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub original_filename: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub model_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tenant_id: Option<String>,
  pub params: ChunkingParams,
}

/// `forward` task payload. `processed_data` arrives through chain binding;
/// the remaining fields are caller-supplied fallbacks that embedded values
/// take priority over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardArgs {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub processed_data: Option<ProcessResult>,
  pub index_name: String,
  pub source: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub original_filename: Option<String>,
}

/// `process_sync` task payload; the source is always local on this path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncArgs {
  pub source: String,
  pub chunking_strategy: String,
}

/// `process` output plus the figures reported with SUCCESS.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
  pub result: ProcessResult,
  pub chunk_count: usize,
  /// Seconds spent fetching and chunking.
  pub processing_time: f64,
}

/// Errors from the synchronous processing path. A wait timeout is distinct
/// from a processing failure: the task may still finish server-side.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("synchronous processing is not implemented for source_type: {0}")]
  NotImplemented(String),

  #[error("timed out waiting for the processing result")]
  Timeout,

  #[error("{0}")]
  Failed(TaskFailure),
}

// ============================================================================
// Pipeline
// ============================================================================

struct PipelineInner {
  config: Config,
  cache: ChunkCache,
  pool: ActorPoolHandle,
  sink: Option<Arc<dyn IndexSink>>,
  state: TaskStateStore,
}

/// The document-processing pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
  inner: Arc<PipelineInner>,
}

impl Pipeline {
  pub fn new(
    config: Config,
    pool: ActorPoolHandle,
    cache: ChunkCache,
    sink: Option<Arc<dyn IndexSink>>,
    state: TaskStateStore,
  ) -> Self {
    Self {
      inner: Arc::new(PipelineInner {
        config,
        cache,
        pool,
        sink,
        state,
      }),
    }
  }

  pub fn state(&self) -> &TaskStateStore {
    &self.inner.state
  }

  /// Register `process`, `forward`, and `process_sync` with their queues and
  /// retry policies. `forward` retries on the cache-visibility race with a
  /// fixed delay: one cache read per delivery, `read_attempts` deliveries in
  /// total. The synchronous task rides the high-priority queue.
  pub fn register_tasks(&self, registry: &mut TaskRegistry) {
    let cache = &self.inner.config.cache;
    registry.register(
      PROCESS_TASK,
      TaskSpec {
        queue: QueueKind::Default,
        max_retries: 0,
        retry_delay: Duration::ZERO,
        handler: Arc::new(ProcessTask { pipeline: self.clone() }),
      },
    );
    registry.register(
      FORWARD_TASK,
      TaskSpec {
        queue: QueueKind::Default,
        max_retries: cache.read_attempts.saturating_sub(1),
        retry_delay: Duration::from_millis(cache.read_delay_ms),
        handler: Arc::new(ForwardTask { pipeline: self.clone() }),
      },
    );
    registry.register(
      SYNC_TASK,
      TaskSpec {
        queue: QueueKind::Sync,
        max_retries: 0,
        retry_delay: Duration::ZERO,
        handler: Arc::new(SyncTask { pipeline: self.clone() }),
      },
    );
  }

  // --------------------------------------------------------------------------
  // process
  // --------------------------------------------------------------------------

  /// Fetch, chunk, and persist one document's chunks to the cache.
  ///
  /// Unsupported `source_type` and a missing source are fatal and
  /// non-retryable. Chunks are always persisted to the cache; if the write
  /// fails, they flow inline instead so `forward` still has exactly one
  /// authoritative payload source.
  pub async fn process(&self, task_id: &str, args: &ProcessArgs) -> Result<ProcessOutcome, TaskError> {
    let started = Instant::now();
    info!(task_id, source = %args.source, strategy = %args.chunking_strategy, "Processing document");

    let kind = SourceKind::parse(&args.source_type)
      .ok_or_else(|| TaskError::fatal(PROCESS_STAGE, format!("Unsupported source_type: {}", args.source_type)))?;

    let request = ProcessFileRequest {
      source: args.source.clone(),
      chunking_strategy: args.chunking_strategy.clone(),
      destination: kind,
      task_id: Some(task_id.to_string()),
      model_id: args.model_id.clone(),
      tenant_id: args.tenant_id.clone(),
      params: args.params.clone(),
    };

    let chunks = self.inner.pool.process(request).await.map_err(|e| match e {
      ComputeError::FileNotFound(source) => TaskError::fatal(PROCESS_STAGE, format!("Source file not found: {source}")),
      ComputeError::ActorGone => TaskError::fatal(PROCESS_STAGE, "compute actor pool is unavailable"),
    })?;

    let processing_time = started.elapsed().as_secs_f64();
    let chunk_count = chunks.len();

    let key = chunk_cache_key(task_id);
    let stored = self.inner.cache.store_chunks(&key, Some(&chunks)).await;

    let result = if stored {
      ProcessResult {
        redis_key: Some(key),
        chunks: None,
        source: args.source.clone(),
        index_name: args.index_name.clone(),
        original_filename: args.original_filename.clone(),
        chunking_strategy: args.chunking_strategy.clone(),
      }
    } else {
      warn!(task_id, "Chunk persistence failed, passing chunks inline");
      ProcessResult {
        redis_key: None,
        chunks: Some(chunks),
        source: args.source.clone(),
        index_name: args.index_name.clone(),
        original_filename: args.original_filename.clone(),
        chunking_strategy: args.chunking_strategy.clone(),
      }
    };

    info!(task_id, chunk_count, processing_time, "Document processed");
    Ok(ProcessOutcome {
      result,
      chunk_count,
      processing_time,
    })
  }

  // --------------------------------------------------------------------------
  // forward
  // --------------------------------------------------------------------------

  /// Load chunks, filter blanks, and submit batched documents to the search
  /// sink, validating its accounting.
  pub async fn forward(&self, args: &ForwardArgs) -> Result<ForwardResult, TaskError> {
    let processed = args
      .processed_data
      .as_ref()
      .ok_or_else(|| TaskError::fatal(FORWARD_STAGE, "missing processed data"))?;

    let chunks = if let Some(ref key) = processed.redis_key {
      self.load_cached_chunks(key).await?
    } else if let Some(ref chunks) = processed.chunks {
      chunks.clone()
    } else {
      return Err(TaskError::fatal(
        FORWARD_STAGE,
        "processed data has neither redis_key nor chunks",
      ));
    };

    let total = chunks.len();
    let chunks: Vec<ChunkRecord> = chunks
      .into_iter()
      .filter(|chunk| {
        if chunk.is_blank() {
          warn!("Dropping chunk with empty content");
          false
        } else {
          true
        }
      })
      .collect();
    if chunks.is_empty() {
      return Err(TaskError::fatal(FORWARD_STAGE, "no content to index"));
    }
    debug!(total, kept = chunks.len(), "Filtered chunks for indexing");

    // Values embedded in the processed data take priority over the
    // caller-supplied fallbacks.
    let index_name = processed.index_name.clone().unwrap_or_else(|| args.index_name.clone());
    let source = if processed.source.is_empty() {
      args.source.clone()
    } else {
      processed.source.clone()
    };
    let original_filename = processed.original_filename.clone().or_else(|| args.original_filename.clone());

    let documents = build_documents(
      &chunks,
      &source,
      original_filename.as_deref(),
      &processed.chunking_strategy,
      args.source_type.as_deref(),
    );

    let Some(ref sink) = self.inner.sink else {
      return Err(TaskError::fatal(FORWARD_STAGE, "Search sink URL is not configured"));
    };

    info!(documents = documents.len(), index = %index_name, "Submitting documents to search sink");
    let response = sink
      .submit(&documents, &index_name)
      .await
      .map_err(|e| TaskError::fatal(FORWARD_STAGE, format!("indexing failed: {e}")))?;

    if !response.success {
      return Err(TaskError::fatal(
        FORWARD_STAGE,
        format!(
          "sink reported failure: {}",
          response.message.unwrap_or_else(|| "no message".to_string())
        ),
      ));
    }
    if response.total_indexed == 0 {
      return Err(TaskError::fatal(
        FORWARD_STAGE,
        format!("partial success: indexed 0 of {} documents", response.total_submitted),
      ));
    }
    if response.total_indexed < response.total_submitted {
      warn!(
        indexed = response.total_indexed,
        submitted = response.total_submitted,
        "Sink indexed only part of the batch"
      );
    }

    info!(chunks_stored = response.total_indexed, index = %index_name, "Documents indexed");
    Ok(ForwardResult {
      chunks_stored: response.total_indexed,
      index_name,
      source,
      original_filename,
    })
  }

  /// Read the cached chunk array. A miss is the process→forward
  /// write-visibility race: transient, so the broker re-delivers after the
  /// configured delay (one read per delivery, `read_attempts` in total).
  /// Everything else is fatal.
  async fn load_cached_chunks(&self, key: &str) -> Result<Vec<ChunkRecord>, TaskError> {
    match self.inner.cache.load_chunks(key).await {
      Ok(Some(chunks)) => Ok(chunks),
      Ok(None) => {
        debug!(key, "Cached chunks not yet visible");
        Err(TaskError::transient(
          FORWARD_STAGE,
          format!("cached chunks at {key} are not yet visible"),
        ))
      }
      Err(e) => Err(TaskError::fatal(FORWARD_STAGE, e.to_string())),
    }
  }

  // --------------------------------------------------------------------------
  // process_and_forward
  // --------------------------------------------------------------------------

  /// Submit the `process` → `forward` chain. Returns the leading task id,
  /// or `""` when submission yields no handle.
  pub async fn process_and_forward(&self, broker: &Broker, args: &ProcessArgs) -> String {
    let process_payload = serde_json::to_value(args).unwrap_or(Value::Null);
    let forward_fallback = json!({
      "index_name": args.index_name.clone().unwrap_or_default(),
      "source": args.source,
      "source_type": args.source_type,
      "original_filename": args.original_filename,
    });

    match broker
      .submit_chain(&[(PROCESS_TASK, process_payload), (FORWARD_TASK, forward_fallback)])
      .await
    {
      Ok(Some(task_id)) => task_id,
      Ok(None) => String::new(),
      Err(e @ BrokerError::UnknownTask(_)) => {
        warn!(error = %e, "Chain submission yielded no handle");
        String::new()
      }
    }
  }

  // --------------------------------------------------------------------------
  // process_sync
  // --------------------------------------------------------------------------

  /// Process a local document through the high-priority queue and wait for
  /// the result under a caller wall-clock timeout. Other source kinds are
  /// not implemented on this path; the task keeps running server-side if
  /// the wait times out.
  pub async fn process_sync(
    &self,
    broker: &Broker,
    source: &str,
    source_type: &str,
    chunking_strategy: &str,
    timeout: Duration,
  ) -> Result<SyncProcessResult, SyncError> {
    if SourceKind::parse(source_type) != Some(SourceKind::Local) {
      let task_id = Uuid::new_v4().to_string();
      self.inner.state.create_pending(&task_id, SYNC_TASK);
      let failure = TaskFailure::new(
        SYNC_STAGE,
        format!("synchronous processing is not implemented for source_type: {source_type}"),
      );
      self.inner.state.set_failure(&task_id, failure);
      return Err(SyncError::NotImplemented(source_type.to_string()));
    }

    let payload = json!({
      "source": source,
      "chunking_strategy": chunking_strategy,
    });
    let task_id = broker
      .submit(SYNC_TASK, payload)
      .await
      .map_err(|e| SyncError::Failed(TaskFailure::new(SYNC_STAGE, e.to_string())))?;

    self.wait_for_sync_result(&task_id, timeout).await
  }

  /// Poll the state store until the synchronous task reaches a terminal
  /// state or the caller deadline passes.
  async fn wait_for_sync_result(&self, task_id: &str, timeout: Duration) -> Result<SyncProcessResult, SyncError> {
    let deadline = Instant::now() + timeout;
    let poll = Duration::from_millis(5);

    loop {
      if let Some(record) = self.inner.state.get(task_id) {
        match record.state {
          TaskState::Success => {
            let result = record
              .result
              .and_then(|value| serde_json::from_value(value).ok())
              .ok_or_else(|| SyncError::Failed(TaskFailure::new(SYNC_STAGE, "result is missing or malformed")))?;
            return Ok(result);
          }
          TaskState::Failure | TaskState::Revoked => {
            let failure = record
              .failure
              .unwrap_or_else(|| TaskFailure::new(SYNC_STAGE, "task did not complete"));
            return Err(SyncError::Failed(failure));
          }
          _ => {}
        }
      }

      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        // Not a processing failure: the task continues server-side.
        warn!(task_id, timeout_ms = timeout.as_millis(), "Timed out waiting for processing result");
        return Err(SyncError::Timeout);
      }
      sleep(poll.min(remaining)).await;
    }
  }

  /// The synchronous task body: fetch, chunk, and join non-blank contents
  /// with blank-line separators.
  async fn run_sync_processing(&self, task_id: &str, args: &SyncArgs) -> Result<SyncProcessResult, TaskError> {
    let started = Instant::now();

    let request = ProcessFileRequest {
      source: args.source.clone(),
      chunking_strategy: args.chunking_strategy.clone(),
      destination: SourceKind::Local,
      task_id: Some(task_id.to_string()),
      model_id: None,
      tenant_id: None,
      params: ChunkingParams::default(),
    };

    let chunks = self
      .inner
      .pool
      .process(request)
      .await
      .map_err(|e| TaskError::fatal(SYNC_STAGE, e.to_string()))?;

    let processing_time = started.elapsed().as_secs_f64();
    let text = chunks
      .iter()
      .filter(|chunk| !chunk.is_blank())
      .map(|chunk| chunk.content.as_str())
      .collect::<Vec<_>>()
      .join("\n\n");

    Ok(SyncProcessResult {
      text_length: text.chars().count(),
      chunks_count: chunks.len(),
      processing_time,
      text,
      chunks,
    })
  }
}

/// Build index documents: chunk metadata with `creation_date` defaulted and
/// the pipeline-level fields stamped in.
fn build_documents(
  chunks: &[ChunkRecord],
  source: &str,
  original_filename: Option<&str>,
  chunking_strategy: &str,
  source_type: Option<&str>,
) -> Vec<IndexDocument> {
  let now = Utc::now();
  chunks
    .iter()
    .map(|chunk| {
      let mut metadata = serde_json::to_value(&chunk.metadata).unwrap_or_else(|_| json!({}));
      if let Value::Object(ref mut map) = metadata {
        map.entry("creation_date").or_insert_with(|| json!(now.to_rfc3339()));
        map.insert("source".to_string(), json!(source));
        if let Some(filename) = original_filename {
          map.insert("filename".to_string(), json!(filename));
        }
        map.insert("chunking_strategy".to_string(), json!(chunking_strategy));
        if let Some(source_type) = source_type {
          map.insert("source_type".to_string(), json!(source_type));
        }
      }
      IndexDocument {
        content: chunk.content.clone(),
        metadata,
      }
    })
    .collect()
}

// ============================================================================
// Handlers
// ============================================================================

struct ProcessTask {
  pipeline: Pipeline,
}

#[async_trait::async_trait]
impl TaskHandler for ProcessTask {
  async fn run(&self, ctx: TaskContext, payload: Value) -> Result<TaskOutcome, TaskError> {
    let args: ProcessArgs = serde_json::from_value(payload)
      .map_err(|e| TaskError::fatal(PROCESS_STAGE, format!("invalid payload: {e}")))?;

    let outcome = self.pipeline.process(&ctx.task_id, &args).await?;
    let chain_value = serde_json::to_value(&outcome.result)
      .map_err(|e| TaskError::fatal(PROCESS_STAGE, format!("result serialization failed: {e}")))?;

    Ok(TaskOutcome {
      chain_value,
      report: json!({
        "redis_key": outcome.result.redis_key,
        "chunk_count": outcome.chunk_count,
        "processing_time": outcome.processing_time,
      }),
    })
  }
}

struct ForwardTask {
  pipeline: Pipeline,
}

#[async_trait::async_trait]
impl TaskHandler for ForwardTask {
  async fn run(&self, _ctx: TaskContext, payload: Value) -> Result<TaskOutcome, TaskError> {
    let args: ForwardArgs = serde_json::from_value(payload)
      .map_err(|e| TaskError::fatal(FORWARD_STAGE, format!("invalid payload: {e}")))?;

    let result = self.pipeline.forward(&args).await?;
    let report = serde_json::to_value(&result)
      .map_err(|e| TaskError::fatal(FORWARD_STAGE, format!("result serialization failed: {e}")))?;
    Ok(TaskOutcome::uniform(report))
  }
}

struct SyncTask {
  pipeline: Pipeline,
}

#[async_trait::async_trait]
impl TaskHandler for SyncTask {
  async fn run(&self, ctx: TaskContext, payload: Value) -> Result<TaskOutcome, TaskError> {
    let args: SyncArgs =
      serde_json::from_value(payload).map_err(|e| TaskError::fatal(SYNC_STAGE, format!("invalid payload: {e}")))?;

    let result = self.pipeline.run_sync_processing(&ctx.task_id, &args).await?;
    let report = serde_json::to_value(&result)
      .map_err(|e| TaskError::fatal(SYNC_STAGE, format!("result serialization failed: {e}")))?;
    Ok(TaskOutcome::uniform(report))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Mutex as StdMutex,
    atomic::{AtomicUsize, Ordering},
  };

  use cache::{CacheBackend, CacheError, MemoryBackend};
  use compute::{ComputeActor, HttpFetcher, ParsingCore, TextSplitter, spawn_actor_pool};
  use docpipe_core::TaskState;
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::sink::{SinkError, SinkResponse};

  /// Sink that records submissions and answers with a canned or echoed
  /// accounting.
  struct RecordingSink {
    submissions: StdMutex<Vec<(Vec<IndexDocument>, String)>>,
    fixed: Option<SinkResponse>,
  }

  impl RecordingSink {
    fn echo() -> Arc<Self> {
      Arc::new(Self {
        submissions: StdMutex::new(Vec::new()),
        fixed: None,
      })
    }

    fn fixed(response: SinkResponse) -> Arc<Self> {
      Arc::new(Self {
        submissions: StdMutex::new(Vec::new()),
        fixed: Some(response),
      })
    }

    fn submission_count(&self) -> usize {
      self.submissions.lock().unwrap().len()
    }
  }

  #[async_trait::async_trait]
  impl IndexSink for RecordingSink {
    async fn submit(&self, documents: &[IndexDocument], index_name: &str) -> Result<SinkResponse, SinkError> {
      self
        .submissions
        .lock()
        .unwrap()
        .push((documents.to_vec(), index_name.to_string()));
      Ok(self.fixed.clone().unwrap_or(SinkResponse {
        success: true,
        total_indexed: documents.len() as u64,
        total_submitted: documents.len() as u64,
        message: None,
      }))
    }
  }

  fn fast_config() -> Config {
    let mut config = Config::default();
    config.cache.read_attempts = 2;
    config.cache.read_delay_ms = 1;
    config
  }

  fn spawn_pool(cancel: &CancellationToken) -> ActorPoolHandle {
    spawn_actor_pool(
      1,
      || ComputeActor::new(Arc::new(TextSplitter::new()), Arc::new(HttpFetcher::new()), None, 1),
      cancel.clone(),
    )
  }

  fn pipeline_with(sink: Option<Arc<dyn IndexSink>>, cache: ChunkCache, cancel: &CancellationToken) -> Pipeline {
    Pipeline::new(fast_config(), spawn_pool(cancel), cache, sink, TaskStateStore::new())
  }

  fn started_broker(pipeline: &Pipeline, cancel: &CancellationToken) -> Broker {
    let mut registry = TaskRegistry::new();
    pipeline.register_tasks(&mut registry);
    let broker = Broker::new(Arc::new(registry), pipeline.state().clone(), None);
    broker.start(1, None, cancel.clone());
    broker
  }

  fn memory_cache() -> ChunkCache {
    ChunkCache::with_backend(Arc::new(MemoryBackend::new()))
  }

  fn write_temp(content: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.txt");
    std::fs::write(&path, content).unwrap();
    let path = path.to_string_lossy().into_owned();
    (dir, path)
  }

  fn process_args(source: &str) -> ProcessArgs {
    ProcessArgs {
      source: source.to_string(),
      source_type: "local".to_string(),
      chunking_strategy: "basic".to_string(),
      ..Default::default()
    }
  }

  // --------------------------------------------------------------------------
  // process
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_process_missing_file_fails_with_json_decodable_error() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);

    let err = pipeline
      .process("t1", &process_args("/tmp/missing-docpipe-8831.txt"))
      .await
      .unwrap_err();

    let TaskError::Fatal(failure) = err else {
      panic!("expected fatal error");
    };
    let parsed: Value = serde_json::from_str(&failure.to_json()).unwrap();
    assert_eq!(parsed["stage"], "process_failed");
    assert!(parsed["message"].as_str().unwrap().contains("not found"));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_process_unsupported_source_type_is_fatal() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);

    let mut args = process_args("/tmp/whatever.txt");
    args.source_type = "carrier-pigeon".to_string();
    let err = pipeline.process("t1", &args).await.unwrap_err();
    assert!(matches!(err, TaskError::Fatal(ref f) if f.message.contains("Unsupported source_type")));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_process_persists_chunks_under_task_key() {
    let cancel = CancellationToken::new();
    let cache = memory_cache();
    let pipeline = pipeline_with(None, cache.clone(), &cancel);
    let (_dir, path) = write_temp("first paragraph\n\nsecond paragraph");

    let outcome = pipeline.process("task-7", &process_args(&path)).await.unwrap();

    assert_eq!(outcome.result.redis_key.as_deref(), Some("dp:task-7:chunks"));
    assert!(outcome.result.chunks.is_none());
    assert_eq!(outcome.chunk_count, 2);

    let stored = cache.load_chunks("dp:task-7:chunks").await.unwrap().unwrap();
    assert_eq!(stored.len(), 2);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_process_falls_back_inline_when_cache_unavailable() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, ChunkCache::unconfigured(), &cancel);
    let (_dir, path) = write_temp("content");

    let outcome = pipeline.process("task-8", &process_args(&path)).await.unwrap();

    // Exactly one payload source: inline chunks when the cache write failed
    assert!(outcome.result.redis_key.is_none());
    assert_eq!(outcome.result.chunks.as_ref().unwrap().len(), 1);
    cancel.cancel();
  }

  // --------------------------------------------------------------------------
  // forward
  // --------------------------------------------------------------------------

  fn forward_args(processed: Option<ProcessResult>) -> ForwardArgs {
    ForwardArgs {
      processed_data: processed,
      index_name: "idx".to_string(),
      source: "/tmp/a.txt".to_string(),
      source_type: Some("local".to_string()),
      original_filename: None,
    }
  }

  fn inline_processed(chunks: Vec<ChunkRecord>) -> ProcessResult {
    ProcessResult {
      chunks: Some(chunks),
      source: "/tmp/a.txt".to_string(),
      chunking_strategy: "basic".to_string(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_forward_end_to_end_from_cache_key() {
    let cancel = CancellationToken::new();
    let cache = memory_cache();
    let sink = RecordingSink::echo();
    let pipeline = pipeline_with(Some(sink.clone()), cache, &cancel);
    let (_dir, path) = write_temp("one paragraph only");

    let outcome = pipeline.process("task-9", &process_args(&path)).await.unwrap();
    let result = pipeline
      .forward(&forward_args(Some(outcome.result)))
      .await
      .unwrap();

    assert_eq!(result.chunks_stored, 1);
    assert_eq!(result.index_name, "idx");
    assert_eq!(sink.submission_count(), 1);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_filters_blank_chunks_k_of_n() {
    let cancel = CancellationToken::new();
    let sink = RecordingSink::echo();
    let pipeline = pipeline_with(Some(sink.clone()), memory_cache(), &cancel);

    let chunks = vec![
      ChunkRecord::new("keep one"),
      ChunkRecord::new("   \n "),
      ChunkRecord::new("keep two"),
    ];
    let result = pipeline
      .forward(&forward_args(Some(inline_processed(chunks))))
      .await
      .unwrap();

    assert_eq!(result.chunks_stored, 2);
    let submissions = sink.submissions.lock().unwrap();
    assert_eq!(submissions[0].0.len(), 2);
    assert!(submissions[0].0.iter().all(|d| !d.content.trim().is_empty()));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_all_blank_is_no_content_to_index() {
    let cancel = CancellationToken::new();
    let sink = RecordingSink::echo();
    let pipeline = pipeline_with(Some(sink.clone()), memory_cache(), &cancel);

    let err = pipeline
      .forward(&forward_args(Some(inline_processed(vec![ChunkRecord::new("   ")]))))
      .await
      .unwrap_err();

    assert!(matches!(err, TaskError::Fatal(ref f) if f.message.contains("no content to index")));
    assert_eq!(sink.submission_count(), 0);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_neither_key_nor_chunks_is_fatal() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(Some(RecordingSink::echo()), memory_cache(), &cancel);

    let err = pipeline
      .forward(&forward_args(Some(ProcessResult::default())))
      .await
      .unwrap_err();
    assert!(matches!(err, TaskError::Fatal(ref f) if f.message.contains("neither")));
    cancel.cancel();
  }

  /// Counts GETs while delegating to an in-memory store.
  struct CountingBackend {
    inner: MemoryBackend,
    reads: AtomicUsize,
  }

  impl CountingBackend {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        inner: MemoryBackend::new(),
        reads: AtomicUsize::new(0),
      })
    }
  }

  #[async_trait::async_trait]
  impl CacheBackend for CountingBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
      self.inner.set_ex(key, value, ttl_secs).await
    }
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
      self.reads.fetch_add(1, Ordering::SeqCst);
      self.inner.get(key).await
    }
    async fn ping(&self) -> Result<(), CacheError> {
      self.inner.ping().await
    }
  }

  #[tokio::test]
  async fn test_forward_cache_miss_is_transient_after_a_single_read() {
    let cancel = CancellationToken::new();
    let backend = CountingBackend::new();
    let pipeline = pipeline_with(
      Some(RecordingSink::echo()),
      ChunkCache::with_backend(backend.clone()),
      &cancel,
    );

    let processed = ProcessResult {
      redis_key: Some("dp:never-written:chunks".to_string()),
      ..Default::default()
    };
    let err = pipeline.forward(&forward_args(Some(processed))).await.unwrap_err();
    assert!(matches!(err, TaskError::Transient { .. }));
    // Re-delivery is the broker's job; one delivery reads the cache once
    assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_miss_reads_read_attempts_times_before_failure() {
    let cancel = CancellationToken::new();
    let backend = CountingBackend::new();
    let pipeline = pipeline_with(
      Some(RecordingSink::echo()),
      ChunkCache::with_backend(backend.clone()),
      &cancel,
    );
    let broker = started_broker(&pipeline, &cancel);

    let processed = ProcessResult {
      redis_key: Some("dp:never-written:chunks".to_string()),
      ..Default::default()
    };
    let payload = serde_json::to_value(forward_args(Some(processed))).unwrap();
    let task_id = broker.submit(FORWARD_TASK, payload).await.unwrap();

    for _ in 0..500 {
      if pipeline.state().state_of(&task_id) == Some(TaskState::Failure) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(pipeline.state().state_of(&task_id), Some(TaskState::Failure));
    // read_attempts = 2 in fast_config: the first delivery plus one retry
    assert_eq!(backend.reads.load(Ordering::SeqCst), 2);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_unconfigured_cache_with_key_is_fatal() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(Some(RecordingSink::echo()), ChunkCache::unconfigured(), &cancel);

    let processed = ProcessResult {
      redis_key: Some("dp:t:chunks".to_string()),
      ..Default::default()
    };
    let err = pipeline.forward(&forward_args(Some(processed))).await.unwrap_err();
    assert!(matches!(err, TaskError::Fatal(_)));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_zero_indexed_is_partial_success_failure() {
    let cancel = CancellationToken::new();
    let sink = RecordingSink::fixed(SinkResponse {
      success: true,
      total_indexed: 0,
      total_submitted: 3,
      message: None,
    });
    let pipeline = pipeline_with(Some(sink), memory_cache(), &cancel);

    let err = pipeline
      .forward(&forward_args(Some(inline_processed(vec![ChunkRecord::new("text")]))))
      .await
      .unwrap_err();
    assert!(matches!(err, TaskError::Fatal(ref f) if f.message.contains("partial success")));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_sink_reported_failure_is_fatal() {
    let cancel = CancellationToken::new();
    let sink = RecordingSink::fixed(SinkResponse {
      success: false,
      total_indexed: 0,
      total_submitted: 1,
      message: Some("index is read-only".to_string()),
    });
    let pipeline = pipeline_with(Some(sink), memory_cache(), &cancel);

    let err = pipeline
      .forward(&forward_args(Some(inline_processed(vec![ChunkRecord::new("text")]))))
      .await
      .unwrap_err();
    assert!(matches!(err, TaskError::Fatal(ref f) if f.message.contains("read-only")));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_missing_sink_url_is_fatal_before_network() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);

    let err = pipeline
      .forward(&forward_args(Some(inline_processed(vec![ChunkRecord::new("text")]))))
      .await
      .unwrap_err();
    assert!(matches!(err, TaskError::Fatal(ref f) if f.message.contains("sink URL")));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_embedded_values_take_priority() {
    let cancel = CancellationToken::new();
    let sink = RecordingSink::echo();
    let pipeline = pipeline_with(Some(sink.clone()), memory_cache(), &cancel);

    let mut processed = inline_processed(vec![ChunkRecord::new("text")]);
    processed.index_name = Some("embedded-idx".to_string());
    processed.source = "/embedded/path.txt".to_string();

    let result = pipeline.forward(&forward_args(Some(processed))).await.unwrap();

    assert_eq!(result.index_name, "embedded-idx");
    assert_eq!(result.source, "/embedded/path.txt");
    assert_eq!(sink.submissions.lock().unwrap()[0].1, "embedded-idx");
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_forward_documents_carry_defaulted_metadata() {
    let cancel = CancellationToken::new();
    let sink = RecordingSink::echo();
    let pipeline = pipeline_with(Some(sink.clone()), memory_cache(), &cancel);

    let mut args = forward_args(Some(inline_processed(vec![ChunkRecord::new("text")])));
    args.original_filename = Some("report.pdf".to_string());
    pipeline.forward(&args).await.unwrap();

    let submissions = sink.submissions.lock().unwrap();
    let metadata = &submissions[0].0[0].metadata;
    assert!(metadata["creation_date"].is_string());
    assert_eq!(metadata["source"], "/tmp/a.txt");
    assert_eq!(metadata["filename"], "report.pdf");
    assert_eq!(metadata["chunking_strategy"], "basic");
    assert_eq!(metadata["source_type"], "local");
    cancel.cancel();
  }

  // --------------------------------------------------------------------------
  // process_and_forward / broker integration
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_process_and_forward_runs_full_chain() {
    let cancel = CancellationToken::new();
    let sink = RecordingSink::echo();
    let pipeline = pipeline_with(Some(sink.clone()), memory_cache(), &cancel);

    let mut registry = TaskRegistry::new();
    pipeline.register_tasks(&mut registry);
    let broker = Broker::new(Arc::new(registry), pipeline.state().clone(), None);
    broker.start(2, None, cancel.clone());

    let (_dir, path) = write_temp("hello world");
    let mut args = process_args(&path);
    args.index_name = Some("idx".to_string());

    let task_id = pipeline.process_and_forward(&broker, &args).await;
    assert!(!task_id.is_empty());

    for _ in 0..500 {
      if sink.submission_count() > 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let submissions = sink.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0[0].content, "hello world");
    assert_eq!(submissions[0].1, "idx");

    drop(submissions);
    assert_eq!(broker.state().state_of(&task_id), Some(TaskState::Success));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_process_and_forward_without_registered_tasks_returns_empty() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);
    let broker = Broker::new(Arc::new(TaskRegistry::new()), TaskStateStore::new(), None);

    let task_id = pipeline.process_and_forward(&broker, &process_args("/tmp/a.txt")).await;
    assert_eq!(task_id, "");
    cancel.cancel();
  }

  // --------------------------------------------------------------------------
  // process_sync
  // --------------------------------------------------------------------------

  #[tokio::test]
  async fn test_process_sync_joins_chunks_with_blank_lines() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);
    let broker = started_broker(&pipeline, &cancel);
    let (_dir, path) = write_temp("first\n\nsecond");

    let result = pipeline
      .process_sync(&broker, &path, "local", "basic", Duration::from_secs(5))
      .await
      .unwrap();

    assert_eq!(result.text, "first\n\nsecond");
    assert_eq!(result.chunks_count, 2);
    assert_eq!(result.text_length, result.text.chars().count());
    assert!(result.processing_time >= 0.0);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_process_sync_unsupported_kind_records_stage() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);
    let broker = started_broker(&pipeline, &cancel);

    let err = pipeline
      .process_sync(&broker, "bucket/key", "minio", "basic", Duration::from_secs(1))
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::NotImplemented(_)));

    let failure = pipeline
      .state()
      .snapshot()
      .into_iter()
      .find_map(|(_, record)| record.failure)
      .unwrap();
    assert_eq!(failure.stage, "sync_processing_failed");
    cancel.cancel();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_process_sync_timeout_is_distinct_from_failure() {
    struct SlowCore;

    impl ParsingCore for SlowCore {
      fn chunk(&self, _: &[u8], _: &str, _: &str, _: &ChunkingParams) -> Option<Vec<ChunkRecord>> {
        std::thread::sleep(Duration::from_millis(200));
        Some(vec![ChunkRecord::new("late")])
      }
    }

    let cancel = CancellationToken::new();
    let pool = spawn_actor_pool(
      1,
      || ComputeActor::new(Arc::new(SlowCore), Arc::new(HttpFetcher::new()), None, 1),
      cancel.clone(),
    );
    let pipeline = Pipeline::new(fast_config(), pool, memory_cache(), None, TaskStateStore::new());
    let broker = started_broker(&pipeline, &cancel);
    let (_dir, path) = write_temp("content");

    let err = pipeline
      .process_sync(&broker, &path, "local", "basic", Duration::from_millis(10))
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Timeout));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_process_sync_missing_file_is_failure() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);
    let broker = started_broker(&pipeline, &cancel);

    let err = pipeline
      .process_sync(&broker, "/tmp/missing-docpipe-4417.txt", "local", "basic", Duration::from_secs(1))
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::Failed(ref f) if f.stage == "sync_processing_failed"));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_process_sync_rides_the_sync_queue() {
    let cancel = CancellationToken::new();
    let pipeline = pipeline_with(None, memory_cache(), &cancel);
    let broker = started_broker(&pipeline, &cancel);
    let (_dir, path) = write_temp("queued content");

    pipeline
      .process_sync(&broker, &path, "local", "basic", Duration::from_secs(5))
      .await
      .unwrap();

    let (_, record) = pipeline
      .state()
      .snapshot()
      .into_iter()
      .find(|(_, record)| record.name == SYNC_TASK)
      .unwrap();
    assert_eq!(record.state, TaskState::Success);
    cancel.cancel();
  }
}
