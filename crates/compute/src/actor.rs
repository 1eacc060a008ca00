//! Compute actors and their handles.
//!
//! A pool of actors shares one bounded request channel; each actor owns a
//! parsing-core instance for its whole lifetime. Dispatching a request
//! returns a [`ResultHandle`] promise. Dropping the handle does not cancel
//! the call: once dispatched, the actor runs it to completion.

use std::sync::Arc;

use docpipe_core::{ChunkRecord, ChunkingParams, SourceKind};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ByteFetcher, ComputeError, ModelStore, ParsingCore, fetch};

/// A single `process_file` call.
#[derive(Debug, Clone)]
pub struct ProcessFileRequest {
  pub source: String,
  pub chunking_strategy: String,
  /// How to obtain the bytes for `source`.
  pub destination: SourceKind,
  pub task_id: Option<String>,
  pub model_id: Option<String>,
  pub tenant_id: Option<String>,
  pub params: ChunkingParams,
}

type CallResult = Result<Vec<ChunkRecord>, ComputeError>;

struct ComputeRequest {
  req: ProcessFileRequest,
  reply: oneshot::Sender<CallResult>,
}

// ============================================================================
// Actor
// ============================================================================

/// Stateful worker wrapping one parsing-core instance.
pub struct ComputeActor {
  core: Arc<dyn ParsingCore>,
  fetcher: Arc<dyn ByteFetcher>,
  model_store: Option<Arc<dyn ModelStore>>,
  /// Cluster CPU slots this actor reserves.
  cpu_slots: usize,
}

impl ComputeActor {
  pub fn new(
    core: Arc<dyn ParsingCore>,
    fetcher: Arc<dyn ByteFetcher>,
    model_store: Option<Arc<dyn ModelStore>>,
    cpu_slots: usize,
  ) -> Self {
    Self {
      core,
      fetcher,
      model_store,
      cpu_slots,
    }
  }

  pub fn cpu_slots(&self) -> usize {
    self.cpu_slots
  }

  /// Fetch, chunk, and normalize output for one source.
  ///
  /// A missing source or failed fetch is [`ComputeError::FileNotFound`];
  /// empty or shape-less parsing output normalizes to `[]` and never errors.
  pub async fn process_file(&self, req: ProcessFileRequest) -> CallResult {
    let bytes = self.fetch_bytes(&req).await?;

    let mut params = req.params.clone();
    if let Some(ref task_id) = req.task_id {
      params.task_id.get_or_insert_with(|| task_id.clone());
    }
    self.apply_model_hints(&mut params, req.model_id.as_deref(), req.tenant_id.as_deref()).await;

    let filename = source_filename(&req.source);
    let chunks = self
      .core
      .chunk(&bytes, &filename, &req.chunking_strategy, &params)
      .unwrap_or_default();

    debug!(
      source = %req.source,
      strategy = %req.chunking_strategy,
      chunks = chunks.len(),
      "Parsing core finished"
    );
    Ok(chunks)
  }

  async fn fetch_bytes(&self, req: &ProcessFileRequest) -> Result<Vec<u8>, ComputeError> {
    let fetched = match req.destination {
      SourceKind::Local => fetch::read_local(&req.source).await,
      SourceKind::ObjectStore => self.fetcher.fetch(&req.source).await,
    };

    match fetched {
      Ok(Some(bytes)) => Ok(bytes),
      Ok(None) => Err(ComputeError::FileNotFound(req.source.clone())),
      Err(e) => {
        warn!(source = %req.source, error = %e, "Byte fetch failed");
        Err(ComputeError::FileNotFound(req.source.clone()))
      }
    }
  }

  /// Inject embedding-model chunk-size hints when both ids are present.
  /// Lookup miss or failure falls back to the fixed defaults, never fatal.
  async fn apply_model_hints(&self, params: &mut ChunkingParams, model_id: Option<&str>, tenant_id: Option<&str>) {
    let looked_up = match (model_id, tenant_id, self.model_store.as_ref()) {
      (Some(model_id), Some(tenant_id), Some(store)) => match store.get_model(model_id, tenant_id).await {
        Ok(Some(model)) => {
          debug!(model = %model.display_name, "Applying model chunk-size hints");
          params.apply_size_hints(model.expected_chunk_size, model.maximum_chunk_size);
          true
        }
        Ok(None) => {
          warn!(model_id, tenant_id, "Model not found, using default chunk sizes");
          false
        }
        Err(e) => {
          warn!(model_id, tenant_id, error = %e, "Model lookup failed, using default chunk sizes");
          false
        }
      },
      _ => false,
    };

    if !looked_up {
      params.apply_default_sizes();
    }
  }
}

fn source_filename(source: &str) -> String {
  std::path::Path::new(source)
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| source.to_string())
}

// ============================================================================
// Pool
// ============================================================================

/// Promise for an in-flight actor call.
///
/// Resolve it inline with `.resolve().await`, or under a caller-supplied
/// timeout; the call keeps running in the actor either way.
pub struct ResultHandle {
  rx: oneshot::Receiver<CallResult>,
}

impl ResultHandle {
  pub async fn resolve(self) -> CallResult {
    self.rx.await.unwrap_or(Err(ComputeError::ActorGone))
  }
}

/// Handle to the compute actor pool. Cheap to clone.
#[derive(Clone)]
pub struct ActorPoolHandle {
  tx: mpsc::Sender<ComputeRequest>,
}

impl ActorPoolHandle {
  /// Queue a call and get back its result promise.
  pub async fn dispatch(&self, req: ProcessFileRequest) -> Result<ResultHandle, ComputeError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send(ComputeRequest { req, reply: reply_tx })
      .await
      .map_err(|_| ComputeError::ActorGone)?;
    Ok(ResultHandle { rx: reply_rx })
  }

  /// Dispatch and resolve inline.
  pub async fn process(&self, req: ProcessFileRequest) -> CallResult {
    self.dispatch(req).await?.resolve().await
  }
}

/// Spawn `count` actors sharing one request channel.
///
/// Each actor constructs its parsing core once via `make_actor` and reuses
/// it for every call. Cancellation stops actors picking up new requests;
/// in-flight calls run to completion.
pub fn spawn_actor_pool<F>(count: usize, make_actor: F, cancel: CancellationToken) -> ActorPoolHandle
where
  F: Fn() -> ComputeActor,
{
  let (tx, rx) = mpsc::channel(count.max(1) * 2);
  let rx = Arc::new(Mutex::new(rx));

  for actor_id in 0..count.max(1) {
    let actor = make_actor();
    info!(actor_id, cpu_slots = actor.cpu_slots(), "Spawning compute actor");
    let rx = rx.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
      actor_loop(actor_id, actor, rx, cancel).await;
    });
  }

  ActorPoolHandle { tx }
}

async fn actor_loop(
  actor_id: usize,
  actor: ComputeActor,
  rx: Arc<Mutex<mpsc::Receiver<ComputeRequest>>>,
  cancel: CancellationToken,
) {
  loop {
    let msg = {
      let mut rx = rx.lock().await;
      tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        msg = rx.recv() => msg,
      }
    };

    let Some(ComputeRequest { req, reply }) = msg else {
      debug!(actor_id, "Compute actor stopping");
      break;
    };

    let result = actor.process_file(req).await;
    // Caller may have stopped waiting; the result is simply dropped then.
    let _ = reply.send(result);
  }
}

#[cfg(test)]
mod tests {
  use docpipe_core::task::{DEFAULT_EXPECTED_CHUNK_SIZE, DEFAULT_MAX_CHUNK_SIZE};

  use super::*;
  use crate::{FetchError, ModelConfig, StaticModelStore, TextSplitter};

  struct NullFetcher;

  #[async_trait::async_trait]
  impl ByteFetcher for NullFetcher {
    async fn fetch(&self, _source: &str) -> Result<Option<Vec<u8>>, FetchError> {
      Ok(None)
    }
  }

  /// Parsing core that returns whatever shape the test wants.
  struct FixedCore(Option<Vec<ChunkRecord>>);

  impl ParsingCore for FixedCore {
    fn chunk(&self, _: &[u8], _: &str, _: &str, _: &ChunkingParams) -> Option<Vec<ChunkRecord>> {
      self.0.clone()
    }
  }

  /// Core that records the params it was called with.
  struct ParamProbe(std::sync::Mutex<Option<ChunkingParams>>);

  impl ParsingCore for ParamProbe {
    fn chunk(&self, _: &[u8], _: &str, _: &str, params: &ChunkingParams) -> Option<Vec<ChunkRecord>> {
      *self.0.lock().unwrap() = Some(params.clone());
      Some(vec![ChunkRecord::new("x")])
    }
  }

  fn local_request(source: &str) -> ProcessFileRequest {
    ProcessFileRequest {
      source: source.to_string(),
      chunking_strategy: "basic".to_string(),
      destination: SourceKind::Local,
      task_id: None,
      model_id: None,
      tenant_id: None,
      params: ChunkingParams::default(),
    }
  }

  fn actor_with_core(core: Arc<dyn ParsingCore>) -> ComputeActor {
    ComputeActor::new(core, Arc::new(NullFetcher), None, 1)
  }

  fn write_temp(content: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.txt");
    std::fs::write(&path, content).unwrap();
    let path = path.to_string_lossy().into_owned();
    (dir, path)
  }

  #[tokio::test]
  async fn test_none_output_normalizes_to_empty() {
    let (_dir, path) = write_temp("text");
    let actor = actor_with_core(Arc::new(FixedCore(None)));
    let chunks = actor.process_file(local_request(&path)).await.unwrap();
    assert!(chunks.is_empty());
  }

  #[tokio::test]
  async fn test_empty_output_normalizes_to_empty() {
    let (_dir, path) = write_temp("text");
    let actor = actor_with_core(Arc::new(FixedCore(Some(Vec::new()))));
    let chunks = actor.process_file(local_request(&path)).await.unwrap();
    assert!(chunks.is_empty());
  }

  #[tokio::test]
  async fn test_missing_local_file_is_file_not_found() {
    let actor = actor_with_core(Arc::new(TextSplitter::new()));
    let err = actor.process_file(local_request("/tmp/missing-497251.txt")).await.unwrap_err();
    assert!(matches!(err, ComputeError::FileNotFound(_)));
  }

  #[tokio::test]
  async fn test_failed_object_fetch_is_file_not_found() {
    let actor = actor_with_core(Arc::new(TextSplitter::new()));
    let mut req = local_request("bucket/key");
    req.destination = SourceKind::ObjectStore;
    let err = actor.process_file(req).await.unwrap_err();
    assert!(matches!(err, ComputeError::FileNotFound(_)));
  }

  #[tokio::test]
  async fn test_model_hints_injected_into_params() {
    let (_dir, path) = write_temp("text");
    let probe = Arc::new(ParamProbe(std::sync::Mutex::new(None)));

    let mut store = StaticModelStore::new();
    store.insert(
      "embed-1",
      "tenant-a",
      ModelConfig {
        expected_chunk_size: 300,
        maximum_chunk_size: 600,
        display_name: "Embed One".to_string(),
      },
    );

    let actor = ComputeActor::new(probe.clone(), Arc::new(NullFetcher), Some(Arc::new(store)), 1);
    let mut req = local_request(&path);
    req.model_id = Some("embed-1".to_string());
    req.tenant_id = Some("tenant-a".to_string());

    actor.process_file(req).await.unwrap();

    let seen = probe.0.lock().unwrap().clone().unwrap();
    assert_eq!(seen.new_after_n_chars, Some(300));
    assert_eq!(seen.max_characters, Some(600));
  }

  #[tokio::test]
  async fn test_model_lookup_miss_falls_back_to_defaults() {
    let (_dir, path) = write_temp("text");
    let probe = Arc::new(ParamProbe(std::sync::Mutex::new(None)));

    let actor = ComputeActor::new(
      probe.clone(),
      Arc::new(NullFetcher),
      Some(Arc::new(StaticModelStore::new())),
      1,
    );
    let mut req = local_request(&path);
    req.model_id = Some("unknown".to_string());
    req.tenant_id = Some("tenant-a".to_string());

    actor.process_file(req).await.unwrap();

    let seen = probe.0.lock().unwrap().clone().unwrap();
    assert_eq!(seen.new_after_n_chars, Some(DEFAULT_EXPECTED_CHUNK_SIZE));
    assert_eq!(seen.max_characters, Some(DEFAULT_MAX_CHUNK_SIZE));
  }

  #[tokio::test]
  async fn test_pool_dispatch_and_resolve() {
    let (_dir, path) = write_temp("first\n\nsecond");
    let cancel = CancellationToken::new();
    let pool = spawn_actor_pool(
      2,
      || actor_with_core(Arc::new(TextSplitter::new())),
      cancel.clone(),
    );

    let handle = pool.dispatch(local_request(&path)).await.unwrap();
    let chunks = handle.resolve().await.unwrap();
    assert_eq!(chunks.len(), 2);

    cancel.cancel();
  }

  #[tokio::test]
  async fn test_task_id_threaded_into_params() {
    let (_dir, path) = write_temp("text");
    let probe = Arc::new(ParamProbe(std::sync::Mutex::new(None)));
    let actor = actor_with_core(probe.clone());

    let mut req = local_request(&path);
    req.task_id = Some("task-9".to_string());
    actor.process_file(req).await.unwrap();

    let seen = probe.0.lock().unwrap().clone().unwrap();
    assert_eq!(seen.task_id.as_deref(), Some("task-9"));
  }
}
