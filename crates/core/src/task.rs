use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TTL for cached chunk payloads between pipeline stages (2 hours).
pub const CACHE_TTL_SECS: u64 = 7200;

/// Default expected chunk size (characters) when no model hints are available.
pub const DEFAULT_EXPECTED_CHUNK_SIZE: u32 = 512;

/// Default maximum chunk size (characters) when no model hints are available.
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 1024;

/// Cache key for a task's chunk payload.
///
/// Keys are derived from the task id, so concurrent chains never collide
/// and no locking is needed around the cache.
pub fn chunk_cache_key(task_id: &str) -> String {
  format!("dp:{task_id}:chunks")
}

// ============================================================================
// Chunks
// ============================================================================

/// Metadata attached to a single chunk by the parsing core.
///
/// All fields are optional; parsing cores fill in what they know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkMetadata {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page_number: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub language: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chunk_index: Option<u32>,
  /// Layout coordinates as reported by the parsing core (shape varies by core).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub coordinates: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub creation_date: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub original_filename: Option<String>,
}

/// One content fragment produced by splitting a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
  pub content: String,
  #[serde(default)]
  pub metadata: ChunkMetadata,
}

impl ChunkRecord {
  pub fn new(content: impl Into<String>) -> Self {
    Self {
      content: content.into(),
      metadata: ChunkMetadata::default(),
    }
  }

  /// True when the content is empty after trimming whitespace.
  pub fn is_blank(&self) -> bool {
    self.content.trim().is_empty()
  }
}

// ============================================================================
// Chunking parameters
// ============================================================================

/// Typed chunking parameters threaded into the parsing core.
///
/// Named fields cover the knobs the pipeline itself sets; `extra` carries
/// caller-supplied passthrough values. Parsing cores must tolerate unknown
/// entries in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingParams {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_characters: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub new_after_n_chars: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub task_id: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChunkingParams {
  /// Fill in chunk-size fields from embedding-model hints, leaving any
  /// caller-supplied values untouched.
  pub fn apply_size_hints(&mut self, expected: u32, maximum: u32) {
    self.new_after_n_chars.get_or_insert(expected);
    self.max_characters.get_or_insert(maximum);
  }

  /// Fall back to the fixed default chunk sizes.
  pub fn apply_default_sizes(&mut self) {
    self.apply_size_hints(DEFAULT_EXPECTED_CHUNK_SIZE, DEFAULT_MAX_CHUNK_SIZE);
  }
}

// ============================================================================
// Source kinds
// ============================================================================

/// How document bytes are fetched for a given `source_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  /// Local filesystem path, read directly after an existence check.
  Local,
  /// Networked object store, fetched through the byte-source fetcher.
  ObjectStore,
}

impl SourceKind {
  /// Resolve a caller-supplied `source_type` string. Unknown kinds are a
  /// fatal input error at the call site.
  pub fn parse(source_type: &str) -> Option<Self> {
    match source_type {
      "local" | "file" => Some(Self::Local),
      "minio" | "object_store" => Some(Self::ObjectStore),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Local => "local",
      Self::ObjectStore => "minio",
    }
  }
}

// ============================================================================
// Task results
// ============================================================================

/// Result of the `process` stage, handed to `forward` via chain composition.
///
/// Exactly one of `redis_key`/`chunks` is the authoritative payload source
/// for `forward`; absence of both is a fatal, non-retryable error there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessResult {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub redis_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chunks: Option<Vec<ChunkRecord>>,
  pub source: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub index_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub original_filename: Option<String>,
  pub chunking_strategy: String,
}

/// Result of the `forward` stage after successful indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardResult {
  pub chunks_stored: u64,
  pub index_name: String,
  pub source: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub original_filename: Option<String>,
}

/// Result of the synchronous processing path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProcessResult {
  /// Non-empty chunk contents joined with blank-line separators.
  pub text: String,
  pub chunks: Vec<ChunkRecord>,
  pub chunks_count: usize,
  /// Processing time in seconds.
  pub processing_time: f64,
  pub text_length: usize,
}

// ============================================================================
// Task state machine
// ============================================================================

/// Lifecycle state of a queued task.
///
/// Created `Pending` at submission; mutated only by the executing worker
/// (`Started`/`Success`/`Failure`/`Retry`) or by a supervisory cancel
/// (`Revoked` from any non-terminal state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
  Pending,
  Started,
  Success,
  Failure,
  Retry,
  Revoked,
}

impl TaskState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Success | Self::Failure | Self::Revoked)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_format() {
    assert_eq!(chunk_cache_key("abc-123"), "dp:abc-123:chunks");
  }

  #[test]
  fn test_source_kind_parse() {
    assert_eq!(SourceKind::parse("local"), Some(SourceKind::Local));
    assert_eq!(SourceKind::parse("minio"), Some(SourceKind::ObjectStore));
    assert_eq!(SourceKind::parse("carrier-pigeon"), None);
  }

  #[test]
  fn test_blank_chunk_detection() {
    assert!(ChunkRecord::new("   \n\t ").is_blank());
    assert!(!ChunkRecord::new("  text ").is_blank());
  }

  #[test]
  fn test_size_hints_do_not_override_caller_values() {
    let mut params = ChunkingParams {
      max_characters: Some(2000),
      ..Default::default()
    };
    params.apply_size_hints(500, 1000);
    assert_eq!(params.max_characters, Some(2000));
    assert_eq!(params.new_after_n_chars, Some(500));
  }

  #[test]
  fn test_chunking_params_extra_passthrough() {
    let json = r#"{"max_characters": 800, "languages": ["en", "de"]}"#;
    let params: ChunkingParams = serde_json::from_str(json).unwrap();
    assert_eq!(params.max_characters, Some(800));
    assert!(params.extra.contains_key("languages"));

    let round = serde_json::to_value(&params).unwrap();
    assert_eq!(round["languages"][0], "en");
  }

  #[test]
  fn test_chunk_record_serialization_skips_absent_metadata() {
    let record = ChunkRecord::new("hello");
    let json = serde_json::to_string(&record).unwrap();
    assert!(!json.contains("page_number"));
    assert!(!json.contains("coordinates"));
  }

  #[test]
  fn test_task_state_terminality() {
    assert!(TaskState::Success.is_terminal());
    assert!(TaskState::Failure.is_terminal());
    assert!(TaskState::Revoked.is_terminal());
    assert!(!TaskState::Pending.is_terminal());
    assert!(!TaskState::Started.is_terminal());
    assert!(!TaskState::Retry.is_terminal());
  }
}
