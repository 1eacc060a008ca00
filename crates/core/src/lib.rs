//! Shared data model for the docpipe pipeline.
//!
//! This crate holds the types that cross crate boundaries: chunk records and
//! their metadata, task payloads/results, the task state machine, chunking
//! parameters, the machine-parseable failure type, and configuration.

pub mod config;
pub mod failure;
pub mod task;

pub use config::Config;
pub use failure::TaskFailure;
pub use task::{
  CACHE_TTL_SECS, ChunkMetadata, ChunkRecord, ChunkingParams, ForwardResult, ProcessResult, SourceKind,
  SyncProcessResult, TaskState, chunk_cache_key,
};
