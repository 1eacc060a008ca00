//! Parsing-core seam and the built-in text splitter.
//!
//! The real document-parsing behavior lives outside this system; actors only
//! require the [`ParsingCore`] contract. The built-in [`TextSplitter`] is a
//! minimal core so the worker binary and tests run end-to-end; its output
//! quality is not a goal.

use docpipe_core::{ChunkMetadata, ChunkRecord, ChunkingParams};

/// A document parsing core: turns raw bytes into chunk records.
///
/// Implementations must tolerate unknown entries in `params.extra` and may
/// return `None` when they produce nothing; callers normalize that to `[]`.
pub trait ParsingCore: Send + Sync {
  fn chunk(
    &self,
    bytes: &[u8],
    filename: &str,
    chunking_strategy: &str,
    params: &ChunkingParams,
  ) -> Option<Vec<ChunkRecord>>;
}

/// Paragraph-oriented splitter over UTF-8 text.
///
/// Splits on blank lines and hard-wraps any paragraph longer than
/// `max_characters` at character boundaries.
#[derive(Debug, Default)]
pub struct TextSplitter;

impl TextSplitter {
  pub fn new() -> Self {
    Self
  }

  fn split_paragraph(paragraph: &str, max_chars: usize) -> Vec<String> {
    if paragraph.chars().count() <= max_chars {
      return vec![paragraph.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in paragraph.chars() {
      current.push(ch);
      count += 1;
      if count == max_chars {
        pieces.push(std::mem::take(&mut current));
        count = 0;
      }
    }
    if !current.is_empty() {
      pieces.push(current);
    }
    pieces
  }
}

impl ParsingCore for TextSplitter {
  fn chunk(
    &self,
    bytes: &[u8],
    filename: &str,
    _chunking_strategy: &str,
    params: &ChunkingParams,
  ) -> Option<Vec<ChunkRecord>> {
    if bytes.is_empty() {
      return None;
    }

    let text = String::from_utf8_lossy(bytes);
    let max_chars = params.max_characters.unwrap_or(docpipe_core::task::DEFAULT_MAX_CHUNK_SIZE) as usize;

    let mut chunks = Vec::new();
    for paragraph in text.split("\n\n") {
      let trimmed = paragraph.trim();
      if trimmed.is_empty() {
        continue;
      }
      for piece in Self::split_paragraph(trimmed, max_chars.max(1)) {
        let index = chunks.len() as u32;
        chunks.push(ChunkRecord {
          content: piece,
          metadata: ChunkMetadata {
            chunk_index: Some(index),
            original_filename: Some(filename.to_string()),
            ..ChunkMetadata::default()
          },
        });
      }
    }

    Some(chunks)
  }
}
