//! Source-file chunking.
//!
//! The pipeline only depends on the [`Chunker`] trait: text in, ordered
//! [`ChunkPiece`]s with 1-based inclusive line ranges out. A smarter,
//! syntax-aware chunker can be plugged in without touching the
//! orchestrator.
//!
//! [`LineChunker`] is the default. It groups blank-line separated blocks
//! into chunks that stay under a character budget derived from
//! `max_tokens`:
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Split the text into blocks of consecutive non-blank lines.
//! 3. Accumulate blocks into a buffer until the next block would overflow.
//! 4. Blocks larger than the budget are split on line boundaries; a single
//!    line larger than the budget is hard-split at a char boundary.
//!
//! # Example
//!
//! ```rust
//! use repo_indexer_core::chunk::{Chunker, LineChunker};
//!
//! let chunker = LineChunker::new(500);
//! let pieces = chunker.chunk("fn a() {}\n\nfn b() {}\n", Some("rust")).unwrap();
//! assert_eq!(pieces.len(), 1);
//! assert_eq!((pieces[0].start_line, pieces[0].end_line), (1, 3));
//! ```

use anyhow::Result;

use crate::models::ChunkPiece;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Splits file text into ordered chunks.
///
/// Implementations return pieces in source order. An empty or
/// whitespace-only input yields no pieces. Callers fall back to
/// [`whole_file`] when this returns an error.
pub trait Chunker: Send + Sync {
    fn chunk(&self, text: &str, language: Option<&str>) -> Result<Vec<ChunkPiece>>;
}

/// Whole-file fallback used when a chunker errors.
pub fn whole_file(text: &str) -> Vec<ChunkPiece> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let end_line = text.lines().count().max(1);
    vec![ChunkPiece {
        content: text.to_string(),
        start_line: 1,
        end_line,
    }]
}

/// Blank-line aware chunker bounded by a token budget.
#[derive(Debug, Clone)]
pub struct LineChunker {
    max_chars: usize,
}

impl LineChunker {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_chars: (max_tokens * CHARS_PER_TOKEN).max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }
}

/// A run of lines with its 1-based line range.
struct Block {
    text: String,
    start: usize,
    end: usize,
}

impl Chunker for LineChunker {
    fn chunk(&self, text: &str, _language: Option<&str>) -> Result<Vec<ChunkPiece>> {
        let mut pieces = Vec::new();
        let mut buf: Option<Block> = None;

        for block in blocks(text) {
            if let Some(current) = buf.as_mut() {
                // Joined with the blank lines between the two blocks.
                let gap = block.start - current.end;
                let would_be = current.text.len() + gap + block.text.len();
                if would_be <= self.max_chars {
                    for _ in 0..gap {
                        current.text.push('\n');
                    }
                    current.text.push_str(&block.text);
                    current.end = block.end;
                    continue;
                }
            }

            if let Some(done) = buf.take() {
                pieces.push(into_piece(done));
            }

            if block.text.len() > self.max_chars {
                self.split_block(block, &mut pieces);
            } else {
                buf = Some(block);
            }
        }

        if let Some(done) = buf.take() {
            pieces.push(into_piece(done));
        }

        Ok(pieces)
    }
}

impl LineChunker {
    fn split_block(&self, block: Block, out: &mut Vec<ChunkPiece>) {
        let mut current: Option<Block> = None;

        for (offset, line) in block.text.split('\n').enumerate() {
            let line_no = block.start + offset;

            if let Some(cur) = current.as_mut() {
                if cur.text.len() + 1 + line.len() <= self.max_chars {
                    cur.text.push('\n');
                    cur.text.push_str(line);
                    cur.end = line_no;
                    continue;
                }
            }
            if let Some(done) = current.take() {
                out.push(into_piece(done));
            }

            if line.len() > self.max_chars {
                let mut remaining = line;
                while !remaining.is_empty() {
                    let mut split_at = snap_to_char_boundary(remaining, self.max_chars);
                    if split_at == 0 {
                        split_at = remaining
                            .char_indices()
                            .nth(1)
                            .map(|(i, _)| i)
                            .unwrap_or(remaining.len());
                    }
                    let piece = &remaining[..split_at];
                    if !piece.trim().is_empty() {
                        out.push(ChunkPiece {
                            content: piece.to_string(),
                            start_line: line_no,
                            end_line: line_no,
                        });
                    }
                    remaining = &remaining[split_at..];
                }
            } else {
                current = Some(Block {
                    text: line.to_string(),
                    start: line_no,
                    end: line_no,
                });
            }
        }

        if let Some(done) = current.take() {
            out.push(into_piece(done));
        }
    }
}

fn into_piece(block: Block) -> ChunkPiece {
    ChunkPiece {
        content: block.text,
        start_line: block.start,
        end_line: block.end,
    }
}

/// Consecutive non-blank lines, with their line ranges.
fn blocks(text: &str) -> Vec<Block> {
    let mut out = Vec::new();
    let mut current: Option<Block> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            if let Some(done) = current.take() {
                out.push(done);
            }
            continue;
        }
        match current.as_mut() {
            Some(block) => {
                block.text.push('\n');
                block.text.push_str(line);
                block.end = line_no;
            }
            None => {
                current = Some(Block {
                    text: line.to_string(),
                    start: line_no,
                    end: line_no,
                })
            }
        }
    }
    if let Some(done) = current.take() {
        out.push(done);
    }
    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub(crate) fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
