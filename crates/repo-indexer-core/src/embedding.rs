//! Embedding provider trait, batch planning, and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the [`plan_batches`] splitter that keeps every request
//! inside the provider's stated limits, and pure helpers for vector
//! serialization and similarity.
//!
//! Concrete HTTP providers (OpenAI, Ollama) live in the `repo-indexer`
//! crate.

use anyhow::Result;
use async_trait::async_trait;

use crate::chunk::snap_to_char_boundary;

/// Per-request limits a provider documents for its embed endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum number of texts in one request.
    pub max_items: usize,
    /// Maximum characters per text; longer texts are truncated.
    pub max_item_chars: usize,
    /// Maximum total characters across one request.
    pub max_batch_chars: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: 2048,
            max_item_chars: 32_000,
            max_batch_chars: 128_000,
        }
    }
}

/// Trait for embedding providers.
///
/// `embed` must be order-preserving: output `i` is the vector for input
/// `i`. Callers are expected to respect [`limits`](Self::limits); use
/// [`plan_batches`] to do so.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    fn limits(&self) -> BatchLimits {
        BatchLimits::default()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Truncate `text` to at most `max_chars` bytes, on a char boundary.
pub fn truncate_for_embedding(text: &str, max_chars: usize) -> &str {
    &text[..snap_to_char_boundary(text, max_chars)]
}

/// Split `texts` into contiguous index ranges that respect `limits`.
///
/// Lengths are measured after per-item truncation. Ranges are returned in
/// input order and cover every index exactly once, so concatenating the
/// per-batch outputs restores the input order. An item that alone exceeds
/// `max_batch_chars` still gets a batch of its own.
pub fn plan_batches(texts: &[String], limits: &BatchLimits) -> Vec<std::ops::Range<usize>> {
    let max_items = limits.max_items.max(1);
    let mut batches = Vec::new();
    let mut start = 0;
    let mut chars = 0;

    for (i, text) in texts.iter().enumerate() {
        let len = text.len().min(limits.max_item_chars);
        let count = i - start;
        if count > 0 && (count >= max_items || chars + len > limits.max_batch_chars) {
            batches.push(start..i);
            start = i;
            chars = 0;
        }
        chars += len;
    }
    if start < texts.len() {
        batches.push(start..texts.len());
    }
    batches
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use repo_indexer_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), Some(v));
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Returns `None` when the length is not a multiple of 4, which the
/// embedding cache treats as a corrupt entry.
pub fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
