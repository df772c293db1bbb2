//! Semantic search over indexed chunks.
//!
//! The query is embedded with the configured provider and matched against
//! the vector store, always scoped to one workspace and optionally to one
//! repository.

use anyhow::{bail, Result};
use serde::Serialize;

use repo_indexer_core::embedding::EmbeddingProvider;
use repo_indexer_core::store::{VectorFilter, VectorStore};

use crate::embedding::embed_batched;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;
const SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub repository_id: i64,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub language: String,
    pub score: f32,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub workspace_id: i64,
    pub repository_id: Option<i64>,
    pub query: String,
    pub limit: usize,
}

/// First `max` bytes of `text` on a char boundary, trimmed.
fn snippet(text: &str, max: usize) -> String {
    let mut end = text.len().min(max);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].trim().to_string()
}

pub async fn search(
    provider: &dyn EmbeddingProvider,
    vectors: &dyn VectorStore,
    request: &SearchRequest,
) -> Result<Vec<SearchHit>> {
    let query = request.query.trim();
    if query.is_empty() {
        bail!("search query is empty");
    }

    let mut embedded = embed_batched(provider, &[query.to_string()]).await?;
    let Some(vector) = embedded.pop() else {
        bail!("embedding service returned no vector for the query");
    };

    let filter = VectorFilter {
        workspace_id: Some(request.workspace_id),
        repository_id: request.repository_id,
        file_id: None,
    };
    let limit = request.limit.clamp(1, MAX_LIMIT);

    let hits = vectors.search(&vector, &filter, limit).await?;
    Ok(hits
        .into_iter()
        .map(|hit| SearchHit {
            repository_id: hit.payload.repository_id,
            path: hit.payload.file_path,
            start_line: hit.payload.start_line,
            end_line: hit.payload.end_line,
            language: hit.payload.language,
            score: hit.score,
            snippet: snippet(&hit.payload.content, SNIPPET_CHARS),
        })
        .collect())
}
