//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only way the pipeline touches stored
//! vectors. Points are always scoped by workspace, repository and file so
//! that deleting one file's vectors, or searching one workspace, is a
//! single filter call.
//!
//! Implementations must be `Send + Sync` to be shared across workers.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkPayload {
    pub workspace_id: i64,
    pub repository_id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub chunk_index: i64,
    pub start_line: i64,
    pub end_line: i64,
    pub language: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    /// Stable point id, `"<file_id>:<chunk_index>"`.
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

impl VectorPoint {
    pub fn point_id(file_id: i64, chunk_index: i64) -> String {
        format!("{}:{}", file_id, chunk_index)
    }
}

/// Scope for deletes and searches. `None` fields match everything.
///
/// A delete with every field `None` is rejected by implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorFilter {
    pub workspace_id: Option<i64>,
    pub repository_id: Option<i64>,
    pub file_id: Option<i64>,
}

impl VectorFilter {
    pub fn workspace(workspace_id: i64) -> Self {
        Self {
            workspace_id: Some(workspace_id),
            ..Self::default()
        }
    }

    pub fn repository(workspace_id: i64, repository_id: i64) -> Self {
        Self {
            workspace_id: Some(workspace_id),
            repository_id: Some(repository_id),
            file_id: None,
        }
    }

    pub fn file(workspace_id: i64, repository_id: i64, file_id: i64) -> Self {
        Self {
            workspace_id: Some(workspace_id),
            repository_id: Some(repository_id),
            file_id: Some(file_id),
        }
    }

    pub fn is_unscoped(&self) -> bool {
        self.workspace_id.is_none() && self.repository_id.is_none() && self.file_id.is_none()
    }

    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        self.workspace_id.map_or(true, |w| w == payload.workspace_id)
            && self.repository_id.map_or(true, |r| r == payload.repository_id)
            && self.file_id.map_or(true, |f| f == payload.file_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPoint {
    pub payload: ChunkPayload,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace points by id.
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;

    /// Remove every point matching `filter`; returns how many were removed.
    async fn delete_by_filter(&self, filter: &VectorFilter) -> Result<u64>;

    /// Highest-scoring points matching `filter`, best first.
    async fn search(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;

    /// Number of points matching `filter`.
    async fn count(&self, filter: &VectorFilter) -> Result<u64>;
}
