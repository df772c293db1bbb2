//! In-memory [`VectorStore`] for tests and embedded use.
//!
//! Points live in a `HashMap` behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every matching point.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;

use super::{ScoredPoint, VectorFilter, VectorPoint, VectorStore};

#[derive(Default)]
pub struct InMemoryVectorStore {
    points: RwLock<HashMap<String, VectorPoint>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths that currently have at least one point, sorted.
    pub fn file_paths(&self, filter: &VectorFilter) -> Vec<String> {
        let points = match self.points.read() {
            Ok(points) => points,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut paths: Vec<String> = points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| p.payload.file_path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory vector store lock poisoned")
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        let mut stored = self.points.write().map_err(poisoned)?;
        for p in points {
            stored.insert(p.id.clone(), p.clone());
        }
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &VectorFilter) -> Result<u64> {
        if filter.is_unscoped() {
            bail!("refusing to delete vectors with an empty filter");
        }
        let mut stored = self.points.write().map_err(poisoned)?;
        let before = stored.len();
        stored.retain(|_, p| !filter.matches(&p.payload));
        Ok((before - stored.len()) as u64)
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let stored = self.points.read().map_err(poisoned)?;
        let mut scored: Vec<ScoredPoint> = stored
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| ScoredPoint {
                payload: p.payload.clone(),
                score: cosine_similarity(vector, &p.vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.payload.file_path.cmp(&b.payload.file_path))
                .then_with(|| a.payload.chunk_index.cmp(&b.payload.chunk_index))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count(&self, filter: &VectorFilter) -> Result<u64> {
        let stored = self.points.read().map_err(poisoned)?;
        Ok(stored.values().filter(|p| filter.matches(&p.payload)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkPayload;

    fn point(workspace: i64, file: i64, idx: i64, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: VectorPoint::point_id(file, idx),
            vector,
            payload: ChunkPayload {
                workspace_id: workspace,
                repository_id: 1,
                file_id: file,
                file_path: format!("src/f{}.rs", file),
                chunk_index: idx,
                start_line: 1,
                end_line: 5,
                language: "rust".into(),
                content: "fn x() {}".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = InMemoryVectorStore::new();
        store.upsert(&[point(1, 1, 0, vec![1.0, 0.0])]).await.unwrap();
        store.upsert(&[point(1, 1, 0, vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(store.count(&VectorFilter::workspace(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_file_only_touches_that_file() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(&[
                point(1, 1, 0, vec![1.0, 0.0]),
                point(1, 1, 1, vec![1.0, 0.0]),
                point(1, 2, 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let removed = store
            .delete_by_filter(&VectorFilter::file(1, 1, 1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.file_paths(&VectorFilter::workspace(1)), vec!["src/f2.rs"]);
    }

    #[tokio::test]
    async fn test_unscoped_delete_rejected() {
        let store = InMemoryVectorStore::new();
        assert!(store.delete_by_filter(&VectorFilter::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_search_ranks_and_filters_by_workspace() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(&[
                point(1, 1, 0, vec![1.0, 0.0]),
                point(1, 2, 0, vec![0.6, 0.8]),
                point(2, 3, 0, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let hits = store
            .search(&[1.0, 0.0], &VectorFilter::workspace(1), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.file_id, 1);
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| h.payload.workspace_id == 1));
    }
}
