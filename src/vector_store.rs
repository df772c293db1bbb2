//! Built-in [`VectorStore`] backed by the `chunk_vectors` table.
//!
//! Vectors are stored as little-endian `f32` blobs next to their payload.
//! Search loads every vector in scope and ranks by cosine similarity in
//! Rust, which is fine up to a few hundred thousand chunks per workspace.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use repo_indexer_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use repo_indexer_core::store::{ChunkPayload, ScoredPoint, VectorFilter, VectorPoint, VectorStore};

use crate::db::Db;

const SCOPE: &str = "(? IS NULL OR workspace_id = ?) \
     AND (? IS NULL OR repository_id = ?) \
     AND (? IS NULL OR file_id = ?)";

fn bind_scope<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &VectorFilter,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(filter.workspace_id)
        .bind(filter.workspace_id)
        .bind(filter.repository_id)
        .bind(filter.repository_id)
        .bind(filter.file_id)
        .bind(filter.file_id)
}

fn payload_from_row(row: &SqliteRow) -> std::result::Result<ChunkPayload, sqlx::Error> {
    Ok(ChunkPayload {
        workspace_id: row.try_get("workspace_id")?,
        repository_id: row.try_get("repository_id")?,
        file_id: row.try_get("file_id")?,
        file_path: row.try_get("file_path")?,
        chunk_index: row.try_get("chunk_index")?,
        start_line: row.try_get("start_line")?,
        end_line: row.try_get("end_line")?,
        language: row.try_get("language")?,
        content: row.try_get("content")?,
    })
}

#[derive(Clone)]
pub struct SqliteVectorStore {
    db: Db,
}

impl SqliteVectorStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points = points.to_vec();
        self.db
            .run_transaction(|conn| {
                let points = points.clone();
                Box::pin(async move {
                    for p in &points {
                        sqlx::query(
                            "INSERT OR REPLACE INTO chunk_vectors \
                             (id, workspace_id, repository_id, file_id, file_path, chunk_index, \
                              start_line, end_line, language, content, vector) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        )
                        .bind(&p.id)
                        .bind(p.payload.workspace_id)
                        .bind(p.payload.repository_id)
                        .bind(p.payload.file_id)
                        .bind(&p.payload.file_path)
                        .bind(p.payload.chunk_index)
                        .bind(p.payload.start_line)
                        .bind(p.payload.end_line)
                        .bind(&p.payload.language)
                        .bind(&p.payload.content)
                        .bind(vec_to_blob(&p.vector))
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &VectorFilter) -> Result<u64> {
        if filter.is_unscoped() {
            bail!("refusing to delete vectors with an empty filter");
        }
        let filter = filter.clone();
        let removed = self
            .db
            .run_query(|pool| {
                let filter = filter.clone();
                async move {
                    let sql = format!("DELETE FROM chunk_vectors WHERE {}", SCOPE);
                    let result = bind_scope(sqlx::query(&sql), &filter).execute(&pool).await?;
                    Ok(result.rows_affected())
                }
            })
            .await?;
        Ok(removed)
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let filter = filter.clone();
        let rows = self
            .db
            .run_query(|pool| {
                let filter = filter.clone();
                async move {
                    let sql = format!(
                        "SELECT workspace_id, repository_id, file_id, file_path, chunk_index, \
                         start_line, end_line, language, content, vector \
                         FROM chunk_vectors WHERE {}",
                        SCOPE
                    );
                    Ok(bind_scope(sqlx::query(&sql), &filter).fetch_all(&pool).await?)
                }
            })
            .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("vector")?;
            // Skip rows whose blob does not decode or has another width.
            let Some(stored) = blob_to_vec(&blob).filter(|v| v.len() == vector.len()) else {
                continue;
            };
            scored.push(ScoredPoint {
                payload: payload_from_row(row)?,
                score: cosine_similarity(vector, &stored),
            });
        }

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
        let filter = filter.clone();
        let n = self
            .db
            .run_query(|pool| {
                let filter = filter.clone();
                async move {
                    let sql = format!("SELECT COUNT(*) FROM chunk_vectors WHERE {}", SCOPE);
                    let n: i64 = bind_scope(sqlx::query(&sql), &filter)
                        .fetch_one(&pool)
                        .await?
                        .try_get(0)?;
                    Ok(n as u64)
                }
            })
            .await?;
        Ok(n)
    }
}
