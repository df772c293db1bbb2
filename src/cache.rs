//! Content-addressed embedding cache shared by every repository.
//!
//! Entries are keyed by `(chunk digest, model)`, so a vector is only
//! reused for the model that produced it. A lookup is one
//! `UPDATE … RETURNING` statement that bumps the use count and last-used
//! time, which means it either sees a whole row or no row, even while an
//! eviction runs. Anything that does not decode cleanly is a miss.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info};

use repo_indexer_core::embedding::{blob_to_vec, vec_to_blob};

use crate::config::CacheConfig;
use crate::db::{now_ms, Db};
use crate::error::StorageResult;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub entries: u64,
    pub max_entries: u64,
    pub models: u64,
    /// Hits and misses seen by this process.
    pub hits: u64,
    pub misses: u64,
}

/// Rows a sweep removes when the cache holds `count` entries: enough to
/// get back under `max_entries` plus `ceil(max_entries * fraction)`.
pub fn eviction_count(count: u64, max_entries: u64, fraction: f64) -> u64 {
    if count <= max_entries {
        return 0;
    }
    let slack = (max_entries as f64 * fraction).ceil() as u64;
    (count - max_entries + slack).min(count)
}

pub struct EmbeddingCache {
    db: Db,
    max_entries: u64,
    evict_fraction: f64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(db: Db, config: &CacheConfig) -> Self {
        Self {
            db,
            max_entries: config.max_entries,
            evict_fraction: config.evict_fraction,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached vector for `digest` under `model`, if present and `dims` wide.
    pub async fn lookup(
        &self,
        digest: &str,
        model: &str,
        dims: usize,
    ) -> StorageResult<Option<Vec<f32>>> {
        let digest = digest.to_string();
        let model = model.to_string();

        let row = self
            .db
            .run_query(|pool| {
                let digest = digest.clone();
                let model = model.clone();
                async move {
                    Ok(sqlx::query(
                        "UPDATE embedding_cache SET use_count = use_count + 1, last_used_at = ? \
                         WHERE content_hash = ? AND model = ? RETURNING dims, vector",
                    )
                    .bind(now_ms())
                    .bind(&digest)
                    .bind(&model)
                    .fetch_optional(&pool)
                    .await?)
                }
            })
            .await?;

        let vector = row.and_then(|row| {
            let stored_dims: i64 = row.try_get("dims").ok()?;
            let blob: Vec<u8> = row.try_get("vector").ok()?;
            let vector = blob_to_vec(&blob)?;
            (stored_dims as usize == dims && vector.len() == dims).then_some(vector)
        });

        match vector {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(vector)
    }

    /// [`lookup`](Self::lookup) for each digest, in order.
    pub async fn lookup_many(
        &self,
        digests: &[String],
        model: &str,
        dims: usize,
    ) -> StorageResult<Vec<Option<Vec<f32>>>> {
        let mut out = Vec::with_capacity(digests.len());
        for digest in digests {
            out.push(self.lookup(digest, model, dims).await?);
        }
        Ok(out)
    }

    pub async fn store(&self, digest: &str, model: &str, vector: &[f32]) -> StorageResult<()> {
        self.store_many(model, &[(digest.to_string(), vector.to_vec())])
            .await
    }

    /// Insert or refresh several entries in one transaction.
    pub async fn store_many(&self, model: &str, entries: &[(String, Vec<f32>)]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let model = model.to_string();
        let rows: Vec<(String, i64, Vec<u8>)> = entries
            .iter()
            .map(|(digest, v)| (digest.clone(), v.len() as i64, vec_to_blob(v)))
            .collect();

        self.db
            .run_transaction(|conn| {
                let model = model.clone();
                let rows = rows.clone();
                Box::pin(async move {
                    let now = now_ms();
                    for (digest, dims, blob) in &rows {
                        sqlx::query(
                            "INSERT INTO embedding_cache \
                             (content_hash, model, dims, vector, use_count, last_used_at, created_at) \
                             VALUES (?, ?, ?, ?, 1, ?, ?) \
                             ON CONFLICT(content_hash, model) DO UPDATE SET \
                             dims = excluded.dims, vector = excluded.vector, \
                             last_used_at = excluded.last_used_at",
                        )
                        .bind(digest)
                        .bind(&model)
                        .bind(*dims)
                        .bind(blob)
                        .bind(now)
                        .bind(now)
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    pub async fn len(&self) -> StorageResult<u64> {
        self.db
            .run_query(|pool| async move {
                let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
                    .fetch_one(&pool)
                    .await?;
                Ok(n as u64)
            })
            .await
    }

    /// Drop least-recently-used entries if the cache is over its bound.
    ///
    /// Order: oldest `last_used_at`, then lowest use count, then oldest
    /// insertion. Returns the number of entries removed.
    pub async fn evict_if_needed(&self) -> StorageResult<u64> {
        let max_entries = self.max_entries;
        let fraction = self.evict_fraction;

        let removed = self
            .db
            .run_transaction(|conn| {
                Box::pin(async move {
                    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
                        .fetch_one(&mut *conn)
                        .await?;
                    let to_remove = eviction_count(count as u64, max_entries, fraction);
                    if to_remove == 0 {
                        return Ok(0);
                    }

                    let result = sqlx::query(
                        "DELETE FROM embedding_cache WHERE rowid IN ( \
                             SELECT rowid FROM embedding_cache \
                             ORDER BY last_used_at ASC, use_count ASC, rowid ASC LIMIT ?)",
                    )
                    .bind(to_remove as i64)
                    .execute(&mut *conn)
                    .await?;
                    Ok(result.rows_affected())
                })
            })
            .await?;

        if removed > 0 {
            info!(removed, max_entries, "embedding cache evicted");
        } else {
            debug!("embedding cache within bounds");
        }
        Ok(removed)
    }

    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub async fn stats(&self) -> StorageResult<CacheStats> {
        let (entries, models) = self
            .db
            .run_query(|pool| async move {
                let row = sqlx::query(
                    "SELECT COUNT(*) AS entries, COUNT(DISTINCT model) AS models FROM embedding_cache",
                )
                .fetch_one(&pool)
                .await?;
                let entries: i64 = row.try_get("entries")?;
                let models: i64 = row.try_get("models")?;
                Ok((entries as u64, models as u64))
            })
            .await?;
        let (hits, misses) = self.counters();
        Ok(CacheStats {
            entries,
            max_entries: self.max_entries,
            models,
            hits,
            misses,
        })
    }
}
