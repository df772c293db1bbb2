//! Index-run history. Written by the orchestrator, read by operators.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use repo_indexer_core::models::{IndexRun, RunStats, RunStatus};

use crate::db::{now_ms, Db};
use crate::error::{StorageError, StorageResult};

const RUN_COLUMNS: &str = "id, repository_id, from_commit, to_commit, status, files_added, \
     files_changed, files_unchanged, files_deleted, files_failed, chunks_indexed, cache_hits, \
     cache_misses, error, started_at, finished_at, duration_ms";

fn run_from_row(row: &SqliteRow) -> StorageResult<IndexRun> {
    let status: String = row.try_get("status")?;
    let count = |name: &str| -> StorageResult<u64> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };
    Ok(IndexRun {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        from_commit: row.try_get("from_commit")?,
        to_commit: row.try_get("to_commit")?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| StorageError::InvalidInput(format!("unknown run status '{}'", status)))?,
        stats: RunStats {
            files_added: count("files_added")?,
            files_changed: count("files_changed")?,
            files_unchanged: count("files_unchanged")?,
            files_deleted: count("files_deleted")?,
            files_failed: count("files_failed")?,
            chunks_indexed: count("chunks_indexed")?,
            cache_hits: count("cache_hits")?,
            cache_misses: count("cache_misses")?,
        },
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

#[derive(Clone)]
pub struct RunStore {
    db: Db,
}

impl RunStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Open a `running` row; returns `(run id, started_at)`.
    pub async fn open(
        &self,
        repository_id: i64,
        from_commit: Option<&str>,
    ) -> StorageResult<(i64, i64)> {
        let from_commit = from_commit.map(str::to_string);
        self.db
            .run_query(|pool| {
                let from_commit = from_commit.clone();
                async move {
                    let started_at = now_ms();
                    let id: i64 = sqlx::query_scalar(
                        "INSERT INTO index_runs (repository_id, from_commit, status, started_at) \
                         VALUES (?, ?, ?, ?) RETURNING id",
                    )
                    .bind(repository_id)
                    .bind(&from_commit)
                    .bind(RunStatus::Running.as_str())
                    .bind(started_at)
                    .fetch_one(&pool)
                    .await?;
                    Ok((id, started_at))
                }
            })
            .await
    }

    pub async fn set_target(&self, run_id: i64, to_commit: &str) -> StorageResult<()> {
        let to_commit = to_commit.to_string();
        self.db
            .run_query(|pool| {
                let to_commit = to_commit.clone();
                async move {
                    sqlx::query("UPDATE index_runs SET to_commit = ? WHERE id = ?")
                        .bind(&to_commit)
                        .bind(run_id)
                        .execute(&pool)
                        .await?;
                    Ok(())
                }
            })
            .await
    }

    /// Write the counters without closing the run.
    pub async fn flush(&self, run_id: i64, stats: &RunStats) -> StorageResult<()> {
        self.write(run_id, stats, None).await
    }

    /// Close the run with its final status, counters and optional error.
    pub async fn close(
        &self,
        run_id: i64,
        started_at: i64,
        status: RunStatus,
        stats: &RunStats,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let finished_at = now_ms();
        let closing = Closing {
            status,
            error: error.map(str::to_string),
            finished_at,
            duration_ms: (finished_at - started_at).max(0),
        };
        self.write(run_id, stats, Some(closing)).await
    }

    async fn write(&self, run_id: i64, stats: &RunStats, closing: Option<Closing>) -> StorageResult<()> {
        let stats = stats.clone();
        self.db
            .run_query(|pool| {
                let stats = stats.clone();
                let closing = closing.clone();
                async move {
                    let mut query = String::from(
                        "UPDATE index_runs SET files_added = ?, files_changed = ?, \
                         files_unchanged = ?, files_deleted = ?, files_failed = ?, \
                         chunks_indexed = ?, cache_hits = ?, cache_misses = ?",
                    );
                    if closing.is_some() {
                        query.push_str(", status = ?, error = ?, finished_at = ?, duration_ms = ?");
                    }
                    query.push_str(" WHERE id = ?");

                    let mut q = sqlx::query(&query)
                        .bind(stats.files_added as i64)
                        .bind(stats.files_changed as i64)
                        .bind(stats.files_unchanged as i64)
                        .bind(stats.files_deleted as i64)
                        .bind(stats.files_failed as i64)
                        .bind(stats.chunks_indexed as i64)
                        .bind(stats.cache_hits as i64)
                        .bind(stats.cache_misses as i64);
                    if let Some(c) = &closing {
                        q = q
                            .bind(c.status.as_str())
                            .bind(c.error.clone())
                            .bind(c.finished_at)
                            .bind(c.duration_ms);
                    }
                    q.bind(run_id).execute(&pool).await?;
                    Ok(())
                }
            })
            .await
    }

    pub async fn get(&self, run_id: i64) -> StorageResult<IndexRun> {
        self.db
            .run_query(|pool| async move {
                let sql = format!("SELECT {} FROM index_runs WHERE id = ?", RUN_COLUMNS);
                let row = sqlx::query(&sql).bind(run_id).fetch_optional(&pool).await?;
                match row {
                    Some(row) => run_from_row(&row),
                    None => Err(StorageError::not_found("index run", run_id)),
                }
            })
            .await
    }

    /// Most recent first.
    pub async fn list(&self, repository_id: i64, limit: i64) -> StorageResult<Vec<IndexRun>> {
        let limit = limit.clamp(1, 100);
        self.db
            .run_query(|pool| async move {
                let sql = format!(
                    "SELECT {} FROM index_runs WHERE repository_id = ? \
                     ORDER BY started_at DESC, id DESC LIMIT ?",
                    RUN_COLUMNS
                );
                let rows = sqlx::query(&sql)
                    .bind(repository_id)
                    .bind(limit)
                    .fetch_all(&pool)
                    .await?;
                rows.iter().map(run_from_row).collect()
            })
            .await
    }
}

#[derive(Debug, Clone)]
struct Closing {
    status: RunStatus,
    error: Option<String>,
    finished_at: i64,
    duration_ms: i64,
}
