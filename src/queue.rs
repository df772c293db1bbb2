//! Persisted job queue over the `repositories` table.
//!
//! A claim is one `UPDATE … WHERE id = (SELECT … LIMIT 1) AND status =
//! 'pending' RETURNING …` statement. SQLite runs it under the database
//! write lock, so two workers (or two processes) racing for the same row
//! can never both see it change; the loser gets zero rows and polls again.

use std::time::Duration;

use tracing::{debug, info};

use repo_indexer_core::models::Repository;
use repo_indexer_core::status::Status;

use crate::db::{now_ms, Db};
use crate::error::{StorageError, StorageResult};
use crate::repos::{repo_from_row, REPO_COLUMNS};

/// Result of a claim attempt. An empty queue is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Claimed(Repository),
    NoWork,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Db,
}

impl JobQueue {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Move the oldest `Pending` repository to `Cloning` and return it.
    pub async fn claim(&self) -> StorageResult<Claim> {
        let sql = format!(
            "UPDATE repositories SET status = ?, updated_at = ? \
             WHERE id = (SELECT id FROM repositories WHERE status = ? \
                         ORDER BY created_at ASC, id ASC LIMIT 1) \
               AND status = ? \
             RETURNING {}",
            REPO_COLUMNS
        );
        self.claim_with(sql, None).await
    }

    /// Claim a specific repository if it is `Pending`.
    pub async fn claim_one(&self, id: i64) -> StorageResult<Claim> {
        let sql = format!(
            "UPDATE repositories SET status = ?, updated_at = ? \
             WHERE id = ? AND status = ? RETURNING {}",
            REPO_COLUMNS
        );
        self.claim_with(sql, Some(id)).await
    }

    async fn claim_with(&self, sql: String, id: Option<i64>) -> StorageResult<Claim> {
        let row = self
            .db
            .run_query(|pool| {
                let sql = sql.clone();
                async move {
                    let mut query = sqlx::query(&sql)
                        .bind(Status::Cloning.as_str())
                        .bind(now_ms());
                    query = match id {
                        Some(id) => query.bind(id),
                        None => query.bind(Status::Pending.as_str()),
                    };
                    Ok(query
                        .bind(Status::Pending.as_str())
                        .fetch_optional(&pool)
                        .await?)
                }
            })
            .await?;

        match row {
            Some(row) => {
                let repo = repo_from_row(&row)?;
                debug!(repository_id = repo.id, "claimed repository");
                Ok(Claim::Claimed(repo))
            }
            None => Ok(Claim::NoWork),
        }
    }

    /// Reset a `Completed` or `Failed` repository to `Pending`.
    ///
    /// Active repositories are refused with [`StorageError::AlreadyActive`];
    /// a repository that is already `Pending` is left alone. The worker pool
    /// picks the job up on its next poll.
    pub async fn request_reindex(&self, id: i64) -> StorageResult<Repository> {
        let sql = format!(
            "UPDATE repositories SET status = ?, error_message = NULL, updated_at = ? \
             WHERE id = ? AND status IN (?, ?) RETURNING {}",
            REPO_COLUMNS
        );
        let found = self
            .db
            .run_transaction(|conn| {
                let sql = sql.clone();
                Box::pin(async move {
                    let row = sqlx::query(&sql)
                        .bind(Status::Pending.as_str())
                        .bind(now_ms())
                        .bind(id)
                        .bind(Status::Completed.as_str())
                        .bind(Status::Failed.as_str())
                        .fetch_optional(&mut *conn)
                        .await?;
                    if let Some(row) = row {
                        return repo_from_row(&row);
                    }

                    let current = sqlx::query(&format!(
                        "SELECT {} FROM repositories WHERE id = ?",
                        REPO_COLUMNS
                    ))
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?;
                    let repo = match current {
                        Some(row) => repo_from_row(&row)?,
                        None => return Err(StorageError::not_found("repository", id)),
                    };
                    if repo.status.is_active() {
                        return Err(StorageError::AlreadyActive {
                            id,
                            status: repo.status,
                        });
                    }
                    Ok(repo)
                })
            })
            .await?;

        info!(repository_id = id, "re-index requested");
        Ok(found)
    }

    /// Return active repositories untouched for longer than `older_than`
    /// to `Pending`. Used to recover runs lost to a crash.
    pub async fn requeue_stale(&self, older_than: Duration) -> StorageResult<Vec<i64>> {
        let cutoff = now_ms() - older_than.as_millis() as i64;
        let ids = self
            .db
            .run_query(|pool| async move {
                let ids: Vec<i64> = sqlx::query_scalar(
                    "UPDATE repositories SET status = ?, updated_at = ? \
                     WHERE status IN (?, ?) AND updated_at < ? RETURNING id",
                )
                .bind(Status::Pending.as_str())
                .bind(now_ms())
                .bind(Status::Cloning.as_str())
                .bind(Status::Indexing.as_str())
                .bind(cutoff)
                .fetch_all(&pool)
                .await?;
                Ok(ids)
            })
            .await?;

        if !ids.is_empty() {
            info!(count = ids.len(), "requeued stale repositories");
        }
        Ok(ids)
    }

    /// Number of repositories waiting in `Pending`.
    pub async fn pending(&self) -> StorageResult<i64> {
        self.db
            .run_query(|pool| async move {
                let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories WHERE status = ?")
                    .bind(Status::Pending.as_str())
                    .fetch_one(&pool)
                    .await?;
                Ok(n)
            })
            .await
    }
}
