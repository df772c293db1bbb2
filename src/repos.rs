//! Repository registry: CRUD plus compare-and-swap status transitions.
//!
//! Status writes never read-then-write. Each one is a single
//! `UPDATE … WHERE id = ? AND status = ?` validated against the
//! transition table first; zero affected rows means another writer got
//! there first ([`StorageError::Conflict`]) or the row is gone.

use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::info;

use repo_indexer_core::models::Repository;
use repo_indexer_core::status::Status;
use repo_indexer_core::store::{VectorFilter, VectorStore};

use crate::db::{now_ms, Db};
use crate::error::{StorageError, StorageResult};
use crate::git::RepoUrl;

pub const DEFAULT_BRANCH: &str = "main";
pub const MAX_LIST_LIMIT: i64 = 100;

pub(crate) const REPO_COLUMNS: &str = "id, workspace_id, url, owner, name, default_branch, status, \
     error_message, last_commit_sha, file_count, chunk_count, created_at, updated_at";

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub workspace_id: Option<i64>,
    pub status: Option<Status>,
    pub limit: Option<i64>,
    pub offset: i64,
}

pub(crate) fn repo_from_row(row: &SqliteRow) -> StorageResult<Repository> {
    let status: String = row.try_get("status")?;
    Ok(Repository {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        url: row.try_get("url")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        default_branch: row.try_get("default_branch")?,
        status: status.parse()?,
        error_message: row.try_get("error_message")?,
        last_commit_sha: row.try_get("last_commit_sha")?,
        file_count: row.try_get("file_count")?,
        chunk_count: row.try_get("chunk_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Apply `from -> to` as a compare-and-swap on the current status.
pub(crate) async fn cas_status(
    conn: &mut SqliteConnection,
    id: i64,
    from: Status,
    to: Status,
) -> StorageResult<()> {
    if !from.can_transition_to(to) {
        return Err(StorageError::InvalidTransition { from, to });
    }

    let result =
        sqlx::query("UPDATE repositories SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(now_ms())
            .bind(id)
            .bind(from.as_str())
            .execute(&mut *conn)
            .await?;

    if result.rows_affected() == 0 {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(match exists {
            Some(_) => StorageError::Conflict { id, expected: from },
            None => StorageError::not_found("repository", id),
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct RepoStore {
    db: Db,
}

impl RepoStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register a repository in `Pending`.
    ///
    /// A duplicate `(workspace, normalized url)` yields
    /// [`StorageError::AlreadyExists`] carrying the existing id.
    pub async fn create(&self, workspace_id: i64, url: &str) -> StorageResult<Repository> {
        let parsed = RepoUrl::parse(url).map_err(StorageError::InvalidInput)?;

        let inserted = self
            .db
            .run_query(|pool| {
                let parsed = parsed.clone();
                async move {
                    let now = now_ms();
                    let sql = format!(
                        "INSERT INTO repositories \
                         (workspace_id, url, owner, name, default_branch, status, created_at, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                         ON CONFLICT(workspace_id, url) DO NOTHING \
                         RETURNING {}",
                        REPO_COLUMNS
                    );
                    let row = sqlx::query(&sql)
                        .bind(workspace_id)
                        .bind(&parsed.url)
                        .bind(&parsed.owner)
                        .bind(&parsed.name)
                        .bind(DEFAULT_BRANCH)
                        .bind(Status::Pending.as_str())
                        .bind(now)
                        .bind(now)
                        .fetch_optional(&pool)
                        .await?;
                    row.as_ref().map(repo_from_row).transpose()
                }
            })
            .await?;

        match inserted {
            Some(repo) => {
                info!(repository_id = repo.id, url = %repo.url, "repository registered");
                Ok(repo)
            }
            None => {
                let url = parsed.url.clone();
                let id: i64 = self
                    .db
                    .run_query(|pool| {
                        let url = url.clone();
                        async move {
                            Ok(sqlx::query_scalar(
                                "SELECT id FROM repositories WHERE workspace_id = ? AND url = ?",
                            )
                            .bind(workspace_id)
                            .bind(&url)
                            .fetch_one(&pool)
                            .await?)
                        }
                    })
                    .await?;
                Err(StorageError::AlreadyExists { id, url })
            }
        }
    }

    pub async fn find(&self, id: i64) -> StorageResult<Option<Repository>> {
        self.db
            .run_query(|pool| async move {
                let sql = format!("SELECT {} FROM repositories WHERE id = ?", REPO_COLUMNS);
                let row = sqlx::query(&sql).bind(id).fetch_optional(&pool).await?;
                row.as_ref().map(repo_from_row).transpose()
            })
            .await
    }

    pub async fn get(&self, id: i64) -> StorageResult<Repository> {
        self.find(id)
            .await?
            .ok_or_else(|| StorageError::not_found("repository", id))
    }

    /// Oldest first. `limit` defaults to and is capped at 100.
    pub async fn list(&self, filter: &ListFilter) -> StorageResult<Vec<Repository>> {
        let limit = filter.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let offset = filter.offset.max(0);
        let workspace = filter.workspace_id;
        let status = filter.status.map(|s| s.as_str());

        self.db
            .run_query(|pool| async move {
                let sql = format!(
                    "SELECT {} FROM repositories \
                     WHERE (? IS NULL OR workspace_id = ?) AND (? IS NULL OR status = ?) \
                     ORDER BY created_at, id LIMIT ? OFFSET ?",
                    REPO_COLUMNS
                );
                let rows = sqlx::query(&sql)
                    .bind(workspace)
                    .bind(workspace)
                    .bind(status)
                    .bind(status)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&pool)
                    .await?;
                rows.iter().map(repo_from_row).collect()
            })
            .await
    }

    /// Compare-and-swap `from -> to`.
    pub async fn transition(&self, id: i64, from: Status, to: Status) -> StorageResult<()> {
        self.db
            .run_transaction(|conn| Box::pin(async move { cas_status(conn, id, from, to).await }))
            .await
    }

    /// `from -> Failed`, persisting `message` for operators.
    pub async fn mark_failed(&self, id: i64, from: Status, message: &str) -> StorageResult<()> {
        let message = message.to_string();
        self.db
            .run_transaction(|conn| {
                let message = message.clone();
                Box::pin(async move {
                    cas_status(conn, id, from, Status::Failed).await?;
                    sqlx::query("UPDATE repositories SET error_message = ? WHERE id = ?")
                        .bind(&message)
                        .bind(id)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    /// `Cloning -> Indexing`, recording the checked-out commit and branch.
    pub async fn record_clone(&self, id: i64, commit: &str, branch: &str) -> StorageResult<()> {
        let commit = commit.to_string();
        let branch = branch.to_string();
        self.db
            .run_transaction(|conn| {
                let commit = commit.clone();
                let branch = branch.clone();
                Box::pin(async move {
                    cas_status(conn, id, Status::Cloning, Status::Indexing).await?;
                    sqlx::query(
                        "UPDATE repositories SET last_commit_sha = ?, default_branch = ? WHERE id = ?",
                    )
                    .bind(&commit)
                    .bind(&branch)
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await
    }

    /// `Indexing -> Completed` together with the denormalized counts.
    pub async fn finish_run(&self, id: i64, file_count: i64, chunk_count: i64) -> StorageResult<()> {
        self.db
            .run_transaction(|conn| {
                Box::pin(async move {
                    cas_status(conn, id, Status::Indexing, Status::Completed).await?;
                    sqlx::query(
                        "UPDATE repositories SET file_count = ?, chunk_count = ?, error_message = NULL \
                         WHERE id = ?",
                    )
                    .bind(file_count)
                    .bind(chunk_count)
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                })
            })
            .await
    }

    /// Refresh `updated_at` while the repository is still in `status`.
    ///
    /// Running pipelines call this as they make progress so stale-run
    /// recovery only sees repositories whose worker has gone away. Returns
    /// `Conflict` once something else has moved the repository on.
    pub async fn touch(&self, id: i64, status: Status) -> StorageResult<()> {
        self.db
            .run_transaction(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(
                        "UPDATE repositories SET updated_at = ? WHERE id = ? AND status = ?",
                    )
                    .bind(now_ms())
                    .bind(id)
                    .bind(status.as_str())
                    .execute(&mut *conn)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StorageError::Conflict {
                            id,
                            expected: status,
                        });
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Remove a repository with its vectors, file records and run history.
    ///
    /// Active repositories are refused; a running pipeline would otherwise
    /// keep writing vectors for a repository that no longer exists.
    pub async fn delete(&self, id: i64, vectors: &dyn VectorStore) -> StorageResult<Repository> {
        let repo = self.get(id).await?;
        if repo.status.is_active() {
            return Err(StorageError::AlreadyActive {
                id,
                status: repo.status,
            });
        }

        vectors
            .delete_by_filter(&VectorFilter::repository(repo.workspace_id, id))
            .await
            .map_err(StorageError::VectorStore)?;

        let expected = repo.status;
        self.db
            .run_transaction(|conn| {
                Box::pin(async move {
                    let removed = sqlx::query("DELETE FROM repositories WHERE id = ? AND status = ?")
                        .bind(id)
                        .bind(expected.as_str())
                        .execute(&mut *conn)
                        .await?;
                    if removed.rows_affected() == 0 {
                        return Err(StorageError::Conflict { id, expected });
                    }
                    sqlx::query("DELETE FROM files WHERE repository_id = ?")
                        .bind(id)
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("DELETE FROM index_runs WHERE repository_id = ?")
                        .bind(id)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;

        info!(repository_id = id, "repository deleted");
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_db;
    use repo_indexer_core::store::memory::InMemoryVectorStore;

    #[tokio::test]
    async fn test_create_normalizes_and_starts_pending() {
        let repos = RepoStore::new(memory_db().await);
        let repo = repos
            .create(1, "https://github.com/Acme/Widgets.git/")
            .await
            .unwrap();
        assert_eq!(repo.url, "https://github.com/Acme/Widgets");
        assert_eq!(repo.owner, "Acme");
        assert_eq!(repo.name, "Widgets");
        assert_eq!(repo.default_branch, "main");
        assert_eq!(repo.status, Status::Pending);
        assert!(repo.error_message.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_url_in_workspace() {
        let repos = RepoStore::new(memory_db().await);
        let first = repos.create(1, "acme/widgets").await.unwrap();
        let err = repos
            .create(1, "https://github.com/acme/widgets")
            .await
            .unwrap_err();
        match err {
            StorageError::AlreadyExists { id, .. } => assert_eq!(id, first.id),
            other => panic!("unexpected {:?}", other),
        }
        // Different workspace is fine.
        repos.create(2, "acme/widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let repos = RepoStore::new(memory_db().await);
        let repo = repos.create(1, "acme/widgets").await.unwrap();

        repos
            .transition(repo.id, Status::Pending, Status::Cloning)
            .await
            .unwrap();
        let err = repos
            .transition(repo.id, Status::Pending, Status::Cloning)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        let err = repos
            .transition(repo.id, Status::Cloning, Status::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));

        let err = repos
            .transition(999, Status::Pending, Status::Cloning)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_touch_refreshes_only_matching_status() {
        let repos = RepoStore::new(memory_db().await);
        let repo = repos.create(1, "acme/widgets").await.unwrap();
        repos
            .transition(repo.id, Status::Pending, Status::Cloning)
            .await
            .unwrap();
        sqlx::query("UPDATE repositories SET updated_at = 0 WHERE id = ?")
            .bind(repo.id)
            .execute(repos.db.pool())
            .await
            .unwrap();

        repos.touch(repo.id, Status::Cloning).await.unwrap();
        assert!(repos.get(repo.id).await.unwrap().updated_at > 0);

        let err = repos.touch(repo.id, Status::Indexing).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_mark_failed_persists_message() {
        let repos = RepoStore::new(memory_db().await);
        let repo = repos.create(1, "acme/widgets").await.unwrap();
        repos
            .transition(repo.id, Status::Pending, Status::Cloning)
            .await
            .unwrap();
        repos
            .mark_failed(repo.id, Status::Cloning, "clone failed: auth")
            .await
            .unwrap();
        let repo = repos.get(repo.id).await.unwrap();
        assert_eq!(repo.status, Status::Failed);
        assert_eq!(repo.error_message.as_deref(), Some("clone failed: auth"));
    }

    #[tokio::test]
    async fn test_list_filters_and_caps_limit() {
        let repos = RepoStore::new(memory_db().await);
        for i in 0..5 {
            repos.create(1, &format!("acme/r{}", i)).await.unwrap();
        }
        repos.create(2, "other/r").await.unwrap();

        let ws1 = repos
            .list(&ListFilter {
                workspace_id: Some(1),
                ..ListFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(ws1.len(), 5);
        assert_eq!(ws1[0].name, "r0");

        let page = repos
            .list(&ListFilter {
                workspace_id: Some(1),
                limit: Some(2),
                offset: 2,
                ..ListFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(
            page.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["r2", "r3"]
        );

        let pending = repos
            .list(&ListFilter {
                status: Some(Status::Completed),
                limit: Some(1000),
                ..ListFilter::default()
            })
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_delete_refuses_active_repository() {
        let repos = RepoStore::new(memory_db().await);
        let vectors = InMemoryVectorStore::new();
        let repo = repos.create(1, "acme/widgets").await.unwrap();
        repos
            .transition(repo.id, Status::Pending, Status::Cloning)
            .await
            .unwrap();
        let err = repos.delete(repo.id, &vectors).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyActive { .. }));

        repos
            .mark_failed(repo.id, Status::Cloning, "clone failed: x")
            .await
            .unwrap();
        repos.delete(repo.id, &vectors).await.unwrap();
        assert!(repos.find(repo.id).await.unwrap().is_none());
    }
}
