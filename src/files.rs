//! Persisted file records, one per `(repository, path)`.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use repo_indexer_core::models::{FileRecord, WalkedFile};

use crate::db::{now_ms, Db};
use crate::error::StorageResult;

fn file_from_row(row: &SqliteRow) -> StorageResult<FileRecord> {
    Ok(FileRecord {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        path: row.try_get("path")?,
        content_hash: row.try_get("content_hash")?,
        language: row.try_get("language")?,
        size_bytes: row.try_get("size_bytes")?,
        chunk_count: row.try_get("chunk_count")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

#[derive(Clone)]
pub struct FileStore {
    db: Db,
}

impl FileStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn list_for_repository(&self, repository_id: i64) -> StorageResult<Vec<FileRecord>> {
        self.db
            .run_query(|pool| async move {
                let rows = sqlx::query(
                    "SELECT id, repository_id, path, content_hash, language, size_bytes, \
                     chunk_count, indexed_at FROM files WHERE repository_id = ? ORDER BY path",
                )
                .bind(repository_id)
                .fetch_all(&pool)
                .await?;
                rows.iter().map(file_from_row).collect()
            })
            .await
    }

    /// Insert or update the record for `file` with an empty digest and
    /// return its id.
    ///
    /// The empty digest stays until [`finalize`](Self::finalize) runs, so a
    /// file whose vectors were never confirmed diffs as changed next time.
    pub async fn reserve(&self, repository_id: i64, file: &WalkedFile) -> StorageResult<i64> {
        let file = file.clone();
        self.db
            .run_query(|pool| {
                let file = file.clone();
                async move {
                    let now = now_ms();
                    let id: i64 = sqlx::query_scalar(
                        "INSERT INTO files \
                         (repository_id, path, content_hash, language, size_bytes, chunk_count, \
                          created_at, updated_at) \
                         VALUES (?, ?, '', ?, ?, 0, ?, ?) \
                         ON CONFLICT(repository_id, path) DO UPDATE SET \
                         content_hash = '', language = excluded.language, \
                         size_bytes = excluded.size_bytes, updated_at = excluded.updated_at \
                         RETURNING id",
                    )
                    .bind(repository_id)
                    .bind(&file.path)
                    .bind(&file.language)
                    .bind(file.size_bytes)
                    .bind(now)
                    .bind(now)
                    .fetch_one(&pool)
                    .await?;
                    Ok(id)
                }
            })
            .await
    }

    /// Confirm a reserved record once its vectors are stored.
    pub async fn finalize(
        &self,
        file_id: i64,
        content_hash: &str,
        chunk_count: i64,
    ) -> StorageResult<()> {
        let content_hash = content_hash.to_string();
        self.db
            .run_query(|pool| {
                let content_hash = content_hash.clone();
                async move {
                    let now = now_ms();
                    sqlx::query(
                        "UPDATE files SET content_hash = ?, chunk_count = ?, indexed_at = ?, \
                         updated_at = ? WHERE id = ?",
                    )
                    .bind(&content_hash)
                    .bind(chunk_count)
                    .bind(now)
                    .bind(now)
                    .bind(file_id)
                    .execute(&pool)
                    .await?;
                    Ok(())
                }
            })
            .await
    }

    pub async fn delete(&self, file_id: i64) -> StorageResult<()> {
        self.db
            .run_query(|pool| async move {
                sqlx::query("DELETE FROM files WHERE id = ?")
                    .bind(file_id)
                    .execute(&pool)
                    .await?;
                Ok(())
            })
            .await
    }

    /// `(file count, chunk count)` over confirmed records.
    pub async fn totals(&self, repository_id: i64) -> StorageResult<(i64, i64)> {
        self.db
            .run_query(|pool| async move {
                let row = sqlx::query(
                    "SELECT COUNT(*) AS files, COALESCE(SUM(chunk_count), 0) AS chunks \
                     FROM files WHERE repository_id = ? AND content_hash != ''",
                )
                .bind(repository_id)
                .fetch_one(&pool)
                .await?;
                Ok((row.try_get("files")?, row.try_get("chunks")?))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_db;

    fn walked(path: &str, hash: &str) -> WalkedFile {
        WalkedFile {
            path: path.into(),
            content_hash: hash.into(),
            language: "rust".into(),
            size_bytes: 3,
        }
    }

    #[tokio::test]
    async fn test_reserve_then_finalize() {
        let files = FileStore::new(memory_db().await);
        let id = files.reserve(1, &walked("a.rs", "h1")).await.unwrap();

        let listed = files.list_for_repository(1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content_hash, "");
        assert!(listed[0].indexed_at.is_none());
        assert_eq!(files.totals(1).await.unwrap(), (0, 0));

        files.finalize(id, "h1", 4).await.unwrap();
        let listed = files.list_for_repository(1).await.unwrap();
        assert_eq!(listed[0].content_hash, "h1");
        assert_eq!(listed[0].chunk_count, 4);
        assert!(listed[0].indexed_at.is_some());
        assert_eq!(files.totals(1).await.unwrap(), (1, 4));
    }

    #[tokio::test]
    async fn test_reserve_keeps_id_and_clears_digest() {
        let files = FileStore::new(memory_db().await);
        let id = files.reserve(1, &walked("a.rs", "h1")).await.unwrap();
        files.finalize(id, "h1", 1).await.unwrap();

        let again = files.reserve(1, &walked("a.rs", "h2")).await.unwrap();
        assert_eq!(id, again);
        assert_eq!(files.list_for_repository(1).await.unwrap()[0].content_hash, "");

        // Same path in another repository is a different record.
        let other = files.reserve(2, &walked("a.rs", "h1")).await.unwrap();
        assert_ne!(other, id);
    }

    #[tokio::test]
    async fn test_delete() {
        let files = FileStore::new(memory_db().await);
        let id = files.reserve(1, &walked("a.rs", "h1")).await.unwrap();
        files.delete(id).await.unwrap();
        assert!(files.list_for_repository(1).await.unwrap().is_empty());
    }
}
