use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Schema statements, applied in order. All are idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workspace_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        default_branch TEXT NOT NULL DEFAULT 'main',
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        last_commit_sha TEXT,
        file_count INTEGER NOT NULL DEFAULT 0,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(workspace_id, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        language TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        indexed_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(repository_id, path)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_cache (
        content_hash TEXT NOT NULL,
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        vector BLOB NOT NULL,
        use_count INTEGER NOT NULL DEFAULT 1,
        last_used_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (content_hash, model)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL,
        from_commit TEXT,
        to_commit TEXT,
        status TEXT NOT NULL,
        files_added INTEGER NOT NULL DEFAULT 0,
        files_changed INTEGER NOT NULL DEFAULT 0,
        files_unchanged INTEGER NOT NULL DEFAULT 0,
        files_deleted INTEGER NOT NULL DEFAULT 0,
        files_failed INTEGER NOT NULL DEFAULT 0,
        chunks_indexed INTEGER NOT NULL DEFAULT 0,
        cache_hits INTEGER NOT NULL DEFAULT 0,
        cache_misses INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        duration_ms INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunk_vectors (
        id TEXT PRIMARY KEY,
        workspace_id INTEGER NOT NULL,
        repository_id INTEGER NOT NULL,
        file_id INTEGER NOT NULL,
        file_path TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        language TEXT NOT NULL,
        content TEXT NOT NULL,
        vector BLOB NOT NULL
    )
    "#,
    // Claim order: oldest pending first.
    "CREATE INDEX IF NOT EXISTS idx_repositories_status_created ON repositories(status, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_repositories_workspace ON repositories(workspace_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_repository ON files(repository_id)",
    "CREATE INDEX IF NOT EXISTS idx_embedding_cache_lru ON embedding_cache(last_used_at, use_count)",
    "CREATE INDEX IF NOT EXISTS idx_index_runs_repository ON index_runs(repository_id, started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_scope ON chunk_vectors(workspace_id, repository_id, file_id)",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("migration failed: {}", statement.trim()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            tables,
            vec![
                "chunk_vectors",
                "embedding_cache",
                "files",
                "index_runs",
                "repositories"
            ]
        );
    }
}
