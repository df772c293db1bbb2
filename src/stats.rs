//! Index statistics and health overview.
//!
//! Summarizes what is registered and indexed: repositories per status,
//! file and chunk totals, cache occupancy and the most recent runs. Used by
//! `rix stats`.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use repo_indexer_core::status::Status;

use crate::config::Config;
use crate::db::Db;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub repositories: BTreeMap<String, i64>,
    pub files: i64,
    pub chunks: i64,
    pub vectors: i64,
    pub cache_entries: i64,
    pub runs: i64,
    pub failed_runs: i64,
    pub last_run_at: Option<i64>,
}

impl IndexStats {
    pub fn repository_total(&self) -> i64 {
        self.repositories.values().sum()
    }
}

pub async fn collect_stats(db: &Db) -> Result<IndexStats> {
    let stats = db
        .run_query(|pool| async move {
            let mut stats = IndexStats::default();
            for status in Status::ALL {
                stats.repositories.insert(status.as_str().to_string(), 0);
            }
            let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM repositories GROUP BY status")
                .fetch_all(&pool)
                .await?;
            for row in &rows {
                stats
                    .repositories
                    .insert(row.try_get("status")?, row.try_get("n")?);
            }

            let row = sqlx::query(
                "SELECT COUNT(*) AS files, COALESCE(SUM(chunk_count), 0) AS chunks FROM files",
            )
            .fetch_one(&pool)
            .await?;
            stats.files = row.try_get("files")?;
            stats.chunks = row.try_get("chunks")?;

            stats.vectors = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
                .fetch_one(&pool)
                .await?;
            stats.cache_entries = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
                .fetch_one(&pool)
                .await?;

            let row = sqlx::query(
                "SELECT COUNT(*) AS runs, \
                 COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed, \
                 MAX(started_at) AS last_run FROM index_runs",
            )
            .fetch_one(&pool)
            .await?;
            stats.runs = row.try_get("runs")?;
            stats.failed_runs = row.try_get("failed")?;
            stats.last_run_at = row.try_get("last_run")?;
            Ok(stats)
        })
        .await?;
    Ok(stats)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, db: &Db) -> Result<()> {
    let stats = collect_stats(db).await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Repo Indexer — Stats");
    println!("====================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Repositories:  {}", stats.repository_total());
    for (status, n) in &stats.repositories {
        println!("    {:<12} {:>6}", status, n);
    }
    println!("  Files:         {}", stats.files);
    println!("  Chunks:        {}", stats.chunks);
    println!("  Vectors:       {}", stats.vectors);
    println!(
        "  Cache:         {} / {} entries",
        stats.cache_entries, config.cache.max_entries
    );
    println!(
        "  Runs:          {} ({} failed), last {}",
        stats.runs,
        stats.failed_runs,
        stats
            .last_run_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix millisecond timestamp as a relative time ("3 hours ago").
pub fn format_ts_relative(ts_ms: i64) -> String {
    let delta = (chrono::Utc::now().timestamp_millis() - ts_ms) / 1000;

    if delta < 0 {
        return format_ts_iso(ts_ms);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts_ms)
    }
}

pub fn format_ts_iso(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}
