//! Core data models shared by the indexer.
//!
//! These mirror the persisted rows (repositories, files, index runs) plus
//! the transient values that flow through one pipeline run (walked files,
//! chunks, run statistics).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::status::Status;

/// A registered repository and its indexing state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repository {
    pub id: i64,
    pub workspace_id: i64,
    pub url: String,
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub status: Status,
    pub error_message: Option<String>,
    pub last_commit_sha: Option<String>,
    pub file_count: i64,
    pub chunk_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted record of one indexed file.
///
/// An empty `content_hash` marks a reserved row whose vectors were never
/// confirmed; the diff engine treats it as changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub repository_id: i64,
    pub path: String,
    pub content_hash: String,
    pub language: String,
    pub size_bytes: i64,
    pub chunk_count: i64,
    pub indexed_at: Option<i64>,
}

/// A file found on disk by the walker, with its content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    /// Path relative to the checkout root, `/`-separated.
    pub path: String,
    pub content_hash: String,
    pub language: String,
    pub size_bytes: i64,
}

/// One chunk produced by a [`Chunker`](crate::chunk::Chunker).
///
/// Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// Terminal (or in-flight) state of an index run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

/// Counters accumulated over one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub files_added: u64,
    pub files_changed: u64,
    pub files_unchanged: u64,
    pub files_deleted: u64,
    pub files_failed: u64,
    pub chunks_indexed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// History row for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRun {
    pub id: i64,
    pub repository_id: i64,
    pub from_commit: Option<String>,
    pub to_commit: Option<String>,
    pub status: RunStatus,
    pub stats: RunStats,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
}

/// SHA-256 of `bytes`, lowercase hex.
///
/// Used for both file digests and chunk cache keys.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
