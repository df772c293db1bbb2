//! Pipeline orchestrator: takes one claimed repository from `Cloning`
//! through fetch, walk, diff and per-file indexing to `Completed`.
//!
//! # Stages
//!
//! ```text
//! Pending ─▶ Cloning ──fetch──▶ Indexing ──walk, diff, files──▶ Completed
//!               │                  │
//!               └──── Failed ◀─────┘   (clone, metadata, listing, persistence)
//! ```
//!
//! Each file runs read → chunk → digest → cache lookup → embed misses →
//! reserve record → drop old vectors → upsert → finalize record. A failure
//! anywhere in that chain is logged, counted in `files_failed`, and the run
//! moves on to the next file.
//!
//! Every processed file refreshes the repository's `updated_at`, so only
//! runs whose worker died look stale to `JobQueue::requeue_stale`.
//!
//! Cancellation is checked between files. A cancelled run closes its
//! `index_runs` row as `cancelled` and leaves the repository status as it
//! was last written, so stale-run recovery can pick it up later.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use repo_indexer_core::chunk::{whole_file, Chunker, LineChunker};
use repo_indexer_core::diff::{diff_files, FileChange};
use repo_indexer_core::embedding::EmbeddingProvider;
use repo_indexer_core::models::{content_digest, FileRecord, Repository, RunStats, RunStatus, WalkedFile};
use repo_indexer_core::status::Status;
use repo_indexer_core::store::{ChunkPayload, VectorFilter, VectorPoint, VectorStore};

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::db::Db;
use crate::embedding::{create_provider, embed_batched};
use crate::error::{IndexError, StorageError};
use crate::files::FileStore;
use crate::git::{checkout_path, FetchError, GitFetcher, RepoFetcher};
use crate::repos::RepoStore;
use crate::runs::RunStore;
use crate::vector_store::SqliteVectorStore;
use crate::walker::{self, WalkOptions};

/// Run counters are written to `index_runs` every this many files.
pub const FLUSH_EVERY: u64 = 50;

/// External services the orchestrator drives. Injected so tests can
/// swap in fakes.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn RepoFetcher>,
    pub chunker: Arc<dyn Chunker>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub vectors: Arc<dyn VectorStore>,
}

impl Collaborators {
    /// Git CLI fetcher, line chunker, the configured embedding provider and
    /// the SQLite vector store.
    pub fn from_config(config: &Config, db: &Db) -> Result<Self> {
        Ok(Self {
            fetcher: Arc::new(GitFetcher::new(&config.git)),
            chunker: Arc::new(LineChunker::new(config.chunking.max_tokens)),
            provider: create_provider(&config.embedding)?,
            vectors: Arc::new(SqliteVectorStore::new(db.clone())),
        })
    }
}

/// What a finished run reports back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub repository_id: i64,
    pub commit: String,
    pub stats: RunStats,
}

pub struct Orchestrator {
    db: Db,
    cache: Arc<EmbeddingCache>,
    parts: Collaborators,
    walk_options: Arc<WalkOptions>,
    clone_dir: PathBuf,
}

/// Mutable state of one run, kept outside the stage functions so the
/// failure path knows which status to move away from.
struct RunState {
    status: Status,
    stats: RunStats,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        config: &Config,
        cache: Arc<EmbeddingCache>,
        parts: Collaborators,
    ) -> Result<Self> {
        Ok(Self {
            db,
            cache,
            parts,
            walk_options: Arc::new(WalkOptions::from_config(&config.indexing)?),
            clone_dir: config.indexing.clone_dir.clone(),
        })
    }

    pub fn vectors(&self) -> Arc<dyn VectorStore> {
        self.parts.vectors.clone()
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.parts.provider.clone()
    }

    /// Index `repo`, which must be `Pending` or already claimed (`Cloning`).
    #[instrument(skip_all, fields(repository_id = repo.id, url = %repo.url))]
    pub async fn run(
        &self,
        repo: Repository,
        cancel: &CancellationToken,
    ) -> Result<RunReport, IndexError> {
        let db = self.db.with_cancel(cancel.clone());
        let repos = RepoStore::new(db.clone());
        let runs = RunStore::new(db.clone());

        let status = match repo.status {
            Status::Pending => {
                repos.transition(repo.id, Status::Pending, Status::Cloning).await?;
                Status::Cloning
            }
            Status::Cloning => Status::Cloning,
            other => {
                return Err(IndexError::Storage(StorageError::InvalidTransition {
                    from: other,
                    to: Status::Cloning,
                }))
            }
        };

        let (run_id, started_at) = match runs.open(repo.id, repo.last_commit_sha.as_deref()).await {
            Ok(opened) => opened,
            Err(err) => {
                let err = IndexError::from(err);
                if !err.is_cancelled() {
                    self.record_failure(repo.id, status, &err).await;
                }
                return Err(err);
            }
        };
        info!(run_id, "index run started");

        let mut state = RunState {
            status,
            stats: RunStats::default(),
        };
        let result = self.execute(&db, &repo, run_id, &mut state, cancel).await;

        let (run_status, error) = match &result {
            Ok(_) => (RunStatus::Completed, None),
            Err(err) if err.is_cancelled() => (RunStatus::Cancelled, Some(err.to_string())),
            Err(err) => (RunStatus::Failed, Some(err.to_string())),
        };

        if let Err(err) = &result {
            if !err.is_cancelled() && state.status.is_active() {
                self.record_failure(repo.id, state.status, err).await;
            }
        }

        // Closed without the cancel token so a cancelled run is still recorded.
        if let Err(err) = RunStore::new(self.db.clone())
            .close(run_id, started_at, run_status, &state.stats, error.as_deref())
            .await
        {
            warn!(run_id, error = %err, "failed to close index run");
        }

        match &result {
            Ok(report) => {
                let s = &report.stats;
                info!(
                    run_id,
                    added = s.files_added,
                    changed = s.files_changed,
                    unchanged = s.files_unchanged,
                    deleted = s.files_deleted,
                    failed = s.files_failed,
                    chunks = s.chunks_indexed,
                    "index run completed"
                );
                if let Err(err) = self.cache.evict_if_needed().await {
                    warn!(error = %err, "embedding cache eviction failed");
                }
            }
            Err(err) if err.is_cancelled() => info!(run_id, "index run cancelled"),
            Err(err) => warn!(run_id, error = %err, "index run failed"),
        }

        result
    }

    async fn record_failure(&self, repository_id: i64, from: Status, err: &IndexError) {
        let repos = RepoStore::new(self.db.clone());
        match repos.mark_failed(repository_id, from, &err.to_string()).await {
            Ok(()) => {}
            Err(mark_err) => warn!(
                repository_id,
                error = %mark_err,
                "could not mark repository failed"
            ),
        }
    }

    async fn execute(
        &self,
        db: &Db,
        repo: &Repository,
        run_id: i64,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<RunReport, IndexError> {
        let repos = RepoStore::new(db.clone());
        let runs = RunStore::new(db.clone());
        let files = FileStore::new(db.clone());

        // Fetch. Dropping the fetch future kills the git child process.
        let dest = checkout_path(&self.clone_dir, repo.id);
        let checkout = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IndexError::Cancelled),
            fetched = self.parts.fetcher.fetch(repo, &dest) => fetched.map_err(|err| match err {
                FetchError::Clone(msg) => IndexError::Clone(msg),
                FetchError::Metadata(msg) => IndexError::Metadata(msg),
            })?,
        };
        debug!(commit = %checkout.commit, branch = %checkout.branch, "checkout ready");

        repos
            .record_clone(repo.id, &checkout.commit, &checkout.branch)
            .await
            .map_err(|err| match err {
                StorageError::Cancelled => IndexError::Cancelled,
                other => IndexError::PersistClone(other),
            })?;
        state.status = Status::Indexing;
        runs.set_target(run_id, &checkout.commit).await?;

        let walked = walker::walk(checkout.root.clone(), self.walk_options.clone())
            .await
            .map_err(|err| IndexError::Listing(format!("{:#}", err)))?;
        let previous = files.list_for_repository(repo.id).await?;
        let diff = diff_files(walked, previous);

        state.stats.files_added = diff.added() as u64;
        state.stats.files_changed = diff.changed() as u64;
        state.stats.files_unchanged = diff.unchanged() as u64;
        state.stats.files_deleted = diff.deleted() as u64;
        info!(
            walked = diff.changes.len(),
            added = diff.added(),
            changed = diff.changed(),
            deleted = diff.deleted(),
            "diff computed"
        );

        let ctx = FileContext {
            repo,
            root: &checkout.root,
            files: &files,
        };

        let mut processed = 0u64;
        for change in diff.changes.iter().filter(|c| c.needs_indexing()) {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            match self.index_file(&ctx, change, &mut state.stats).await {
                Ok(chunks) => {
                    state.stats.chunks_indexed += chunks as u64;
                    debug!(path = change.path(), chunks, "file indexed");
                }
                Err(_) if cancel.is_cancelled() => return Err(IndexError::Cancelled),
                Err(err) => {
                    state.stats.files_failed += 1;
                    warn!(path = change.path(), error = %format!("{:#}", err), "file skipped");
                }
            }
            processed += 1;
            self.heartbeat(&repos, repo.id).await?;
            if processed % FLUSH_EVERY == 0 {
                self.flush(&runs, run_id, &state.stats).await;
            }
        }

        for record in &diff.deleted {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            match self.remove_file(repo, record, &files).await {
                Ok(()) => debug!(path = %record.path, "file removed"),
                Err(_) if cancel.is_cancelled() => return Err(IndexError::Cancelled),
                Err(err) => {
                    state.stats.files_failed += 1;
                    warn!(path = %record.path, error = %format!("{:#}", err), "file removal failed");
                }
            }
            processed += 1;
            self.heartbeat(&repos, repo.id).await?;
            if processed % FLUSH_EVERY == 0 {
                self.flush(&runs, run_id, &state.stats).await;
            }
        }

        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let (file_count, chunk_count) = files.totals(repo.id).await?;
        repos.finish_run(repo.id, file_count, chunk_count).await?;
        state.status = Status::Completed;

        Ok(RunReport {
            run_id,
            repository_id: repo.id,
            commit: checkout.commit,
            stats: state.stats.clone(),
        })
    }

    /// Keep the repository out of stale-run recovery while files are being
    /// processed. Losing the `Indexing` status means another actor owns the
    /// repository now, so the run stops.
    async fn heartbeat(&self, repos: &RepoStore, repository_id: i64) -> Result<(), IndexError> {
        match repos.touch(repository_id, Status::Indexing).await {
            Ok(()) => Ok(()),
            Err(err @ (StorageError::Conflict { .. } | StorageError::NotFound { .. })) => {
                warn!(error = %err, "repository changed under a running pipeline, stopping");
                Err(err.into())
            }
            Err(StorageError::Cancelled) => Err(IndexError::Cancelled),
            Err(err) => {
                warn!(error = %err, "heartbeat failed");
                Ok(())
            }
        }
    }

    async fn flush(&self, runs: &RunStore, run_id: i64, stats: &RunStats) {
        if let Err(err) = runs.flush(run_id, stats).await {
            warn!(run_id, error = %err, "failed to flush run progress");
        }
    }

    /// Index one added or changed file; returns its chunk count.
    async fn index_file(
        &self,
        ctx: &FileContext<'_>,
        change: &FileChange,
        stats: &mut RunStats,
    ) -> Result<usize> {
        let (walked, replaces) = match change {
            FileChange::Added(current) => (current, false),
            FileChange::Changed { current, .. } => (current, true),
            FileChange::Unchanged { .. } => return Ok(0),
        };

        let bytes = tokio::fs::read(ctx.root.join(&walked.path))
            .await
            .context("read failed")?;
        // The file may have changed since the walk; record what was indexed.
        let indexed = WalkedFile {
            content_hash: content_digest(&bytes),
            size_bytes: bytes.len() as i64,
            ..walked.clone()
        };
        let text = String::from_utf8(bytes).map_err(|_| anyhow!("file is not valid UTF-8"))?;

        let language = (walked.language != "unknown").then_some(walked.language.as_str());
        let pieces = match self.parts.chunker.chunk(&text, language) {
            Ok(pieces) => pieces,
            Err(err) => {
                debug!(path = %walked.path, error = %err, "chunker failed, using whole file");
                whole_file(&text)
            }
        };

        let vectors = self.embed_pieces(&pieces, stats).await?;

        let file_id = ctx.files.reserve(ctx.repo.id, &indexed).await?;
        let scope = VectorFilter::file(ctx.repo.workspace_id, ctx.repo.id, file_id);
        if replaces {
            self.parts
                .vectors
                .delete_by_filter(&scope)
                .await
                .context("removing previous vectors failed")?;
        }

        let points: Vec<VectorPoint> = pieces
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (piece, vector))| VectorPoint {
                id: VectorPoint::point_id(file_id, i as i64),
                vector,
                payload: ChunkPayload {
                    workspace_id: ctx.repo.workspace_id,
                    repository_id: ctx.repo.id,
                    file_id,
                    file_path: walked.path.clone(),
                    chunk_index: i as i64,
                    start_line: piece.start_line as i64,
                    end_line: piece.end_line as i64,
                    language: walked.language.clone(),
                    content: piece.content.clone(),
                },
            })
            .collect();
        self.parts
            .vectors
            .upsert(&points)
            .await
            .context("vector upsert failed")?;

        ctx.files
            .finalize(file_id, &indexed.content_hash, points.len() as i64)
            .await?;
        Ok(points.len())
    }

    /// One vector per piece, from the cache where possible.
    async fn embed_pieces(
        &self,
        pieces: &[repo_indexer_core::models::ChunkPiece],
        stats: &mut RunStats,
    ) -> Result<Vec<Vec<f32>>> {
        if pieces.is_empty() {
            return Ok(Vec::new());
        }
        let provider = self.parts.provider.as_ref();
        let model = provider.model_name().to_string();
        let dims = provider.dims();

        let digests: Vec<String> = pieces
            .iter()
            .map(|p| content_digest(p.content.as_bytes()))
            .collect();

        let mut slots = match self.cache.lookup_many(&digests, &model, dims).await {
            Ok(found) => found,
            Err(StorageError::Cancelled) => return Err(StorageError::Cancelled.into()),
            Err(err) => {
                warn!(error = %err, "embedding cache lookup failed, embedding everything");
                vec![None; pieces.len()]
            }
        };

        let missing: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].is_none()).collect();
        stats.cache_hits += (slots.len() - missing.len()) as u64;
        stats.cache_misses += missing.len() as u64;

        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| pieces[i].content.clone()).collect();
            let fresh = embed_batched(provider, &texts)
                .await
                .context("embedding failed")?;

            let entries: Vec<(String, Vec<f32>)> = missing
                .iter()
                .zip(&fresh)
                .map(|(&i, v)| (digests[i].clone(), v.clone()))
                .collect();
            if let Err(err) = self.cache.store_many(&model, &entries).await {
                warn!(error = %err, "embedding cache store failed");
            }

            for (&i, vector) in missing.iter().zip(fresh) {
                slots[i] = Some(vector);
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| anyhow!("missing embedding")))
            .collect()
    }

    /// Vectors first, then the record, so a half-done removal is retried
    /// on the next run instead of leaving orphaned vectors.
    async fn remove_file(
        &self,
        repo: &Repository,
        record: &FileRecord,
        files: &FileStore,
    ) -> Result<()> {
        self.parts
            .vectors
            .delete_by_filter(&VectorFilter::file(repo.workspace_id, repo.id, record.id))
            .await
            .context("removing vectors failed")?;
        files.delete(record.id).await?;
        Ok(())
    }
}

struct FileContext<'a> {
    repo: &'a Repository,
    root: &'a Path,
    files: &'a FileStore,
}
