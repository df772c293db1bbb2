//! # Repo Indexer CLI (`rix`)
//!
//! The `rix` binary registers repositories, runs the indexing worker pool,
//! and queries the resulting index.
//!
//! ## Usage
//!
//! ```bash
//! rix --config ./config/rix.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rix init` | Create the SQLite database and run schema migrations |
//! | `rix repo add <url>` | Register a repository (queued as pending) |
//! | `rix repo list` | List repositories with their status |
//! | `rix repo show <id>` | Show one repository |
//! | `rix repo reindex <id>` | Queue a completed or failed repository again |
//! | `rix repo delete <id>` | Remove a repository, its files, vectors and checkout |
//! | `rix repo runs <id>` | Show index-run history |
//! | `rix worker` | Run the worker pool until Ctrl-C |
//! | `rix index <id>` | Index one pending repository in the foreground |
//! | `rix requeue-stale` | Return stuck active repositories to pending |
//! | `rix search "<query>"` | Semantic search within a workspace |
//! | `rix cache stats` | Embedding cache occupancy and hit counters |
//! | `rix cache evict` | Run an eviction sweep now |
//! | `rix stats` | Overall index statistics |
//!
//! ## Logging
//!
//! Logs go to stderr. `RUST_LOG` sets the filter (default `info`);
//! `RIX_LOG_JSON=1` switches to JSON lines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use repo_indexer::cache::EmbeddingCache;
use repo_indexer::config::{self, Config};
use repo_indexer::core::models::Repository;
use repo_indexer::core::status::Status;
use repo_indexer::db::Db;
use repo_indexer::git::checkout_path;
use repo_indexer::migrate;
use repo_indexer::pipeline::{Collaborators, Orchestrator};
use repo_indexer::queue::{Claim, JobQueue};
use repo_indexer::repos::{ListFilter, RepoStore};
use repo_indexer::runs::RunStore;
use repo_indexer::search::{self, SearchRequest};
use repo_indexer::stats::{self, format_ts_iso};
use repo_indexer::vector_store::SqliteVectorStore;
use repo_indexer::worker::WorkerPool;

/// Repo Indexer CLI: incremental repository indexing for semantic code search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rix.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rix",
    about = "Repo Indexer — incremental repository indexing for semantic code search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rix.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Manage registered repositories.
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Run the worker pool.
    ///
    /// Workers poll for pending repositories and index them. The first
    /// Ctrl-C stops claiming and lets in-flight runs finish; a second one
    /// cancels them at the next file boundary.
    Worker {
        /// Override `indexing.workers`.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Claim one pending repository and index it in the foreground.
    Index {
        id: i64,
    },

    /// Return repositories stuck in cloning/indexing to pending.
    RequeueStale {
        /// Override `indexing.stale_after_secs`.
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Semantic search over indexed chunks.
    Search {
        query: String,

        #[arg(long, default_value_t = 1)]
        workspace: i64,

        /// Restrict results to one repository.
        #[arg(long)]
        repo: Option<i64>,

        #[arg(long, default_value_t = search::DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Inspect or sweep the embedding cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show index statistics.
    Stats,
}

#[derive(Subcommand)]
enum RepoAction {
    /// Register a repository URL (GitHub short forms accepted).
    Add {
        url: String,
        #[arg(long, default_value_t = 1)]
        workspace: i64,
    },
    /// List repositories.
    List {
        #[arg(long)]
        workspace: Option<i64>,
        /// pending, cloning, indexing, completed or failed.
        #[arg(long)]
        status: Option<Status>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one repository.
    Show { id: i64 },
    /// Queue a completed or failed repository for re-indexing.
    Reindex { id: i64 },
    /// Delete a repository with its files, vectors, run history and checkout.
    Delete { id: i64 },
    /// Show recent index runs.
    Runs {
        id: i64,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry count, bound, models and hit/miss counters.
    Stats,
    /// Evict least-recently-used entries if over the bound.
    Evict,
}

fn init_tracing() {
    let json = std::env::var("RIX_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let db = Db::open(&cfg).await?;
    migrate::run_migrations(db.pool()).await?;

    let result = run(cli.command, &cfg, &db).await;
    db.close().await;
    result
}

async fn run(command: Commands, cfg: &Config, db: &Db) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            println!("Database initialized at {}.", cfg.db.path.display());
        }
        Commands::Repo { action } => run_repo(action, cfg, db).await?,
        Commands::Worker { workers } => run_worker(cfg, db, workers).await?,
        Commands::Index { id } => run_index(cfg, db, id).await?,
        Commands::RequeueStale { older_than_secs } => {
            let secs = older_than_secs.unwrap_or(cfg.indexing.stale_after_secs);
            let ids = JobQueue::new(db.clone())
                .requeue_stale(Duration::from_secs(secs))
                .await?;
            if ids.is_empty() {
                println!("No stale repositories.");
            } else {
                println!("Requeued {} repositories: {:?}", ids.len(), ids);
            }
        }
        Commands::Search {
            query,
            workspace,
            repo,
            limit,
        } => {
            let parts = Collaborators::from_config(cfg, db)?;
            let request = SearchRequest {
                workspace_id: workspace,
                repository_id: repo,
                query,
                limit,
            };
            let hits =
                search::search(parts.provider.as_ref(), parts.vectors.as_ref(), &request).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {}:{}-{} (repo {}, {})",
                    i + 1,
                    hit.score,
                    hit.path,
                    hit.start_line,
                    hit.end_line,
                    hit.repository_id,
                    hit.language
                );
                for line in hit.snippet.lines().take(4) {
                    println!("     {}", line);
                }
            }
        }
        Commands::Cache { action } => {
            let cache = EmbeddingCache::new(db.clone(), &cfg.cache);
            match action {
                CacheAction::Stats => {
                    let s = cache.stats().await?;
                    println!("Entries:  {} / {}", s.entries, s.max_entries);
                    println!("Models:   {}", s.models);
                    println!("Hits:     {}", s.hits);
                    println!("Misses:   {}", s.misses);
                }
                CacheAction::Evict => {
                    let removed = cache.evict_if_needed().await?;
                    println!("Evicted {} entries.", removed);
                }
            }
        }
        Commands::Stats => stats::run_stats(cfg, db).await?,
    }
    Ok(())
}

fn print_repo_row(repo: &Repository) {
    println!(
        "  {:>5}  {:>4}  {:<10} {:>6} {:>7}  {}",
        repo.id,
        repo.workspace_id,
        repo.status.as_str(),
        repo.file_count,
        repo.chunk_count,
        repo.url
    );
}

async fn run_repo(action: RepoAction, cfg: &Config, db: &Db) -> anyhow::Result<()> {
    let repos = RepoStore::new(db.clone());
    match action {
        RepoAction::Add { url, workspace } => {
            let repo = repos.create(workspace, &url).await?;
            println!("Registered repository {} ({}), status pending.", repo.id, repo.url);
        }
        RepoAction::List {
            workspace,
            status,
            limit,
            offset,
        } => {
            let list = repos
                .list(&ListFilter {
                    workspace_id: workspace,
                    status,
                    limit: Some(limit),
                    offset,
                })
                .await?;
            println!(
                "  {:>5}  {:>4}  {:<10} {:>6} {:>7}  {}",
                "ID", "WS", "STATUS", "FILES", "CHUNKS", "URL"
            );
            println!("  {}", "-".repeat(76));
            for repo in &list {
                print_repo_row(repo);
            }
        }
        RepoAction::Show { id } => {
            let repo = repos.get(id).await?;
            println!("Repository {}", repo.id);
            println!("  URL:        {}", repo.url);
            println!("  Name:       {}/{}", repo.owner, repo.name);
            println!("  Workspace:  {}", repo.workspace_id);
            println!("  Branch:     {}", repo.default_branch);
            println!("  Status:     {}", repo.status);
            println!(
                "  Commit:     {}",
                repo.last_commit_sha.as_deref().unwrap_or("-")
            );
            println!("  Files:      {}", repo.file_count);
            println!("  Chunks:     {}", repo.chunk_count);
            println!("  Updated:    {}", format_ts_iso(repo.updated_at));
            if let Some(err) = &repo.error_message {
                println!("  Error:      {}", err);
            }
        }
        RepoAction::Reindex { id } => {
            let repo = JobQueue::new(db.clone()).request_reindex(id).await?;
            println!("Repository {} is {}.", repo.id, repo.status);
        }
        RepoAction::Delete { id } => {
            let vectors = SqliteVectorStore::new(db.clone());
            let repo = repos.delete(id, &vectors).await?;
            let checkout = checkout_path(&cfg.indexing.clone_dir, repo.id);
            if checkout.exists() {
                tokio::fs::remove_dir_all(&checkout)
                    .await
                    .with_context(|| format!("failed to remove {}", checkout.display()))?;
            }
            println!("Deleted repository {} ({}).", repo.id, repo.url);
        }
        RepoAction::Runs { id, limit } => {
            let runs = RunStore::new(db.clone()).list(id, limit).await?;
            println!(
                "  {:>5}  {:<10} {:>5} {:>5} {:>5} {:>5} {:>5} {:>7}  {}",
                "RUN", "STATUS", "ADD", "CHG", "DEL", "SAME", "FAIL", "CHUNKS", "STARTED"
            );
            println!("  {}", "-".repeat(76));
            for run in &runs {
                let s = &run.stats;
                println!(
                    "  {:>5}  {:<10} {:>5} {:>5} {:>5} {:>5} {:>5} {:>7}  {}",
                    run.id,
                    run.status.as_str(),
                    s.files_added,
                    s.files_changed,
                    s.files_deleted,
                    s.files_unchanged,
                    s.files_failed,
                    s.chunks_indexed,
                    format_ts_iso(run.started_at)
                );
            }
        }
    }
    Ok(())
}

fn build_orchestrator(cfg: &Config, db: &Db) -> anyhow::Result<Arc<Orchestrator>> {
    if !cfg.embedding.is_enabled() {
        bail!("embedding provider is disabled; set [embedding] provider in the config");
    }
    let cache = Arc::new(EmbeddingCache::new(db.clone(), &cfg.cache));
    let parts = Collaborators::from_config(cfg, db)?;
    Ok(Arc::new(Orchestrator::new(db.clone(), cfg, cache, parts)?))
}

async fn run_worker(cfg: &Config, db: &Db, workers: Option<usize>) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(cfg, db)?;
    let pool = WorkerPool::new(
        JobQueue::new(db.clone()),
        orchestrator,
        workers.unwrap_or(cfg.indexing.workers),
        cfg.indexing.poll_interval(),
    );
    let handle = pool.start();

    let control = handle.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("shutdown requested; finishing in-flight runs (Ctrl-C again to cancel them)");
        control.shutdown();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelling in-flight runs");
            control.cancel();
        }
    });

    let summaries = handle.join().await;
    for s in &summaries {
        println!(
            "worker {}: {} completed, {} failed, {} cancelled",
            s.worker_id, s.completed, s.failed, s.cancelled
        );
    }
    Ok(())
}

async fn run_index(cfg: &Config, db: &Db, id: i64) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(cfg, db)?;
    let repo = match JobQueue::new(db.clone()).claim_one(id).await? {
        Claim::Claimed(repo) => repo,
        Claim::NoWork => {
            let current = RepoStore::new(db.clone()).get(id).await?;
            bail!(
                "repository {} is {}, not pending; use `rix repo reindex {}` first",
                id,
                current.status,
                id
            );
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelling run");
            on_signal.cancel();
        }
    });

    let report = orchestrator.run(repo, &cancel).await?;
    let s = &report.stats;
    println!("Indexed repository {} at {}.", report.repository_id, report.commit);
    println!(
        "  added {}, changed {}, unchanged {}, deleted {}, failed {}",
        s.files_added, s.files_changed, s.files_unchanged, s.files_deleted, s.files_failed
    );
    println!(
        "  {} chunks embedded ({} cache hits, {} misses)",
        s.chunks_indexed, s.cache_hits, s.cache_misses
    );
    Ok(())
}
