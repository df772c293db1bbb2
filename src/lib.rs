//! # Repo Indexer
//!
//! Incremental indexing of source repositories for semantic code search.
//!
//! Repositories are registered per workspace and queued in SQLite. A pool
//! of workers claims them one at a time, clones or updates the checkout,
//! diffs the files against what was indexed last time, and embeds only the
//! chunks whose content changed. Embeddings are cached by content digest,
//! so identical code across repositories or commits is embedded once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  claim  ┌──────────────┐  fetch  ┌──────────┐
//! │ JobQueue │────────▶│ Orchestrator │────────▶│   git    │
//! │ (SQLite) │         └──────┬───────┘         └──────────┘
//! └──────────┘                │ walk → diff → chunk → embed
//!                             ▼
//!             ┌───────────────┬───────────────┐
//!             ▼               ▼               ▼
//!       ┌──────────┐   ┌────────────┐  ┌─────────────┐
//!       │  files   │   │ embedding  │  │ VectorStore │
//!       │ records  │   │   cache    │  │             │
//!       └──────────┘   └────────────┘  └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rix init                                   # create database
//! rix repo add https://github.com/acme/api   # register a repository
//! rix worker                                 # index queued repositories
//! rix search "retry with backoff"            # query the index
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Connection setup and retrying unit of work |
//! | [`migrate`] | Schema creation |
//! | [`error`] | Storage and pipeline error types |
//! | [`repos`] | Repository registry and status transitions |
//! | [`queue`] | Atomic job claims, re-index, stale recovery |
//! | [`files`] | Persisted file records |
//! | [`runs`] | Index-run history |
//! | [`git`] | URL normalization and the git fetcher |
//! | [`walker`] | Checkout walking and content digests |
//! | [`embedding`] | Embedding providers over HTTP |
//! | [`cache`] | Content-addressed embedding cache |
//! | [`vector_store`] | SQLite-backed vector store |
//! | [`pipeline`] | The per-repository orchestrator |
//! | [`worker`] | Worker pool with graceful shutdown |
//! | [`search`] | Semantic search |
//! | [`stats`] | Index statistics |

pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod files;
pub mod git;
pub mod migrate;
pub mod pipeline;
pub mod queue;
pub mod repos;
pub mod runs;
pub mod search;
pub mod stats;
pub mod vector_store;
pub mod walker;
pub mod worker;

pub use repo_indexer_core as core;
