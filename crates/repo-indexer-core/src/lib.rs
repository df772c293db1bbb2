//! # repo-indexer core
//!
//! Runtime-free logic for the repository indexer: data models, the
//! repository status machine, the incremental diff engine, chunking,
//! embedding batch planning, and the vector store abstraction.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Everything that
//! talks to a database, a git remote, or an HTTP service lives in the
//! `repo-indexer` crate and plugs into the traits defined here.

pub mod chunk;
pub mod diff;
pub mod embedding;
pub mod models;
pub mod status;
pub mod store;
