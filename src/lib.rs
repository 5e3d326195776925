//! Streaming catalog comparison: pulls availability from Watchmode and
//! metadata from TMDB, merges them into one catalog, commits versioned
//! snapshots to Postgres and serves filtered aggregations over the current
//! snapshot.

pub mod api;
pub mod catalog;
pub mod cli;
pub mod database_ops;
pub mod error;
pub mod normalization;
pub mod orchestrator;
pub mod query;
pub mod realtime;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use catalog::{Snapshot, SnapshotMeta, Title, TitleId, UnifiedCatalog};
pub use error::{PersistenceError, RefreshError, SourceError};
pub use orchestrator::{RefreshOutcome, RefreshRunner, RefreshState};
