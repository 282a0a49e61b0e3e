//! # Sync Store
//!
//! SQLite persistence for the sync engine: pool setup, embedded migrations, and
//! the match-resolution tables.
//!
//! ## Overview
//!
//! This crate owns:
//! - The connection pool and the physical schema (`migrations/`)
//! - Match cache rows keyed by (catalog entry, track title)
//! - Unmatched records awaiting manual review
//!
//! Checkpoint and retry tables share the same schema; their repositories live
//! with the components that drive them in `core-sync`.

pub mod db;
pub mod error;
pub mod models;
pub mod repositories;

pub use error::{LibraryError, Result};
pub use models::{CachedMatch, NearMiss, UnmatchedRecord, UnmatchedRecordId, UnmatchedStatus};
pub use repositories::{
    MatchCacheRepository, SqliteMatchCacheRepository, SqliteUnmatchedRepository,
    UnmatchedRepository,
};
