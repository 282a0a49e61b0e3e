//! # Repositories
//!
//! Trait-plus-SQLite implementations for the match-resolution tables.
//!
//! - `MatchCacheRepository` - confident matches keyed by (catalog entry, title)
//! - `UnmatchedRepository` - unmatched records and their review lifecycle
//!
//! Every trait is `Send + Sync` so callers hold them as `Arc<dyn ...>` and
//! tests can substitute in-memory fakes.

pub mod match_cache;
pub mod unmatched;

pub use match_cache::{MatchCacheRepository, SqliteMatchCacheRepository};
pub use unmatched::{SqliteUnmatchedRepository, UnmatchedRepository};
