//! # Match Resolution
//!
//! Decides which remote media item corresponds to a catalog track.
//!
//! ## Components
//!
//! - **Scorer** (`scorer`): Pure title/artist/duration similarity and candidate selection
//! - **Guarded Search** (`search`): Quota, rate-limit and circuit-breaker guards around the remote search
//! - **Resolver** (`resolver`): Cache lookup, fallback query strategies, near-miss recording and manual resolution

pub mod error;
pub mod resolver;
pub mod scorer;
pub mod search;

pub use error::{MatchError, Result};
pub use resolver::{CatalogTrack, MatchResolver, ResolveOutcome};
pub use scorer::{
    find_all_matches, find_best_match, parse_duration, score, ExpectedTrack, MatchScore,
    ScoreBreakdown, ScoredCandidate,
};
pub use search::GuardedSearch;
