//! # Host Bridge Traits
//!
//! Contracts between the sync core and the collaborators it treats as external.
//!
//! ## Overview
//!
//! The core never talks to the network, a credential store or a log backend
//! directly. Each capability it needs is expressed here as a trait that the
//! host implements:
//!
//! - [`MediaSearchProvider`](search::MediaSearchProvider) - remote search on the
//!   playlist service, optionally reporting remaining quota
//! - [`QueryStrategyProvider`](query::QueryStrategyProvider) - ordered query
//!   strings for a catalog track
//! - [`Clock`](time::Clock) - time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should pick the variant that matches the upstream condition so the core can
//! tell transient failures (retry) from permanent ones (dead-letter).

pub mod error;
pub mod query;
pub mod search;
pub mod time;

pub use error::BridgeError;

pub use query::{BasicQueryStrategies, QueryStrategyProvider};
pub use search::{MatchCandidate, MediaSearchProvider, QuotaReport, SearchResponse};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
