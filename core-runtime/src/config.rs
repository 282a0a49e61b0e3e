//! # Engine Configuration
//!
//! Tunables for every engine component, grouped per component and aggregated
//! into [`CoreConfig`].
//!
//! ## Overview
//!
//! Each struct implements `Default` with the production defaults, derives
//! `Deserialize` with `#[serde(default)]` so a host document only needs the
//! keys it overrides, and exposes `validate()` for fail-fast checks.
//!
//! Business thresholds (retry cap, quota warn level, match cut-offs) live here
//! rather than in the components, so they can be recalibrated without a code
//! change.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::{CoreConfig, MatchingConfig};
//!
//! let config = CoreConfig::builder()
//!     .database_path("/var/lib/tunesync/sync.db")
//!     .matching(MatchingConfig::default().with_match_threshold(0.7))
//!     .build()?;
//! assert_eq!(config.scheduler.max_concurrent, 3);
//! # Ok::<(), core_runtime::Error>(())
//! ```
//!
//! Host supplied JSON is parsed and validated in one step:
//!
//! ```
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::from_json_str(r#"{ "retry": { "max_attempts": 5 } }"#)?;
//! assert_eq!(config.retry.max_attempts, 5);
//! assert!(config.database_path.is_none());
//! # Ok::<(), core_runtime::Error>(())
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Matching
// ============================================================================

/// Cut-offs used by the scorer and resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum confidence for an automatic match
    pub match_threshold: f64,
    /// Minimum confidence for a candidate to be kept as a near-miss
    pub near_miss_threshold: f64,
    /// How many near-misses to persist per unmatched record
    pub max_near_misses: usize,
    /// Result limit passed to each search call
    pub search_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            near_miss_threshold: 0.3,
            max_near_misses: 3,
            search_limit: 10,
        }
    }
}

impl MatchingConfig {
    pub fn with_match_threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = threshold;
        self
    }

    pub fn with_near_miss_threshold(mut self, threshold: f64) -> Self {
        self.near_miss_threshold = threshold;
        self
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(Error::invalid("matching.match_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.near_miss_threshold) {
            return Err(Error::invalid(
                "matching.near_miss_threshold",
                "must be within [0, 1]",
            ));
        }
        if self.near_miss_threshold > self.match_threshold {
            return Err(Error::invalid(
                "matching.near_miss_threshold",
                "must not exceed match_threshold",
            ));
        }
        if self.search_limit == 0 {
            return Err(Error::invalid("matching.search_limit", "must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker slots
    pub max_concurrent: usize,
    /// Retries after the first attempt, per task unless overridden
    pub default_retries: u32,
    pub default_timeout_ms: u64,
    /// Backoff before retry `n` is `base_backoff_ms * 2^(n-1)`
    pub base_backoff_ms: u64,
    /// Bound on the pending queue; unbounded when `None`
    pub max_queued: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_retries: 2,
            default_timeout_ms: 30_000,
            base_backoff_ms: 1_000,
            max_queued: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, slots: usize) -> Self {
        self.max_concurrent = slots;
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_base_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.base_backoff_ms = backoff_ms;
        self
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = Some(max_queued);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::invalid("scheduler.max_concurrent", "must be at least 1"));
        }
        if self.default_timeout_ms == 0 {
            return Err(Error::invalid(
                "scheduler.default_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.max_queued == Some(0) {
            return Err(Error::invalid("scheduler.max_queued", "must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker
    pub success_threshold: u32,
    /// Cooldown after the last failure before probing again
    pub open_timeout_ms: u64,
    /// Rolling window for reported success-rate metrics
    pub metrics_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 60_000,
            metrics_window_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.open_timeout_ms = timeout_ms;
        self
    }

    pub fn with_metrics_window_ms(mut self, window_ms: u64) -> Self {
        self.metrics_window_ms = window_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(Error::invalid(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Quota and rate limiting
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// `remaining` at or below this value counts as approaching the limit
    pub warn_threshold: i64,
    /// Age after which reported quota is treated as unknown
    pub stale_after_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 5,
            stale_after_secs: 86_400,
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.warn_threshold < 0 {
            return Err(Error::invalid("quota.warn_threshold", "must not be negative"));
        }
        if self.stale_after_secs == 0 {
            return Err(Error::invalid("quota.stale_after_secs", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Client-side token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket size (maximum burst)
    pub capacity: u32,
    /// Time to replenish one token
    pub refill_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_interval_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::invalid("rate_limit.capacity", "must be at least 1"));
        }
        if self.refill_interval_ms == 0 {
            return Err(Error::invalid(
                "rate_limit.refill_interval_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Retry queue and checkpoints
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Attempt count at which an item is moved to the dead-letter queue
    pub max_attempts: u32,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid("retry.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Completed checkpoints older than this are eligible for purge
    pub retention_days: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

// ============================================================================
// Aggregate
// ============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// SQLite file; an in-memory database is used when absent
    pub database_path: Option<PathBuf>,
    pub database_max_connections: u32,
    pub event_buffer_size: usize,
    pub matching: MatchingConfig,
    pub scheduler: SchedulerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicyConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            database_max_connections: 5,
            event_buffer_size: crate::events::DEFAULT_EVENT_BUFFER_SIZE,
            matching: MatchingConfig::default(),
            scheduler: SchedulerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            quota: QuotaConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicyConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Parse a JSON document and validate the result.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid configuration document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.database_path {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("Database path cannot be empty".to_string()));
            }
        }
        if self.database_max_connections == 0 {
            return Err(Error::invalid(
                "database_max_connections",
                "must be at least 1",
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::invalid("event_buffer_size", "must be at least 1"));
        }

        self.matching.validate()?;
        self.scheduler.validate()?;
        self.circuit_breaker.validate()?;
        self.quota.validate()?;
        self.rate_limit.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Builder for [`CoreConfig`]; `build()` validates.
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.database_path = Some(path.into());
        self
    }

    /// Use a private in-memory database.
    pub fn in_memory(mut self) -> Self {
        self.config.database_path = None;
        self
    }

    pub fn database_max_connections(mut self, connections: u32) -> Self {
        self.config.database_max_connections = connections;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn matching(mut self, matching: MatchingConfig) -> Self {
        self.config.matching = matching;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = breaker;
        self
    }

    pub fn quota(mut self, quota: QuotaConfig) -> Self {
        self.config.quota = quota;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn retry(mut self, retry: RetryPolicyConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.config.checkpoint = checkpoint;
        self
    }

    pub fn build(self) -> Result<CoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
