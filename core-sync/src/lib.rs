//! # Sync Engine
//!
//! Resilience machinery for long-running batch operations.
//!
//! ## Overview
//!
//! A batch run asks the checkpoint manager which items are still unprocessed,
//! hands each to the scheduler, and routes every failure through the retry
//! queue. Calls to upstream services go through a circuit breaker, a quota
//! tracker fed by upstream responses, and a client-side token bucket.
//!
//! ## Components
//!
//! - **Circuit Breaker** (`circuit_breaker`): Per-dependency closed/open/half-open guard plus a get-or-create registry
//! - **Quota Tracker** (`quota`): Reactive remaining-quota and reset-time tracking with staleness
//! - **Rate Limiter** (`rate_limiter`): Token bucket for client-paced throttling
//! - **Scheduler** (`scheduler`): Bounded-parallelism priority queue with per-task retry and timeout
//! - **Checkpoints** (`checkpoint`): Per-item outcome tracking for resumable runs
//! - **Retry Queue** (`retry_queue`): Attempt counting and dead-letter routing
//! - **Batch Processor** (`batch`): Runs a batch end to end over the components above

pub mod batch;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod error;
pub mod quota;
pub mod rate_limiter;
pub mod retry_queue;
pub mod scheduler;

pub use batch::{BatchProcessor, BatchReport, ItemOutcome, ItemProcessor};
pub use checkpoint::{
    CheckpointId, CheckpointManager, CheckpointRepository, CheckpointStats, CheckpointStatus,
    ItemStatus, SqliteCheckpointRepository, SyncCheckpoint,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState,
};
pub use error::{FailureClass, Result, SyncError};
pub use quota::{QuotaState, QuotaTracker};
pub use rate_limiter::TokenBucket;
pub use retry_queue::{
    DeadLetterEntry, RetryDecision, RetryEntry, RetryQueue, RetryQueueRepository,
    SqliteRetryQueueRepository,
};
pub use scheduler::{
    Priority, SchedulerStats, TaskHandle, TaskId, TaskOptions, TaskOutcome, TaskScheduler,
};
