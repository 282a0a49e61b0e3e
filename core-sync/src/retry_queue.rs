//! # Retry Queue & Dead-Letter Queue
//!
//! Routes failed items by [`FailureClass`]:
//!
//! - `Transient` and `Local`: recorded in the retry queue with an attempt counter. When the
//!   counter reaches `max_attempts` the item moves to the dead-letter queue.
//! - `Permanent`: written straight to the dead-letter queue; never queued for
//!   retry.
//! - `Unavailable`: nothing is written. The item simply stays unprocessed in
//!   its checkpoint and is picked up on the next pass.
//!
//! Entries are keyed by `(item_id, owner_key)`; the owner key is usually the
//! sync id. The dead-letter queue is terminal. Nothing here reprocesses it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::time::Clock;
use core_runtime::config::RetryPolicyConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{FailureClass, Result, SyncError};

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub item_id: String,
    pub owner_key: String,
    pub attempt_count: u32,
    pub last_error: String,
    pub last_attempt_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub item_id: String,
    pub owner_key: String,
    pub error_message: String,
    pub attempt_count: u32,
    /// Dead-lettered on a permanent error rather than by exhausting retries
    pub permanent: bool,
    pub created_at: i64,
}

/// What [`RetryQueue::record_failure`] did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum RetryDecision {
    Queued { attempt_count: u32 },
    DeadLettered { attempt_count: u32, permanent: bool },
    /// Unavailable; left for the next pass without spending an attempt
    Deferred,
}

impl RetryDecision {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, RetryDecision::DeadLettered { .. })
    }
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait RetryQueueRepository: Send + Sync {
    async fn find_retry(&self, item_id: &str, owner_key: &str) -> Result<Option<RetryEntry>>;

    /// Insert with `attempt_count = 1` or increment an existing entry. Returns
    /// the attempt count after the write.
    async fn increment_retry(
        &self,
        item_id: &str,
        owner_key: &str,
        error: &str,
        now: i64,
    ) -> Result<u32>;

    async fn remove_retry(&self, item_id: &str, owner_key: &str) -> Result<bool>;

    async fn list_retries(&self, owner_key: &str) -> Result<Vec<RetryEntry>>;

    /// Write the dead-letter entry and drop any retry entry in one transaction.
    async fn dead_letter(&self, entry: &DeadLetterEntry) -> Result<()>;

    async fn find_dead_letter(&self, item_id: &str, owner_key: &str) -> Result<Option<DeadLetterEntry>>;

    async fn list_dead_letters(&self, owner_key: &str) -> Result<Vec<DeadLetterEntry>>;

    async fn remove_dead_letter(&self, item_id: &str, owner_key: &str) -> Result<bool>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteRetryQueueRepository {
    pool: SqlitePool,
}

impl SqliteRetryQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct RetryRow {
    item_id: String,
    owner_key: String,
    attempt_count: i64,
    last_error: String,
    last_attempt_at: i64,
    created_at: i64,
}

impl From<RetryRow> for RetryEntry {
    fn from(row: RetryRow) -> Self {
        Self {
            item_id: row.item_id,
            owner_key: row.owner_key,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            last_attempt_at: row.last_attempt_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    item_id: String,
    owner_key: String,
    error_message: String,
    attempt_count: i64,
    permanent: bool,
    created_at: i64,
}

impl From<DeadLetterRow> for DeadLetterEntry {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            item_id: row.item_id,
            owner_key: row.owner_key,
            error_message: row.error_message,
            attempt_count: row.attempt_count.max(0) as u32,
            permanent: row.permanent,
            created_at: row.created_at,
        }
    }
}

fn db_error(e: sqlx::Error) -> SyncError {
    SyncError::Database(e.to_string())
}

#[async_trait]
impl RetryQueueRepository for SqliteRetryQueueRepository {
    async fn find_retry(&self, item_id: &str, owner_key: &str) -> Result<Option<RetryEntry>> {
        let row = sqlx::query_as::<_, RetryRow>(
            r#"
            SELECT item_id, owner_key, attempt_count, last_error, last_attempt_at, created_at
            FROM retry_queue WHERE item_id = ? AND owner_key = ?
            "#,
        )
        .bind(item_id)
        .bind(owner_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(RetryEntry::from))
    }

    async fn increment_retry(
        &self,
        item_id: &str,
        owner_key: &str,
        error: &str,
        now: i64,
    ) -> Result<u32> {
        let attempts: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO retry_queue (item_id, owner_key, attempt_count, last_error, last_attempt_at, created_at)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT (item_id, owner_key) DO UPDATE SET
                attempt_count = retry_queue.attempt_count + 1,
                last_error = excluded.last_error,
                last_attempt_at = excluded.last_attempt_at
            RETURNING attempt_count
            "#,
        )
        .bind(item_id)
        .bind(owner_key)
        .bind(error)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(attempts.max(0) as u32)
    }

    async fn remove_retry(&self, item_id: &str, owner_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM retry_queue WHERE item_id = ? AND owner_key = ?")
            .bind(item_id)
            .bind(owner_key)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_retries(&self, owner_key: &str) -> Result<Vec<RetryEntry>> {
        let rows = sqlx::query_as::<_, RetryRow>(
            r#"
            SELECT item_id, owner_key, attempt_count, last_error, last_attempt_at, created_at
            FROM retry_queue WHERE owner_key = ?
            ORDER BY last_attempt_at, item_id
            "#,
        )
        .bind(owner_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(RetryEntry::from).collect())
    }

    async fn dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (item_id, owner_key, error_message, attempt_count, permanent, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (item_id, owner_key) DO UPDATE SET
                error_message = excluded.error_message,
                attempt_count = excluded.attempt_count,
                permanent = excluded.permanent
            "#,
        )
        .bind(&entry.item_id)
        .bind(&entry.owner_key)
        .bind(&entry.error_message)
        .bind(entry.attempt_count as i64)
        .bind(entry.permanent)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query("DELETE FROM retry_queue WHERE item_id = ? AND owner_key = ?")
            .bind(&entry.item_id)
            .bind(&entry.owner_key)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)
    }

    async fn find_dead_letter(&self, item_id: &str, owner_key: &str) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT item_id, owner_key, error_message, attempt_count, permanent, created_at
            FROM dead_letter_queue WHERE item_id = ? AND owner_key = ?
            "#,
        )
        .bind(item_id)
        .bind(owner_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(DeadLetterEntry::from))
    }

    async fn list_dead_letters(&self, owner_key: &str) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT item_id, owner_key, error_message, attempt_count, permanent, created_at
            FROM dead_letter_queue WHERE owner_key = ?
            ORDER BY created_at, item_id
            "#,
        )
        .bind(owner_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(DeadLetterEntry::from).collect())
    }

    async fn remove_dead_letter(&self, item_id: &str, owner_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dead_letter_queue WHERE item_id = ? AND owner_key = ?")
            .bind(item_id)
            .bind(owner_key)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Retry Queue
// ============================================================================

pub struct RetryQueue {
    repository: Arc<dyn RetryQueueRepository>,
    clock: Arc<dyn Clock>,
    config: RetryPolicyConfig,
    event_bus: Option<EventBus>,
}

impl RetryQueue {
    pub fn new(
        repository: Arc<dyn RetryQueueRepository>,
        clock: Arc<dyn Clock>,
        config: RetryPolicyConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Record one failed attempt and decide where the item goes next.
    pub async fn record_failure(
        &self,
        item_id: &str,
        owner_key: &str,
        error: &SyncError,
    ) -> Result<RetryDecision> {
        if let Some(existing) = self.repository.find_dead_letter(item_id, owner_key).await? {
            debug!(item_id, owner_key, "Item already dead-lettered");
            return Ok(RetryDecision::DeadLettered {
                attempt_count: existing.attempt_count,
                permanent: existing.permanent,
            });
        }

        let message = error.to_string();
        let now = self.clock.unix_timestamp();

        match error.classify() {
            FailureClass::Unavailable => {
                debug!(item_id, owner_key, error = %message, "Dependency unavailable, deferring item");
                Ok(RetryDecision::Deferred)
            }
            FailureClass::Permanent => {
                let attempt_count = self
                    .repository
                    .find_retry(item_id, owner_key)
                    .await?
                    .map_or(1, |entry| entry.attempt_count + 1);
                self.move_to_dead_letter(item_id, owner_key, &message, attempt_count, true, now)
                    .await?;
                Ok(RetryDecision::DeadLettered {
                    attempt_count,
                    permanent: true,
                })
            }
            FailureClass::Transient | FailureClass::Local => {
                let attempt_count = self
                    .repository
                    .increment_retry(item_id, owner_key, &message, now)
                    .await?;

                if attempt_count >= self.config.max_attempts {
                    self.move_to_dead_letter(item_id, owner_key, &message, attempt_count, false, now)
                        .await?;
                    return Ok(RetryDecision::DeadLettered {
                        attempt_count,
                        permanent: false,
                    });
                }

                debug!(item_id, owner_key, attempt_count, error = %message, "Item queued for retry");
                Ok(RetryDecision::Queued { attempt_count })
            }
        }
    }

    /// Clear the retry entry after a successful attempt.
    pub async fn record_success(&self, item_id: &str, owner_key: &str) -> Result<bool> {
        let removed = self.repository.remove_retry(item_id, owner_key).await?;
        if removed {
            debug!(item_id, owner_key, "Retried item succeeded");
        }
        Ok(removed)
    }

    async fn move_to_dead_letter(
        &self,
        item_id: &str,
        owner_key: &str,
        message: &str,
        attempt_count: u32,
        permanent: bool,
        now: i64,
    ) -> Result<()> {
        let entry = DeadLetterEntry {
            item_id: item_id.to_string(),
            owner_key: owner_key.to_string(),
            error_message: message.to_string(),
            attempt_count,
            permanent,
            created_at: now,
        };
        self.repository.dead_letter(&entry).await?;

        warn!(
            item_id,
            owner_key,
            attempt_count,
            permanent,
            error = message,
            "Item moved to dead-letter queue"
        );
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Sync(SyncEvent::ItemDeadLettered {
                item_id: item_id.to_string(),
                owner_key: owner_key.to_string(),
                reason: message.to_string(),
            }))
            .ok();
        }
        Ok(())
    }

    pub async fn get_retry(&self, item_id: &str, owner_key: &str) -> Result<Option<RetryEntry>> {
        self.repository.find_retry(item_id, owner_key).await
    }

    pub async fn pending_retries(&self, owner_key: &str) -> Result<Vec<RetryEntry>> {
        self.repository.list_retries(owner_key).await
    }

    pub async fn dead_letters(&self, owner_key: &str) -> Result<Vec<DeadLetterEntry>> {
        self.repository.list_dead_letters(owner_key).await
    }

    pub async fn is_dead_lettered(&self, item_id: &str, owner_key: &str) -> Result<bool> {
        Ok(self
            .repository
            .find_dead_letter(item_id, owner_key)
            .await?
            .is_some())
    }

    /// Drop a dead-letter entry after manual triage.
    pub async fn discard_dead_letter(&self, item_id: &str, owner_key: &str) -> Result<bool> {
        let removed = self.repository.remove_dead_letter(item_id, owner_key).await?;
        if removed {
            info!(item_id, owner_key, "Dead-letter entry discarded");
        }
        Ok(removed)
    }
}

impl fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryQueue")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use core_library::db::create_test_pool;

    async fn queue() -> RetryQueue {
        let pool = create_test_pool().await.unwrap();
        RetryQueue::new(
            Arc::new(SqliteRetryQueueRepository::new(pool)),
            Arc::new(ManualClock::starting_now()),
            RetryPolicyConfig::default(),
        )
    }

    fn transient() -> SyncError {
        SyncError::Transient("503 Service Unavailable".into())
    }

    #[tokio::test]
    async fn test_transient_failures_count_up_then_dead_letter() {
        let queue = queue().await;

        assert_eq!(
            queue.record_failure("42", "nightly", &transient()).await.unwrap(),
            RetryDecision::Queued { attempt_count: 1 }
        );
        assert_eq!(
            queue.record_failure("42", "nightly", &transient()).await.unwrap(),
            RetryDecision::Queued { attempt_count: 2 }
        );
        assert_eq!(
            queue.record_failure("42", "nightly", &transient()).await.unwrap(),
            RetryDecision::DeadLettered {
                attempt_count: 3,
                permanent: false
            }
        );

        assert!(queue.get_retry("42", "nightly").await.unwrap().is_none());
        assert!(queue.is_dead_lettered("42", "nightly").await.unwrap());
        let dlq = queue.dead_letters("nightly").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retry_queue() {
        let queue = queue().await;
        let gone = SyncError::Permanent("video removed".into());

        let decision = queue.record_failure("7", "nightly", &gone).await.unwrap();
        assert_eq!(
            decision,
            RetryDecision::DeadLettered {
                attempt_count: 1,
                permanent: true
            }
        );
        assert!(queue.pending_retries("nightly").await.unwrap().is_empty());
        assert!(queue.dead_letters("nightly").await.unwrap()[0].permanent);
    }

    #[tokio::test]
    async fn test_unavailable_is_deferred_without_writes() {
        let queue = queue().await;
        let open = SyncError::CircuitOpen {
            name: "search".into(),
            retry_after_ms: 1_000,
        };

        assert_eq!(
            queue.record_failure("7", "nightly", &open).await.unwrap(),
            RetryDecision::Deferred
        );
        assert!(queue.get_retry("7", "nightly").await.unwrap().is_none());
        assert!(!queue.is_dead_lettered("7", "nightly").await.unwrap());
    }

    #[tokio::test]
    async fn test_success_clears_retry_entry() {
        let queue = queue().await;
        queue.record_failure("7", "nightly", &transient()).await.unwrap();

        assert!(queue.record_success("7", "nightly").await.unwrap());
        assert!(!queue.record_success("7", "nightly").await.unwrap());

        // Counter starts over after a success.
        assert_eq!(
            queue.record_failure("7", "nightly", &transient()).await.unwrap(),
            RetryDecision::Queued { attempt_count: 1 }
        );
    }

    #[tokio::test]
    async fn test_owner_keys_are_isolated() {
        let queue = queue().await;
        queue.record_failure("7", "nightly", &transient()).await.unwrap();
        queue.record_failure("7", "weekly", &transient()).await.unwrap();
        queue.record_failure("7", "weekly", &transient()).await.unwrap();

        assert_eq!(queue.get_retry("7", "nightly").await.unwrap().unwrap().attempt_count, 1);
        assert_eq!(queue.get_retry("7", "weekly").await.unwrap().unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_dead_lettered_item_stays_put() {
        let queue = queue().await;
        queue
            .record_failure("7", "nightly", &SyncError::Permanent("gone".into()))
            .await
            .unwrap();

        let again = queue.record_failure("7", "nightly", &transient()).await.unwrap();
        assert!(again.is_dead_lettered());
        assert!(queue.get_retry("7", "nightly").await.unwrap().is_none());

        assert!(queue.discard_dead_letter("7", "nightly").await.unwrap());
        assert!(!queue.is_dead_lettered("7", "nightly").await.unwrap());
    }
}
