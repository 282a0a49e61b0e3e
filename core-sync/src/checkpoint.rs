//! # Checkpoint / Resume Manager
//!
//! Tracks per-item outcomes for a named batch operation so an interrupted run
//! can pick up where it stopped.
//!
//! ## Overview
//!
//! - One checkpoint per caller-chosen `sync_id`; creating a second one for the
//!   same id is an error.
//! - Item outcomes are upserted per `(checkpoint, item)`, so marking an item
//!   twice overwrites the earlier outcome.
//! - Statistics are aggregated from the item records on every call. There is no
//!   cached counter on the checkpoint row to drift after a crash.
//! - Items that are not marked `success` are still unprocessed. Failed items
//!   are picked up again on resume.
//! - Completed checkpoints past the retention window are purged together with
//!   their item records.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::time::Clock;
use core_runtime::config::CheckpointConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SyncError};

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::Database(format!("Invalid checkpoint id '{}': {}", s, e)))
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    /// Failed checkpoints can be resumed; completed ones cannot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Completed)
    }
}

impl FromStr for CheckpointStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(CheckpointStatus::InProgress),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            _ => Err(SyncError::Database(format!("Invalid checkpoint status: {}", s))),
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(ItemStatus::Success),
            "failed" => Ok(ItemStatus::Failed),
            _ => Err(SyncError::Database(format!("Invalid item status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub id: CheckpointId,
    pub sync_id: String,
    pub operation: String,
    pub status: CheckpointStatus,
    pub total_items: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Live progress, aggregated from item records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub remaining_items: u64,
    pub percent_complete: f64,
}

impl CheckpointStats {
    fn new(total_items: u64, processed_items: u64, failed_items: u64) -> Self {
        let percent_complete = if total_items == 0 {
            100.0
        } else {
            (processed_items as f64 / total_items as f64 * 100.0).min(100.0)
        };
        Self {
            total_items,
            processed_items,
            failed_items,
            remaining_items: total_items.saturating_sub(processed_items),
            percent_complete,
        }
    }
}

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// Insert a new checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CheckpointExists`] if the sync id is taken.
    async fn insert(&self, checkpoint: &SyncCheckpoint) -> Result<()>;

    async fn find_by_id(&self, id: &CheckpointId) -> Result<Option<SyncCheckpoint>>;

    async fn find_by_sync_id(&self, sync_id: &str) -> Result<Option<SyncCheckpoint>>;

    async fn update_status(
        &self,
        id: &CheckpointId,
        status: CheckpointStatus,
        updated_at: i64,
        completed_at: Option<i64>,
    ) -> Result<()>;

    /// Insert or overwrite the outcome for one item.
    async fn upsert_item(
        &self,
        id: &CheckpointId,
        item_id: &str,
        status: ItemStatus,
        error_message: Option<&str>,
        processed_at: i64,
    ) -> Result<()>;

    async fn item_status(&self, id: &CheckpointId, item_id: &str) -> Result<Option<ItemStatus>>;

    /// Returns `(succeeded, failed)` item counts.
    async fn item_counts(&self, id: &CheckpointId) -> Result<(u64, u64)>;

    async fn items_with_status(&self, id: &CheckpointId, status: ItemStatus) -> Result<Vec<String>>;

    /// Delete a checkpoint and its item records. Returns whether it existed.
    async fn delete(&self, id: &CheckpointId) -> Result<bool>;

    /// Delete completed checkpoints whose `completed_at` is before `cutoff`.
    async fn delete_completed_before(&self, cutoff: i64) -> Result<u64>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteCheckpointRepository {
    pool: SqlitePool,
}

impl SqliteCheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct CheckpointRow {
    id: String,
    sync_id: String,
    operation: String,
    status: String,
    total_items: i64,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl TryFrom<CheckpointRow> for SyncCheckpoint {
    type Error = SyncError;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        Ok(SyncCheckpoint {
            id: CheckpointId::from_string(&row.id)?,
            sync_id: row.sync_id,
            operation: row.operation,
            status: row.status.parse()?,
            total_items: row.total_items.max(0) as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

const SELECT_CHECKPOINT: &str = r#"
    SELECT id, sync_id, operation, status, total_items, created_at, updated_at, completed_at
    FROM sync_checkpoints
"#;

fn db_error(e: sqlx::Error) -> SyncError {
    SyncError::Database(e.to_string())
}

#[async_trait]
impl CheckpointRepository for SqliteCheckpointRepository {
    async fn insert(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (
                id, sync_id, operation, status, total_items,
                created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(checkpoint.id.to_string())
        .bind(&checkpoint.sync_id)
        .bind(&checkpoint.operation)
        .bind(checkpoint.status.as_str())
        .bind(checkpoint.total_items as i64)
        .bind(checkpoint.created_at)
        .bind(checkpoint.updated_at)
        .bind(checkpoint.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => SyncError::CheckpointExists {
                sync_id: checkpoint.sync_id.clone(),
            },
            _ => db_error(e),
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: &CheckpointId) -> Result<Option<SyncCheckpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(&format!("{} WHERE id = ?", SELECT_CHECKPOINT))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(SyncCheckpoint::try_from).transpose()
    }

    async fn find_by_sync_id(&self, sync_id: &str) -> Result<Option<SyncCheckpoint>> {
        let row =
            sqlx::query_as::<_, CheckpointRow>(&format!("{} WHERE sync_id = ?", SELECT_CHECKPOINT))
                .bind(sync_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(SyncCheckpoint::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: &CheckpointId,
        status: CheckpointStatus,
        updated_at: i64,
        completed_at: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sync_checkpoints SET status = ?, updated_at = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(updated_at)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(SyncError::CheckpointNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn upsert_item(
        &self,
        id: &CheckpointId,
        item_id: &str,
        status: ItemStatus,
        error_message: Option<&str>,
        processed_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_processed_items (checkpoint_id, item_id, status, error_message, processed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (checkpoint_id, item_id) DO UPDATE SET
                status = excluded.status,
                error_message = excluded.error_message,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(id.to_string())
        .bind(item_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(processed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn item_status(&self, id: &CheckpointId, item_id: &str) -> Result<Option<ItemStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM sync_processed_items WHERE checkpoint_id = ? AND item_id = ?",
        )
        .bind(id.to_string())
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        status.map(|s| s.parse()).transpose()
    }

    async fn item_counts(&self, id: &CheckpointId) -> Result<(u64, u64)> {
        let (succeeded, failed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
            FROM sync_processed_items
            WHERE checkpoint_id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok((succeeded.max(0) as u64, failed.max(0) as u64))
    }

    async fn items_with_status(&self, id: &CheckpointId, status: ItemStatus) -> Result<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT item_id FROM sync_processed_items
            WHERE checkpoint_id = ? AND status = ?
            ORDER BY processed_at, item_id
            "#,
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn delete(&self, id: &CheckpointId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_checkpoints WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_completed_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_checkpoints WHERE status = 'completed' AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct CheckpointManager {
    repository: Arc<dyn CheckpointRepository>,
    clock: Arc<dyn Clock>,
    config: CheckpointConfig,
    event_bus: Option<EventBus>,
}

impl CheckpointManager {
    pub fn new(
        repository: Arc<dyn CheckpointRepository>,
        clock: Arc<dyn Clock>,
        config: CheckpointConfig,
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

    /// Start tracking a new batch operation.
    ///
    /// # Errors
    ///
    /// [`SyncError::CheckpointExists`] if `sync_id` already has a checkpoint.
    pub async fn create(
        &self,
        sync_id: &str,
        operation: &str,
        total_items: u64,
    ) -> Result<SyncCheckpoint> {
        if self.repository.find_by_sync_id(sync_id).await?.is_some() {
            return Err(SyncError::CheckpointExists {
                sync_id: sync_id.to_string(),
            });
        }

        let now = self.clock.unix_timestamp();
        let checkpoint = SyncCheckpoint {
            id: CheckpointId::new(),
            sync_id: sync_id.to_string(),
            operation: operation.to_string(),
            status: CheckpointStatus::InProgress,
            total_items,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.repository.insert(&checkpoint).await?;

        info!(
            sync_id,
            checkpoint_id = %checkpoint.id,
            operation,
            total_items,
            "Checkpoint created"
        );
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Sync(SyncEvent::CheckpointCreated {
                sync_id: sync_id.to_string(),
                operation: operation.to_string(),
                total_items,
            }))
            .ok();
        }

        Ok(checkpoint)
    }

    pub async fn get(&self, id: &CheckpointId) -> Result<SyncCheckpoint> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::CheckpointNotFound(id.to_string()))
    }

    pub async fn get_by_sync_id(&self, sync_id: &str) -> Result<Option<SyncCheckpoint>> {
        self.repository.find_by_sync_id(sync_id).await
    }

    pub async fn mark_item_success(&self, id: &CheckpointId, item_id: &str) -> Result<()> {
        self.mark_item(id, item_id, ItemStatus::Success, None).await
    }

    pub async fn mark_item_failed(&self, id: &CheckpointId, item_id: &str, error: &str) -> Result<()> {
        self.mark_item(id, item_id, ItemStatus::Failed, Some(error))
            .await
    }

    async fn mark_item(
        &self,
        id: &CheckpointId,
        item_id: &str,
        status: ItemStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let checkpoint = self.get(id).await?;
        if checkpoint.status.is_terminal() {
            return Err(SyncError::InvalidStateTransition {
                from: checkpoint.status.to_string(),
                to: status.as_str().to_string(),
                reason: "checkpoint is already completed".to_string(),
            });
        }

        // A new item may not push the recorded outcomes past the declared total.
        if self.repository.item_status(id, item_id).await?.is_none() {
            let (succeeded, failed) = self.repository.item_counts(id).await?;
            if succeeded + failed >= checkpoint.total_items {
                return Err(SyncError::CheckpointOverflow {
                    checkpoint_id: id.to_string(),
                    total_items: checkpoint.total_items,
                });
            }
        }

        self.repository
            .upsert_item(id, item_id, status, error, self.clock.unix_timestamp())
            .await?;
        debug!(checkpoint_id = %id, item_id, status = status.as_str(), "Item outcome recorded");
        Ok(())
    }

    /// Items from `all_items` that have not been marked `success`, in input order.
    pub async fn get_unprocessed_items(
        &self,
        id: &CheckpointId,
        all_items: &[String],
    ) -> Result<Vec<String>> {
        let done: HashSet<String> = self
            .repository
            .items_with_status(id, ItemStatus::Success)
            .await?
            .into_iter()
            .collect();

        Ok(all_items
            .iter()
            .filter(|item| !done.contains(item.as_str()))
            .cloned()
            .collect())
    }

    pub async fn failed_items(&self, id: &CheckpointId) -> Result<Vec<String>> {
        self.repository
            .items_with_status(id, ItemStatus::Failed)
            .await
    }

    pub async fn stats(&self, id: &CheckpointId) -> Result<CheckpointStats> {
        let checkpoint = self.get(id).await?;
        let (succeeded, failed) = self.repository.item_counts(id).await?;
        Ok(CheckpointStats::new(checkpoint.total_items, succeeded, failed))
    }

    /// Close the checkpoint with `Completed` or `Failed`. Item records are kept.
    pub async fn complete(&self, id: &CheckpointId, status: CheckpointStatus) -> Result<SyncCheckpoint> {
        let checkpoint = self.get(id).await?;
        if status == CheckpointStatus::InProgress || checkpoint.status.is_terminal() {
            return Err(SyncError::InvalidStateTransition {
                from: checkpoint.status.to_string(),
                to: status.to_string(),
                reason: "checkpoint can only be closed once, as completed or failed".to_string(),
            });
        }

        let now = self.clock.unix_timestamp();
        let completed_at = (status == CheckpointStatus::Completed).then_some(now);
        self.repository
            .update_status(id, status, now, completed_at)
            .await?;

        info!(checkpoint_id = %id, sync_id = %checkpoint.sync_id, status = %status, "Checkpoint closed");
        self.get(id).await
    }

    /// Reopen a failed checkpoint for another pass.
    pub async fn resume(&self, id: &CheckpointId) -> Result<SyncCheckpoint> {
        let checkpoint = self.get(id).await?;
        match checkpoint.status {
            CheckpointStatus::InProgress => Ok(checkpoint),
            CheckpointStatus::Failed => {
                self.repository
                    .update_status(
                        id,
                        CheckpointStatus::InProgress,
                        self.clock.unix_timestamp(),
                        None,
                    )
                    .await?;
                info!(checkpoint_id = %id, sync_id = %checkpoint.sync_id, "Checkpoint resumed");
                self.get(id).await
            }
            CheckpointStatus::Completed => Err(SyncError::InvalidStateTransition {
                from: checkpoint.status.to_string(),
                to: CheckpointStatus::InProgress.to_string(),
                reason: "completed checkpoints cannot be resumed".to_string(),
            }),
        }
    }

    pub async fn delete(&self, id: &CheckpointId) -> Result<bool> {
        self.repository.delete(id).await
    }

    /// Purge completed checkpoints older than the retention window.
    pub async fn purge_expired(&self) -> Result<u64> {
        let retention_secs = i64::from(self.config.retention_days) * 86_400;
        let cutoff = self.clock.unix_timestamp() - retention_secs;
        let purged = self.repository.delete_completed_before(cutoff).await?;
        if purged > 0 {
            info!(purged, retention_days = self.config.retention_days, "Purged expired checkpoints");
        } else {
            debug!("No expired checkpoints to purge");
        }
        Ok(purged)
    }
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("config", &self.config)
            .finish()
    }
}

/// Convenience for callers that only have the sqlite pool.
pub fn sqlite_checkpoint_manager(
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: CheckpointConfig,
) -> CheckpointManager {
    CheckpointManager::new(Arc::new(SqliteCheckpointRepository::new(pool)), clock, config)
}
