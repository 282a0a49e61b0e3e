//! # Batch Processor
//!
//! Drives one named batch run: checkpoint bookkeeping, bounded parallel
//! execution and retry/dead-letter routing around a caller-supplied
//! [`ItemProcessor`].
//!
//! ## Flow
//!
//! 1. Drop repeated item ids, keeping the first occurrence.
//! 2. Get or create the checkpoint for `sync_id`. A failed checkpoint is
//!    reopened unless the run brings more items than it was created with; a
//!    completed one is rejected.
//! 3. Skip items already marked successful and items in the dead-letter queue.
//! 4. Submit the rest to a fresh [`TaskScheduler`].
//! 5. Record each outcome as it settles: success clears the retry entry,
//!    failure is marked on the checkpoint and routed through the [`RetryQueue`].
//!    A success the checkpoint refuses to record counts as a failure.
//! 6. Close the checkpoint: `Completed` when every failed item has been
//!    dead-lettered and every success was recorded, otherwise `Failed` so the
//!    next run resumes it.
//!
//! A single item never aborts the batch. Bookkeeping errors are logged and the
//! run carries on.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use core_runtime::config::SchedulerConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::checkpoint::{CheckpointId, CheckpointManager, CheckpointStatus, SyncCheckpoint};
use crate::error::{Result, SyncError};
use crate::retry_queue::RetryQueue;
use crate::scheduler::{Priority, TaskHandle, TaskOptions, TaskOutcome, TaskScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Done,
    /// Nothing to do for this item; still counts as processed
    Skipped,
}

/// Work performed for one item of a batch.
#[async_trait]
pub trait ItemProcessor: Send + Sync + 'static {
    async fn process(&self, item_id: &str) -> Result<ItemOutcome>;

    fn priority(&self, _item_id: &str) -> Priority {
        Priority::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub sync_id: String,
    pub checkpoint_id: CheckpointId,
    pub status: CheckpointStatus,
    pub total: u64,
    /// Marked successful by an earlier run
    pub already_processed: u64,
    pub succeeded: u64,
    pub skipped: u64,
    /// Failed this run and left for a later run
    pub failed: u64,
    /// Moved to the dead-letter queue this run, or skipped because already there
    pub dead_lettered: u64,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.status == CheckpointStatus::Completed
    }
}

pub struct BatchProcessor {
    checkpoints: Arc<CheckpointManager>,
    retry_queue: Arc<RetryQueue>,
    scheduler_config: SchedulerConfig,
    event_bus: Option<EventBus>,
}

impl BatchProcessor {
    pub fn new(
        checkpoints: Arc<CheckpointManager>,
        retry_queue: Arc<RetryQueue>,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            checkpoints,
            retry_queue,
            scheduler_config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    /// Run (or resume) the batch identified by `sync_id`.
    #[instrument(skip(self, items, processor), fields(total = items.len()))]
    pub async fn run(
        &self,
        sync_id: &str,
        operation: &str,
        items: &[String],
        processor: Arc<dyn ItemProcessor>,
    ) -> Result<BatchReport> {
        let items = unique_items(items);
        let checkpoint = self.open_checkpoint(sync_id, operation, items.len() as u64).await?;
        let unprocessed = self
            .checkpoints
            .get_unprocessed_items(&checkpoint.id, &items)
            .await?;

        let mut report = BatchReport {
            sync_id: sync_id.to_string(),
            checkpoint_id: checkpoint.id,
            status: checkpoint.status,
            total: items.len() as u64,
            already_processed: (items.len() - unprocessed.len()) as u64,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            dead_lettered: 0,
        };

        let mut pending = Vec::with_capacity(unprocessed.len());
        for item_id in unprocessed {
            if self.retry_queue.is_dead_lettered(&item_id, sync_id).await? {
                report.dead_lettered += 1;
            } else {
                pending.push(item_id);
            }
        }

        info!(
            sync_id,
            checkpoint_id = %checkpoint.id,
            pending = pending.len(),
            already_processed = report.already_processed,
            "Starting batch"
        );

        let scheduler: TaskScheduler<ItemOutcome> = TaskScheduler::new(self.scheduler_config.clone());
        let mut in_flight = FuturesUnordered::new();
        for item_id in pending {
            let handle = submit_item(&scheduler, &processor, &item_id).await?;
            in_flight.push(async move { (item_id, handle.join().await) });
        }

        let mut unrecorded = 0u64;
        while let Some((item_id, outcome)) = in_flight.next().await {
            if !self
                .record_outcome(&checkpoint.id, sync_id, &item_id, outcome, &mut report)
                .await
            {
                unrecorded += 1;
            }
        }
        scheduler.await_all().await;

        report.status = self
            .close_checkpoint(&checkpoint.id, sync_id, unrecorded)
            .await?;

        info!(
            sync_id,
            status = %report.status,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "Batch finished"
        );
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Sync(SyncEvent::BatchCompleted {
                sync_id: sync_id.to_string(),
                succeeded: report.succeeded,
                skipped: report.skipped,
                failed: report.failed,
                dead_lettered: report.dead_lettered,
            }))
            .ok();
        }

        Ok(report)
    }

    async fn open_checkpoint(
        &self,
        sync_id: &str,
        operation: &str,
        total_items: u64,
    ) -> Result<SyncCheckpoint> {
        match self.checkpoints.get_by_sync_id(sync_id).await? {
            None => self.checkpoints.create(sync_id, operation, total_items).await,
            Some(existing) if existing.status.is_terminal() => Err(SyncError::CheckpointExists {
                sync_id: sync_id.to_string(),
            }),
            Some(existing) if total_items > existing.total_items => {
                Err(SyncError::CheckpointOverflow {
                    checkpoint_id: existing.id.to_string(),
                    total_items: existing.total_items,
                })
            }
            Some(existing) => {
                info!(sync_id, checkpoint_id = %existing.id, "Resuming checkpoint");
                self.checkpoints.resume(&existing.id).await
            }
        }
    }

    async fn record_outcome(
        &self,
        checkpoint_id: &CheckpointId,
        sync_id: &str,
        item_id: &str,
        outcome: TaskOutcome<ItemOutcome>,
        report: &mut BatchReport,
    ) -> bool {
        let (error, attempts) = match outcome {
            TaskOutcome::Succeeded { value, .. } => {
                if let Err(e) = self.checkpoints.mark_item_success(checkpoint_id, item_id).await {
                    warn!(sync_id, item_id, error = %e, "Failed to mark item successful");
                    report.failed += 1;
                    return false;
                }
                match value {
                    ItemOutcome::Done => report.succeeded += 1,
                    ItemOutcome::Skipped => report.skipped += 1,
                }
                if let Err(e) = self.retry_queue.record_success(item_id, sync_id).await {
                    warn!(sync_id, item_id, error = %e, "Failed to clear retry entry");
                }
                return true;
            }
            TaskOutcome::Failed { error, attempts } => (error, attempts),
            TaskOutcome::Cancelled => (SyncError::Cancelled, 0),
        };

        let message = error.to_string();
        if let Err(e) = self
            .checkpoints
            .mark_item_failed(checkpoint_id, item_id, &message)
            .await
        {
            warn!(sync_id, item_id, error = %e, "Failed to mark item failed");
        }

        match self.retry_queue.record_failure(item_id, sync_id, &error).await {
            Ok(decision) if decision.is_dead_lettered() => report.dead_lettered += 1,
            Ok(_) => report.failed += 1,
            Err(e) => {
                warn!(sync_id, item_id, error = %e, "Failed to record retry");
                report.failed += 1;
            }
        }

        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Sync(SyncEvent::ItemFailed {
                sync_id: sync_id.to_string(),
                item_id: item_id.to_string(),
                message,
                attempts,
            }))
            .ok();
        }
        true
    }

    /// Completed when every failed item is already dead-lettered and no
    /// success went unrecorded.
    async fn close_checkpoint(
        &self,
        id: &CheckpointId,
        sync_id: &str,
        unrecorded: u64,
    ) -> Result<CheckpointStatus> {
        let mut retryable = unrecorded;
        for item_id in self.checkpoints.failed_items(id).await? {
            if !self.retry_queue.is_dead_lettered(&item_id, sync_id).await? {
                retryable += 1;
            }
        }

        let status = if retryable == 0 {
            CheckpointStatus::Completed
        } else {
            CheckpointStatus::Failed
        };
        self.checkpoints.complete(id, status).await?;
        Ok(status)
    }
}

fn unique_items(items: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

async fn submit_item(
    scheduler: &TaskScheduler<ItemOutcome>,
    processor: &Arc<dyn ItemProcessor>,
    item_id: &str,
) -> Result<TaskHandle<ItemOutcome>> {
    let options = TaskOptions::default()
        .with_priority(processor.priority(item_id))
        .with_label(item_id);
    let factory = {
        let processor = Arc::clone(processor);
        let item_id = item_id.to_string();
        move || {
            let processor = Arc::clone(&processor);
            let item_id = item_id.clone();
            async move { processor.process(&item_id).await }
        }
    };

    match scheduler.submit(options.clone(), factory.clone()) {
        Err(SyncError::QueueFull { .. }) => {
            // Drain the queue once, then try again.
            scheduler.await_all().await;
            scheduler.submit(options, factory)
        }
        other => other,
    }
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("scheduler_config", &self.scheduler_config)
            .finish()
    }
}
