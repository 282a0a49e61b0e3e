//! # Concurrency Scheduler
//!
//! Bounded-parallelism task runner with priority dispatch, per-task retry and
//! per-attempt timeout.
//!
//! ## Overview
//!
//! - `submit` returns a [`TaskHandle`] immediately; the task runs when a worker
//!   slot frees up.
//! - Before every dispatch the pending queue is ordered by descending
//!   [`Priority`], FIFO within a tier, so re-prioritising a queued task takes
//!   effect at the next dispatch.
//! - Each attempt races the task future against its timeout. Whichever
//!   finishes first decides the attempt; the loser is dropped.
//! - Failed attempts with a transient error are retried after
//!   `base_backoff_ms * 2^(attempt - 1)`, up to the task's retry count.
//! - Settlement happens once per task: statistics are updated under the same
//!   lock that frees the worker slot, then the outcome is sent to the handle.
//! - [`TaskScheduler::await_all`] waits on a completion signal, not a poll.
//!
//! Tasks are factories (`Fn() -> Future`) so a retry can build a fresh future.
//! Cancellation only reaches tasks that have not started.
//!
//! ## Usage
//!
//! ```ignore
//! let scheduler = TaskScheduler::new(SchedulerConfig::default());
//! let handle = scheduler.submit(TaskOptions::default().with_priority(Priority::High), move || {
//!     let resolver = resolver.clone();
//!     async move { resolver.resolve_one(&track).await }
//! })?;
//! scheduler.await_all().await;
//! let outcome = handle.join().await;
//! ```

use std::cmp::Reverse;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use core_runtime::config::SchedulerConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

// ============================================================================
// Types
// ============================================================================

/// Dispatch priority; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            _ => Err(SyncError::Config(format!("Invalid priority: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Per-task overrides. Unset values fall back to the scheduler config.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub priority: Priority,
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub label: Option<String>,
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: SyncError, attempts: u32 },
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            TaskOutcome::Succeeded { attempts, .. } | TaskOutcome::Failed { attempts, .. } => {
                *attempts
            }
            TaskOutcome::Cancelled => 0,
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            TaskOutcome::Succeeded { value, .. } => Ok(value),
            TaskOutcome::Failed { error, .. } => Err(error),
            TaskOutcome::Cancelled => Err(SyncError::Cancelled),
        }
    }
}

/// Receives the outcome of one submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: TaskId,
    receiver: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to settle.
    pub async fn join(self) -> TaskOutcome<T> {
        self.receiver.await.unwrap_or(TaskOutcome::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active: usize,
    pub queued: usize,
    /// Mean wall time of settled (completed or failed) tasks, retries included
    pub average_duration_ms: f64,
}

// ============================================================================
// Internals
// ============================================================================

type TaskFactory<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct PendingTask<T> {
    id: TaskId,
    priority: Priority,
    retries: u32,
    timeout: Duration,
    label: Option<String>,
    factory: TaskFactory<T>,
    sender: oneshot::Sender<TaskOutcome<T>>,
}

struct SchedulerState<T> {
    pending: Vec<PendingTask<T>>,
    active: usize,
    next_id: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_duration_ms: f64,
}

impl<T> SchedulerState<T> {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active == 0
    }
}

struct Shared<T> {
    config: SchedulerConfig,
    state: Mutex<SchedulerState<T>>,
    idle: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, SchedulerState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Cloneable handle to a shared task queue. Must be used inside a Tokio runtime.
pub struct TaskScheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> TaskScheduler<T> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SchedulerState {
                    pending: Vec::new(),
                    active: 0,
                    next_id: 1,
                    completed: 0,
                    failed: 0,
                    cancelled: 0,
                    total_duration_ms: 0.0,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Queue a task. Fails with [`SyncError::QueueFull`] when `max_queued`
    /// pending tasks are already waiting.
    pub fn submit<F, Fut>(&self, options: TaskOptions, factory: F) -> Result<TaskHandle<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let config = &self.shared.config;
        let (sender, receiver) = oneshot::channel();

        let id = {
            let mut state = self.shared.lock();
            if let Some(capacity) = config.max_queued {
                if state.pending.len() >= capacity {
                    return Err(SyncError::QueueFull { capacity });
                }
            }

            let id = TaskId(state.next_id);
            state.next_id += 1;
            state.pending.push(PendingTask {
                id,
                priority: options.priority,
                retries: options.retries.unwrap_or(config.default_retries),
                timeout: options.timeout.unwrap_or_else(|| config.default_timeout()),
                label: options.label,
                factory: Arc::new(move || factory().boxed()),
                sender,
            });
            id
        };

        debug!(task = %id, priority = ?options.priority, "Task submitted");
        Self::pump(&self.shared);
        Ok(TaskHandle { id, receiver })
    }

    /// Remove a task that has not started. Returns `false` if it is running,
    /// finished or unknown.
    pub fn cancel(&self, id: TaskId) -> bool {
        let removed = {
            let mut state = self.shared.lock();
            let Some(index) = state.pending.iter().position(|t| t.id == id) else {
                return false;
            };
            let task = state.pending.remove(index);
            state.cancelled += 1;
            (task, state.is_idle())
        };

        let (task, idle) = removed;
        let _ = task.sender.send(TaskOutcome::Cancelled);
        debug!(task = %id, "Task cancelled before start");
        if idle {
            self.shared.idle.notify_waiters();
        }
        true
    }

    /// Change the priority of a queued task. Returns `false` if it already
    /// started or is unknown.
    pub fn set_priority(&self, id: TaskId, priority: Priority) -> bool {
        let mut state = self.shared.lock();
        match state.pending.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                task.priority = priority;
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        let settled = state.completed + state.failed;
        SchedulerStats {
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            active: state.active,
            queued: state.pending.len(),
            average_duration_ms: if settled == 0 {
                0.0
            } else {
                state.total_duration_ms / settled as f64
            },
        }
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    /// Resolve once nothing is queued or running.
    pub async fn await_all(&self) {
        loop {
            // Registered before the check so a settlement in between is not missed.
            let notified = self.shared.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn pump(shared: &Arc<Shared<T>>) {
        loop {
            let task = {
                let mut state = shared.lock();
                if state.active >= shared.config.max_concurrent || state.pending.is_empty() {
                    return;
                }
                state
                    .pending
                    .sort_by_key(|t| (Reverse(t.priority), t.id));
                state.active += 1;
                state.pending.remove(0)
            };

            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                Self::run(shared, task).await;
            });
        }
    }

    async fn run(shared: Arc<Shared<T>>, task: PendingTask<T>) {
        let started = Instant::now();
        let max_attempts = task.retries + 1;
        let label = task.label.as_deref().unwrap_or("");
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            // Building the future can panic as well as polling it.
            let future = match std::panic::catch_unwind(AssertUnwindSafe(|| (task.factory)())) {
                Ok(future) => AssertUnwindSafe(future).catch_unwind(),
                Err(_panic) => {
                    warn!(task = %task.id, label, attempts = attempt, "Task factory panicked");
                    break TaskOutcome::Failed {
                        error: SyncError::Permanent("task panicked".to_string()),
                        attempts: attempt,
                    };
                }
            };
            let error = match tokio::time::timeout(task.timeout, future).await {
                Ok(Ok(Ok(value))) => {
                    break TaskOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    }
                }
                Ok(Ok(Err(error))) => error,
                Ok(Err(_panic)) => SyncError::Permanent("task panicked".to_string()),
                Err(_elapsed) => SyncError::Timeout(task.timeout.as_millis() as u64),
            };

            if attempt < max_attempts && error.is_retryable() {
                let delay = backoff_delay(shared.config.base_backoff_ms, attempt);
                debug!(
                    task = %task.id,
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(task = %task.id, label, attempts = attempt, error = %error, "Task failed");
            break TaskOutcome::Failed {
                error,
                attempts: attempt,
            };
        };

        let idle = {
            let mut state = shared.lock();
            state.active -= 1;
            match outcome {
                TaskOutcome::Succeeded { .. } => state.completed += 1,
                TaskOutcome::Failed { .. } => state.failed += 1,
                TaskOutcome::Cancelled => state.cancelled += 1,
            }
            state.total_duration_ms += started.elapsed().as_secs_f64() * 1_000.0;
            state.is_idle()
        };

        let _ = task.sender.send(outcome);
        Self::pump(&shared);
        if idle {
            shared.idle.notify_waiters();
        }
    }
}

impl<T> fmt::Debug for TaskScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TaskScheduler")
            .field("max_concurrent", &self.shared.config.max_concurrent)
            .field("active", &state.active)
            .field("queued", &state.pending.len())
            .finish()
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_concurrent(max_concurrent)
            .with_base_backoff_ms(1)
            .with_default_timeout_ms(5_000)
    }

    /// Occupies the only worker slot until the returned gate is opened.
    fn occupy(scheduler: &TaskScheduler<&'static str>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        scheduler
            .submit(TaskOptions::default().with_priority(Priority::High), move || {
                let g = Arc::clone(&g);
                async move {
                    g.notified().await;
                    Ok("blocker")
                }
            })
            .unwrap();
        gate
    }

    fn record(
        scheduler: &TaskScheduler<&'static str>,
        order: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        priority: Priority,
    ) -> TaskHandle<&'static str> {
        let order = Arc::clone(order);
        scheduler
            .submit(TaskOptions::default().with_priority(priority), move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(name);
                    Ok(name)
                }
            })
            .unwrap()
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(1_000, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1_000, 2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(1_000, 3), Duration::from_millis(4_000));
    }

    #[test]
    fn test_priority_conversion() {
        assert_eq!(Priority::from_i32(2).unwrap(), Priority::High);
        assert!(Priority::from_i32(9).is_err());
        assert!(Priority::High > Priority::Normal);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let scheduler: TaskScheduler<usize> = TaskScheduler::new(config(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                scheduler
                    .submit(TaskOptions::default(), move || {
                        let running = Arc::clone(&running);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(15)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        }
                    })
                    .unwrap()
            })
            .collect();

        scheduler.await_all().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);

        let stats = scheduler.stats();
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
        assert!(stats.average_duration_ms > 0.0);

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().await.into_result().unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let scheduler = TaskScheduler::new(config(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = occupy(&scheduler);

        record(&scheduler, &order, "low", Priority::Low);
        record(&scheduler, &order, "normal-1", Priority::Normal);
        record(&scheduler, &order, "high", Priority::High);
        record(&scheduler, &order, "normal-2", Priority::Normal);

        gate.notify_one();
        scheduler.await_all().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["high", "normal-1", "normal-2", "low"]
        );
    }

    #[tokio::test]
    async fn test_set_priority_applies_at_next_dispatch() {
        let scheduler = TaskScheduler::new(config(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = occupy(&scheduler);

        record(&scheduler, &order, "first", Priority::Low);
        let late = record(&scheduler, &order, "second", Priority::Low);
        assert!(scheduler.set_priority(late.id(), Priority::High));

        gate.notify_one();
        scheduler.await_all().await;

        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
        assert!(!scheduler.set_priority(late.id(), Priority::Low));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let scheduler: TaskScheduler<u32> = TaskScheduler::new(config(1));
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let handle = scheduler
            .submit(TaskOptions::default().with_retries(2), move || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(SyncError::Transient(format!("attempt {}", n)))
                    } else {
                        Ok(n)
                    }
                }
            })
            .unwrap();

        assert_eq!(
            handle.join().await,
            TaskOutcome::Succeeded {
                value: 3,
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_last_error() {
        let scheduler: TaskScheduler<()> = TaskScheduler::new(config(1));
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let handle = scheduler
            .submit(TaskOptions::default(), move || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err::<(), _>(SyncError::Transient(format!("attempt {}", n)))
                }
            })
            .unwrap();

        match handle.join().await {
            TaskOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 3);
                assert_eq!(error, SyncError::Transient("attempt 3".into()));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(scheduler.stats().failed, 1);
        assert_eq!(scheduler.stats().completed, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let scheduler: TaskScheduler<()> = TaskScheduler::new(config(1));
        let handle = scheduler
            .submit(TaskOptions::default().with_retries(5), || async {
                Err::<(), _>(SyncError::Permanent("not found".into()))
            })
            .unwrap();

        assert_eq!(handle.join().await.attempts(), 1);
    }

    #[tokio::test]
    async fn test_timeout_settles_once() {
        let scheduler: TaskScheduler<()> = TaskScheduler::new(config(1));
        let handle = scheduler
            .submit(
                TaskOptions::default()
                    .with_retries(0)
                    .with_timeout(Duration::from_millis(20)),
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
            )
            .unwrap();

        match handle.join().await {
            TaskOutcome::Failed { error, attempts } => {
                assert_eq!(error, SyncError::Timeout(20));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_fails_and_frees_slot() {
        let scheduler: TaskScheduler<()> = TaskScheduler::new(config(1));
        let broken = true;
        let handle = scheduler
            .submit(TaskOptions::default().with_retries(3), move || async move {
                assert!(!broken, "decoder blew up");
                Ok(())
            })
            .unwrap();

        match handle.join().await {
            TaskOutcome::Failed { error, attempts } => {
                assert_eq!(error, SyncError::Permanent("task panicked".into()));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        scheduler.await_all().await;
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_panicking_factory_fails_and_frees_slot() {
        let scheduler: TaskScheduler<()> = TaskScheduler::new(config(1));
        let broken = true;
        let handle = scheduler
            .submit(TaskOptions::default().with_retries(3), move || {
                assert!(!broken, "cannot build request");
                async { Ok(()) }
            })
            .unwrap();
        let after = scheduler
            .submit(TaskOptions::default(), || async { Ok(()) })
            .unwrap();

        match handle.join().await {
            TaskOutcome::Failed { error, attempts } => {
                assert_eq!(error, SyncError::Permanent("task panicked".into()));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(after.join().await.is_success());

        tokio::time::timeout(Duration::from_secs(2), scheduler.await_all())
            .await
            .expect("scheduler drains after a factory panic");
        let stats = scheduler.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let scheduler = TaskScheduler::new(config(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = occupy(&scheduler);

        let doomed = record(&scheduler, &order, "doomed", Priority::Normal);
        let id = doomed.id();
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(doomed.join().await, TaskOutcome::Cancelled);

        gate.notify_one();
        scheduler.await_all().await;

        assert!(order.lock().unwrap().is_empty());
        let stats = scheduler.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_overflow() {
        let scheduler = TaskScheduler::new(config(1).with_max_queued(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = occupy(&scheduler);

        record(&scheduler, &order, "queued", Priority::Normal);
        let overflow = scheduler.submit(TaskOptions::default(), || async { Ok("overflow") });
        assert!(matches!(overflow, Err(SyncError::QueueFull { capacity: 1 })));

        gate.notify_one();
        scheduler.await_all().await;
        assert_eq!(*order.lock().unwrap(), vec!["queued"]);
    }

    #[tokio::test]
    async fn test_await_all_on_idle_scheduler_returns() {
        let scheduler: TaskScheduler<()> = TaskScheduler::new(config(1));
        scheduler.await_all().await;
        assert!(scheduler.is_idle());
    }
}
