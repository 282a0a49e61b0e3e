//! # Circuit Breaker
//!
//! Per-dependency failure guard with lazy recovery.
//!
//! ## State machine
//!
//! ```text
//!   closed ──(failure_threshold consecutive failures)──> open
//!   open ──(open_timeout elapsed since last failure)──> half_open
//!   half_open ──(success_threshold consecutive successes)──> closed
//!   half_open ──(any failure)──> open
//! ```
//!
//! The open → half_open move is evaluated lazily whenever the breaker is
//! queried or called; there is no background timer.
//!
//! While open, [`CircuitBreaker::execute`] rejects immediately with
//! [`SyncError::CircuitOpen`] and never invokes the guarded future. Rejections
//! are not failures: they do not extend the cooldown.
//!
//! ## What counts as a failure
//!
//! Only [`FailureClass::Transient`] errors move the failure counter. Permanent
//! errors (the dependency answered, the resource is just gone), local storage
//! errors and unavailability signals from inner guards leave the state
//! untouched.
//!
//! ## Metrics
//!
//! A rolling call history, pruned to `metrics_window_ms`, feeds
//! [`CircuitBreakerMetrics`]. It is reporting only. The trip decision uses the
//! consecutive counter, so an open breaker can still report a high windowed
//! success rate.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock);
//! let breaker = registry.get_or_create("video-search");
//! let response = breaker.execute(|| provider.search(query, 10)).await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use bridge_traits::time::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_runtime::config::CircuitBreakerConfig;
use core_runtime::events::{BreakerEvent, CoreEvent, EventBus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FailureClass, Result, SyncError};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Calls recorded within the metrics window
    pub window_calls: u64,
    pub window_successes: u64,
    pub window_failures: u64,
    /// `window_successes / window_calls`, or 1.0 with no calls in the window
    pub success_rate: f64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    history: VecDeque<(DateTime<Utc>, bool)>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure_at: None,
            history: VecDeque::new(),
        }
    }
}

type Transition = (CircuitState, CircuitState);

// ============================================================================
// Circuit Breaker
// ============================================================================

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    event_bus: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner::new()),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the cooldown transition if it is due.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner);
            (inner.state, transition)
        };
        self.announce(transition);
        state
    }

    /// Run `call` through the breaker.
    ///
    /// Rejected with [`SyncError::CircuitOpen`] without running `call` while
    /// the breaker is open.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        let result = call().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => match err.classify() {
                FailureClass::Transient => self.record_failure(),
                FailureClass::Permanent | FailureClass::Local => self.record_neutral(),
                FailureClass::Unavailable => {}
            },
        }
        result
    }

    /// Admission check used by [`execute`](Self::execute).
    pub fn admit(&self) -> Result<()> {
        let (admitted, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner);
            let admitted = if inner.state == CircuitState::Open {
                Err(SyncError::CircuitOpen {
                    name: self.name.clone(),
                    retry_after_ms: self.retry_after_ms(&inner),
                })
            } else {
                Ok(())
            };
            (admitted, transition)
        };
        self.announce(transition);

        if admitted.is_err() {
            debug!(breaker = %self.name, "Call rejected, circuit open");
        }
        admitted
    }

    pub fn record_success(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            self.push_history(&mut inner, now, true);

            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.consecutive_failures = 0;
                        inner.half_open_successes = 0;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                // A call admitted before the breaker opened finished late.
                CircuitState::Open => None,
            }
        };
        self.announce(transition);
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.lock();
            self.push_history(&mut inner, now, false);
            inner.last_failure_at = Some(now);

            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_failures += 1;
                    inner.half_open_successes = 0;
                    inner.state = CircuitState::Open;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => {
                    inner.consecutive_failures += 1;
                    None
                }
            }
        };
        self.announce(transition);
    }

    /// Record a call that failed for reasons unrelated to dependency health.
    fn record_neutral(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.push_history(&mut inner, now, false);
    }

    /// Force the breaker closed and clear all counters and history.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let previous = inner.state;
            *inner = BreakerInner::new();
            (previous != CircuitState::Closed).then_some((previous, CircuitState::Closed))
        };
        info!(breaker = %self.name, "Circuit breaker reset");
        self.announce(transition);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = self.clock.now();
        let (metrics, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner);
            self.prune(&mut inner, now);

            let window_calls = inner.history.len() as u64;
            let window_successes = inner.history.iter().filter(|(_, ok)| *ok).count() as u64;
            let success_rate = if window_calls == 0 {
                1.0
            } else {
                window_successes as f64 / window_calls as f64
            };

            let metrics = CircuitBreakerMetrics {
                name: self.name.clone(),
                state: inner.state,
                consecutive_failures: inner.consecutive_failures,
                half_open_successes: inner.half_open_successes,
                last_failure_at: inner.last_failure_at,
                window_calls,
                window_successes,
                window_failures: window_calls - window_successes,
                success_rate,
            };
            (metrics, transition)
        };
        self.announce(transition);
        metrics
    }

    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_timeout(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.config.open_timeout_ms as i64)
    }

    fn refresh(&self, inner: &mut BreakerInner) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let cooled = match inner.last_failure_at {
            Some(at) => self.clock.now() - at >= self.open_timeout(),
            None => true,
        };
        if cooled {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            Some((CircuitState::Open, CircuitState::HalfOpen))
        } else {
            None
        }
    }

    fn retry_after_ms(&self, inner: &BreakerInner) -> u64 {
        inner
            .last_failure_at
            .map(|at| {
                let remaining = self.open_timeout() - (self.clock.now() - at);
                remaining.num_milliseconds().max(0) as u64
            })
            .unwrap_or(0)
    }

    fn push_history(&self, inner: &mut BreakerInner, now: DateTime<Utc>, ok: bool) {
        inner.history.push_back((now, ok));
        self.prune(inner, now);
    }

    fn prune(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::milliseconds(self.config.metrics_window_ms as i64);
        while inner.history.front().is_some_and(|(at, _)| *at < cutoff) {
            inner.history.pop_front();
        }
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, "Circuit opened"),
            CircuitState::HalfOpen => info!(breaker = %self.name, "Circuit half-open, probing"),
            CircuitState::Closed => info!(breaker = %self.name, %from, "Circuit closed"),
        }

        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Breaker(BreakerEvent::StateChanged {
                name: self.name.clone(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }))
            .ok();
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.lock().state)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Get-or-create store of breakers keyed by dependency name.
///
/// Constructed explicitly and passed to whoever needs it; independent
/// dependencies get independent failure budgets.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    event_bus: Option<EventBus>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_config,
            clock,
            event_bus: None,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Like [`get_or_create`](Self::get_or_create) with a per-breaker config.
    /// The config is ignored when the breaker already exists.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = %name, "Creating circuit breaker");
            let mut breaker = CircuitBreaker::new(name, config, Arc::clone(&self.clock));
            if let Some(bus) = &self.event_bus {
                breaker = breaker.with_event_bus(bus.clone());
            }
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.get(name).cloned()
    }

    /// Metrics for every breaker, sorted by name.
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        let mut metrics: Vec<_> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        for breaker in breakers {
            breaker.reset();
        }
    }
}
