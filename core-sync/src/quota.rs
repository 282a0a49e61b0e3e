//! # Quota Tracker
//!
//! Reactive view of the upstream's remaining call budget.
//!
//! The tracker only knows what the upstream last reported; it never predicts
//! consumption between reports. A report older than `stale_after_secs` is
//! treated as unknown, and unknown quota never blocks a call.
//!
//! The reported reset time is honoured: once it has passed, an exhausted
//! budget is no longer considered exceeded even before the next report.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bridge_traits::search::QuotaReport;
use bridge_traits::time::Clock;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use core_runtime::config::QuotaConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Last reported quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub remaining: i64,
    pub reset_at: Option<DateTime<Utc>>,
    pub max_quota: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

pub struct QuotaTracker {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<QuotaState>>,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(None),
        }
    }

    /// Record a quota report. `reset_raw` is RFC 3339 or Unix time (seconds
    /// or milliseconds); an unparseable value is stored as unknown.
    pub fn update(&self, remaining: i64, reset_raw: &str, max_quota: Option<i64>) {
        let reset_at = parse_reset_time(reset_raw);
        if reset_at.is_none() && !reset_raw.trim().is_empty() {
            warn!(reset = %reset_raw, "Unrecognised quota reset timestamp");
        }

        let state = QuotaState {
            remaining,
            reset_at,
            max_quota,
            last_updated: self.clock.now(),
        };

        if remaining <= self.config.warn_threshold {
            warn!(remaining, reset_at = ?state.reset_at, "Upstream quota running low");
        } else {
            debug!(remaining, "Quota updated");
        }

        *self.lock() = Some(state);
    }

    pub fn update_from_report(&self, report: &QuotaReport) {
        self.update(report.remaining, &report.reset_at, report.max_quota);
    }

    /// Latest state, or `None` when nothing was reported or it went stale.
    pub fn snapshot(&self) -> Option<QuotaState> {
        let state = self.lock().clone()?;
        (!self.is_state_stale(&state)).then_some(state)
    }

    pub fn is_stale(&self) -> bool {
        match self.lock().as_ref() {
            Some(state) => self.is_state_stale(state),
            None => true,
        }
    }

    /// Remaining budget at or below the warn threshold.
    pub fn is_approaching_limit(&self) -> bool {
        self.snapshot()
            .is_some_and(|s| s.remaining <= self.config.warn_threshold)
    }

    /// Budget spent and the reported reset has not happened yet.
    pub fn is_limit_exceeded(&self) -> bool {
        let now = self.clock.now();
        self.snapshot().is_some_and(|s| {
            s.remaining <= 0 && s.reset_at.map_or(true, |reset| now < reset)
        })
    }

    /// Time left until the reported reset, when known and in the future.
    pub fn time_until_reset(&self) -> Option<Duration> {
        let reset = self.snapshot()?.reset_at?;
        (reset - self.clock.now()).to_std().ok()
    }

    /// Fail fast with [`SyncError::QuotaExceeded`] while the budget is spent.
    pub fn check_available(&self) -> Result<()> {
        if self.is_limit_exceeded() {
            return Err(SyncError::QuotaExceeded {
                resets_in_secs: self.time_until_reset().map(|d| d.as_secs()),
            });
        }
        Ok(())
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn is_state_stale(&self, state: &QuotaState) -> bool {
        let max_age = ChronoDuration::seconds(self.config.stale_after_secs as i64);
        self.clock.now() - state.last_updated > max_age
    }

    fn lock(&self) -> MutexGuard<'_, Option<QuotaState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Values above this are taken as milliseconds since the epoch.
const MILLIS_CUTOFF: i64 = 100_000_000_000;

pub fn parse_reset_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(number) = raw.parse::<i64>() {
        return if number > MILLIS_CUTOFF {
            Utc.timestamp_millis_opt(number).single()
        } else {
            Utc.timestamp_opt(number, 0).single()
        };
    }

    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
