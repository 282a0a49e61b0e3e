use bridge_traits::BridgeError;
use core_library::LibraryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure should be routed by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retryable; counts against the breaker and the retry cap
    Transient,
    /// Will not succeed on retry; goes straight to the dead-letter queue
    Permanent,
    /// Dependency is temporarily refusing calls (circuit open, quota spent);
    /// try again on a later pass without spending a retry attempt
    Unavailable,
    /// Our own storage failed; retryable, but says nothing about the upstream
    Local,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
            FailureClass::Unavailable => "unavailable",
            FailureClass::Local => "local",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Circuit '{name}' is open; retry in {retry_after_ms}ms")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    #[error("Upstream quota exhausted (resets in {resets_in_secs:?}s)")]
    QuotaExceeded { resets_in_secs: Option<u64> },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Checkpoint already exists for sync id {sync_id}")]
    CheckpointExists { sync_id: String },

    #[error("Checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("Checkpoint {checkpoint_id} already accounts for all {total_items} items")]
    CheckpointOverflow {
        checkpoint_id: String,
        total_items: u64,
    },

    #[error("Scheduler queue is full ({capacity} pending tasks)")]
    QueueFull { capacity: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn classify(&self) -> FailureClass {
        match self {
            SyncError::Transient(_) | SyncError::Timeout(_) => FailureClass::Transient,
            SyncError::Database(_) => FailureClass::Local,
            SyncError::CircuitOpen { .. }
            | SyncError::QuotaExceeded { .. }
            | SyncError::QueueFull { .. }
            | SyncError::Cancelled => FailureClass::Unavailable,
            SyncError::Permanent(_)
            | SyncError::InvalidStateTransition { .. }
            | SyncError::CheckpointExists { .. }
            | SyncError::CheckpointNotFound(_)
            | SyncError::CheckpointOverflow { .. }
            | SyncError::Config(_) => FailureClass::Permanent,
        }
    }

    /// Whether the scheduler should retry the task within the current run.
    pub fn is_retryable(&self) -> bool {
        matches!(self.classify(), FailureClass::Transient | FailureClass::Local)
    }

    /// Rejections produced by the guards themselves rather than the upstream.
    pub fn is_unavailable(&self) -> bool {
        self.classify() == FailureClass::Unavailable
    }
}

impl From<BridgeError> for SyncError {
    fn from(err: BridgeError) -> Self {
        if err.is_permanent() {
            SyncError::Permanent(err.to_string())
        } else {
            SyncError::Transient(err.to_string())
        }
    }
}

impl From<LibraryError> for SyncError {
    fn from(err: LibraryError) -> Self {
        match err {
            LibraryError::InvalidStateTransition { from, to } => {
                SyncError::InvalidStateTransition {
                    from,
                    to,
                    reason: "record is no longer pending".to_string(),
                }
            }
            other => SyncError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            SyncError::Transient("503".into()).classify(),
            FailureClass::Transient
        );
        assert_eq!(SyncError::Timeout(100).classify(), FailureClass::Transient);
        assert_eq!(
            SyncError::Permanent("gone".into()).classify(),
            FailureClass::Permanent
        );
        assert_eq!(
            SyncError::CircuitOpen {
                name: "search".into(),
                retry_after_ms: 10
            }
            .classify(),
            FailureClass::Unavailable
        );
        assert_eq!(
            SyncError::QuotaExceeded {
                resets_in_secs: None
            }
            .classify(),
            FailureClass::Unavailable
        );
    }

    #[test]
    fn test_storage_errors_are_local_but_retryable() {
        let err = SyncError::Database("database is locked".into());
        assert_eq!(err.classify(), FailureClass::Local);
        assert!(err.is_retryable());
        assert!(!err.is_unavailable());

        let from_library: SyncError = LibraryError::NotFound {
            entity_type: "checkpoint".into(),
            id: "cp-1".into(),
        }
        .into();
        assert_eq!(from_library.classify(), FailureClass::Local);
    }

    #[test]
    fn test_only_transient_errors_retry_in_run() {
        assert!(SyncError::Transient("reset".into()).is_retryable());
        assert!(!SyncError::Permanent("gone".into()).is_retryable());
        assert!(!SyncError::CircuitOpen {
            name: "search".into(),
            retry_after_ms: 0
        }
        .is_retryable());
    }

    #[test]
    fn test_bridge_error_conversion_preserves_class() {
        let not_found: SyncError = BridgeError::NotFound("video".into()).into();
        assert_eq!(not_found.classify(), FailureClass::Permanent);

        let forbidden: SyncError = BridgeError::Http {
            status: 403,
            message: "forbidden".into(),
        }
        .into();
        assert_eq!(forbidden.classify(), FailureClass::Permanent);

        let throttled: SyncError = BridgeError::RateLimited {
            retry_after_secs: Some(5),
        }
        .into();
        assert_eq!(throttled.classify(), FailureClass::Transient);
    }
}
