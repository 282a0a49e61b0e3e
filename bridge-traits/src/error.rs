use thiserror::Error;

/// Errors reported by host-provided collaborators (search backends, query
/// generators, logging sinks).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by upstream (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),
}

impl BridgeError {
    /// Whether the upstream confirmed the failure will not go away on retry.
    ///
    /// Missing or invalid resources and 4xx responses are permanent, except
    /// 408 (request timeout) and 429 (too many requests).
    pub fn is_permanent(&self) -> bool {
        match self {
            BridgeError::NotFound(_) | BridgeError::InvalidResource(_) => true,
            BridgeError::Http { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }

    /// Inverse of [`is_permanent`](Self::is_permanent).
    pub fn is_transient(&self) -> bool {
        !self.is_permanent()
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
