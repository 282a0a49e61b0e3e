use core_library::LibraryError;
use core_sync::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    /// Search guards or upstream failures
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },
}

impl MatchError {
    /// Circuit open or quota exhausted; the item should be tried again later.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MatchError::Sync(e) if e.is_unavailable())
    }
}

impl From<MatchError> for SyncError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::Sync(e) => e,
            MatchError::Library(e) => SyncError::from(e),
            MatchError::InvalidInput { .. } => SyncError::Permanent(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MatchError>;
