use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Library error: {0}")]
    Library(#[from] core_library::LibraryError),

    #[error("Match error: {0}")]
    Match(#[from] core_match::MatchError),
}

impl CoreError {
    /// True when the failure only means a dependency is refusing calls for now.
    pub fn is_unavailable(&self) -> bool {
        match self {
            CoreError::Sync(e) => e.is_unavailable(),
            CoreError::Match(e) => e.is_unavailable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use core_sync::SyncError;

    #[test]
    fn test_unavailable_passes_through_wrappers() {
        let open = CoreError::from(SyncError::CircuitOpen {
            name: "video-search".into(),
            retry_after_ms: 1_000,
        });
        assert!(open.is_unavailable());

        let spent = CoreError::from(core_match::MatchError::from(SyncError::QuotaExceeded {
            resets_in_secs: Some(60),
        }));
        assert!(spent.is_unavailable());

        let init = CoreError::InitializationFailed("pool".into());
        assert!(!init.is_unavailable());
    }
}
