//! Domain models for match resolution storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LibraryError;

// =============================================================================
// ID Types
// =============================================================================

/// Unique identifier for an unmatched record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnmatchedRecordId(pub Uuid);

impl UnmatchedRecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for UnmatchedRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnmatchedRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Match cache
// =============================================================================

/// A confident match remembered for (catalog entry, track title).
///
/// One row per key; a later resolution overwrites the earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMatch {
    pub catalog_entry_id: String,
    pub track_title: String,
    pub external_id: String,
    pub confidence: f64,
    pub matched_title: String,
    pub matched_artist: Option<String>,
    /// Unix seconds
    pub created_at: i64,
}

// =============================================================================
// Unmatched records
// =============================================================================

/// Review status of an unmatched record. `Resolved` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedStatus {
    Pending,
    Resolved,
    Skipped,
}

impl UnmatchedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnmatchedStatus::Pending => "pending",
            UnmatchedStatus::Resolved => "resolved",
            UnmatchedStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UnmatchedStatus::Pending)
    }
}

impl fmt::Display for UnmatchedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnmatchedStatus {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UnmatchedStatus::Pending),
            "resolved" => Ok(UnmatchedStatus::Resolved),
            "skipped" => Ok(UnmatchedStatus::Skipped),
            other => Err(LibraryError::InvalidInput {
                field: "status".to_string(),
                message: format!("unknown unmatched status '{}'", other),
            }),
        }
    }
}

/// A candidate that scored below the match threshold but is worth review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearMiss {
    pub external_id: String,
    pub title: String,
    pub uploader_handle: String,
    pub duration_millis: Option<u64>,
    pub confidence: f64,
}

/// A catalog track for which no strategy produced a confident match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedRecord {
    pub id: UnmatchedRecordId,
    pub playlist_context: String,
    pub catalog_entry_id: String,
    pub track_title: String,
    pub artist: String,
    /// Best scoring candidates, highest first
    pub near_misses: Vec<NearMiss>,
    pub strategies_tried: u32,
    pub status: UnmatchedStatus,
    pub resolved_external_id: Option<String>,
    pub resolved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UnmatchedRecord {
    /// New pending record.
    pub fn pending(
        playlist_context: impl Into<String>,
        catalog_entry_id: impl Into<String>,
        track_title: impl Into<String>,
        artist: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            id: UnmatchedRecordId::new(),
            playlist_context: playlist_context.into(),
            catalog_entry_id: catalog_entry_id.into(),
            track_title: track_title.into(),
            artist: artist.into(),
            near_misses: Vec::new(),
            strategies_tried: 0,
            status: UnmatchedStatus::Pending,
            resolved_external_id: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_near_misses(mut self, near_misses: Vec<NearMiss>) -> Self {
        self.near_misses = near_misses;
        self
    }

    pub fn with_strategies_tried(mut self, count: u32) -> Self {
        self.strategies_tried = count;
        self
    }
}
