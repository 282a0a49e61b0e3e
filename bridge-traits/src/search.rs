//! Remote Media Search Contract
//!
//! The playlist service exposes a search endpoint that returns candidate media
//! items for a query string. Responses may carry quota metadata which the core
//! feeds into its quota tracker; the core never predicts quota on its own.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One externally returned item considered as a possible match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Identifier of the media item on the remote service
    pub external_id: String,
    /// Title as published on the remote service
    pub title: String,
    /// Channel or uploader handle; a weak proxy for the artist
    pub uploader_handle: String,
    /// Duration in milliseconds, when the service reports one
    pub duration_millis: Option<u64>,
}

impl MatchCandidate {
    pub fn new(
        external_id: impl Into<String>,
        title: impl Into<String>,
        uploader_handle: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            uploader_handle: uploader_handle.into(),
            duration_millis: None,
        }
    }

    pub fn with_duration_millis(mut self, millis: u64) -> Self {
        self.duration_millis = Some(millis);
        self
    }
}

/// Quota metadata attached to a search response.
///
/// `reset_at` is passed through verbatim; its format is service specific
/// (RFC 3339 or Unix seconds) and is parsed by the quota tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReport {
    pub remaining: i64,
    pub reset_at: String,
    pub max_quota: Option<i64>,
}

/// Result of one search call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub candidates: Vec<MatchCandidate>,
    pub quota: Option<QuotaReport>,
}

impl SearchResponse {
    pub fn new(candidates: Vec<MatchCandidate>) -> Self {
        Self {
            candidates,
            quota: None,
        }
    }

    pub fn with_quota(mut self, quota: QuotaReport) -> Self {
        self.quota = Some(quota);
        self
    }
}

/// Remote search capability of the playlist service.
#[async_trait::async_trait]
pub trait MediaSearchProvider: Send + Sync {
    /// Stable dependency name; used to key the circuit breaker guarding it.
    fn name(&self) -> &str;

    /// Search for up to `limit` candidates matching `query`.
    async fn search(&self, query: &str, limit: usize) -> Result<SearchResponse>;
}
