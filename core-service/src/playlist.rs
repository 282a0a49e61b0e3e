//! Playlist builds as resumable batches.
//!
//! Each catalog track is one batch item keyed by its catalog entry id. The
//! item is resolved through the [`MatchResolver`]; a track that stays
//! unmatched counts as processed (its unmatched record is the follow-up), so
//! only dependency failures leave items for a later run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use core_match::{CatalogTrack, MatchResolver};
use core_sync::{BatchReport, ItemOutcome, ItemProcessor, SyncError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One playlist slot: a catalog entry and the track it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistTrack {
    pub catalog_entry_id: String,
    pub track: CatalogTrack,
}

impl PlaylistTrack {
    pub fn new(catalog_entry_id: impl Into<String>, track: CatalogTrack) -> Self {
        Self {
            catalog_entry_id: catalog_entry_id.into(),
            track,
        }
    }
}

/// Result of a playlist build run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistBuild {
    pub report: BatchReport,
    /// Remote ids in playlist order, for every track matched so far
    /// (including tracks matched by earlier runs of the same sync id)
    pub external_ids: Vec<String>,
    /// Catalog entry ids with no remote id yet
    pub unmatched: Vec<String>,
}

pub(crate) struct TrackResolutionProcessor {
    resolver: Arc<MatchResolver>,
    playlist_context: String,
    tracks: HashMap<String, CatalogTrack>,
    resolved: Mutex<HashMap<String, String>>,
}

impl TrackResolutionProcessor {
    pub(crate) fn new(
        resolver: Arc<MatchResolver>,
        playlist_context: impl Into<String>,
        tracks: &[PlaylistTrack],
    ) -> Self {
        Self {
            resolver,
            playlist_context: playlist_context.into(),
            tracks: tracks
                .iter()
                .map(|t| (t.catalog_entry_id.clone(), t.track.clone()))
                .collect(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Remote id found during this run.
    pub(crate) fn resolved(&self, catalog_entry_id: &str) -> Option<String> {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(catalog_entry_id)
            .cloned()
    }
}

#[async_trait]
impl ItemProcessor for TrackResolutionProcessor {
    async fn process(&self, item_id: &str) -> core_sync::Result<ItemOutcome> {
        let track = self
            .tracks
            .get(item_id)
            .ok_or_else(|| SyncError::Permanent(format!("Unknown catalog entry {}", item_id)))?;

        let outcome = self
            .resolver
            .resolve(item_id, track, &self.playlist_context)
            .await
            .map_err(SyncError::from)?;

        match outcome.external_id() {
            Some(external_id) => {
                self.resolved
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(item_id.to_string(), external_id.to_string());
                Ok(ItemOutcome::Done)
            }
            None => {
                debug!(catalog_entry_id = %item_id, "Track left unmatched");
                Ok(ItemOutcome::Skipped)
            }
        }
    }
}
