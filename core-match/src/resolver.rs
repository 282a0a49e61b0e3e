//! # Match Resolver
//!
//! Resolves one catalog track to at most one remote media item.
//!
//! ## Flow
//!
//! 1. Match cache lookup by (catalog entry, track title). A hit returns
//!    without any remote call.
//! 2. Each query strategy in order, most specific first: guarded search,
//!    score every candidate, stop at the first confident match and cache it.
//! 3. When every strategy is exhausted, keep the best near-misses from the last
//!    response and persist an unmatched record for manual review.
//!
//! ## Failure policy
//!
//! - Cache and unmatched-record writes are best effort: logged and swallowed.
//! - A failing strategy is absorbed and the next one is tried.
//! - `CircuitOpen` / `QuotaExceeded` abort the item immediately; the caller
//!   should retry it on a later pass.
//! - If every strategy failed without a single response, the last error is
//!   returned instead of recording the track as unmatched.

use std::fmt;
use std::sync::Arc;

use bridge_traits::query::QueryStrategyProvider;
use bridge_traits::search::SearchResponse;
use bridge_traits::time::Clock;
use core_library::{
    CachedMatch, MatchCacheRepository, NearMiss, UnmatchedRecord, UnmatchedRecordId,
    UnmatchedRepository, UnmatchedStatus,
};
use core_runtime::config::MatchingConfig;
use core_runtime::events::{CoreEvent, EventBus, MatchEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{MatchError, Result};
use crate::scorer::{find_all_matches, find_best_match, parse_duration, ExpectedTrack, ScoredCandidate};
use crate::search::GuardedSearch;

/// A catalog track as the host knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTrack {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    /// `"5:54"`, `"1:02:03"` or plain seconds
    pub duration: Option<String>,
}

impl CatalogTrack {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: None,
            duration: None,
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    pub fn expected(&self) -> ExpectedTrack {
        let mut expected = ExpectedTrack::new(&self.title).with_artist(&self.artist);
        if let Some(raw) = &self.duration {
            match parse_duration(raw) {
                Some(secs) => expected = expected.with_duration_secs(secs as f64),
                None => debug!(duration = %raw, "Ignoring unparseable catalog duration"),
            }
        }
        expected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ResolveOutcome {
    Cached {
        external_id: String,
    },
    Matched {
        external_id: String,
        confidence: f64,
        /// Zero-based index of the query strategy that matched
        strategy_index: usize,
    },
    Unmatched {
        near_misses: Vec<NearMiss>,
        /// `None` when the unmatched record could not be written
        record_id: Option<UnmatchedRecordId>,
    },
}

impl ResolveOutcome {
    pub fn external_id(&self) -> Option<&str> {
        match self {
            ResolveOutcome::Cached { external_id } | ResolveOutcome::Matched { external_id, .. } => {
                Some(external_id)
            }
            ResolveOutcome::Unmatched { .. } => None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.external_id().is_some()
    }
}

pub struct MatchResolver {
    cache: Arc<dyn MatchCacheRepository>,
    unmatched: Arc<dyn UnmatchedRepository>,
    strategies: Arc<dyn QueryStrategyProvider>,
    search: Arc<GuardedSearch>,
    clock: Arc<dyn Clock>,
    config: MatchingConfig,
    event_bus: Option<EventBus>,
}

impl MatchResolver {
    pub fn new(
        cache: Arc<dyn MatchCacheRepository>,
        unmatched: Arc<dyn UnmatchedRepository>,
        strategies: Arc<dyn QueryStrategyProvider>,
        search: Arc<GuardedSearch>,
        clock: Arc<dyn Clock>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            cache,
            unmatched,
            strategies,
            search,
            clock,
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    #[instrument(skip(self, track), fields(title = %track.title))]
    pub async fn resolve(
        &self,
        catalog_entry_id: &str,
        track: &CatalogTrack,
        playlist_context: &str,
    ) -> Result<ResolveOutcome> {
        if track.title.trim().is_empty() {
            return Err(MatchError::InvalidInput {
                field: "title".to_string(),
                message: "track title is empty".to_string(),
            });
        }

        match self.cache.find(catalog_entry_id, &track.title).await {
            Ok(Some(hit)) => {
                debug!(external_id = %hit.external_id, "Match cache hit");
                self.announce_match(catalog_entry_id, &track.title, &hit.external_id, hit.confidence, true);
                return Ok(ResolveOutcome::Cached {
                    external_id: hit.external_id,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Match cache lookup failed, resolving remotely"),
        }

        let expected = track.expected();
        let queries = self
            .strategies
            .strategies(&track.title, &track.artist, track.album.as_deref());

        let mut last_response: Option<SearchResponse> = None;
        let mut last_error = None;
        let mut tried = 0u32;

        for (index, query) in queries.iter().enumerate() {
            tried += 1;
            let response = match self.search.search(query, self.config.search_limit).await {
                Ok(response) => response,
                Err(e) if e.is_unavailable() => {
                    info!(query = %query, error = %e, "Search unavailable, deferring track");
                    return Err(e.into());
                }
                Err(e) => {
                    debug!(query = %query, error = %e, "Strategy failed, trying next");
                    last_error = Some(e);
                    continue;
                }
            };

            if let Some(best) =
                find_best_match(&expected, &response.candidates, self.config.match_threshold)
            {
                let confidence = best.confidence();
                info!(
                    query = %query,
                    external_id = %best.candidate.external_id,
                    confidence,
                    strategy_index = index,
                    "Track matched"
                );
                self.remember(catalog_entry_id, &track.title, &best).await;
                self.announce_match(
                    catalog_entry_id,
                    &track.title,
                    &best.candidate.external_id,
                    confidence,
                    false,
                );
                return Ok(ResolveOutcome::Matched {
                    external_id: best.candidate.external_id,
                    confidence,
                    strategy_index: index,
                });
            }

            debug!(query = %query, candidates = response.candidates.len(), "No confident match");
            last_response = Some(response);
        }

        if last_response.is_none() {
            if let Some(error) = last_error {
                warn!(strategies = tried, error = %error, "Every strategy failed");
                return Err(error.into());
            }
        }

        let near_misses = last_response
            .map(|response| self.near_misses(&expected, &response))
            .unwrap_or_default();
        let record_id = self
            .record_unmatched(catalog_entry_id, track, playlist_context, &near_misses, tried)
            .await;

        Ok(ResolveOutcome::Unmatched {
            near_misses,
            record_id,
        })
    }

    /// Resolve a pending unmatched record by hand and cache the choice.
    pub async fn apply_manual_match(
        &self,
        record_id: &UnmatchedRecordId,
        external_id: &str,
    ) -> Result<UnmatchedRecord> {
        if external_id.trim().is_empty() {
            return Err(MatchError::InvalidInput {
                field: "external_id".to_string(),
                message: "external id is empty".to_string(),
            });
        }

        let now = self.clock.unix_timestamp();
        let record = self.unmatched.mark_resolved(record_id, external_id, now).await?;

        let chosen = record.near_misses.iter().find(|m| m.external_id == external_id);
        let cached = CachedMatch {
            catalog_entry_id: record.catalog_entry_id.clone(),
            track_title: record.track_title.clone(),
            external_id: external_id.to_string(),
            confidence: 1.0,
            matched_title: chosen
                .map(|m| m.title.clone())
                .unwrap_or_else(|| record.track_title.clone()),
            matched_artist: Some(
                chosen
                    .map(|m| m.uploader_handle.clone())
                    .unwrap_or_else(|| record.artist.clone()),
            ),
            created_at: now,
        };
        self.cache.upsert(&cached).await?;

        info!(record_id = %record_id, external_id, "Unmatched track resolved manually");
        Ok(record)
    }

    /// Dismiss a pending unmatched record.
    pub async fn skip_unmatched(&self, record_id: &UnmatchedRecordId) -> Result<UnmatchedRecord> {
        let record = self
            .unmatched
            .mark_skipped(record_id, self.clock.unix_timestamp())
            .await?;
        info!(record_id = %record_id, "Unmatched track skipped");
        Ok(record)
    }

    /// Records awaiting review, optionally for one playlist.
    pub async fn pending_unmatched(&self, playlist_context: Option<&str>) -> Result<Vec<UnmatchedRecord>> {
        Ok(self
            .unmatched
            .find_by_status(UnmatchedStatus::Pending, playlist_context)
            .await?)
    }

    // ------------------------------------------------------------------------

    fn near_misses(&self, expected: &ExpectedTrack, response: &SearchResponse) -> Vec<NearMiss> {
        find_all_matches(expected, &response.candidates, self.config.near_miss_threshold)
            .into_iter()
            .take(self.config.max_near_misses)
            .map(|scored| NearMiss {
                confidence: scored.confidence(),
                external_id: scored.candidate.external_id,
                title: scored.candidate.title,
                uploader_handle: scored.candidate.uploader_handle,
                duration_millis: scored.candidate.duration_millis,
            })
            .collect()
    }

    async fn remember(&self, catalog_entry_id: &str, track_title: &str, best: &ScoredCandidate) {
        let entry = CachedMatch {
            catalog_entry_id: catalog_entry_id.to_string(),
            track_title: track_title.to_string(),
            external_id: best.candidate.external_id.clone(),
            confidence: best.confidence(),
            matched_title: best.candidate.title.clone(),
            matched_artist: Some(best.candidate.uploader_handle.clone()),
            created_at: self.clock.unix_timestamp(),
        };
        if let Err(e) = self.cache.upsert(&entry).await {
            warn!(error = %e, "Failed to cache match");
        }
    }

    async fn record_unmatched(
        &self,
        catalog_entry_id: &str,
        track: &CatalogTrack,
        playlist_context: &str,
        near_misses: &[NearMiss],
        strategies_tried: u32,
    ) -> Option<UnmatchedRecordId> {
        let record = UnmatchedRecord::pending(
            playlist_context,
            catalog_entry_id,
            &track.title,
            &track.artist,
            self.clock.unix_timestamp(),
        )
        .with_near_misses(near_misses.to_vec())
        .with_strategies_tried(strategies_tried);

        let stored = match self.unmatched.upsert_pending(&record).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to record unmatched track");
                return None;
            }
        };

        info!(
            playlist_context,
            strategies_tried,
            near_misses = near_misses.len(),
            status = %stored.status,
            "Track left unmatched"
        );
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Match(MatchEvent::Unmatched {
                catalog_entry_id: catalog_entry_id.to_string(),
                track_title: track.title.clone(),
                playlist_context: playlist_context.to_string(),
                near_misses: near_misses.len(),
            }))
            .ok();
        }
        Some(stored.id)
    }

    fn announce_match(
        &self,
        catalog_entry_id: &str,
        track_title: &str,
        external_id: &str,
        confidence: f64,
        from_cache: bool,
    ) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Match(MatchEvent::Matched {
                catalog_entry_id: catalog_entry_id.to_string(),
                track_title: track_title.to_string(),
                external_id: external_id.to_string(),
                confidence,
                from_cache,
            }))
            .ok();
        }
    }
}

impl fmt::Debug for MatchResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchResolver")
            .field("config", &self.config)
            .field("search", &self.search)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockSearchProvider;
    use async_trait::async_trait;
    use bridge_traits::error::BridgeError;
    use bridge_traits::query::BasicQueryStrategies;
    use bridge_traits::search::{MatchCandidate, MediaSearchProvider};
    use bridge_traits::time::ManualClock;
    use core_library::db::create_test_pool;
    use core_library::{LibraryError, SqliteMatchCacheRepository, SqliteUnmatchedRepository};
    use core_runtime::config::{CircuitBreakerConfig, QuotaConfig};
    use core_sync::{CircuitBreakerRegistry, QuotaTracker, SyncError};

    const ENTRY: &str = "catalog-42";
    const PLAYLIST: &str = "road-trip";

    struct Harness {
        resolver: MatchResolver,
        cache: Arc<dyn MatchCacheRepository>,
        unmatched: Arc<dyn UnmatchedRepository>,
        registry: CircuitBreakerRegistry,
    }

    async fn harness(mock: MockSearchProvider) -> Harness {
        harness_with_cache(mock, None).await
    }

    async fn harness_with_cache(
        mut mock: MockSearchProvider,
        cache_override: Option<Arc<dyn MatchCacheRepository>>,
    ) -> Harness {
        mock.expect_name().return_const("video-search".to_string());
        let pool = create_test_pool().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(3),
            clock.clone(),
        );
        let quota = Arc::new(QuotaTracker::new(QuotaConfig::default(), clock.clone()));
        let provider: Arc<dyn MediaSearchProvider> = Arc::new(mock);
        let search = Arc::new(GuardedSearch::from_registry(provider, &registry, quota));

        let cache: Arc<dyn MatchCacheRepository> = cache_override
            .unwrap_or_else(|| Arc::new(SqliteMatchCacheRepository::new(pool.clone())));
        let unmatched: Arc<dyn UnmatchedRepository> = Arc::new(SqliteUnmatchedRepository::new(pool));

        Harness {
            resolver: MatchResolver::new(
                cache.clone(),
                unmatched.clone(),
                Arc::new(BasicQueryStrategies),
                search,
                clock,
                MatchingConfig::default(),
            ),
            cache,
            unmatched,
            registry,
        }
    }

    fn bohemian() -> CatalogTrack {
        CatalogTrack::new("Bohemian Rhapsody", "Queen").with_duration("5:54")
    }

    fn exact() -> MatchCandidate {
        MatchCandidate::new("fJ9rUzIMcZQ", "Bohemian Rhapsody", "Queen - Topic").with_duration_millis(354_000)
    }

    fn distractors() -> Vec<MatchCandidate> {
        vec![
            MatchCandidate::new("d1", "Bohemian Rhapsody (Piano Cover)", "KeysForAll").with_duration_millis(410_000),
            MatchCandidate::new("d2", "Radio Ga Ga", "Queen").with_duration_millis(343_000),
            MatchCandidate::new("d3", "Bohemian Rhapsody Reaction", "ReactsDaily").with_duration_millis(900_000),
            MatchCandidate::new("d4", "Under Pressure", "Queen").with_duration_millis(248_000),
        ]
    }

    #[tokio::test]
    async fn test_cache_hit_skips_search() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search().never();
        let h = harness(mock).await;

        h.cache
            .upsert(&CachedMatch {
                catalog_entry_id: ENTRY.into(),
                track_title: "Bohemian Rhapsody".into(),
                external_id: "cached-id".into(),
                confidence: 0.97,
                matched_title: "Bohemian Rhapsody".into(),
                matched_artist: Some("Queen".into()),
                created_at: 0,
            })
            .await
            .unwrap();

        let outcome = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        assert_eq!(
            outcome,
            ResolveOutcome::Cached {
                external_id: "cached-id".into()
            }
        );
    }

    #[tokio::test]
    async fn test_falls_through_strategies_until_match_then_caches() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search().times(2).returning(|query, _| {
            if query == "Queen - Bohemian Rhapsody" {
                Ok(SearchResponse::new(distractors()))
            } else {
                Ok(SearchResponse::new(vec![exact()]))
            }
        });
        let h = harness(mock).await;

        let outcome = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        match outcome {
            ResolveOutcome::Matched {
                external_id,
                confidence,
                strategy_index,
            } => {
                assert_eq!(external_id, "fJ9rUzIMcZQ");
                assert!(confidence > 0.95);
                assert_eq!(strategy_index, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let cached = h.cache.find(ENTRY, "Bohemian Rhapsody").await.unwrap().unwrap();
        assert_eq!(cached.external_id, "fJ9rUzIMcZQ");

        // Served from cache; the mock would reject a third search.
        let again = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        assert!(matches!(again, ResolveOutcome::Cached { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_strategies_record_near_misses() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search()
            .times(3)
            .returning(|_, _| Ok(SearchResponse::new(distractors())));
        let h = harness(mock).await;

        let outcome = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        let ResolveOutcome::Unmatched {
            near_misses,
            record_id,
        } = outcome
        else {
            panic!("expected unmatched outcome");
        };

        assert!(!near_misses.is_empty());
        assert!(near_misses.len() <= 3);
        assert!(near_misses.iter().all(|m| m.confidence >= 0.3 && m.confidence < 0.6));
        assert!(near_misses.windows(2).all(|w| w[0].confidence >= w[1].confidence));

        let record = h
            .unmatched
            .find_by_id(&record_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.strategies_tried, 3);
        assert_eq!(record.playlist_context, PLAYLIST);
        assert_eq!(record.near_misses, near_misses);
        assert!(h.cache.find(ENTRY, "Bohemian Rhapsody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_strategy_is_absorbed() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search().times(2).returning(|query, _| {
            if query == "Queen - Bohemian Rhapsody" {
                Err(BridgeError::Timeout("search".into()))
            } else {
                Ok(SearchResponse::new(vec![exact()]))
            }
        });
        let h = harness(mock).await;

        let outcome = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        assert_eq!(outcome.external_id(), Some("fJ9rUzIMcZQ"));
    }

    #[tokio::test]
    async fn test_all_strategies_failing_surfaces_last_error() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search()
            .times(3)
            .returning(|_, _| Err(BridgeError::Network("connection reset".into())));
        let h = harness(mock).await;

        let err = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap_err();
        assert!(matches!(err, MatchError::Sync(SyncError::Transient(_))));
        assert!(h
            .unmatched
            .find_by_key(PLAYLIST, ENTRY, "Bohemian Rhapsody")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_open_circuit_aborts_item() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search().never();
        let h = harness(mock).await;

        let breaker = h.registry.get_or_create("video-search");
        for _ in 0..3 {
            breaker.record_failure();
        }

        let err = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    struct BrokenCache;

    #[async_trait]
    impl MatchCacheRepository for BrokenCache {
        async fn find(&self, _: &str, _: &str) -> core_library::Result<Option<CachedMatch>> {
            Ok(None)
        }

        async fn upsert(&self, _: &CachedMatch) -> core_library::Result<()> {
            Err(LibraryError::Migration("disk full".into()))
        }

        async fn delete(&self, _: &str, _: &str) -> core_library::Result<bool> {
            Ok(false)
        }

        async fn count(&self) -> core_library::Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_cache_write_failure_does_not_fail_resolution() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search()
            .times(1)
            .returning(|_, _| Ok(SearchResponse::new(vec![exact()])));
        let h = harness_with_cache(mock, Some(Arc::new(BrokenCache))).await;

        let outcome = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        assert!(outcome.is_match());
    }

    #[tokio::test]
    async fn test_manual_match_resolves_and_caches() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search()
            .times(3)
            .returning(|_, _| Ok(SearchResponse::new(distractors())));
        let h = harness(mock).await;

        let ResolveOutcome::Unmatched { record_id, .. } =
            h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap()
        else {
            panic!("expected unmatched outcome");
        };
        let record_id = record_id.unwrap();
        assert_eq!(h.resolver.pending_unmatched(Some(PLAYLIST)).await.unwrap().len(), 1);

        let resolved = h.resolver.apply_manual_match(&record_id, "d1").await.unwrap();
        assert_eq!(resolved.status, UnmatchedStatus::Resolved);
        assert_eq!(resolved.resolved_external_id.as_deref(), Some("d1"));

        let cached = h.cache.find(ENTRY, "Bohemian Rhapsody").await.unwrap().unwrap();
        assert_eq!(cached.external_id, "d1");
        assert_eq!(cached.confidence, 1.0);
        assert_eq!(cached.matched_title, "Bohemian Rhapsody (Piano Cover)");

        let err = h.resolver.skip_unmatched(&record_id).await.unwrap_err();
        assert!(matches!(
            err,
            MatchError::Library(LibraryError::InvalidStateTransition { .. })
        ));
        assert!(h.resolver.pending_unmatched(Some(PLAYLIST)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_record_is_not_reopened() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search()
            .times(6)
            .returning(|_, _| Ok(SearchResponse::new(distractors())));
        let h = harness(mock).await;

        let ResolveOutcome::Unmatched { record_id, .. } =
            h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap()
        else {
            panic!("expected unmatched outcome");
        };
        let record_id = record_id.unwrap();
        h.resolver.skip_unmatched(&record_id).await.unwrap();

        let again = h.resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        assert!(!again.is_match());

        let record = h.unmatched.find_by_id(&record_id).await.unwrap().unwrap();
        assert_eq!(record.status, UnmatchedStatus::Skipped);
    }

    #[tokio::test]
    async fn test_match_events() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search()
            .times(1)
            .returning(|_, _| Ok(SearchResponse::new(vec![exact()])));
        let h = harness(mock).await;
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let resolver = h.resolver.with_event_bus(bus);

        resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();
        resolver.resolve(ENTRY, &bohemian(), PLAYLIST).await.unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            CoreEvent::Match(MatchEvent::Matched { from_cache: false, .. })
        ));
        assert!(matches!(
            second,
            CoreEvent::Match(MatchEvent::Matched { from_cache: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_title_is_rejected() {
        let mut mock = MockSearchProvider::new();
        mock.expect_search().never();
        let h = harness(mock).await;

        let err = h
            .resolver
            .resolve(ENTRY, &CatalogTrack::new("  ", "Queen"), PLAYLIST)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidInput { .. }));
    }
}
