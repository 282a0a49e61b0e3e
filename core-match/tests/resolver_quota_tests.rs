//! Integration tests for resolution under upstream quota pressure
//!
//! The fake provider reports its remaining quota on every response, the way
//! the playlist service does. Once it reports an empty budget the resolver
//! must stop calling it until the reported reset time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::query::BasicQueryStrategies;
use bridge_traits::search::{MatchCandidate, MediaSearchProvider, QuotaReport, SearchResponse};
use bridge_traits::time::{Clock, ManualClock};
use core_library::db::create_test_pool;
use core_library::{SqliteMatchCacheRepository, SqliteUnmatchedRepository};
use core_match::{CatalogTrack, GuardedSearch, MatchError, MatchResolver, ResolveOutcome};
use core_runtime::config::{CircuitBreakerConfig, MatchingConfig, QuotaConfig};
use core_sync::{CircuitBreakerRegistry, CircuitState, QuotaTracker, SyncError};

/// Serves a fixed catalogue and counts down a quota budget.
struct CountingProvider {
    clock: Arc<ManualClock>,
    budget: Mutex<i64>,
    queries: Mutex<Vec<String>>,
}

impl CountingProvider {
    fn new(clock: Arc<ManualClock>, budget: i64) -> Self {
        Self {
            clock,
            budget: Mutex::new(budget),
            queries: Mutex::new(Vec::new()),
        }
    }

    fn refill(&self, budget: i64) {
        *self.budget.lock().unwrap() = budget;
    }

    fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaSearchProvider for CountingProvider {
    fn name(&self) -> &str {
        "video-search"
    }

    async fn search(&self, query: &str, _limit: usize) -> BridgeResult<SearchResponse> {
        self.queries.lock().unwrap().push(query.to_string());
        let remaining = {
            let mut budget = self.budget.lock().unwrap();
            *budget -= 1;
            *budget
        };

        let reset_at = (self.clock.now() + chrono::Duration::hours(1)).to_rfc3339();
        let candidates = if query.contains("Bohemian Rhapsody") {
            vec![MatchCandidate::new("fJ9rUzIMcZQ", "Bohemian Rhapsody", "Queen")
                .with_duration_millis(354_000)]
        } else {
            vec![MatchCandidate::new("x", "Completely Different Song", "Nobody")]
        };

        Ok(SearchResponse::new(candidates).with_quota(QuotaReport {
            remaining,
            reset_at,
            max_quota: Some(100),
        }))
    }
}

struct Harness {
    resolver: MatchResolver,
    provider: Arc<CountingProvider>,
    quota: Arc<QuotaTracker>,
    registry: CircuitBreakerRegistry,
    clock: Arc<ManualClock>,
}

async fn harness(budget: i64) -> Harness {
    let pool = create_test_pool().await.unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let provider = Arc::new(CountingProvider::new(clock.clone(), budget));
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), dyn_clock.clone());
    let quota = Arc::new(QuotaTracker::new(QuotaConfig::default(), dyn_clock.clone()));
    let search = Arc::new(GuardedSearch::from_registry(
        provider.clone(),
        &registry,
        quota.clone(),
    ));

    Harness {
        resolver: MatchResolver::new(
            Arc::new(SqliteMatchCacheRepository::new(pool.clone())),
            Arc::new(SqliteUnmatchedRepository::new(pool)),
            Arc::new(BasicQueryStrategies),
            search,
            dyn_clock,
            MatchingConfig::default(),
        ),
        provider,
        quota,
        registry,
        clock,
    }
}

#[tokio::test]
async fn test_spent_quota_defers_until_reset() {
    let h = harness(1).await;
    let track = CatalogTrack::new("Bohemian Rhapsody", "Queen").with_duration("5:54");

    // The only budgeted call matches; the response reports zero left.
    let first = h.resolver.resolve("1", &track, "mix").await.unwrap();
    assert!(first.is_match());
    assert!(h.quota.is_limit_exceeded());

    // A different track now fails fast without reaching the provider.
    let other = CatalogTrack::new("Yesterday", "The Beatles");
    let err = h.resolver.resolve("2", &other, "mix").await.unwrap_err();
    assert!(err.is_unavailable());
    assert!(matches!(err, MatchError::Sync(SyncError::QuotaExceeded { .. })));
    assert_eq!(h.provider.query_count(), 1);

    // Quota rejections are not upstream failures.
    assert_eq!(
        h.registry.get_or_create("video-search").state(),
        CircuitState::Closed
    );

    // Cached tracks are still served while the budget is spent.
    let cached = h.resolver.resolve("1", &track, "mix").await.unwrap();
    assert!(matches!(cached, ResolveOutcome::Cached { .. }));

    // Once the reported reset passes the provider is called again.
    h.clock.advance(Duration::from_secs(3_601));
    h.provider.refill(100);
    let after_reset = h.resolver.resolve("2", &other, "mix").await.unwrap();
    assert!(!after_reset.is_match());
    assert!(h.provider.query_count() > 1);
}

#[tokio::test]
async fn test_stale_quota_report_is_ignored() {
    let h = harness(1).await;
    let track = CatalogTrack::new("Bohemian Rhapsody", "Queen");

    h.quota.update(0, "", None);
    h.clock.advance(Duration::from_secs(25 * 3_600));
    assert!(h.quota.is_stale());

    let outcome = h.resolver.resolve("1", &track, "mix").await.unwrap();
    assert!(outcome.is_match());
}
