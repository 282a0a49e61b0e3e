//! # Guarded Search
//!
//! Wraps a [`MediaSearchProvider`] with the resilience guards, in order:
//!
//! 1. Quota: fail fast with `QuotaExceeded` while a fresh report says the
//!    budget is spent. This never reaches the breaker.
//! 2. Rate limiter: wait for a token when one is configured.
//! 3. Circuit breaker: reject while open; record transient failures.
//! 4. Feed any quota report on the response back into the tracker.

use std::fmt;
use std::sync::Arc;

use bridge_traits::search::{MediaSearchProvider, SearchResponse};
use core_sync::{CircuitBreaker, CircuitBreakerRegistry, QuotaTracker, SyncError, TokenBucket};
use tracing::{debug, warn};

pub struct GuardedSearch {
    provider: Arc<dyn MediaSearchProvider>,
    breaker: Arc<CircuitBreaker>,
    quota: Arc<QuotaTracker>,
    limiter: Option<Arc<TokenBucket>>,
}

impl GuardedSearch {
    pub fn new(
        provider: Arc<dyn MediaSearchProvider>,
        breaker: Arc<CircuitBreaker>,
        quota: Arc<QuotaTracker>,
    ) -> Self {
        Self {
            provider,
            breaker,
            quota,
            limiter: None,
        }
    }

    /// Guard `provider` with the registry's breaker for its name.
    pub fn from_registry(
        provider: Arc<dyn MediaSearchProvider>,
        registry: &CircuitBreakerRegistry,
        quota: Arc<QuotaTracker>,
    ) -> Self {
        let breaker = registry.get_or_create(provider.name());
        Self::new(provider, breaker, quota)
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<SearchResponse, SyncError> {
        self.quota.check_available()?;
        if self.quota.is_approaching_limit() {
            warn!(provider = self.provider.name(), "Search quota nearly spent");
        }

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let provider = &self.provider;
        let response = self
            .breaker
            .execute(|| async move { provider.search(query, limit).await.map_err(SyncError::from) })
            .await?;

        if let Some(report) = &response.quota {
            self.quota.update_from_report(report);
        }

        debug!(
            provider = self.provider.name(),
            query,
            candidates = response.candidates.len(),
            "Search completed"
        );
        Ok(response)
    }
}

impl fmt::Debug for GuardedSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedSearch")
            .field("provider", &self.provider.name())
            .field("breaker", &self.breaker.name())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockSearchProvider;
    use bridge_traits::error::BridgeError;
    use bridge_traits::search::{MatchCandidate, QuotaReport};
    use bridge_traits::time::{Clock, ManualClock};
    use core_runtime::config::{CircuitBreakerConfig, QuotaConfig, RateLimitConfig};
    use core_sync::CircuitState;

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: CircuitBreakerRegistry,
        quota: Arc<QuotaTracker>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        Fixture {
            registry: CircuitBreakerRegistry::new(
                CircuitBreakerConfig::default().with_failure_threshold(2),
                dyn_clock.clone(),
            ),
            quota: Arc::new(QuotaTracker::new(QuotaConfig::default(), dyn_clock)),
            clock,
        }
    }

    fn provider(mock: MockSearchProvider) -> Arc<dyn MediaSearchProvider> {
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_search_feeds_quota_report() {
        let f = fixture();
        let mut mock = MockSearchProvider::new();
        mock.expect_name().return_const("video-search".to_string());
        mock.expect_search().times(1).returning(|_, _| {
            Ok(SearchResponse::new(vec![MatchCandidate::new("id", "Title", "Artist")]).with_quota(
                QuotaReport {
                    remaining: 3,
                    reset_at: "4102444800".to_string(),
                    max_quota: Some(100),
                },
            ))
        });

        let search = GuardedSearch::from_registry(provider(mock), &f.registry, f.quota.clone());
        let response = search.search("Title", 5).await.unwrap();

        assert_eq!(response.candidates.len(), 1);
        assert_eq!(f.quota.snapshot().unwrap().remaining, 3);
        assert!(f.quota.is_approaching_limit());
        assert_eq!(search.breaker().name(), "video-search");
    }

    #[tokio::test]
    async fn test_spent_quota_fails_fast_without_calling_provider() {
        let f = fixture();
        let reset = (f.clock.now() + chrono::Duration::hours(1)).to_rfc3339();
        f.quota.update(0, &reset, None);

        let mut mock = MockSearchProvider::new();
        mock.expect_name().return_const("video-search".to_string());
        mock.expect_search().never();

        let search = GuardedSearch::from_registry(provider(mock), &f.registry, f.quota.clone());
        let err = search.search("anything", 5).await.unwrap_err();

        assert!(matches!(err, SyncError::QuotaExceeded { resets_in_secs: Some(_) }));
        assert_eq!(search.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transient_failures_open_breaker() {
        let f = fixture();
        let mut mock = MockSearchProvider::new();
        mock.expect_name().return_const("video-search".to_string());
        mock.expect_search()
            .times(2)
            .returning(|_, _| Err(BridgeError::Http { status: 503, message: "unavailable".into() }));

        let search = GuardedSearch::from_registry(provider(mock), &f.registry, f.quota.clone());
        for _ in 0..2 {
            let err = search.search("q", 5).await.unwrap_err();
            assert_eq!(err.classify(), core_sync::FailureClass::Transient);
        }

        let err = search.search("q", 5).await.unwrap_err();
        assert!(matches!(err, SyncError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_not_found_does_not_count_against_breaker() {
        let f = fixture();
        let mut mock = MockSearchProvider::new();
        mock.expect_name().return_const("video-search".to_string());
        mock.expect_search()
            .times(3)
            .returning(|_, _| Err(BridgeError::NotFound("no such query".into())));

        let search = GuardedSearch::from_registry(provider(mock), &f.registry, f.quota.clone());
        for _ in 0..3 {
            let err = search.search("q", 5).await.unwrap_err();
            assert!(matches!(err, SyncError::Permanent(_)));
        }
        assert_eq!(search.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rate_limiter_is_consulted() {
        let f = fixture();
        let mut mock = MockSearchProvider::new();
        mock.expect_name().return_const("video-search".to_string());
        mock.expect_search()
            .times(2)
            .returning(|_, _| Ok(SearchResponse::default()));

        let limiter = Arc::new(
            TokenBucket::new(RateLimitConfig {
                capacity: 2,
                refill_interval_ms: 60_000,
            })
            .unwrap(),
        );
        let search = GuardedSearch::from_registry(provider(mock), &f.registry, f.quota.clone())
            .with_rate_limiter(limiter.clone());

        search.search("a", 5).await.unwrap();
        search.search("b", 5).await.unwrap();
        assert!(!limiter.try_acquire());
    }
}
