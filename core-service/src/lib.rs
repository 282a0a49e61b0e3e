//! Sync engine façade and bootstrap.
//!
//! [`SyncEngine::bootstrap`] turns a validated [`CoreConfig`] plus the
//! host-provided collaborators in [`CoreDependencies`] into a fully wired
//! engine: one SQLite pool, one event bus, one circuit breaker registry, one
//! quota tracker and token bucket in front of the remote search, and the
//! checkpoint, retry and batch machinery on top.
//!
//! ```rust,ignore
//! use core_runtime::config::CoreConfig;
//! use core_service::{CoreDependencies, SyncEngine};
//!
//! let config = CoreConfig::builder().database_path("/var/lib/tunesync/sync.db").build()?;
//! let engine = SyncEngine::bootstrap(config, CoreDependencies::new(search_provider)).await?;
//! let build = engine.build_playlist("weekly-2024-10", "weekly", &tracks).await?;
//! ```
//!
//! Logging is the host's call: install a subscriber with
//! `core_runtime::logging::init_logging` before bootstrapping.

pub mod error;
pub mod playlist;

pub use error::{CoreError, Result};
pub use playlist::{PlaylistBuild, PlaylistTrack};

use std::collections::HashSet;
use std::sync::Arc;

use bridge_traits::query::{BasicQueryStrategies, QueryStrategyProvider};
use bridge_traits::search::MediaSearchProvider;
use bridge_traits::time::{Clock, SystemClock};
use core_library::db::{create_pool, DatabaseConfig};
use core_library::{
    MatchCacheRepository, SqliteMatchCacheRepository, SqliteUnmatchedRepository,
    UnmatchedRepository,
};
use core_match::{GuardedSearch, MatchError, MatchResolver};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, EventStream, Receiver};
use core_sync::{
    BatchProcessor, BatchReport, CheckpointManager, CircuitBreakerMetrics, CircuitBreakerRegistry,
    ItemProcessor, QuotaTracker, RetryQueue, SqliteCheckpointRepository,
    SqliteRetryQueueRepository, TokenBucket,
};
use sqlx::SqlitePool;
use tracing::{info, instrument};

use crate::playlist::TrackResolutionProcessor;

/// Batch operation name recorded on playlist build checkpoints.
pub const PLAYLIST_BUILD_OPERATION: &str = "playlist_build";

/// Collaborators the host supplies.
pub struct CoreDependencies {
    pub search_provider: Arc<dyn MediaSearchProvider>,
    pub query_strategies: Arc<dyn QueryStrategyProvider>,
    pub clock: Arc<dyn Clock>,
}

impl CoreDependencies {
    /// Dependencies with the default query strategies and the system clock.
    pub fn new(search_provider: Arc<dyn MediaSearchProvider>) -> Self {
        Self {
            search_provider,
            query_strategies: Arc::new(BasicQueryStrategies),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_query_strategies(mut self, strategies: Arc<dyn QueryStrategyProvider>) -> Self {
        self.query_strategies = strategies;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<CoreConfig>,
    pool: SqlitePool,
    event_bus: EventBus,
    breakers: Arc<CircuitBreakerRegistry>,
    quota: Arc<QuotaTracker>,
    rate_limiter: Arc<TokenBucket>,
    match_cache: Arc<dyn MatchCacheRepository>,
    resolver: Arc<MatchResolver>,
    checkpoints: Arc<CheckpointManager>,
    retry_queue: Arc<RetryQueue>,
    batch: Arc<BatchProcessor>,
}

impl SyncEngine {
    /// Validate `config`, open the database and wire every component.
    #[instrument(skip_all, fields(in_memory = config.database_path.is_none()))]
    pub async fn bootstrap(config: CoreConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;

        let db_config = match &config.database_path {
            Some(path) => DatabaseConfig::new(path).max_connections(config.database_max_connections),
            None => DatabaseConfig::in_memory(),
        };
        let pool = create_pool(db_config)
            .await
            .map_err(|e| CoreError::InitializationFailed(format!("database: {}", e)))?;

        Self::with_pool(config, deps, pool)
    }

    /// Wire every component over an existing, migrated pool.
    pub fn with_pool(config: CoreConfig, deps: CoreDependencies, pool: SqlitePool) -> Result<Self> {
        config.validate()?;

        let CoreDependencies {
            search_provider,
            query_strategies,
            clock,
        } = deps;

        let event_bus = EventBus::new(config.event_buffer_size);

        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone(), Arc::clone(&clock))
                .with_event_bus(event_bus.clone()),
        );
        let quota = Arc::new(QuotaTracker::new(config.quota.clone(), Arc::clone(&clock)));
        let rate_limiter = Arc::new(TokenBucket::new(config.rate_limit.clone())?);

        let search = Arc::new(
            GuardedSearch::from_registry(search_provider, &breakers, Arc::clone(&quota))
                .with_rate_limiter(Arc::clone(&rate_limiter)),
        );

        let match_cache: Arc<dyn MatchCacheRepository> =
            Arc::new(SqliteMatchCacheRepository::new(pool.clone()));
        let unmatched: Arc<dyn UnmatchedRepository> =
            Arc::new(SqliteUnmatchedRepository::new(pool.clone()));

        let resolver = Arc::new(
            MatchResolver::new(
                Arc::clone(&match_cache),
                unmatched,
                query_strategies,
                search,
                Arc::clone(&clock),
                config.matching.clone(),
            )
            .with_event_bus(event_bus.clone()),
        );

        let checkpoints = Arc::new(
            CheckpointManager::new(
                Arc::new(SqliteCheckpointRepository::new(pool.clone())),
                Arc::clone(&clock),
                config.checkpoint.clone(),
            )
            .with_event_bus(event_bus.clone()),
        );
        let retry_queue = Arc::new(
            RetryQueue::new(
                Arc::new(SqliteRetryQueueRepository::new(pool.clone())),
                Arc::clone(&clock),
                config.retry.clone(),
            )
            .with_event_bus(event_bus.clone()),
        );
        let batch = Arc::new(
            BatchProcessor::new(
                Arc::clone(&checkpoints),
                Arc::clone(&retry_queue),
                config.scheduler.clone(),
            )
            .with_event_bus(event_bus.clone()),
        );

        info!(
            max_concurrent = config.scheduler.max_concurrent,
            match_threshold = config.matching.match_threshold,
            "Sync engine ready"
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
            event_bus,
            breakers,
            quota,
            rate_limiter,
            match_cache,
            resolver,
            checkpoints,
            retry_queue,
            batch,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_stream(&self) -> EventStream {
        self.event_bus.stream()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn rate_limiter(&self) -> &Arc<TokenBucket> {
        &self.rate_limiter
    }

    pub fn resolver(&self) -> &Arc<MatchResolver> {
        &self.resolver
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub fn batch_processor(&self) -> &Arc<BatchProcessor> {
        &self.batch
    }

    pub fn breaker_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        self.breakers.all_metrics()
    }

    /// Run (or resume) an arbitrary batch.
    pub async fn run_batch(
        &self,
        sync_id: &str,
        operation: &str,
        items: &[String],
        processor: Arc<dyn ItemProcessor>,
    ) -> Result<BatchReport> {
        Ok(self.batch.run(sync_id, operation, items, processor).await?)
    }

    /// Resolve every track of a playlist as one resumable batch.
    ///
    /// Catalog entry ids must be unique within `tracks`.
    #[instrument(skip(self, tracks), fields(tracks = tracks.len()))]
    pub async fn build_playlist(
        &self,
        sync_id: &str,
        playlist_context: &str,
        tracks: &[PlaylistTrack],
    ) -> Result<PlaylistBuild> {
        let mut seen = HashSet::with_capacity(tracks.len());
        for track in tracks {
            if !seen.insert(track.catalog_entry_id.as_str()) {
                return Err(MatchError::InvalidInput {
                    field: "catalog_entry_id".to_string(),
                    message: format!("duplicate entry {}", track.catalog_entry_id),
                }
                .into());
            }
        }

        let items: Vec<String> = tracks.iter().map(|t| t.catalog_entry_id.clone()).collect();
        let processor = Arc::new(TrackResolutionProcessor::new(
            Arc::clone(&self.resolver),
            playlist_context,
            tracks,
        ));

        let report = self
            .batch
            .run(
                sync_id,
                PLAYLIST_BUILD_OPERATION,
                &items,
                Arc::clone(&processor) as Arc<dyn ItemProcessor>,
            )
            .await?;

        let mut external_ids = Vec::new();
        let mut unmatched = Vec::new();
        for track in tracks {
            let found = match processor.resolved(&track.catalog_entry_id) {
                Some(id) => Some(id),
                None => self
                    .match_cache
                    .find(&track.catalog_entry_id, &track.track.title)
                    .await?
                    .map(|hit| hit.external_id),
            };
            match found {
                Some(id) => external_ids.push(id),
                None => unmatched.push(track.catalog_entry_id.clone()),
            }
        }

        info!(
            sync_id,
            matched = external_ids.len(),
            unmatched = unmatched.len(),
            status = %report.status,
            "Playlist build finished"
        );

        Ok(PlaylistBuild {
            report,
            external_ids,
            unmatched,
        })
    }

    /// Delete completed checkpoints older than the retention window.
    pub async fn purge_expired_checkpoints(&self) -> Result<u64> {
        Ok(self.checkpoints.purge_expired().await?)
    }

    /// Close the database pool. Clones of this engine become unusable.
    pub async fn shutdown(&self) {
        self.pool.close().await;
        info!("Sync engine shut down");
    }
}
