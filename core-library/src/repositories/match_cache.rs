//! Match cache persistence.

use crate::error::Result;
use crate::models::CachedMatch;
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, instrument};

#[async_trait]
pub trait MatchCacheRepository: Send + Sync {
    /// Look up the cached match for a catalog entry and expected title.
    async fn find(&self, catalog_entry_id: &str, track_title: &str)
        -> Result<Option<CachedMatch>>;

    /// Insert or overwrite the row for the match's key.
    async fn upsert(&self, entry: &CachedMatch) -> Result<()>;

    /// Remove a cached match. Returns whether a row existed.
    async fn delete(&self, catalog_entry_id: &str, track_title: &str) -> Result<bool>;

    async fn count(&self) -> Result<u64>;
}

pub struct SqliteMatchCacheRepository {
    pool: SqlitePool,
}

impl SqliteMatchCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct MatchCacheRow {
    catalog_entry_id: String,
    track_title: String,
    external_id: String,
    confidence: f64,
    matched_title: String,
    matched_artist: Option<String>,
    created_at: i64,
}

impl From<MatchCacheRow> for CachedMatch {
    fn from(row: MatchCacheRow) -> Self {
        CachedMatch {
            catalog_entry_id: row.catalog_entry_id,
            track_title: row.track_title,
            external_id: row.external_id,
            confidence: row.confidence,
            matched_title: row.matched_title,
            matched_artist: row.matched_artist,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl MatchCacheRepository for SqliteMatchCacheRepository {
    async fn find(
        &self,
        catalog_entry_id: &str,
        track_title: &str,
    ) -> Result<Option<CachedMatch>> {
        let row = sqlx::query_as::<_, MatchCacheRow>(
            r#"
            SELECT catalog_entry_id, track_title, external_id, confidence,
                   matched_title, matched_artist, created_at
            FROM match_cache
            WHERE catalog_entry_id = ? AND track_title = ?
            "#,
        )
        .bind(catalog_entry_id)
        .bind(track_title)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CachedMatch::from))
    }

    #[instrument(skip(self, entry), fields(catalog_entry_id = %entry.catalog_entry_id))]
    async fn upsert(&self, entry: &CachedMatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO match_cache (
                catalog_entry_id, track_title, external_id, confidence,
                matched_title, matched_artist, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (catalog_entry_id, track_title) DO UPDATE SET
                external_id = excluded.external_id,
                confidence = excluded.confidence,
                matched_title = excluded.matched_title,
                matched_artist = excluded.matched_artist,
                created_at = excluded.created_at
            "#,
        )
        .bind(&entry.catalog_entry_id)
        .bind(&entry.track_title)
        .bind(&entry.external_id)
        .bind(entry.confidence)
        .bind(&entry.matched_title)
        .bind(&entry.matched_artist)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        debug!(external_id = %entry.external_id, "Match cached");
        Ok(())
    }

    async fn delete(&self, catalog_entry_id: &str, track_title: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM match_cache WHERE catalog_entry_id = ? AND track_title = ?")
                .bind(catalog_entry_id)
                .bind(track_title)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM match_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
