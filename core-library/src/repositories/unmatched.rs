//! Unmatched record persistence.
//!
//! Rows are keyed by (playlist context, catalog entry, track title). Writing a
//! record again refreshes its near-misses while it is still pending; once a
//! reviewer resolves or skips it, later writes leave it untouched.

use crate::error::{LibraryError, Result};
use crate::models::{NearMiss, UnmatchedRecord, UnmatchedRecordId, UnmatchedStatus};
use async_trait::async_trait;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};

#[async_trait]
pub trait UnmatchedRepository: Send + Sync {
    /// Insert a pending record, or refresh the pending record with the same
    /// key. Terminal records are preserved. Returns the stored row.
    async fn upsert_pending(&self, record: &UnmatchedRecord) -> Result<UnmatchedRecord>;

    async fn find_by_id(&self, id: &UnmatchedRecordId) -> Result<Option<UnmatchedRecord>>;

    async fn find_by_key(
        &self,
        playlist_context: &str,
        catalog_entry_id: &str,
        track_title: &str,
    ) -> Result<Option<UnmatchedRecord>>;

    /// Records with `status`, oldest first. `playlist_context` narrows the result.
    async fn find_by_status(
        &self,
        status: UnmatchedStatus,
        playlist_context: Option<&str>,
    ) -> Result<Vec<UnmatchedRecord>>;

    /// pending -> resolved
    async fn mark_resolved(
        &self,
        id: &UnmatchedRecordId,
        external_id: &str,
        now: i64,
    ) -> Result<UnmatchedRecord>;

    /// pending -> skipped
    async fn mark_skipped(&self, id: &UnmatchedRecordId, now: i64) -> Result<UnmatchedRecord>;
}

pub struct SqliteUnmatchedRepository {
    pool: SqlitePool,
}

impl SqliteUnmatchedRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn require(&self, id: &UnmatchedRecordId) -> Result<UnmatchedRecord> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| LibraryError::NotFound {
                entity_type: "UnmatchedRecord".to_string(),
                id: id.to_string(),
            })
    }

    /// Apply a status change guarded by `status = 'pending'`. A zero row update
    /// means the record is missing or already terminal.
    async fn transition(
        &self,
        id: &UnmatchedRecordId,
        to: UnmatchedStatus,
        external_id: Option<&str>,
        now: i64,
    ) -> Result<UnmatchedRecord> {
        let result = sqlx::query(
            r#"
            UPDATE unmatched_tracks
            SET status = ?, resolved_external_id = ?, resolved_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(to.as_str())
        .bind(external_id)
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        let record = self.require(id).await?;
        if result.rows_affected() == 0 {
            return Err(LibraryError::InvalidStateTransition {
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }

        info!(record_id = %id, status = %to, "Unmatched record reviewed");
        Ok(record)
    }
}

#[derive(Debug, FromRow)]
struct UnmatchedRow {
    id: String,
    playlist_context: String,
    catalog_entry_id: String,
    track_title: String,
    artist: String,
    near_misses: String,
    strategies_tried: i64,
    status: String,
    resolved_external_id: Option<String>,
    resolved_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<UnmatchedRow> for UnmatchedRecord {
    type Error = LibraryError;

    fn try_from(row: UnmatchedRow) -> Result<Self> {
        let id = UnmatchedRecordId::from_string(&row.id).map_err(|e| {
            LibraryError::InvalidInput {
                field: "id".to_string(),
                message: e.to_string(),
            }
        })?;
        let near_misses: Vec<NearMiss> = serde_json::from_str(&row.near_misses)?;

        Ok(UnmatchedRecord {
            id,
            playlist_context: row.playlist_context,
            catalog_entry_id: row.catalog_entry_id,
            track_title: row.track_title,
            artist: row.artist,
            near_misses,
            strategies_tried: row.strategies_tried.max(0) as u32,
            status: row.status.parse()?,
            resolved_external_id: row.resolved_external_id,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, playlist_context, catalog_entry_id, track_title, artist,
           near_misses, strategies_tried, status, resolved_external_id,
           resolved_at, created_at, updated_at
    FROM unmatched_tracks
"#;

#[async_trait]
impl UnmatchedRepository for SqliteUnmatchedRepository {
    async fn upsert_pending(&self, record: &UnmatchedRecord) -> Result<UnmatchedRecord> {
        let near_misses = serde_json::to_string(&record.near_misses)?;

        sqlx::query(
            r#"
            INSERT INTO unmatched_tracks (
                id, playlist_context, catalog_entry_id, track_title, artist,
                near_misses, strategies_tried, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT (playlist_context, catalog_entry_id, track_title) DO UPDATE SET
                artist = excluded.artist,
                near_misses = excluded.near_misses,
                strategies_tried = excluded.strategies_tried,
                updated_at = excluded.updated_at
            WHERE unmatched_tracks.status = 'pending'
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.playlist_context)
        .bind(&record.catalog_entry_id)
        .bind(&record.track_title)
        .bind(&record.artist)
        .bind(near_misses)
        .bind(record.strategies_tried as i64)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        let stored = self
            .find_by_key(
                &record.playlist_context,
                &record.catalog_entry_id,
                &record.track_title,
            )
            .await?
            .ok_or_else(|| LibraryError::NotFound {
                entity_type: "UnmatchedRecord".to_string(),
                id: record.id.to_string(),
            })?;

        debug!(
            record_id = %stored.id,
            status = %stored.status,
            near_misses = stored.near_misses.len(),
            "Unmatched record written"
        );
        Ok(stored)
    }

    async fn find_by_id(&self, id: &UnmatchedRecordId) -> Result<Option<UnmatchedRecord>> {
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, UnmatchedRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(UnmatchedRecord::try_from).transpose()
    }

    async fn find_by_key(
        &self,
        playlist_context: &str,
        catalog_entry_id: &str,
        track_title: &str,
    ) -> Result<Option<UnmatchedRecord>> {
        let sql = format!(
            "{} WHERE playlist_context = ? AND catalog_entry_id = ? AND track_title = ?",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, UnmatchedRow>(&sql)
            .bind(playlist_context)
            .bind(catalog_entry_id)
            .bind(track_title)
            .fetch_optional(&self.pool)
            .await?;

        row.map(UnmatchedRecord::try_from).transpose()
    }

    async fn find_by_status(
        &self,
        status: UnmatchedStatus,
        playlist_context: Option<&str>,
    ) -> Result<Vec<UnmatchedRecord>> {
        let sql = format!(
            "{} WHERE status = ? AND (? IS NULL OR playlist_context = ?) ORDER BY created_at, rowid",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, UnmatchedRow>(&sql)
            .bind(status.as_str())
            .bind(playlist_context)
            .bind(playlist_context)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(UnmatchedRecord::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn mark_resolved(
        &self,
        id: &UnmatchedRecordId,
        external_id: &str,
        now: i64,
    ) -> Result<UnmatchedRecord> {
        self.transition(id, UnmatchedStatus::Resolved, Some(external_id), now)
            .await
    }

    async fn mark_skipped(&self, id: &UnmatchedRecordId, now: i64) -> Result<UnmatchedRecord> {
        self.transition(id, UnmatchedStatus::Skipped, None, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    fn near_miss(id: &str, confidence: f64) -> NearMiss {
        NearMiss {
            external_id: id.to_string(),
            title: format!("candidate {}", id),
            uploader_handle: "Someone".to_string(),
            duration_millis: Some(200_000),
            confidence,
        }
    }

    async fn repo() -> SqliteUnmatchedRepository {
        SqliteUnmatchedRepository::new(create_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_upsert_inserts_pending() {
        let repo = repo().await;
        let record = UnmatchedRecord::pending("mix", "cat-1", "Song", "Band", 10)
            .with_near_misses(vec![near_miss("a", 0.5), near_miss("b", 0.4)])
            .with_strategies_tried(3);

        let stored = repo.upsert_pending(&record).await.unwrap();
        assert_eq!(stored.id, record.id);
        assert_eq!(stored.status, UnmatchedStatus::Pending);
        assert_eq!(stored.near_misses.len(), 2);
        assert_eq!(stored.strategies_tried, 3);
    }

    #[tokio::test]
    async fn test_upsert_refreshes_pending_record() {
        let repo = repo().await;
        let first = UnmatchedRecord::pending("mix", "cat-1", "Song", "Band", 10)
            .with_strategies_tried(1);
        let original = repo.upsert_pending(&first).await.unwrap();

        let second = UnmatchedRecord::pending("mix", "cat-1", "Song", "Band", 20)
            .with_near_misses(vec![near_miss("c", 0.45)])
            .with_strategies_tried(2);
        let refreshed = repo.upsert_pending(&second).await.unwrap();

        assert_eq!(refreshed.id, original.id);
        assert_eq!(refreshed.strategies_tried, 2);
        assert_eq!(refreshed.near_misses, vec![near_miss("c", 0.45)]);
        assert_eq!(refreshed.updated_at, 20);
    }

    #[tokio::test]
    async fn test_terminal_record_not_reopened() {
        let repo = repo().await;
        let stored = repo
            .upsert_pending(&UnmatchedRecord::pending("mix", "cat-1", "Song", "Band", 10))
            .await
            .unwrap();
        repo.mark_skipped(&stored.id, 15).await.unwrap();

        let again = UnmatchedRecord::pending("mix", "cat-1", "Song", "Band", 30)
            .with_strategies_tried(4);
        let after = repo.upsert_pending(&again).await.unwrap();

        assert_eq!(after.status, UnmatchedStatus::Skipped);
        assert_eq!(after.strategies_tried, 0);
    }

    #[tokio::test]
    async fn test_mark_resolved_then_reject_second_transition() {
        let repo = repo().await;
        let stored = repo
            .upsert_pending(&UnmatchedRecord::pending("mix", "cat-1", "Song", "Band", 10))
            .await
            .unwrap();

        let resolved = repo.mark_resolved(&stored.id, "yt-9", 50).await.unwrap();
        assert_eq!(resolved.status, UnmatchedStatus::Resolved);
        assert_eq!(resolved.resolved_external_id.as_deref(), Some("yt-9"));
        assert_eq!(resolved.resolved_at, Some(50));

        let err = repo.mark_skipped(&stored.id, 60).await.unwrap_err();
        assert!(matches!(err, LibraryError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_on_missing_record() {
        let repo = repo().await;
        let err = repo
            .mark_skipped(&UnmatchedRecordId::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_find_by_status_filters_context() {
        let repo = repo().await;
        repo.upsert_pending(&UnmatchedRecord::pending("a", "1", "One", "X", 1))
            .await
            .unwrap();
        repo.upsert_pending(&UnmatchedRecord::pending("b", "2", "Two", "Y", 2))
            .await
            .unwrap();

        let all = repo
            .find_by_status(UnmatchedStatus::Pending, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let only_b = repo
            .find_by_status(UnmatchedStatus::Pending, Some("b"))
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].track_title, "Two");
    }
}
