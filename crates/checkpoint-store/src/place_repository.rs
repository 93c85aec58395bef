//! Narrow accessors onto the externally-owned `places` table. This core
//! only ever touches three columns on that table — `crawl_status`,
//! `embed_status`, and `id` — and never creates or drops it; the migrations
//! in this crate cover `batch_checkpoint`/`batch_execution_metadata` only.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaceRepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cannot set embed_status=COMPLETED for place {place_id} with crawl_status={crawl_status:?}")]
    EmbedRequiresCrawlComplete {
        place_id: i64,
        crawl_status: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedStatus {
    Pending,
    Completed,
    Failed,
}

impl EmbedStatus {
    fn as_str(self) -> &'static str {
        match self {
            EmbedStatus::Pending => "PENDING",
            EmbedStatus::Completed => "COMPLETED",
            EmbedStatus::Failed => "FAILED",
        }
    }
}

/// Lifecycle-flag reads/writes on `places`, shared by the crawl worker pool,
/// the embedding pipeline, and the update queue's push-from-crawl-status
/// path. Kept separate from `CheckpointStore` because it owns a different
/// table with a different write pattern (row-at-a-time, no PENDING ->
/// PROCESSING claim step — a place's crawl lifecycle is driven by the
/// external crawler, not by this core).
#[async_trait]
pub trait PlaceRepository: Send + Sync {
    async fn mark_crawl_status(
        &self,
        place_id: i64,
        status: &str,
    ) -> Result<(), PlaceRepositoryError>;

    /// Enforces the invariant `embed_status = COMPLETED => crawl_status =
    /// COMPLETED`: refuses to mark embedding complete for a place whose crawl
    /// never finished.
    async fn mark_embed_status(
        &self,
        place_id: i64,
        status: EmbedStatus,
    ) -> Result<(), PlaceRepositoryError>;

    /// Places with `crawl_status = COMPLETED` and `embed_status = PENDING`,
    /// ordered by `id` ascending starting strictly after `after_id`.
    async fn eligible_for_embedding(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, PlaceRepositoryError>;

    /// Places with `crawl_status = PENDING`, for seeding the update queue.
    async fn pending_ids_for_queue(&self, limit: i64) -> Result<Vec<i64>, PlaceRepositoryError>;
}

pub struct PgPlaceRepository {
    pool: sqlx::PgPool,
}

impl PgPlaceRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlaceRepository for PgPlaceRepository {
    async fn mark_crawl_status(
        &self,
        place_id: i64,
        status: &str,
    ) -> Result<(), PlaceRepositoryError> {
        sqlx::query("UPDATE places SET crawl_status = $2 WHERE id = $1")
            .bind(place_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_embed_status(
        &self,
        place_id: i64,
        status: EmbedStatus,
    ) -> Result<(), PlaceRepositoryError> {
        if status == EmbedStatus::Completed {
            let crawl_status: Option<(String,)> =
                sqlx::query_as("SELECT crawl_status FROM places WHERE id = $1")
                    .bind(place_id)
                    .fetch_optional(&self.pool)
                    .await?;
            let crawl_status = crawl_status.map(|(s,)| s).unwrap_or_default();
            if crawl_status != "COMPLETED" {
                return Err(PlaceRepositoryError::EmbedRequiresCrawlComplete {
                    place_id,
                    crawl_status,
                });
            }
        }

        sqlx::query("UPDATE places SET embed_status = $2 WHERE id = $1")
            .bind(place_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn eligible_for_embedding(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, PlaceRepositoryError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM places \
             WHERE crawl_status = 'COMPLETED' AND embed_status = 'PENDING' AND id > $1 \
             ORDER BY id ASC \
             LIMIT $2",
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn pending_ids_for_queue(&self, limit: i64) -> Result<Vec<i64>, PlaceRepositoryError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM places WHERE crawl_status = 'PENDING' ORDER BY id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// In-memory test double, keyed by place id. Seed rows directly via `rows`
/// before handing the repository to a pipeline under test.
#[derive(Default)]
pub struct MemPlaceRepository {
    rows: std::sync::Mutex<std::collections::BTreeMap<i64, MemPlaceRow>>,
}

#[derive(Debug, Clone)]
pub struct MemPlaceRow {
    pub crawl_status: String,
    pub embed_status: EmbedStatus,
}

impl MemPlaceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, place_id: i64, crawl_status: &str, embed_status: EmbedStatus) {
        self.rows.lock().unwrap().insert(
            place_id,
            MemPlaceRow {
                crawl_status: crawl_status.to_string(),
                embed_status,
            },
        );
    }

    pub fn get(&self, place_id: i64) -> Option<MemPlaceRow> {
        self.rows.lock().unwrap().get(&place_id).cloned()
    }
}

#[async_trait]
impl PlaceRepository for MemPlaceRepository {
    async fn mark_crawl_status(
        &self,
        place_id: i64,
        status: &str,
    ) -> Result<(), PlaceRepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.entry(place_id).or_insert(MemPlaceRow {
            crawl_status: "PENDING".to_string(),
            embed_status: EmbedStatus::Pending,
        });
        row.crawl_status = status.to_string();
        Ok(())
    }

    async fn mark_embed_status(
        &self,
        place_id: i64,
        status: EmbedStatus,
    ) -> Result<(), PlaceRepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.entry(place_id).or_insert(MemPlaceRow {
            crawl_status: "PENDING".to_string(),
            embed_status: EmbedStatus::Pending,
        });
        if status == EmbedStatus::Completed && row.crawl_status != "COMPLETED" {
            return Err(PlaceRepositoryError::EmbedRequiresCrawlComplete {
                place_id,
                crawl_status: row.crawl_status.clone(),
            });
        }
        row.embed_status = status;
        Ok(())
    }

    async fn eligible_for_embedding(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, PlaceRepositoryError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(id, row)| {
                **id > after_id && row.crawl_status == "COMPLETED" && row.embed_status == EmbedStatus::Pending
            })
            .map(|(id, _)| *id)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn pending_ids_for_queue(&self, limit: i64) -> Result<Vec<i64>, PlaceRepositoryError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(_, row)| row.crawl_status == "PENDING")
            .map(|(id, _)| *id)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_status_strings_round_trip_through_as_str() {
        assert_eq!(EmbedStatus::Pending.as_str(), "PENDING");
        assert_eq!(EmbedStatus::Completed.as_str(), "COMPLETED");
        assert_eq!(EmbedStatus::Failed.as_str(), "FAILED");
    }

    #[tokio::test]
    async fn mem_repository_enforces_embed_requires_crawl_complete() {
        let repo = MemPlaceRepository::new();
        repo.seed(1, "PENDING", EmbedStatus::Pending);
        let err = repo
            .mark_embed_status(1, EmbedStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlaceRepositoryError::EmbedRequiresCrawlComplete { .. }
        ));

        repo.mark_crawl_status(1, "COMPLETED").await.unwrap();
        repo.mark_embed_status(1, EmbedStatus::Completed)
            .await
            .unwrap();
        assert_eq!(repo.get(1).unwrap().embed_status, EmbedStatus::Completed);
    }

    #[tokio::test]
    async fn mem_repository_lists_eligible_places_in_order() {
        let repo = MemPlaceRepository::new();
        repo.seed(1, "COMPLETED", EmbedStatus::Pending);
        repo.seed(2, "PENDING", EmbedStatus::Pending);
        repo.seed(3, "COMPLETED", EmbedStatus::Pending);

        let eligible = repo.eligible_for_embedding(0, 10).await.unwrap();
        assert_eq!(eligible, vec![1, 3]);
    }
}
