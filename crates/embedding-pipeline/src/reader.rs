use async_trait::async_trait;
use checkpoint_store::{PlaceRepository, PlaceRepositoryError};
use pipeline_engine::{ClassifiedError, ErrorClass, Reader};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("place repository error: {0}")]
pub struct EligibilityError(#[from] PlaceRepositoryError);

impl ClassifiedError for EligibilityError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Reads place ids with `crawl_status = COMPLETED, embed_status = PENDING`
/// in ascending `id` order (spec.md §4.6). Single cursor, no partitioning —
/// the embedding service is rate-limited so there is exactly one consumer.
pub struct EligiblePlaceReader<Repo: PlaceRepository> {
    repo: Arc<Repo>,
    cursor: i64,
}

impl<Repo: PlaceRepository> EligiblePlaceReader<Repo> {
    pub fn new(repo: Arc<Repo>) -> Self {
        Self { repo, cursor: 0 }
    }

    /// Resumes from a prior run's high-water mark rather than rescanning
    /// from the start of the table.
    pub fn resume_after(repo: Arc<Repo>, last_id: i64) -> Self {
        Self { repo, cursor: last_id }
    }
}

#[async_trait]
impl<Repo: PlaceRepository> Reader<i64> for EligiblePlaceReader<Repo> {
    type Error = EligibilityError;

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<i64>, EligibilityError> {
        let ids = self
            .repo
            .eligible_for_embedding(self.cursor, max as i64)
            .await?;
        if let Some(&last) = ids.last() {
            self.cursor = last;
        }
        Ok(ids)
    }
}
