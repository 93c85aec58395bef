//! Worker-modulo crawl job: pages through `work-partitioner`'s keyset scan,
//! crawls each place through `CrawlerClient`, and writes the COMPLETED/FAILED
//! outcome back onto `places.crawl_status` (spec.md §4.1).

use crate::crawler::CrawlerClient;
use async_trait::async_trait;
use checkpoint_store::PlaceRepository;
use pipeline_engine::{ClassifiedError, EngineError, ErrorClass, Processor, Reader, Writer};
use std::sync::Arc;
use work_partitioner::PartitionedReader;

#[derive(Debug, thiserror::Error)]
#[error("partitioned read failed: {0}")]
pub struct PartitionReadError(#[from] sqlx::Error);

impl ClassifiedError for PartitionReadError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Wraps a `work-partitioner::PartitionedReader` page stream into a
/// `pipeline_engine::Reader<i64>` by concatenating pages until `max` ids are
/// buffered or a page comes back empty (end of this worker's partition).
pub struct PartitionedCrawlReader<R: PartitionedReader> {
    inner: R,
}

impl<R: PartitionedReader> PartitionedCrawlReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: PartitionedReader> Reader<i64> for PartitionedCrawlReader<R> {
    type Error = PartitionReadError;

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<i64>, Self::Error> {
        let mut chunk = Vec::with_capacity(max);
        while chunk.len() < max {
            let page = self.inner.next_page().await?;
            if page.is_empty() {
                break;
            }
            chunk.extend(page);
        }
        Ok(chunk)
    }
}

#[derive(Debug, Clone)]
pub struct PlaceCrawlOutcome {
    pub place_id: i64,
    pub success: bool,
    pub error: Option<String>,
}

pub struct PlaceCrawlProcessor<C: CrawlerClient> {
    crawler: Arc<C>,
}

impl<C: CrawlerClient> PlaceCrawlProcessor<C> {
    pub fn new(crawler: Arc<C>) -> Self {
        Self { crawler }
    }
}

#[async_trait]
impl<C: CrawlerClient> Processor<i64, PlaceCrawlOutcome> for PlaceCrawlProcessor<C> {
    type Error = EngineError;

    async fn process(&self, place_id: i64) -> Result<Option<PlaceCrawlOutcome>, EngineError> {
        let outcome = match self.crawler.crawl_place(place_id).await {
            Ok(()) => PlaceCrawlOutcome {
                place_id,
                success: true,
                error: None,
            },
            Err(err) => PlaceCrawlOutcome {
                place_id,
                success: false,
                error: Some(err.to_string()),
            },
        };
        Ok(Some(outcome))
    }
}

pub struct PlaceCrawlWriter<Repo: PlaceRepository> {
    repo: Arc<Repo>,
}

impl<Repo: PlaceRepository> PlaceCrawlWriter<Repo> {
    pub fn new(repo: Arc<Repo>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<Repo: PlaceRepository> Writer<PlaceCrawlOutcome> for PlaceCrawlWriter<Repo> {
    type Error = EngineError;

    async fn write(&self, chunk: Vec<PlaceCrawlOutcome>) -> Result<(), EngineError> {
        for outcome in chunk {
            let status = if outcome.success { "COMPLETED" } else { "FAILED" };
            self.repo
                .mark_crawl_status(outcome.place_id, status)
                .await
                .map_err(|err| EngineError::transient(err.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_store::MemPlaceRepository;
    use pipeline_engine::{ChunkEngine, EngineStatus, JobSpec, RetryPolicy, TaskExecutor};
    use tokio_util::sync::CancellationToken;

    struct FixedPages(std::sync::Mutex<Vec<Vec<i64>>>);

    #[async_trait]
    impl PartitionedReader for FixedPages {
        async fn next_page(&mut self) -> Result<Vec<i64>, sqlx::Error> {
            Ok(self.0.lock().unwrap().pop().unwrap_or_default())
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl CrawlerClient for AlwaysSucceeds {
        async fn crawl_region(&self, _region_code: &str, _region_type: &str) -> Result<i64, EngineError> {
            Ok(0)
        }
        async fn crawl_place(&self, _place_id: i64) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn partitioned_crawl_marks_owned_places_completed() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(3, "PENDING", checkpoint_store::EmbedStatus::Pending);
        repo.seed(6, "PENDING", checkpoint_store::EmbedStatus::Pending);

        // the fake pops from the back, so the last page pushed is the first
        // one returned: [3, 6] then an empty page signaling end-of-stream.
        let pages = FixedPages(std::sync::Mutex::new(vec![vec![], vec![3, 6]]));

        let spec = JobSpec {
            reader: PartitionedCrawlReader::new(pages),
            processor: PlaceCrawlProcessor::new(Arc::new(AlwaysSucceeds)),
            writer: PlaceCrawlWriter::new(repo.clone()),
            chunk_size: 10,
            skip_limit: 0,
            retry_policy: RetryPolicy::default(),
            task_executor: TaskExecutor::Sequential,
            stop_token: CancellationToken::new(),
        };
        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Completed);
        assert_eq!(report.counters.written, 2);
        assert_eq!(repo.get(3).unwrap().crawl_status, "COMPLETED");
        assert_eq!(repo.get(6).unwrap().crawl_status, "COMPLETED");
    }
}
