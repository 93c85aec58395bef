//! Region-sweep crawl job: claims regions from `checkpoint-store`, crawls
//! each through `CrawlerClient`, and commits the COMPLETED/FAILED outcome
//! back onto the same checkpoint row (spec.md §4.2).

use crate::crawler::CrawlerClient;
use async_trait::async_trait;
use checkpoint_store::{CheckpointError, CheckpointStore, ExecutionStatus, RegionCheckpoint, RegionType};
use pipeline_engine::{
    ChunkEngine, ClassifiedError, EngineError, EngineReport, EngineStatus, ErrorClass, JobSpec, Processor,
    Reader, RetryPolicy, TaskExecutor, Writer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct CheckpointReadError(#[from] CheckpointError);

impl ClassifiedError for CheckpointReadError {
    fn class(&self) -> ErrorClass {
        match &self.0 {
            CheckpointError::Database(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

/// One region's crawl outcome, carried from `process` to `write` so the
/// writer can flip the checkpoint to COMPLETED or FAILED without re-deriving
/// anything from the crawler.
#[derive(Debug, Clone)]
pub struct RegionOutcome {
    pub id: i64,
    pub processed_count: i64,
    pub failure: Option<String>,
}

pub struct RegionCheckpointReader<S: CheckpointStore> {
    store: Arc<S>,
    batch_name: String,
    region_type: RegionType,
}

impl<S: CheckpointStore> RegionCheckpointReader<S> {
    pub fn new(store: Arc<S>, batch_name: impl Into<String>, region_type: RegionType) -> Self {
        Self {
            store,
            batch_name: batch_name.into(),
            region_type,
        }
    }
}

#[async_trait]
impl<S: CheckpointStore> Reader<RegionCheckpoint> for RegionCheckpointReader<S> {
    type Error = CheckpointReadError;

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<RegionCheckpoint>, Self::Error> {
        let mut chunk = Vec::with_capacity(max);
        while chunk.len() < max {
            match self.store.next_pending(&self.batch_name, self.region_type).await? {
                Some(checkpoint) => chunk.push(checkpoint),
                None => break,
            }
        }
        Ok(chunk)
    }
}

pub struct RegionCrawlProcessor<C: CrawlerClient> {
    crawler: Arc<C>,
}

impl<C: CrawlerClient> RegionCrawlProcessor<C> {
    pub fn new(crawler: Arc<C>) -> Self {
        Self { crawler }
    }
}

#[async_trait]
impl<C: CrawlerClient> Processor<RegionCheckpoint, RegionOutcome> for RegionCrawlProcessor<C> {
    type Error = EngineError;

    async fn process(&self, checkpoint: RegionCheckpoint) -> Result<Option<RegionOutcome>, EngineError> {
        let outcome = match self
            .crawler
            .crawl_region(&checkpoint.region_code, checkpoint.region_type.as_str())
            .await
        {
            Ok(processed_count) => RegionOutcome {
                id: checkpoint.id,
                processed_count,
                failure: None,
            },
            Err(err) => RegionOutcome {
                id: checkpoint.id,
                processed_count: 0,
                failure: Some(err.to_string()),
            },
        };
        Ok(Some(outcome))
    }
}

pub struct RegionCheckpointWriter<S: CheckpointStore> {
    store: Arc<S>,
}

impl<S: CheckpointStore> RegionCheckpointWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: CheckpointStore> Writer<RegionOutcome> for RegionCheckpointWriter<S> {
    type Error = CheckpointReadError;

    async fn write(&self, chunk: Vec<RegionOutcome>) -> Result<(), Self::Error> {
        for outcome in chunk {
            match outcome.failure {
                None => self.store.mark_completed(outcome.id, outcome.processed_count).await?,
                Some(message) => self.store.mark_failed(outcome.id, &message).await?,
            }
        }
        Ok(())
    }
}

/// Runs the three region levels in sequence for one worker (spec.md §4.2:
/// a sweep worker exhausts SIDO, then SIGUNGU, then DONG before finishing).
/// Stops early and returns the failing/stopped stage's report if a level
/// doesn't reach `Completed`, so a DB outage on SIDO never starts SIGUNGU.
///
/// Wraps the sweep in the batch's execution lifecycle: a region left
/// PROCESSING by a crashed prior run is reset to PENDING before claiming
/// starts (spec.md §8 scenario 2, "resume after crash"), `start_execution`
/// enforces the single-flight guarantee for `batch_name` (spec.md §4.2), and
/// `finish_execution` always closes out the execution record whether the
/// sweep completes, fails, or is stopped.
pub async fn run_region_sweep_for_batch<S, C>(
    store: Arc<S>,
    crawler: Arc<C>,
    batch_name: &str,
    chunk_size: usize,
    stop_token: CancellationToken,
) -> EngineReport
where
    S: CheckpointStore,
    C: CrawlerClient,
{
    if store.has_interrupted(batch_name).await.unwrap_or(false) {
        match store.reset_processing_to_pending(batch_name).await {
            Ok(count) if count > 0 => {
                warn!(batch_name, count, "resuming regions left PROCESSING by a prior run");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(batch_name, error = %err, "failed to reset interrupted regions to pending");
            }
        }
    }

    let execution = match store.start_execution(batch_name).await {
        Ok(execution) => Some(execution),
        Err(CheckpointError::ConcurrentExecution { .. }) => {
            warn!(batch_name, "refusing to start sweep: an execution is already running");
            return EngineReport {
                status: EngineStatus::Failed,
                counters: pipeline_engine::EngineCounters::default(),
            };
        }
        Err(err) => {
            warn!(batch_name, error = %err, "failed to open a batch execution record");
            None
        }
    };

    let mut total = pipeline_engine::EngineCounters::default();
    let mut final_status = EngineStatus::Completed;
    for region_type in [RegionType::Sido, RegionType::Sigungu, RegionType::Dong] {
        let spec = JobSpec {
            reader: RegionCheckpointReader::new(store.clone(), batch_name, region_type),
            processor: RegionCrawlProcessor::new(crawler.clone()),
            writer: RegionCheckpointWriter::new(store.clone()),
            chunk_size,
            skip_limit: 0,
            retry_policy: RetryPolicy::default(),
            task_executor: TaskExecutor::Sequential,
            stop_token: stop_token.clone(),
        };
        let report = ChunkEngine::run(spec).await;
        total.read += report.counters.read;
        total.written += report.counters.written;
        total.skipped += report.counters.skipped;
        total.failed += report.counters.failed;

        if report.status != EngineStatus::Completed {
            final_status = report.status;
            break;
        }
    }

    if let Some(execution) = execution {
        let execution_status = match final_status {
            EngineStatus::Completed => ExecutionStatus::Completed,
            EngineStatus::Failed => ExecutionStatus::Failed,
            EngineStatus::Stopped => ExecutionStatus::Interrupted,
        };
        if let Err(err) = store.finish_execution(execution.execution_id, execution_status).await {
            warn!(batch_name, error = %err, "failed to close out batch execution record");
        } else {
            info!(batch_name, status = execution_status.as_str(), "batch execution closed out");
        }
    }

    EngineReport {
        status: final_status,
        counters: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_store::{MemCheckpointStore, RegionSeed};
    use pipeline_engine::{ChunkEngine, EngineStatus, JobSpec, RetryPolicy, TaskExecutor};
    use tokio_util::sync::CancellationToken;

    struct AlwaysFails;

    #[async_trait]
    impl CrawlerClient for AlwaysFails {
        async fn crawl_region(&self, _region_code: &str, _region_type: &str) -> Result<i64, EngineError> {
            Err(EngineError::transient("crawler timed out"))
        }
        async fn crawl_place(&self, _place_id: i64) -> Result<(), EngineError> {
            Err(EngineError::transient("crawler timed out"))
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl CrawlerClient for AlwaysSucceeds {
        async fn crawl_region(&self, _region_code: &str, _region_type: &str) -> Result<i64, EngineError> {
            Ok(42)
        }
        async fn crawl_place(&self, _place_id: i64) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn seed(code: &str) -> RegionSeed {
        RegionSeed {
            region_type: RegionType::Sido,
            region_code: code.to_string(),
            region_name: format!("region-{code}"),
            parent_code: None,
        }
    }

    fn seed_at(region_type: RegionType, code: &str) -> RegionSeed {
        RegionSeed {
            region_type,
            region_code: code.to_string(),
            region_name: format!("region-{code}"),
            parent_code: None,
        }
    }

    #[tokio::test]
    async fn sweep_for_batch_covers_all_three_levels() {
        let store = Arc::new(MemCheckpointStore::new());
        store
            .initialize(
                "batch-a",
                vec![
                    seed_at(RegionType::Sido, "11"),
                    seed_at(RegionType::Sigungu, "1101"),
                    seed_at(RegionType::Dong, "110101"),
                ],
            )
            .await
            .unwrap();

        let report = run_region_sweep_for_batch(
            store.clone(),
            Arc::new(AlwaysSucceeds),
            "batch-a",
            10,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report.status, EngineStatus::Completed);
        assert_eq!(report.counters.written, 3);

        // the execution record was opened and closed out, not left RUNNING.
        let second = run_region_sweep_for_batch(
            store.clone(),
            Arc::new(AlwaysSucceeds),
            "batch-a",
            10,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(second.status, EngineStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_sweep_of_the_same_batch_is_refused() {
        let store = Arc::new(MemCheckpointStore::new());
        store.initialize("batch-a", vec![seed("11")]).await.unwrap();
        store.start_execution("batch-a").await.unwrap();

        let report = run_region_sweep_for_batch(
            store.clone(),
            Arc::new(AlwaysSucceeds),
            "batch-a",
            10,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report.status, EngineStatus::Failed);
        // the region itself was never touched since the sweep never started.
        let progress = store.progress("batch-a").await.unwrap();
        assert_eq!(progress.pending, 1);
    }

    #[tokio::test]
    async fn region_left_processing_by_a_crashed_run_is_resumed() {
        let store = Arc::new(MemCheckpointStore::new());
        store.initialize("batch-a", vec![seed("11")]).await.unwrap();
        // simulate a crash: claim the region (-> PROCESSING) and abandon it
        // without ever calling mark_completed/mark_failed or finish_execution.
        store.next_pending("batch-a", RegionType::Sido).await.unwrap();
        assert!(store.has_interrupted("batch-a").await.unwrap());

        let report = run_region_sweep_for_batch(
            store.clone(),
            Arc::new(AlwaysSucceeds),
            "batch-a",
            10,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report.status, EngineStatus::Completed);
        let progress = store.progress("batch-a").await.unwrap();
        assert_eq!(progress.completed, 1);
    }

    #[tokio::test]
    async fn sweep_marks_every_region_completed() {
        let store = Arc::new(MemCheckpointStore::new());
        store
            .initialize("batch-a", vec![seed("11"), seed("26")])
            .await
            .unwrap();

        let spec = JobSpec {
            reader: RegionCheckpointReader::new(store.clone(), "batch-a", RegionType::Sido),
            processor: RegionCrawlProcessor::new(Arc::new(AlwaysSucceeds)),
            writer: RegionCheckpointWriter::new(store.clone()),
            chunk_size: 10,
            skip_limit: 0,
            retry_policy: RetryPolicy::default(),
            task_executor: TaskExecutor::Sequential,
            stop_token: CancellationToken::new(),
        };
        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Completed);
        assert_eq!(report.counters.written, 2);

        let progress = store.progress("batch-a").await.unwrap();
        assert_eq!(progress.completed, 2);
    }

    #[tokio::test]
    async fn crawler_failure_marks_region_failed_not_engine_failed() {
        let store = Arc::new(MemCheckpointStore::new());
        store.initialize("batch-a", vec![seed("11")]).await.unwrap();

        let spec = JobSpec {
            reader: RegionCheckpointReader::new(store.clone(), "batch-a", RegionType::Sido),
            processor: RegionCrawlProcessor::new(Arc::new(AlwaysFails)),
            writer: RegionCheckpointWriter::new(store.clone()),
            chunk_size: 10,
            skip_limit: 0,
            retry_policy: RetryPolicy::default(),
            task_executor: TaskExecutor::Sequential,
            stop_token: CancellationToken::new(),
        };
        let report = ChunkEngine::run(spec).await;
        assert_eq!(report.status, EngineStatus::Completed);

        let progress = store.progress("batch-a").await.unwrap();
        assert_eq!(progress.failed, 1);
    }
}
