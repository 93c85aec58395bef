//! Sequential embedding step: reads crawl-complete/embed-pending places,
//! turns each place's keywords into one embedding-service call, and commits
//! the resulting vectors alongside the `embed_status` flip (spec.md §4.6).
//!
//! This is the same `ChunkEngine` the crawl and update-queue steps use,
//! configured with `TaskExecutor::Sequential` and no worker partitioning —
//! the embedding service is rate-limited, so there is exactly one consumer,
//! the way the Sui indexer's sequential pipeline stage runs one committer
//! per checkpoint rather than fanning out.

mod client;
mod processor;
mod reader;
mod writer;

pub use client::{EmbeddingClient, PlaceKeywordSource, VectorSink};
pub use processor::{EmbeddingProcessor, PlaceEmbeddingBatch, PlaceEmbeddingOutcome};
pub use reader::{EligibilityError, EligiblePlaceReader};
pub use writer::EmbeddingWriter;

use checkpoint_store::PlaceRepository;
use pipeline_engine::{ChunkEngine, EngineReport, JobSpec, RetryPolicy, TaskExecutor};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("embedding service is unreachable: {0}")]
    ServiceUnavailable(String),
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub max_keywords_per_place: usize,
    pub skip_limit: u64,
    pub retry_policy: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_keywords_per_place: 8,
            skip_limit: 0,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Builds and runs the embedding step to completion. Performs the
/// pre-flight health check spec.md §4.6 requires before the engine is
/// allowed to start: an unreachable embedding service refuses the whole
/// step rather than burning through `skip_limit` on the first chunk.
pub async fn run_embedding_job<Repo, K, E, S>(
    places: Arc<Repo>,
    keywords: K,
    client: E,
    sink: S,
    config: EmbeddingConfig,
    stop_token: CancellationToken,
) -> Result<EngineReport, PipelineError>
where
    Repo: PlaceRepository + 'static,
    K: PlaceKeywordSource + 'static,
    E: EmbeddingClient + 'static,
    S: VectorSink + 'static,
{
    if let Err(err) = client.health_check().await {
        warn!(error = %err, "embedding service unreachable, refusing to start");
        return Err(PipelineError::ServiceUnavailable(err.to_string()));
    }

    let reader = EligiblePlaceReader::new(places.clone());
    let processor = EmbeddingProcessor::new(keywords, client, config.max_keywords_per_place);
    let writer = EmbeddingWriter::new(sink, places);

    let spec = JobSpec {
        reader,
        processor,
        writer,
        chunk_size: 1,
        skip_limit: config.skip_limit,
        retry_policy: config.retry_policy,
        task_executor: TaskExecutor::Sequential,
        stop_token,
    };

    Ok(ChunkEngine::run(spec).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use checkpoint_store::{EmbedStatus, MemPlaceRepository};
    use pipeline_engine::{EngineError, EngineStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedKeywords(HashMap<i64, Vec<String>>);

    #[async_trait]
    impl PlaceKeywordSource for FixedKeywords {
        async fn keywords_for(&self, place_id: i64, max_k: usize) -> Result<Vec<String>, EngineError> {
            Ok(self
                .0
                .get(&place_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .take(max_k)
                .collect())
        }
    }

    struct EchoClient {
        reachable: bool,
    }

    #[async_trait]
    impl EmbeddingClient for EchoClient {
        async fn health_check(&self) -> Result<(), EngineError> {
            if self.reachable {
                Ok(())
            } else {
                Err(EngineError::fatal("connection refused"))
            }
        }
        async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError> {
            Ok(inputs.iter().map(|s| vec![s.len() as f32]).collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        persisted: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl VectorSink for RecordingSink {
        async fn persist_vectors(
            &self,
            place_id: i64,
            _vectors: Vec<(usize, Vec<f32>)>,
        ) -> Result<(), EngineError> {
            self.persisted.lock().unwrap().push(place_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn completes_and_marks_every_eligible_place() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(1, "COMPLETED", EmbedStatus::Pending);
        repo.seed(2, "COMPLETED", EmbedStatus::Pending);
        repo.seed(3, "PENDING", EmbedStatus::Pending); // not eligible, crawl incomplete

        let mut keywords = HashMap::new();
        keywords.insert(1, vec!["cafe".to_string()]);
        keywords.insert(2, vec!["bakery".to_string(), "bread".to_string()]);

        let report = run_embedding_job(
            repo.clone(),
            FixedKeywords(keywords),
            EchoClient { reachable: true },
            RecordingSink::default(),
            EmbeddingConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.status, EngineStatus::Completed);
        assert_eq!(report.counters.written, 2);
        assert_eq!(repo.get(1).unwrap().embed_status, EmbedStatus::Completed);
        assert_eq!(repo.get(2).unwrap().embed_status, EmbedStatus::Completed);
        assert_eq!(repo.get(3).unwrap().embed_status, EmbedStatus::Pending);
    }

    #[tokio::test]
    async fn unreachable_service_refuses_to_start() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(1, "COMPLETED", EmbedStatus::Pending);

        let err = run_embedding_job(
            repo.clone(),
            FixedKeywords(HashMap::new()),
            EchoClient { reachable: false },
            RecordingSink::default(),
            EmbeddingConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::ServiceUnavailable(_)));
        // the repository was never touched; the place is still pending.
        assert_eq!(repo.get(1).unwrap().embed_status, EmbedStatus::Pending);
    }

    struct FailingClient;

    #[async_trait]
    impl EmbeddingClient for FailingClient {
        async fn health_check(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn embed(&self, _inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError> {
            Err(EngineError::transient("embedding service timed out"))
        }
    }

    #[tokio::test]
    async fn processor_error_marks_the_place_failed_instead_of_leaving_it_pending_forever() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(1, "COMPLETED", EmbedStatus::Pending);
        repo.seed(2, "COMPLETED", EmbedStatus::Pending);

        let mut keywords = HashMap::new();
        keywords.insert(1, vec!["cafe".to_string()]);
        keywords.insert(2, vec!["bakery".to_string()]);

        let report = run_embedding_job(
            repo.clone(),
            FixedKeywords(keywords),
            FailingClient,
            RecordingSink::default(),
            EmbeddingConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.status, EngineStatus::Completed);
        // "written" means the writer committed the outcome, not that the
        // embedding itself succeeded; both places commit a FAILED mark.
        assert_eq!(report.counters.written, 2);
        // the read cursor still advances past both ids, so without an
        // explicit FAILED mark they would never be picked up again.
        assert_eq!(repo.get(1).unwrap().embed_status, EmbedStatus::Failed);
        assert_eq!(repo.get(2).unwrap().embed_status, EmbedStatus::Failed);
    }

    #[tokio::test]
    async fn places_with_no_keywords_stay_pending_and_are_skipped_over() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(1, "COMPLETED", EmbedStatus::Pending);
        repo.seed(2, "COMPLETED", EmbedStatus::Pending);

        let mut keywords = HashMap::new();
        keywords.insert(2, vec!["bakery".to_string()]);
        // place 1 has no keywords on file yet.

        let report = run_embedding_job(
            repo.clone(),
            FixedKeywords(keywords),
            EchoClient { reachable: true },
            RecordingSink::default(),
            EmbeddingConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.status, EngineStatus::Completed);
        assert_eq!(repo.get(1).unwrap().embed_status, EmbedStatus::Pending);
        assert_eq!(repo.get(2).unwrap().embed_status, EmbedStatus::Completed);
    }
}
