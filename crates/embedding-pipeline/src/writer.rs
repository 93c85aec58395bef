use crate::client::VectorSink;
use crate::processor::PlaceEmbeddingOutcome;
use async_trait::async_trait;
use checkpoint_store::{EmbedStatus, PlaceRepository};
use pipeline_engine::{EngineError, Writer};
use std::sync::Arc;
use tracing::warn;

/// Persists a place's vectors and flips `embed_status` to COMPLETED, or
/// marks it FAILED when the processor couldn't produce vectors. Used with
/// `chunk_size = 1` so each call is exactly one place's commit, matching the
/// "vectors and the status flip commit together" requirement (spec.md §4.6)
/// without needing a multi-place transaction inside one `Writer::write`
/// call.
pub struct EmbeddingWriter<S, Repo: PlaceRepository> {
    sink: S,
    places: Arc<Repo>,
}

impl<S, Repo: PlaceRepository> EmbeddingWriter<S, Repo> {
    pub fn new(sink: S, places: Arc<Repo>) -> Self {
        Self { sink, places }
    }
}

#[async_trait]
impl<S, Repo> Writer<PlaceEmbeddingOutcome> for EmbeddingWriter<S, Repo>
where
    S: VectorSink,
    Repo: PlaceRepository,
{
    type Error = EngineError;

    async fn write(&self, chunk: Vec<PlaceEmbeddingOutcome>) -> Result<(), EngineError> {
        for outcome in chunk {
            match outcome {
                PlaceEmbeddingOutcome::Embedded(batch) => {
                    self.sink
                        .persist_vectors(batch.place_id, batch.vectors)
                        .await?;
                    self.places
                        .mark_embed_status(batch.place_id, EmbedStatus::Completed)
                        .await
                        .map_err(|e| EngineError::transient(e.to_string()))?;
                }
                PlaceEmbeddingOutcome::Failed { place_id, error } => {
                    warn!(place_id, %error, "marking place embed_status FAILED");
                    self.places
                        .mark_embed_status(place_id, EmbedStatus::Failed)
                        .await
                        .map_err(|e| EngineError::transient(e.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::PlaceEmbeddingBatch;
    use async_trait::async_trait as at;
    use checkpoint_store::MemPlaceRepository;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(i64, Vec<(usize, Vec<f32>)>)>>,
    }

    #[at]
    impl VectorSink for RecordingSink {
        async fn persist_vectors(
            &self,
            place_id: i64,
            vectors: Vec<(usize, Vec<f32>)>,
        ) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push((place_id, vectors));
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_persists_vectors_and_completes_embed_status() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(1, "COMPLETED", checkpoint_store::EmbedStatus::Pending);
        let sink = RecordingSink::default();
        let writer = EmbeddingWriter::new(sink, repo.clone());

        writer
            .write(vec![PlaceEmbeddingOutcome::Embedded(PlaceEmbeddingBatch {
                place_id: 1,
                vectors: vec![(0, vec![1.0, 2.0])],
            })])
            .await
            .unwrap();

        assert_eq!(
            repo.get(1).unwrap().embed_status,
            checkpoint_store::EmbedStatus::Completed
        );
        assert_eq!(writer.sink.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn write_fails_when_crawl_never_completed() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(1, "PENDING", checkpoint_store::EmbedStatus::Pending);
        let writer = EmbeddingWriter::new(RecordingSink::default(), repo);

        let err = writer
            .write(vec![PlaceEmbeddingOutcome::Embedded(PlaceEmbeddingBatch {
                place_id: 1,
                vectors: vec![(0, vec![1.0])],
            })])
            .await
            .unwrap_err();
        assert_eq!(err.class, pipeline_engine::ErrorClass::Transient);
    }

    #[tokio::test]
    async fn write_marks_failed_outcome_without_touching_the_sink() {
        let repo = Arc::new(MemPlaceRepository::new());
        repo.seed(1, "COMPLETED", checkpoint_store::EmbedStatus::Pending);
        let sink = RecordingSink::default();
        let writer = EmbeddingWriter::new(sink, repo.clone());

        writer
            .write(vec![PlaceEmbeddingOutcome::Failed {
                place_id: 1,
                error: "embedding service timed out".to_string(),
            }])
            .await
            .unwrap();

        assert_eq!(
            repo.get(1).unwrap().embed_status,
            checkpoint_store::EmbedStatus::Failed
        );
        assert!(writer.sink.calls.lock().unwrap().is_empty());
    }
}
