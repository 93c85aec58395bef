use crate::client::{EmbeddingClient, PlaceKeywordSource};
use async_trait::async_trait;
use pipeline_engine::{EngineError, Processor};

/// One place's keyword-ordinal-tagged vectors, produced by a single
/// embedding-service call (spec.md §4.6: "group up to K keyword strings per
/// place into one embedding call").
#[derive(Debug, Clone)]
pub struct PlaceEmbeddingBatch {
    pub place_id: i64,
    pub vectors: Vec<(usize, Vec<f32>)>,
}

/// Outcome of attempting to embed one place. Keyword-lookup and
/// embedding-service failures are captured here rather than surfaced as
/// `Processor::Err`, so the writer still sees the place and can flip
/// `embed_status` to FAILED instead of leaving it PENDING behind an advanced
/// read cursor (the same outcome-carrying shape `UpdateTaskProcessor` uses
/// for crawl failures).
#[derive(Debug, Clone)]
pub enum PlaceEmbeddingOutcome {
    Embedded(PlaceEmbeddingBatch),
    Failed { place_id: i64, error: String },
}

pub struct EmbeddingProcessor<K, E> {
    keywords: K,
    client: E,
    max_keywords: usize,
}

impl<K, E> EmbeddingProcessor<K, E> {
    pub fn new(keywords: K, client: E, max_keywords: usize) -> Self {
        Self {
            keywords,
            client,
            max_keywords,
        }
    }
}

#[async_trait]
impl<K, E> Processor<i64, PlaceEmbeddingOutcome> for EmbeddingProcessor<K, E>
where
    K: PlaceKeywordSource,
    E: EmbeddingClient,
{
    type Error = EngineError;

    async fn process(&self, place_id: i64) -> Result<Option<PlaceEmbeddingOutcome>, EngineError> {
        let keywords = match self.keywords.keywords_for(place_id, self.max_keywords).await {
            Ok(keywords) => keywords,
            Err(err) => {
                return Ok(Some(PlaceEmbeddingOutcome::Failed {
                    place_id,
                    error: err.to_string(),
                }))
            }
        };
        if keywords.is_empty() {
            return Ok(None);
        }

        let vectors = match self.client.embed(keywords.clone()).await {
            Ok(vectors) => vectors,
            Err(err) => {
                return Ok(Some(PlaceEmbeddingOutcome::Failed {
                    place_id,
                    error: err.to_string(),
                }))
            }
        };
        if vectors.len() != keywords.len() {
            return Ok(Some(PlaceEmbeddingOutcome::Failed {
                place_id,
                error: format!(
                    "embedding service returned {} vectors for {} keywords on place {place_id}",
                    vectors.len(),
                    keywords.len()
                ),
            }));
        }

        Ok(Some(PlaceEmbeddingOutcome::Embedded(PlaceEmbeddingBatch {
            place_id,
            vectors: vectors.into_iter().enumerate().collect(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait as at;

    struct FixedKeywords(Vec<String>);

    #[at]
    impl PlaceKeywordSource for FixedKeywords {
        async fn keywords_for(&self, _place_id: i64, max_k: usize) -> Result<Vec<String>, EngineError> {
            Ok(self.0.iter().take(max_k).cloned().collect())
        }
    }

    struct EchoClient;

    #[at]
    impl EmbeddingClient for EchoClient {
        async fn health_check(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError> {
            Ok(inputs.iter().map(|s| vec![s.len() as f32]).collect())
        }
    }

    struct FailingClient;

    #[at]
    impl EmbeddingClient for FailingClient {
        async fn health_check(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn embed(&self, _inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError> {
            Err(EngineError::transient("embedding service timed out"))
        }
    }

    fn unwrap_embedded(outcome: PlaceEmbeddingOutcome) -> PlaceEmbeddingBatch {
        match outcome {
            PlaceEmbeddingOutcome::Embedded(batch) => batch,
            PlaceEmbeddingOutcome::Failed { place_id, error } => {
                panic!("place {place_id} unexpectedly failed: {error}")
            }
        }
    }

    #[tokio::test]
    async fn places_with_no_keywords_are_dropped() {
        let processor = EmbeddingProcessor::new(FixedKeywords(vec![]), EchoClient, 8);
        let result = processor.process(1).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn vectors_are_tagged_with_keyword_ordinal() {
        let processor = EmbeddingProcessor::new(
            FixedKeywords(vec!["cafe".into(), "bakery".into()]),
            EchoClient,
            8,
        );
        let batch = unwrap_embedded(processor.process(42).await.unwrap().unwrap());
        assert_eq!(batch.place_id, 42);
        assert_eq!(batch.vectors, vec![(0, vec![4.0]), (1, vec![6.0])]);
    }

    #[tokio::test]
    async fn max_keywords_caps_the_embedding_call() {
        let processor = EmbeddingProcessor::new(
            FixedKeywords(vec!["a".into(), "b".into(), "c".into()]),
            EchoClient,
            2,
        );
        let batch = unwrap_embedded(processor.process(1).await.unwrap().unwrap());
        assert_eq!(batch.vectors.len(), 2);
    }

    #[tokio::test]
    async fn embedding_service_error_is_reported_as_a_failed_outcome_not_an_err() {
        let processor =
            EmbeddingProcessor::new(FixedKeywords(vec!["cafe".into()]), FailingClient, 8);

        let outcome = processor.process(7).await.unwrap().unwrap();
        match outcome {
            PlaceEmbeddingOutcome::Failed { place_id, error } => {
                assert_eq!(place_id, 7);
                assert!(error.contains("timed out"));
            }
            PlaceEmbeddingOutcome::Embedded(_) => panic!("expected a failed outcome"),
        }
    }

    #[tokio::test]
    async fn mismatched_vector_count_is_reported_as_a_failed_outcome() {
        struct ShortClient;

        #[at]
        impl EmbeddingClient for ShortClient {
            async fn health_check(&self) -> Result<(), EngineError> {
                Ok(())
            }
            async fn embed(&self, _inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError> {
                Ok(vec![vec![1.0]])
            }
        }

        let processor = EmbeddingProcessor::new(
            FixedKeywords(vec!["cafe".into(), "bakery".into()]),
            ShortClient,
            8,
        );

        let outcome = processor.process(9).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            PlaceEmbeddingOutcome::Failed { place_id: 9, .. }
        ));
    }
}
