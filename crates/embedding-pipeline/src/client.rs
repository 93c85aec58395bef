//! Thin external-collaborator interfaces. The embedding service and the
//! place's keyword source are out-of-process systems this core does not
//! implement — only the contract it calls through, per spec.md's
//! thin-interface Non-goal for external services.

use async_trait::async_trait;
use pipeline_engine::EngineError;

/// "Accepts an ordered array of strings and returns a same-length array of
/// fixed-dimension vectors" (spec.md §6 wire contract).
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Checked once before the engine starts (spec.md §4.6): an unreachable
    /// service refuses the whole step instead of burning skip_limit on the
    /// first chunk.
    async fn health_check(&self) -> Result<(), EngineError>;

    async fn embed(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError>;
}

/// Supplies the keyword strings a place was crawled with. Not modeled in
/// detail here — the crawled record's shape belongs to the crawler, not to
/// this pipeline.
#[async_trait]
pub trait PlaceKeywordSource: Send + Sync {
    async fn keywords_for(&self, place_id: i64, max_k: usize) -> Result<Vec<String>, EngineError>;
}

/// Persists vectors for one place, keyed by keyword ordinal (spec.md §4.6:
/// "vectors stored keyed by (place_id, keyword_ordinal)"). The vector store
/// itself is an external collaborator; this core only needs somewhere to
/// hand the ordinal-tagged vectors to.
#[async_trait]
pub trait VectorSink: Send + Sync {
    async fn persist_vectors(
        &self,
        place_id: i64,
        vectors: Vec<(usize, Vec<f32>)>,
    ) -> Result<(), EngineError>;
}
