//! Thin external-collaborator stand-ins for the embedding service, the
//! place keyword source, and the vector store (spec.md §1/§4.6 Non-goals).
//! Mirrors `crawler::StubCrawlerClient`: every call refuses until a
//! concrete client is wired in.

use async_trait::async_trait;
use embedding_pipeline::{EmbeddingClient, PlaceKeywordSource, VectorSink};
use pipeline_engine::EngineError;

pub struct StubEmbeddingClient;

#[async_trait]
impl EmbeddingClient for StubEmbeddingClient {
    async fn health_check(&self) -> Result<(), EngineError> {
        Err(EngineError::fatal("embedding service not configured"))
    }

    async fn embed(&self, _inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EngineError> {
        Err(EngineError::fatal("embedding service not configured"))
    }
}

pub struct StubKeywordSource;

#[async_trait]
impl PlaceKeywordSource for StubKeywordSource {
    async fn keywords_for(&self, place_id: i64, _max_k: usize) -> Result<Vec<String>, EngineError> {
        Err(EngineError::fatal(format!(
            "keyword source not configured (place {place_id})"
        )))
    }
}

pub struct StubVectorSink;

#[async_trait]
impl VectorSink for StubVectorSink {
    async fn persist_vectors(&self, place_id: i64, _vectors: Vec<(usize, Vec<f32>)>) -> Result<(), EngineError> {
        Err(EngineError::fatal(format!(
            "vector store not configured (place {place_id})"
        )))
    }
}
