//! Thin external-collaborator interface onto the crawler service (spec.md
//! §1 Non-goals: "the crawler itself is out of scope"). Both deployment
//! modes call through this one trait; only the read/claim/write plumbing
//! around the call differs between region-sweep and worker-modulo.

use async_trait::async_trait;
use pipeline_engine::EngineError;

#[async_trait]
pub trait CrawlerClient: Send + Sync {
    /// Crawls every place in `region_code` (a sido/sigungu/dong code, per
    /// `region_type`), returning the number of places processed.
    async fn crawl_region(&self, region_code: &str, region_type: &str) -> Result<i64, EngineError>;

    /// Crawls a single place by id.
    async fn crawl_place(&self, place_id: i64) -> Result<(), EngineError>;
}

/// Stand-in used until a concrete HTTP client is wired in: every call
/// refuses with a fatal `ServiceUnavailable`-class error, so a crawl job
/// started against it fails fast instead of silently doing nothing.
pub struct StubCrawlerClient;

#[async_trait]
impl CrawlerClient for StubCrawlerClient {
    async fn crawl_region(&self, region_code: &str, _region_type: &str) -> Result<i64, EngineError> {
        Err(EngineError::fatal(format!(
            "crawler service not configured (region {region_code})"
        )))
    }

    async fn crawl_place(&self, place_id: i64) -> Result<(), EngineError> {
        Err(EngineError::fatal(format!(
            "crawler service not configured (place {place_id})"
        )))
    }
}
