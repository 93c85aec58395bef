//! Shared application state threaded through every route handler via axum's
//! `State` extractor, composed once in `main` (spec.md §4: one process hosts
//! the HTTP control plane plus all three job kinds).

use std::sync::Arc;

use checkpoint_store::{PgCheckpointStore, PgPlaceRepository};
use place_ingest_config::AppConfig;
use place_ingest_metrics::IngestMetrics;
use update_queue::{RedisQueueBackend, UpdateQueue};

use crate::{crawler::StubCrawlerClient, deployment_mode::DeploymentModeRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub job_controller: Arc<job_controller::JobController>,
    pub deployment_modes: Arc<DeploymentModeRegistry>,
    pub checkpoint_store: Arc<PgCheckpointStore>,
    pub place_repo: Arc<PgPlaceRepository>,
    /// Raw pool, held alongside `place_repo` because
    /// `work_partitioner::PgPartitionedReader` scans `places` directly and
    /// has no use for the repository's narrower `PlaceRepository` surface.
    pub pg_pool: sqlx::PgPool,
    pub queue: UpdateQueue<RedisQueueBackend>,
    pub crawler: Arc<StubCrawlerClient>,
    pub metrics: Arc<IngestMetrics>,
    pub registry: Arc<prometheus::Registry>,
}
