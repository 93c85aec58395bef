//! Embedding step control (spec.md §6 `/batch/embedding/*`). One slot per
//! process: the embedding service is rate-limited, so there is never more
//! than one concurrent run, mirroring `embedding_pipeline::run_embedding_job`'s
//! own single-consumer design.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use embedding_pipeline::EmbeddingClient;

use crate::embedding_stub::{StubEmbeddingClient, StubKeywordSource, StubVectorSink};
use crate::errors::{ok, ApiError, Envelope};
use crate::state::AppState;

const JOB_NAME: &str = "embedding";
const WORKER_ID: usize = 0;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/batch/embedding/start", post(start))
        .route("/batch/embedding/stop", post(stop))
        .route("/batch/embedding/status", get(status))
        .route("/batch/embedding/health", get(health))
}

async fn start(State(state): State<AppState>) -> Result<Json<Envelope<()>>, ApiError> {
    let places = state.place_repo.clone();
    let metrics = state.metrics.clone();
    state
        .job_controller
        .start(JOB_NAME, WORKER_ID, move |token| async move {
            let report = match embedding_pipeline::run_embedding_job(
                places,
                StubKeywordSource,
                StubEmbeddingClient,
                StubVectorSink,
                embedding_pipeline::EmbeddingConfig::default(),
                token,
            )
            .await
            {
                Ok(report) => report,
                Err(err) => {
                    tracing::warn!(error = %err, "embedding job refused to start");
                    pipeline_engine::EngineReport {
                        status: pipeline_engine::EngineStatus::Failed,
                        counters: pipeline_engine::EngineCounters::default(),
                    }
                }
            };
            crate::metrics_glue::record_engine_report(&metrics, JOB_NAME, &report);
            report
        })
        .await?;
    Ok(ok(()))
}

async fn stop(State(state): State<AppState>) -> Result<Json<Envelope<job_controller::SlotStatus>>, ApiError> {
    Ok(ok(state.job_controller.stop(JOB_NAME, WORKER_ID).await?))
}

async fn status(State(state): State<AppState>) -> Result<Json<Envelope<job_controller::SlotSnapshot>>, ApiError> {
    state
        .job_controller
        .status(JOB_NAME, WORKER_ID)
        .await
        .map(ok)
        .ok_or_else(|| ApiError::NotFound("embedding job has not been started".to_string()))
}

async fn health() -> Result<Json<Envelope<()>>, ApiError> {
    StubEmbeddingClient
        .health_check()
        .await
        .map(ok)
        .map_err(|err| ApiError::ServiceUnavailable(err.to_string()))
}
