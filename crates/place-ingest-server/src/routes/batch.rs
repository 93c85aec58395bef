//! Crawl job control (spec.md §6 `/batch/*` minus `/batch/queue` and
//! `/batch/embedding`, which get their own route modules).

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use checkpoint_store::CheckpointStore;
use place_ingest_config::DeploymentMode;
use serde::Serialize;
use work_partitioner::{CrawlStatusFilter, PartitionSpec};

use crate::errors::{ok, ApiError};
use crate::jobs::partitioned::{PartitionedCrawlReader, PlaceCrawlProcessor, PlaceCrawlWriter};
use crate::jobs::region_sweep::run_region_sweep_for_batch;
use crate::state::AppState;

const JOB_NAME: &str = "crawl";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/batch/status", get(batch_status))
        .route("/batch/status/{worker_id}", get(worker_status))
        .route("/batch/start/{worker_id}", post(start_worker))
        .route("/batch/start-all", post(start_all))
        .route("/batch/stop/{worker_id}", post(stop_worker))
        .route("/batch/stop-all", post(stop_all))
        .route("/batch/config", get(batch_config))
        .route("/batch/current-jobs", get(current_jobs))
}

#[derive(Serialize)]
struct BatchStatus {
    batch_name: String,
    deployment_mode: DeploymentMode,
    slots: Vec<job_controller::SlotSnapshot>,
    checkpoint_progress: checkpoint_store::BatchProgress,
}

async fn batch_status(State(state): State<AppState>) -> Result<axum::Json<crate::errors::Envelope<BatchStatus>>, ApiError> {
    let slots = state
        .job_controller
        .status_all()
        .await
        .into_iter()
        .filter(|s| s.job_name == JOB_NAME)
        .collect();
    let progress = state.checkpoint_store.progress(&state.config.batch.batch_name).await?;
    Ok(ok(BatchStatus {
        batch_name: state.config.batch.batch_name.clone(),
        deployment_mode: state.config.batch.deployment_mode,
        slots,
        checkpoint_progress: progress,
    }))
}

async fn worker_status(
    State(state): State<AppState>,
    Path(worker_id): Path<usize>,
) -> Result<axum::Json<crate::errors::Envelope<job_controller::SlotSnapshot>>, ApiError> {
    state
        .job_controller
        .status(JOB_NAME, worker_id)
        .await
        .map(ok)
        .ok_or_else(|| ApiError::NotFound(format!("no slot for worker {worker_id}")))
}

async fn start_worker(State(state): State<AppState>, Path(worker_id): Path<usize>) -> Result<axum::Json<crate::errors::Envelope<()>>, ApiError> {
    start_one(&state, worker_id).await?;
    Ok(ok(()))
}

async fn start_all(State(state): State<AppState>) -> Result<axum::Json<crate::errors::Envelope<usize>>, ApiError> {
    let total = state.config.worker.total_workers;
    for worker_id in 0..total {
        start_one(&state, worker_id).await?;
    }
    Ok(ok(total))
}

async fn start_one(state: &AppState, worker_id: usize) -> Result<(), ApiError> {
    let batch_name = state.config.batch.batch_name.clone();
    let mode = state.config.batch.deployment_mode;
    state.deployment_modes.claim(&batch_name, mode)?;

    match mode {
        DeploymentMode::RegionSweep => {
            let store = state.checkpoint_store.clone();
            let crawler = state.crawler.clone();
            let chunk_size = state.config.worker.chunk_size;
            let batch_name = batch_name.clone();
            let metrics = state.metrics.clone();
            state
                .job_controller
                .start(JOB_NAME, worker_id, move |token| async move {
                    let report = run_region_sweep_for_batch(store, crawler, &batch_name, chunk_size, token).await;
                    crate::metrics_glue::record_engine_report(&metrics, JOB_NAME, &report);
                    report
                })
                .await?;
        }
        DeploymentMode::Partitioned => {
            let spec = PartitionSpec::new(
                worker_id as i64,
                state.config.worker.total_workers as i64,
                state.config.worker.chunk_size as i64,
                CrawlStatusFilter::Pending,
            )
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
            let reader = PartitionedCrawlReader::new(work_partitioner::PgPartitionedReader::new(
                state.pg_pool.clone(),
                spec,
            ));
            let processor = PlaceCrawlProcessor::new(state.crawler.clone());
            let writer = PlaceCrawlWriter::new(state.place_repo.clone());
            let chunk_size = state.config.worker.chunk_size;
            let skip_limit = state.config.worker.skip_limit as u64;
            let metrics = state.metrics.clone();
            state
                .job_controller
                .start(JOB_NAME, worker_id, move |token| async move {
                    let report = pipeline_engine::ChunkEngine::run(pipeline_engine::JobSpec {
                        reader,
                        processor,
                        writer,
                        chunk_size,
                        skip_limit,
                        retry_policy: pipeline_engine::RetryPolicy::default(),
                        task_executor: pipeline_engine::TaskExecutor::Sequential,
                        stop_token: token,
                    })
                    .await;
                    crate::metrics_glue::record_engine_report(&metrics, JOB_NAME, &report);
                    report
                })
                .await?;
        }
    }
    Ok(())
}

async fn stop_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<usize>,
) -> Result<axum::Json<crate::errors::Envelope<job_controller::SlotStatus>>, ApiError> {
    let status = state.job_controller.stop(JOB_NAME, worker_id).await?;
    Ok(ok(status))
}

async fn stop_all(State(state): State<AppState>) -> axum::Json<crate::errors::Envelope<()>> {
    state.job_controller.stop_all().await;
    state.deployment_modes.release(&state.config.batch.batch_name);
    ok(())
}

#[derive(Serialize)]
struct BatchConfigView {
    total_workers: usize,
    threads_per_worker: usize,
    chunk_size: usize,
}

async fn batch_config(State(state): State<AppState>) -> axum::Json<crate::errors::Envelope<BatchConfigView>> {
    ok(BatchConfigView {
        total_workers: state.config.worker.total_workers,
        threads_per_worker: state.config.worker.threads_per_worker,
        chunk_size: state.config.worker.chunk_size,
    })
}

async fn current_jobs(State(state): State<AppState>) -> axum::Json<crate::errors::Envelope<Vec<job_controller::SlotSnapshot>>> {
    ok(state.job_controller.current_jobs().await)
}
