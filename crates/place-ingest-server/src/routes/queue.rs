//! Update-queue producer/consumer/supervisor control plane
//! (spec.md §6 `/batch/queue/*`).

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use checkpoint_store::PlaceRepository;
use update_queue::{ClearTarget, OperationFlags, Priority};

use crate::errors::{ok, ApiError, Envelope};
use crate::jobs::update_task::{UpdateTaskProcessor, UpdateTaskWriter};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/batch/queue/push/{place_id}", post(push_one))
        .route("/batch/queue/push-all", post(push_all))
        .route("/batch/queue/push-batch", post(push_all))
        .route("/batch/queue/stats", get(stats))
        .route("/batch/queue/workers", get(workers))
        .route("/batch/queue/failed", get(failed))
        .route("/batch/queue/task/{task_id}", get(task))
        .route("/batch/queue/worker/start", post(worker_start))
        .route("/batch/queue/worker/stop", post(worker_stop))
        .route("/batch/queue/worker/status", get(worker_status))
        .route("/batch/queue/retry-failed", post(retry_failed))
        .route("/batch/queue/clear", delete(clear_all))
        .route("/batch/queue/clear-completed", delete(clear_completed))
        .route("/batch/queue/clear-failed", delete(clear_failed))
}

#[derive(Deserialize)]
struct PushQuery {
    #[serde(default)]
    menus: bool,
    #[serde(default)]
    images: bool,
    #[serde(default)]
    reviews: bool,
    #[serde(default)]
    priority: Option<String>,
}

fn ops_from(query: &PushQuery) -> OperationFlags {
    if !query.menus && !query.images && !query.reviews {
        return OperationFlags::all();
    }
    OperationFlags {
        menus: query.menus,
        images: query.images,
        reviews: query.reviews,
    }
}

fn priority_from(query: &PushQuery) -> Priority {
    match query.priority.as_deref() {
        Some("high") => Priority::High,
        _ => Priority::Normal,
    }
}

async fn push_one(
    State(state): State<AppState>,
    Path(place_id): Path<i64>,
    Query(query): Query<PushQuery>,
) -> Result<Json<Envelope<uuid::Uuid>>, ApiError> {
    let task_id = state.queue.push(place_id, ops_from(&query), priority_from(&query)).await?;
    Ok(ok(task_id))
}

const PUSH_ALL_DEFAULT_LIMIT: i64 = 1000;

#[derive(Deserialize)]
struct PushAllBody {
    /// Caps how many pending places the database scan returns; the client
    /// names a filter size, never the place ids themselves (spec.md §4.5
    /// `push_all(filter)` enqueues places the server selects, not ones the
    /// caller supplies).
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    menus: bool,
    #[serde(default)]
    images: bool,
    #[serde(default)]
    reviews: bool,
    #[serde(default)]
    priority: Option<String>,
}

/// Batch-enqueues every place with `crawl_status = PENDING`, up to
/// `limit` (spec.md §4.5 `push_all(filter)`); both `push-all` and
/// `push-batch` route here.
async fn push_all(State(state): State<AppState>, Json(body): Json<PushAllBody>) -> Result<Json<Envelope<u64>>, ApiError> {
    let ops = if !body.menus && !body.images && !body.reviews {
        OperationFlags::all()
    } else {
        OperationFlags {
            menus: body.menus,
            images: body.images,
            reviews: body.reviews,
        }
    };
    let priority = match body.priority.as_deref() {
        Some("high") => Priority::High,
        _ => Priority::Normal,
    };
    let limit = body.limit.unwrap_or(PUSH_ALL_DEFAULT_LIMIT);
    let place_ids = state.place_repo.pending_ids_for_queue(limit).await?;
    let pushed = state.queue.push_all(&place_ids, ops, priority).await?;
    Ok(ok(pushed))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Envelope<update_queue::QueueStats>>, ApiError> {
    Ok(ok(state.queue.stats().await?))
}

async fn workers(State(state): State<AppState>) -> Result<Json<Envelope<Vec<update_queue::WorkerSnapshot>>>, ApiError> {
    Ok(ok(state.queue.workers().await?))
}

async fn failed(State(state): State<AppState>) -> Result<Json<Envelope<Vec<i64>>>, ApiError> {
    Ok(ok(state.queue.failed().await?))
}

async fn task(
    State(state): State<AppState>,
    Path(task_id): Path<uuid::Uuid>,
) -> Result<Json<Envelope<update_queue::InflightEntry>>, ApiError> {
    state
        .queue
        .lookup_task(task_id)
        .await?
        .map(ok)
        .ok_or_else(|| ApiError::NotFound(format!("no in-flight task {task_id}")))
}

#[derive(Serialize)]
struct WorkerHandle {
    worker_id: String,
}

/// Starts one queue-consumer slot (spec.md §6 `POST /batch/queue/worker/start`):
/// a `ChunkEngine` over `QueueReader`/`UpdateTaskProcessor`/`UpdateTaskWriter`,
/// registered in the same `JobController` as the crawl slots under job name
/// `"queue-consumer"` so `/batch/current-jobs` sees it too.
async fn worker_start(State(state): State<AppState>) -> Result<Json<Envelope<WorkerHandle>>, ApiError> {
    let worker_id = state.job_controller.current_jobs().await.iter().filter(|s| s.job_name == "queue-consumer").count();
    let worker_label = format!("queue-worker-{worker_id}");
    let queue = state.queue.clone();
    let crawler = state.crawler.clone();
    let label_for_reader = worker_label.clone();
    let metrics = state.metrics.clone();
    state
        .job_controller
        .start("queue-consumer", worker_id, move |token| async move {
            let spec = pipeline_engine::JobSpec {
                reader: update_queue::QueueReader::new(queue.clone(), label_for_reader.clone(), token.clone()),
                processor: UpdateTaskProcessor::new(crawler),
                writer: UpdateTaskWriter::new(queue),
                chunk_size: 10,
                skip_limit: 0,
                retry_policy: pipeline_engine::RetryPolicy::default(),
                task_executor: pipeline_engine::TaskExecutor::Sequential,
                stop_token: token,
            };
            let report = pipeline_engine::ChunkEngine::run(spec).await;
            crate::metrics_glue::record_engine_report(&metrics, "queue-consumer", &report);
            report
        })
        .await?;
    Ok(ok(WorkerHandle { worker_id: worker_label }))
}

async fn worker_stop(State(state): State<AppState>) -> Result<Json<Envelope<()>>, ApiError> {
    let live = state.job_controller.current_jobs().await;
    for slot in live.into_iter().filter(|s| s.job_name == "queue-consumer") {
        state.job_controller.stop("queue-consumer", slot.worker_id).await?;
    }
    Ok(ok(()))
}

async fn worker_status(State(state): State<AppState>) -> Json<Envelope<Vec<job_controller::SlotSnapshot>>> {
    let slots = state
        .job_controller
        .status_all()
        .await
        .into_iter()
        .filter(|s| s.job_name == "queue-consumer")
        .collect();
    ok(slots)
}

async fn retry_failed(State(state): State<AppState>) -> Result<Json<Envelope<u64>>, ApiError> {
    Ok(ok(state.queue.retry_failed().await?))
}

async fn clear_all(State(state): State<AppState>) -> Result<Json<Envelope<u64>>, ApiError> {
    Ok(ok(state.queue.clear(ClearTarget::All).await?))
}

async fn clear_completed(State(state): State<AppState>) -> Result<Json<Envelope<u64>>, ApiError> {
    Ok(ok(state.queue.clear(ClearTarget::Completed).await?))
}

async fn clear_failed(State(state): State<AppState>) -> Result<Json<Envelope<u64>>, ApiError> {
    Ok(ok(state.queue.clear(ClearTarget::Failed).await?))
}
