//! Prometheus text-format exposition (spec.md §6 `GET /metrics`).

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use checkpoint_store::CheckpointStore;
use prometheus::TextEncoder;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

/// Refreshes the gauges that reflect point-in-time state (as opposed to
/// `chunk_items`, a running counter updated as jobs finish) right before
/// each scrape, the way a Prometheus exporter samples on pull rather than
/// on a timer.
async fn refresh_gauges(state: &AppState) {
    if let Ok(stats) = state.queue.stats().await {
        state
            .metrics
            .queue_depth
            .with_label_values(&["pending"])
            .set(stats.pending_depth as i64);
        state
            .metrics
            .queue_depth
            .with_label_values(&["priority"])
            .set(stats.priority_depth as i64);
    }
    if let Ok(workers) = state.queue.workers().await {
        for worker in workers {
            state
                .metrics
                .queue_inflight
                .with_label_values(&[worker.worker_id.as_str()])
                .set(if worker.current_task_id.is_some() { 1 } else { 0 });
        }
    }
    let batch_name = state.config.batch.batch_name.as_str();
    if let Ok(progress) = state.checkpoint_store.progress(batch_name).await {
        state
            .metrics
            .checkpoint_watermark
            .with_label_values(&[batch_name, "ALL"])
            .set(progress.completed);
    }
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    refresh_gauges(&state).await;
    let families = state.registry.gather();
    match TextEncoder.encode_to_string(&families) {
        Ok(body) => (StatusCode::OK, body),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {error}"),
        ),
    }
}
