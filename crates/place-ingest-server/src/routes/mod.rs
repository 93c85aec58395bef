pub mod batch;
pub mod embedding;
pub mod health;
pub mod metrics;
pub mod queue;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(batch::routes())
        .merge(queue::routes())
        .merge(embedding::routes())
        .merge(metrics::routes())
        .with_state(state)
}
