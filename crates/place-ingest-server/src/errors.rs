//! Uniform `{ success, data | error }` response envelope (spec.md §6), with
//! an `ApiError` -> `IntoResponse` mapping that matches each collaborator
//! error to an HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wraps `data` in a `success: true` envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<job_controller::ControllerError> for ApiError {
    fn from(err: job_controller::ControllerError) -> Self {
        match err {
            job_controller::ControllerError::AlreadyRunning { .. } => ApiError::Conflict(err.to_string()),
            job_controller::ControllerError::NotFound { .. } => ApiError::NotFound(err.to_string()),
        }
    }
}

impl From<update_queue::QueueError> for ApiError {
    fn from(err: update_queue::QueueError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<checkpoint_store::CheckpointError> for ApiError {
    fn from(err: checkpoint_store::CheckpointError) -> Self {
        match err {
            checkpoint_store::CheckpointError::ConcurrentExecution { .. } => ApiError::Conflict(err.to_string()),
            checkpoint_store::CheckpointError::NotFound(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<embedding_pipeline::PipelineError> for ApiError {
    fn from(err: embedding_pipeline::PipelineError) -> Self {
        ApiError::ServiceUnavailable(err.to_string())
    }
}

impl From<checkpoint_store::PlaceRepositoryError> for ApiError {
    fn from(err: checkpoint_store::PlaceRepositoryError) -> Self {
        match err {
            checkpoint_store::PlaceRepositoryError::EmbedRequiresCrawlComplete { .. } => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::deployment_mode::DeploymentModeError> for ApiError {
    fn from(err: crate::deployment_mode::DeploymentModeError) -> Self {
        ApiError::Conflict(err.to_string())
    }
}
