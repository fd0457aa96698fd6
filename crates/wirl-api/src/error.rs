//! Translates orchestrator/engine errors to HTTP status codes per spec.md
//! §7: 400 for validation, 404 for unknown ids, 409 for illegal state
//! transitions (e.g. `continue` on a `succeeded` run), 500 only for
//! unexpected store errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use wirl_orchestrator::{RegistryError, SchedulerError, StoreError};

use crate::common::ErrorResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    NotFound(#[from] NotFoundKind),

    #[error("illegal state transition: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("engine error: {0}")]
    Engine(#[from] wirl_engine::EngineError),

    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] wirl_engine::checkpoint::StoreError),
}

#[derive(Debug, thiserror::Error)]
#[error("{0} not found")]
pub struct NotFoundKind(pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(NotFoundKind(msg)) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Store(StoreError::RunNotFound(id)) => (StatusCode::NOT_FOUND, format!("run {id} not found")),
            ApiError::Store(StoreError::TemplateNotFound(name)) => {
                (StatusCode::NOT_FOUND, format!("template '{name}' not found"))
            }
            ApiError::Store(StoreError::TriggerNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("trigger {id} not found"))
            }
            ApiError::Store(e) => {
                tracing::error!("unexpected store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal store error".to_string())
            }
            ApiError::Registry(RegistryError::SourceNotFound(name, _)) => {
                (StatusCode::NOT_FOUND, format!("template '{name}' not found"))
            }
            ApiError::Registry(RegistryError::CompileFailed { name, errors }) => {
                (StatusCode::BAD_REQUEST, format!("template '{name}' failed to compile: {errors}"))
            }
            ApiError::Registry(e) => {
                tracing::error!("unexpected registry error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal registry error".to_string())
            }
            ApiError::Scheduler(SchedulerError::CronInvalid(expr, msg)) => {
                (StatusCode::BAD_REQUEST, format!("invalid cron expression '{expr}': {msg}"))
            }
            ApiError::Scheduler(SchedulerError::InputsTemplateInvalid(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Scheduler(e) => {
                tracing::error!("unexpected scheduler error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal scheduler error".to_string())
            }
            ApiError::Engine(e) => {
                tracing::error!("unexpected engine error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal engine error".to_string())
            }
            ApiError::Checkpoint(e) => {
                tracing::error!("unexpected checkpoint store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal checkpoint store error".to_string())
            }
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}
