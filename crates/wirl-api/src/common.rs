//! Shared response DTOs, grounded on the teacher's
//! `control_plane::api::common` (`ErrorResponse`, `ListResponse<T>`).

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }

    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[aliases(RunListResponse = ListResponse<crate::routes::runs::RunSummary>)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
