//! `GET /workflow-templates` (spec.md §6): lists compiled templates
//! discoverable under `WORKFLOW_DEFINITIONS_PATH`.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

/// A `.wirl` file discoverable under the configured definitions directory.
/// `id` is the template name: templates are identified by file stem, not a
/// separately-minted identifier, since WIRL sources are the source of truth.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub path: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflow-templates", get(list_templates))
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/workflow-templates",
    responses(
        (status = 200, description = "Compiled templates discoverable on disk", body = [TemplateSummary]),
    ),
    tag = "templates"
)]
pub async fn list_templates(State(state): State<AppState>) -> Result<Json<Vec<TemplateSummary>>, ApiError> {
    let sources = state.registry.list_sources().await?;
    Ok(Json(
        sources
            .into_iter()
            .map(|s| TemplateSummary {
                id: s.name.clone(),
                name: s.name,
                path: s.path.display().to_string(),
            })
            .collect(),
    ))
}
