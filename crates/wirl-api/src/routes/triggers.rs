//! `/workflow-triggers` routes (spec.md §6): CRUD over cron triggers. Cron
//! validity and template existence are both checked at creation time so a
//! trigger can never be persisted pointing at something that will fail
//! every tick.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use wirl_orchestrator::scheduler::validate_cron;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflow-triggers", get(list_triggers).post(create_trigger))
        .route("/workflow-triggers/:id", patch(update_trigger).delete(delete_trigger))
        .with_state(state)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TriggerDto {
    pub id: Uuid,
    pub name: String,
    pub template_name: String,
    pub inputs_template: Value,
    pub cron_expression: String,
    pub timezone: String,
    pub is_active: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<wirl_orchestrator::Trigger> for TriggerDto {
    fn from(t: wirl_orchestrator::Trigger) -> Self {
        Self {
            id: t.trigger_id,
            name: t.name,
            template_name: t.template_name,
            inputs_template: t.inputs_template,
            cron_expression: t.cron_expression,
            timezone: t.timezone,
            is_active: t.is_active,
            next_run_at: t.next_run_at,
            last_run_at: t.last_run_at,
            last_error: t.last_error,
        }
    }
}

#[utoipa::path(
    get,
    path = "/workflow-triggers",
    responses((status = 200, description = "All triggers", body = [TriggerDto])),
    tag = "triggers"
)]
pub async fn list_triggers(State(state): State<AppState>) -> Result<Json<Vec<TriggerDto>>, ApiError> {
    let triggers = state.triggers.list().await?;
    Ok(Json(triggers.into_iter().map(TriggerDto::from).collect()))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTriggerRequest {
    pub name: String,
    pub template_name: String,
    #[serde(default = "default_inputs_template")]
    pub inputs_template: Value,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_inputs_template() -> Value {
    Value::Object(Default::default())
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[utoipa::path(
    post,
    path = "/workflow-triggers",
    request_body = CreateTriggerRequest,
    responses(
        (status = 200, description = "Trigger created", body = TriggerDto),
        (status = 400, description = "Invalid cron expression, timezone, or inputs template"),
        (status = 404, description = "Unknown template"),
    ),
    tag = "triggers"
)]
pub async fn create_trigger(
    State(state): State<AppState>,
    Json(req): Json<CreateTriggerRequest>,
) -> Result<Json<TriggerDto>, ApiError> {
    if !req.inputs_template.is_object() {
        return Err(ApiError::Validation("inputs_template must be a JSON object".to_string()));
    }

    // Validates the template exists and compiles before the trigger is persisted.
    state.registry.resolve(&req.template_name).await?;
    let next_run_at = validate_cron(&req.cron_expression, &req.timezone)?;

    let trigger_id = state
        .triggers
        .create(
            &req.name,
            &req.template_name,
            req.inputs_template,
            &req.cron_expression,
            &req.timezone,
            next_run_at,
        )
        .await?;

    let trigger = state
        .triggers
        .get(trigger_id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::TriggerNotFound(trigger_id))?;

    Ok(Json(TriggerDto::from(trigger)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTriggerRequest {
    pub is_active: bool,
}

#[utoipa::path(
    patch,
    path = "/workflow-triggers/{id}",
    params(("id" = Uuid, Path, description = "Trigger id")),
    request_body = UpdateTriggerRequest,
    responses(
        (status = 200, description = "Trigger updated", body = TriggerDto),
        (status = 404, description = "Unknown trigger"),
    ),
    tag = "triggers"
)]
pub async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTriggerRequest>,
) -> Result<Json<TriggerDto>, ApiError> {
    state
        .triggers
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::TriggerNotFound(id))?;

    state.triggers.set_active(id, req.is_active).await?;
    let updated = state
        .triggers
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::TriggerNotFound(id))?;

    Ok(Json(TriggerDto::from(updated)))
}

#[utoipa::path(
    delete,
    path = "/workflow-triggers/{id}",
    params(("id" = Uuid, Path, description = "Trigger id")),
    responses(
        (status = 204, description = "Trigger deleted"),
        (status = 404, description = "Unknown trigger"),
    ),
    tag = "triggers"
)]
pub async fn delete_trigger(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state
        .triggers
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::TriggerNotFound(id))?;
    state.triggers.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_dto_carries_every_field_from_the_store_type() {
        let trigger_id = Uuid::now_v7();
        let trigger = wirl_orchestrator::Trigger {
            trigger_id,
            name: "nightly".to_string(),
            template_name: "close_books".to_string(),
            inputs_template: serde_json::json!({"as_of": "today"}),
            cron_expression: "0 2 * * *".to_string(),
            timezone: "UTC".to_string(),
            is_active: true,
            next_run_at: Utc::now(),
            last_run_at: None,
            last_error: None,
        };

        let dto = TriggerDto::from(trigger.clone());
        assert_eq!(dto.id, trigger_id);
        assert_eq!(dto.name, "nightly");
        assert_eq!(dto.cron_expression, "0 2 * * *");
        assert!(dto.is_active);
        assert_eq!(dto.inputs_template, trigger.inputs_template);
    }
}
