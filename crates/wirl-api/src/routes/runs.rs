//! `/workflows` routes (spec.md §6): start, inspect, continue, and cancel
//! runs. A thin layer over `wirl_orchestrator::RunStore` — starting a run
//! enqueues it (`status = queued`); the worker pool picks it up and drives
//! `wirl_engine::Engine` out-of-band.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use wirl_engine::checkpoint::Write;
use wirl_orchestrator::RunStatus;

use crate::common::ListResponse;
use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", post(start_run).get(list_runs))
        .route("/workflows/:id", get(get_run))
        .route("/workflows/:id/run-details", get(run_details))
        .route("/workflows/:id/continue", post(continue_run))
        .route("/workflows/:id/cancel", post(cancel_run))
        .with_state(state)
}

fn status_str(status: RunStatus) -> &'static str {
    status.as_str()
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RunSummary {
    pub id: Uuid,
    pub template: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RunDetail {
    pub id: Uuid,
    pub template: String,
    pub status: String,
    pub inputs: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListRunsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/workflows",
    params(ListRunsQuery),
    responses((status = 200, description = "Paginated runs", body = crate::common::RunListResponse)),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ListResponse<RunSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let (runs, total) = state.runs.list(limit, offset).await?;
    Ok(Json(ListResponse {
        items: runs
            .into_iter()
            .map(|r| RunSummary {
                id: r.run_id,
                template: r.template_name,
                status: status_str(r.status).to_string(),
                created_at: r.created_at,
            })
            .collect(),
        total,
        limit,
        offset,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartRunRequest {
    pub template_name: String,
    #[serde(default = "default_inputs")]
    pub inputs: Value,
}

fn default_inputs() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StartRunResponse {
    pub id: Uuid,
    pub status: String,
    pub result: Option<Value>,
}

#[utoipa::path(
    post,
    path = "/workflows",
    request_body = StartRunRequest,
    responses((status = 200, description = "Run enqueued", body = StartRunResponse)),
    tag = "runs"
)]
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, ApiError> {
    if !req.inputs.is_object() {
        return Err(ApiError::Validation("inputs must be a JSON object".to_string()));
    }

    let workflow = state.registry.resolve(&req.template_name).await?;
    let run_id = state
        .runs
        .enqueue(&req.template_name, &workflow.source_hash, req.inputs, None)
        .await?;

    Ok(Json(StartRunResponse {
        id: run_id,
        status: RunStatus::Queued.as_str().to_string(),
        result: None,
    }))
}

#[utoipa::path(
    get,
    path = "/workflows/{id}",
    params(("id" = Uuid, Path, description = "Run id")),
    responses((status = 200, description = "Run detail", body = RunDetail), (status = 404, description = "Unknown run")),
    tag = "runs"
)]
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<RunDetail>, ApiError> {
    let run = state
        .runs
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::RunNotFound(id))?;
    Ok(Json(RunDetail {
        id: run.run_id,
        template: run.template_name,
        status: status_str(run.status).to_string(),
        inputs: run.inputs,
        result: run.result,
        error: run.error,
    }))
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StepTrace {
    pub step: u64,
    pub node: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub input_state: Value,
    pub output_state: Value,
    pub branches: Vec<String>,
    pub writes: Vec<WriteDto>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WriteDto {
    pub kind: String,
    pub channel: String,
    pub value: Value,
}

impl From<&Write> for WriteDto {
    fn from(w: &Write) -> Self {
        let kind = match w.kind {
            wirl_engine::checkpoint::WriteKind::NodeOutput => "node_output",
            wirl_engine::checkpoint::WriteKind::CycleOutput => "cycle_output",
        };
        Self {
            kind: kind.to_string(),
            channel: w.channel.clone(),
            value: w.value.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RunDetailsResponse {
    pub initial_state: Value,
    pub steps: Vec<StepTrace>,
}

/// Renders the per-superstep checkpoint sequence as a per-node trace.
/// `wirl_engine::Snapshot` checkpoints one whole superstep (possibly several
/// frontier nodes at once) rather than one task per node, so each snapshot's
/// writes are grouped by the node that produced them (the channel name's
/// segment before its first `.`) to synthesize one trace entry per node,
/// in the node's alphabetical order within that superstep (matching the
/// engine's lexicographic tie-break, spec.md §4.3).
#[utoipa::path(
    get,
    path = "/workflows/{id}/run-details",
    params(("id" = Uuid, Path, description = "Run id")),
    responses((status = 200, description = "Per-superstep execution trace", body = RunDetailsResponse), (status = 404, description = "Unknown run")),
    tag = "runs"
)]
pub async fn run_details(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunDetailsResponse>, ApiError> {
    state
        .runs
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::RunNotFound(id))?;

    let checkpoints = state.checkpoints.list_with_created_at(id).await?;
    let initial_state = checkpoints
        .first()
        .map(|(snap, _)| serde_json::to_value(&snap.channels).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);

    let mut steps = Vec::new();
    let mut prev_channels = checkpoints.first().map(|(s, _)| s.channels.clone()).unwrap_or_default();

    for (snapshot, created_at) in &checkpoints {
        let mut by_node: std::collections::BTreeMap<String, Vec<&Write>> = std::collections::BTreeMap::new();
        for write in &snapshot.writes {
            let node = write.channel.split('.').next().unwrap_or(&write.channel).to_string();
            by_node.entry(node).or_default().push(write);
        }

        for (node, writes) in by_node {
            steps.push(StepTrace {
                step: snapshot.superstep,
                node: node.clone(),
                task_id: format!("{id}-{}-{node}", snapshot.superstep),
                timestamp: *created_at,
                input_state: serde_json::to_value(&prev_channels).unwrap_or(Value::Null),
                output_state: serde_json::to_value(&snapshot.channels).unwrap_or(Value::Null),
                branches: Vec::new(),
                writes: writes.into_iter().map(WriteDto::from).collect(),
            });
        }

        prev_channels = snapshot.channels.clone();
    }

    Ok(Json(RunDetailsResponse { initial_state, steps }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ContinueRunRequest {
    #[serde(default = "default_inputs")]
    pub inputs: Value,
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/continue",
    params(("id" = Uuid, Path, description = "Run id")),
    request_body = ContinueRunRequest,
    responses(
        (status = 200, description = "Run re-queued for resumption", body = RunDetail),
        (status = 404, description = "Unknown run"),
        (status = 409, description = "Run is not in a continuable state"),
    ),
    tag = "runs"
)]
pub async fn continue_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ContinueRunRequest>,
) -> Result<Json<RunDetail>, ApiError> {
    let run = state
        .runs
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::RunNotFound(id))?;

    match run.status {
        RunStatus::NeedsInput | RunStatus::Failed => {}
        other => {
            return Err(ApiError::Conflict(format!(
                "run {id} is '{}', which cannot be continued",
                other.as_str()
            )))
        }
    }

    state.runs.continue_run(id, req.inputs).await?;
    let updated = state
        .runs
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::RunNotFound(id))?;

    Ok(Json(RunDetail {
        id: updated.run_id,
        template: updated.template_name,
        status: status_str(updated.status).to_string(),
        inputs: updated.inputs,
        result: updated.result,
        error: updated.error,
    }))
}

#[utoipa::path(
    post,
    path = "/workflows/{id}/cancel",
    params(("id" = Uuid, Path, description = "Run id")),
    responses((status = 204, description = "Cancellation requested"), (status = 404, description = "Unknown run")),
    tag = "runs"
)]
pub async fn cancel_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state
        .runs
        .get(id)
        .await?
        .ok_or_else(|| wirl_orchestrator::StoreError::RunNotFound(id))?;
    state.runs.request_cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirl_engine::checkpoint::WriteKind;

    #[test]
    fn write_channel_splits_on_first_dot_for_node_name() {
        let write = Write {
            kind: WriteKind::NodeOutput,
            channel: "Fetch.body".to_string(),
            value: Value::String("ok".to_string()),
        };
        let node = write.channel.split('.').next().unwrap_or(&write.channel);
        assert_eq!(node, "Fetch");
    }

    #[test]
    fn write_dto_preserves_kind_and_value() {
        let write = Write {
            kind: WriteKind::CycleOutput,
            channel: "Loop.count".to_string(),
            value: Value::from(3),
        };
        let dto = WriteDto::from(&write);
        assert_eq!(dto.kind, "cycle_output");
        assert_eq!(dto.channel, "Loop.count");
        assert_eq!(dto.value, Value::from(3));
    }
}
