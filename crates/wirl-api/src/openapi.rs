//! Aggregates every route module's `utoipa::path` into one `ApiDoc`, served
//! at `/swagger-ui`, mirroring the teacher's control-plane `main.rs`.

use utoipa::OpenApi;

use crate::routes::{health, runs, templates, triggers};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        templates::list_templates,
        runs::list_runs,
        runs::start_run,
        runs::get_run,
        runs::run_details,
        runs::continue_run,
        runs::cancel_run,
        triggers::list_triggers,
        triggers::create_trigger,
        triggers::update_trigger,
        triggers::delete_trigger,
    ),
    components(schemas(
        health::HealthResponse,
        templates::TemplateSummary,
        runs::RunSummary,
        runs::RunDetail,
        runs::StartRunRequest,
        runs::StartRunResponse,
        runs::ContinueRunRequest,
        runs::RunDetailsResponse,
        runs::StepTrace,
        runs::WriteDto,
        triggers::TriggerDto,
        triggers::CreateTriggerRequest,
        triggers::UpdateTriggerRequest,
        crate::common::ErrorResponse,
        crate::common::RunListResponse,
    )),
    tags(
        (name = "health", description = "Liveness probe"),
        (name = "templates", description = "WIRL workflow templates"),
        (name = "runs", description = "Workflow runs"),
        (name = "triggers", description = "Cron-scheduled workflow triggers"),
    )
)]
pub struct ApiDoc;
