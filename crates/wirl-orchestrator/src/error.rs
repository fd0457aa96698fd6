//! Error taxonomy for the run queue, worker pool, and trigger scheduler
//! (spec.md §7).

use uuid::Uuid;

/// Errors from the Postgres-backed run queue and checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("template {0} not found")]
    TemplateNotFound(String),

    #[error("trigger {0} not found")]
    TriggerNotFound(Uuid),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for wirl_engine::EngineError {
    fn from(e: StoreError) -> Self {
        wirl_engine::EngineError::Store(wirl_engine::checkpoint::StoreError::Database(e.to_string()))
    }
}

/// A worker discovered it no longer owns a run it was executing — another
/// worker reclaimed it as stale, or the run was cancelled out from under it.
/// The worker aborts and leaves the row for whoever holds the claim now.
#[derive(Debug, thiserror::Error)]
#[error("lost claim on run {0}")]
pub struct ClaimLost(pub Uuid);

/// Errors surfaced by the worker pool itself, distinct from a single run's
/// execution failure (which is recorded on the run row, not returned here).
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("graceful shutdown timed out with {0} run(s) still in flight")]
    ShutdownTimeout(usize),
}

/// Errors surfaced by the trigger scheduler. A trigger that fails with
/// `CronInvalid` or `InputsTemplateInvalid` is auto-deactivated by the
/// scheduler (spec.md §4.6) rather than propagated further.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid cron expression '{0}': {1}")]
    CronInvalid(String, String),

    #[error("inputs_template is not a JSON object: {0}")]
    InputsTemplateInvalid(String),
}

/// Registry/template compilation errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("template '{0}' has no WIRL source on disk at {1}")]
    SourceNotFound(String, String),

    #[error("template '{name}' failed to parse/compile: {errors}")]
    CompileFailed { name: String, errors: String },
}
