//! Shared application state threaded through every route module, grounded
//! on the teacher's per-module `AppState` convention (each route module
//! holds only the service handles it needs).

use std::sync::Arc;

use wirl_orchestrator::{PostgresCheckpointStore, RunStore, TemplateRegistry, TriggerStore};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TemplateRegistry>,
    pub runs: RunStore,
    pub triggers: TriggerStore,
    /// Concrete (not trait-object) handle: `run-details` needs each
    /// checkpoint row's `created_at`, which `wirl_engine::CheckpointStore`
    /// does not expose (the engine's `Snapshot` is storage-agnostic and
    /// carries no timestamp of its own).
    pub checkpoints: PostgresCheckpointStore,
}
