//! The durable run orchestrator (spec.md §4.5-§4.6): a Postgres-backed job
//! queue, worker pool, template registry, and cron trigger scheduler sitting
//! on top of `wirl_engine::Engine`.
//!
//! ```text
//! workflow_runs (queue) <- [RunStore::claim_one] <- [WorkerPool] -> Engine
//! workflow_triggers      <- [TriggerScheduler] -> RunStore::enqueue
//! ```

pub mod error;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod worker;

pub use error::{ClaimLost, RegistryError, SchedulerError, StoreError, WorkerPoolError};
pub use registry::{TemplateRegistry, TemplateSource};
pub use retry::RetryPolicy;
pub use scheduler::{TriggerScheduler, TriggerSchedulerConfig};
pub use schema::run_migrations;
pub use store::{PostgresCheckpointStore, Run, RunStatus, RunStore, Trigger, TriggerStore, WorkerRegistry};
pub use worker::{WorkerPool, WorkerPoolConfig};
