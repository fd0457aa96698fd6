//! Server configuration, read from the environment (spec.md §6:
//! `DATABASE_URL`, `WORKFLOW_DEFINITIONS_PATH`), mirroring the teacher's
//! `TelemetryConfig::from_env` / `RunnerConfig::from_env` constructors.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub definitions_path: String,
    pub bind_addr: String,
    pub worker_id: String,
    pub max_concurrency: usize,
    pub stale_timeout: chrono::Duration,
    pub trigger_tick_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
        let definitions_path =
            std::env::var("WORKFLOW_DEFINITIONS_PATH").unwrap_or_else(|_| "./workflows".to_string());
        let bind_addr = std::env::var("WIRL_API_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let worker_id = std::env::var("WIRL_WORKER_ID").unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::now_v7()));
        let max_concurrency = std::env::var("WIRL_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let stale_timeout_secs: i64 = std::env::var("WIRL_STALE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        let trigger_tick_secs: u64 = std::env::var("WIRL_TRIGGER_TICK_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);

        Ok(Self {
            database_url,
            definitions_path,
            bind_addr,
            worker_id,
            max_concurrency,
            stale_timeout: chrono::Duration::seconds(stale_timeout_secs),
            trigger_tick_interval: Duration::from_secs(trigger_tick_secs),
        })
    }
}
