//! Control-plane HTTP server: serves the `/workflow-templates`, `/workflows`,
//! and `/workflow-triggers` routes and, in the same process, runs the worker
//! pool and trigger scheduler in the background (spec.md §5: "The scheduler
//! and workers run alongside the API in the same or a separate process").
//! Mirrors the teacher's control-plane `main.rs` bootstrap order: tracing,
//! config, pool, migrations, then serve.

mod common;
mod config;
mod error;
mod openapi;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use wirl_orchestrator::{
    run_migrations, PostgresCheckpointStore, RunStore, TemplateRegistry, TriggerScheduler, TriggerSchedulerConfig,
    TriggerStore, WorkerPool, WorkerPoolConfig, WorkerRegistry,
};

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool).await.context("failed to run migrations")?;

    let registry = Arc::new(TemplateRegistry::new(config.definitions_path.clone()));
    let runs = RunStore::new(pool.clone());
    let triggers = TriggerStore::new(pool.clone());
    let checkpoints = PostgresCheckpointStore::new(pool.clone());
    let workers = WorkerRegistry::new(pool.clone());

    // No in-process callables are registered here: callable implementations
    // are an external collaborator (spec.md §1, Out of Scope) that a
    // deployment wires in via a `CallableResolver` of its own, or reaches
    // through `SubprocessCallable`. The control plane itself only queues and
    // tracks runs; callable resolution happens inside the worker pool below.
    let resolver: Arc<dyn wirl_engine::CallableResolver> = Arc::new(wirl_engine::InProcessRegistry::new());

    let worker_pool = Arc::new(WorkerPool::new(
        runs.clone(),
        Arc::new(checkpoints.clone()),
        registry.clone(),
        resolver,
        workers,
        WorkerPoolConfig {
            worker_id: config.worker_id.clone(),
            max_concurrency: config.max_concurrency,
            stale_threshold: config.stale_timeout,
            ..Default::default()
        },
    ));
    worker_pool.start().await.context("failed to start worker pool")?;

    let scheduler = Arc::new(TriggerScheduler::new(
        triggers.clone(),
        runs.clone(),
        registry.clone(),
        TriggerSchedulerConfig {
            tick_interval: config.trigger_tick_interval,
            ..Default::default()
        },
    ));
    let scheduler_handle = scheduler.clone().spawn();

    let state = AppState {
        registry,
        runs,
        triggers,
        checkpoints,
    };

    let app = routes::all(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()));

    let cors_origins: Vec<_> = std::env::var("WIRL_CORS_ORIGINS")
        .ok()
        .map(|v| v.split(',').filter(|s| !s.is_empty()).map(|s| s.parse().unwrap()).collect())
        .unwrap_or_default();
    let app = if !cors_origins.is_empty() {
        tracing::info!(?cors_origins, "CORS origins configured");
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT]),
        )
    } else {
        app
    };
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "wirl-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    scheduler.stop();
    scheduler_handle.abort();
    worker_pool.shutdown().await.context("worker pool shutdown failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
