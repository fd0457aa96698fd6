//! The worker pool: claims queued runs, drives each one against
//! `wirl_engine::Engine`, and writes the terminal or interim state back
//! (spec.md §4.5).
//!
//! Grounded on `durable::worker::pool::WorkerPool`: a semaphore caps
//! `max_concurrency`, a `tokio::sync::watch` channel signals shutdown to
//! three background loops (poll, heartbeat, stale-reclaim), and `shutdown()`
//! drains in-flight work against a deadline before deregistering. The
//! teacher's separate watermark-based `BackpressureState` layer is not
//! carried — spec.md only calls for a hard concurrency cap ("each worker
//! process runs N concurrent runs"), so the semaphore alone covers it; this
//! is noted as a simplification in DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use wirl_engine::{CancelFlag, Engine, EngineOutcome, ExecutorConfig, SharedCheckpointStore};

use crate::error::{StoreError, WorkerPoolError};
use crate::registry::TemplateRegistry;
use crate::retry::RetryPolicy;
use crate::store::{Run, RunStatus, RunStore, WorkerRegistry};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_reclaim_interval: Duration,
    pub stale_threshold: chrono::Duration,
    pub cancel_poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: chrono::Duration::seconds(300),
            cancel_poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolStatus {
    Stopped,
    Running,
    Draining,
}

/// Drives claimed runs with `Engine`, using `registry` to resolve
/// `template_name` to a compiled graph and `resolver` to resolve each node's
/// `call_target` to a callable.
pub struct WorkerPool {
    run_store: RunStore,
    checkpoints: SharedCheckpointStore,
    registry: Arc<TemplateRegistry>,
    resolver: Arc<dyn wirl_engine::CallableResolver>,
    workers: WorkerRegistry,
    config: WorkerPoolConfig,
    status: RwLock<PoolStatus>,
    active_runs: Arc<Semaphore>,
    cancel_flags: Arc<RwLock<HashMap<Uuid, CancelFlag>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        run_store: RunStore,
        checkpoints: SharedCheckpointStore,
        registry: Arc<TemplateRegistry>,
        resolver: Arc<dyn wirl_engine::CallableResolver>,
        workers: WorkerRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            run_store,
            checkpoints,
            registry,
            resolver,
            workers,
            active_runs: Arc::new(Semaphore::new(config.max_concurrency)),
            status: RwLock::new(PoolStatus::Stopped),
            cancel_flags: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
            config,
            poll_handle: tokio::sync::Mutex::new(None),
            heartbeat_handle: tokio::sync::Mutex::new(None),
            reclaim_handle: tokio::sync::Mutex::new(None),
        }
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().await;
            if *status == PoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = PoolStatus::Running;
        }

        self.workers.register(&self.config.worker_id).await?;
        info!(worker_id = %self.config.worker_id, max_concurrency = self.config.max_concurrency, "worker pool starting");

        self.spawn_poll_loop();
        self.spawn_heartbeat_loop();
        self.spawn_reclaim_loop();
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write().await;
            if *status == PoolStatus::Stopped {
                return Ok(());
            }
            *status = PoolStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let in_flight = self.config.max_concurrency - self.active_runs.available_permits();
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight, "shutdown timed out with runs still in flight");
                return Err(WorkerPoolError::ShutdownTimeout(in_flight));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.workers.deregister(&self.config.worker_id).await?;
        *self.status.write().await = PoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.active_runs.available_permits()
    }

    fn spawn_poll_loop(&self) {
        let run_store = self.run_store.clone();
        let checkpoints = Arc::clone(&self.checkpoints);
        let registry = Arc::clone(&self.registry);
        let resolver = Arc::clone(&self.resolver);
        let config = self.config.clone();
        let active_runs = Arc::clone(&self.active_runs);
        let cancel_flags = Arc::clone(&self.cancel_flags);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let permit = match active_runs.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        if wait_or_shutdown(&mut shutdown_rx, config.poll_interval).await {
                            break;
                        }
                        continue;
                    }
                };

                match run_store.claim_one(&config.worker_id, config.stale_threshold).await {
                    Ok(Some(run)) => {
                        let run_store = run_store.clone();
                        let checkpoints = Arc::clone(&checkpoints);
                        let registry = Arc::clone(&registry);
                        let resolver = Arc::clone(&resolver);
                        let worker_id = config.worker_id.clone();
                        let cancel_poll_interval = config.cancel_poll_interval;
                        let cancel_flags = Arc::clone(&cancel_flags);

                        tokio::spawn(async move {
                            execute_claimed_run(
                                run,
                                run_store,
                                checkpoints,
                                registry,
                                resolver,
                                worker_id,
                                cancel_poll_interval,
                                cancel_flags,
                            )
                            .await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        if wait_or_shutdown(&mut shutdown_rx, config.poll_interval).await {
                            break;
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        error!("poll loop claim failed: {}", e);
                        if wait_or_shutdown(&mut shutdown_rx, config.poll_interval).await {
                            break;
                        }
                    }
                }
            }
            debug!("poll loop exited");
        });
        *self.poll_handle.try_lock().expect("pool not yet started concurrently") = Some(handle);
    }

    fn spawn_heartbeat_loop(&self) {
        let workers = self.workers.clone();
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        let active_runs = Arc::clone(&self.active_runs);
        let max_concurrency = self.config.max_concurrency;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let load = (max_concurrency - active_runs.available_permits()) as i32;
                        if let Err(e) = workers.heartbeat(&worker_id, load).await {
                            error!("heartbeat failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("heartbeat loop exited");
        });
        *self.heartbeat_handle.try_lock().expect("pool not yet started concurrently") = Some(handle);
    }

    fn spawn_reclaim_loop(&self) {
        let run_store = self.run_store.clone();
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match run_store.reclaim_stale(threshold).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "reclaimed stale runs");
                            }
                            Ok(_) => {}
                            Err(e) => error!("stale reclaim failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("reclaim loop exited");
        });
        *self.reclaim_handle.try_lock().expect("pool not yet started concurrently") = Some(handle);
    }
}

async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown_rx.changed() => true,
    }
}

/// Worker lifecycle for one claimed run (spec.md §4.5, steps 1-5): load the
/// template, load the latest checkpoint (if any), drive the engine, then
/// write the terminal or interim state back to `workflow_runs`.
#[instrument(skip_all, fields(run_id = %run.run_id, template = %run.template_name))]
async fn execute_claimed_run(
    run: Run,
    run_store: RunStore,
    checkpoints: SharedCheckpointStore,
    registry: Arc<TemplateRegistry>,
    resolver: Arc<dyn wirl_engine::CallableResolver>,
    worker_id: String,
    cancel_poll_interval: Duration,
    cancel_flags: Arc<RwLock<HashMap<Uuid, CancelFlag>>>,
) {
    let run_id = run.run_id;
    let cancel = CancelFlag::new();
    cancel_flags.write().await.insert(run_id, cancel.clone());
    let watcher = spawn_cancel_watcher(run_id, run_store.clone(), cancel.clone(), cancel_poll_interval);

    let outcome = run_once(&run, &checkpoints, &registry, &resolver, &cancel).await;
    watcher.abort();
    cancel_flags.write().await.remove(&run_id);

    let policy = RetryPolicy::default();
    match outcome {
        Ok(EngineOutcome::Completed { result }) => {
            retry_store_write("mark_succeeded", run_id, &policy, || {
                let result = result.clone();
                async move { run_store.mark_succeeded(run_id, result).await }
            })
            .await;
        }
        Ok(EngineOutcome::Suspended { hitl }) => {
            debug!(node = %hitl.node, "run suspended on HITL node");
            retry_store_write("mark_needs_input", run_id, &policy, || async {
                run_store.mark_needs_input(run_id).await
            })
            .await;
        }
        Ok(EngineOutcome::Canceled) => {
            retry_store_write("mark_canceled", run_id, &policy, || async {
                run_store.mark_canceled(run_id).await
            })
            .await;
        }
        Err(e) => {
            warn!("run failed: {}", e);
            let message = e.to_string();
            retry_store_write("mark_failed", run_id, &policy, || {
                let message = message.clone();
                async move { run_store.mark_failed(run_id, &message).await }
            })
            .await;
        }
    }
}

/// Retries a terminal-state write against `workflow_runs` with `policy`'s
/// backoff, per spec.md §7: "`StoreError` — transient DB failure; retried
/// with backoff inside the worker for up to a bounded window, then surfaces
/// as `failed`". Exhausting every attempt just logs and returns — the run
/// stays claimed by this worker until `stale_timeout` lets another worker's
/// reclaim loop pick it up and try the same write against its own observed
/// terminal state.
async fn retry_store_write<F, Fut>(operation: &str, run_id: Uuid, policy: &RetryPolicy, mut write: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(()) => return,
            Err(e) => {
                if !policy.has_attempts_remaining(attempt) {
                    error!(%run_id, operation, attempt, "giving up on {} after {} attempts: {}", operation, attempt, e);
                    return;
                }
                let delay = policy.delay_for_attempt(attempt + 1);
                warn!(%run_id, operation, attempt, ?delay, "{} failed, retrying: {}", operation, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn run_once(
    run: &Run,
    checkpoints: &SharedCheckpointStore,
    registry: &TemplateRegistry,
    resolver: &Arc<dyn wirl_engine::CallableResolver>,
    cancel: &CancelFlag,
) -> Result<EngineOutcome, wirl_engine::EngineError> {
    let workflow = registry
        .resolve(&run.template_name)
        .await
        .map_err(|e| wirl_engine::EngineError::MissingCallable(e.to_string()))?;

    let engine = Engine::new(Arc::clone(checkpoints), Arc::clone(resolver), ExecutorConfig::default());

    let configurable = Map::new();
    let existing = checkpoints.load_latest(run.run_id).await?;
    if existing.is_some() {
        let resume_payload = run.resume_payload.clone();
        engine.resume(&workflow, run.run_id, resume_payload, configurable, cancel).await
    } else {
        let inputs = match &run.inputs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        engine.start(&workflow, run.run_id, inputs, configurable, cancel).await
    }
}

fn spawn_cancel_watcher(
    run_id: Uuid,
    run_store: RunStore,
    cancel: CancelFlag,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll_interval).await;
            match run_store.get(run_id).await {
                Ok(Some(run)) if run.cancel_requested || run.status != RunStatus::Running => {
                    cancel.request();
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    })
}
