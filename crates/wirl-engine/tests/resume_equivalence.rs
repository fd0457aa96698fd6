//! Crash-and-resume equivalence (spec.md §8 invariant 8): a run interrupted
//! at any checkpoint boundary and resumed from its last durable snapshot
//! must finish with the same result as an uninterrupted run, for pure
//! callables. `proptest` generates the crash point (how many `save` calls
//! succeed before the store starts failing) rather than hand-picking a
//! handful of supersteps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{Map, Value};
use uuid::Uuid;
use wirl_engine::checkpoint::{CheckpointStore, InMemoryCheckpointStore, Snapshot, StoreError};
use wirl_engine::{CancelFlag, Engine, EngineError, EngineOutcome, ExecutorConfig, FnCallable, InProcessRegistry};

const CHAIN_SOURCE: &str = r#"
workflow Chain {
    inputs { int x; }
    outputs { y = C.out; }
    node A {
        call "chain.step";
        inputs { int x = x; }
        outputs { int out; }
    }
    node B {
        call "chain.step";
        inputs { int x = A.out; }
        outputs { int out; }
    }
    node C {
        call "chain.step";
        inputs { int x = B.out; }
        outputs { int out; }
    }
}
"#;

fn registry() -> InProcessRegistry {
    let mut registry = InProcessRegistry::new();
    registry.register(
        "chain",
        "step",
        Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
            let x = inputs["x"].as_i64().unwrap();
            Ok(Map::from_iter([("out".to_string(), Value::from(x + 1))]))
        })),
    );
    registry
}

/// Wraps an `InMemoryCheckpointStore` and fails every `save` from the
/// `crash_after`-th call onward, simulating a process crash between
/// supersteps. `load_latest`/`list` always delegate, since those read
/// whatever the real store durably persisted before the crash.
struct CrashingStore {
    inner: Arc<InMemoryCheckpointStore>,
    saves: AtomicU64,
    crash_after: u64,
}

impl CrashingStore {
    fn new(inner: Arc<InMemoryCheckpointStore>, crash_after: u64) -> Self {
        Self {
            inner,
            saves: AtomicU64::new(0),
            crash_after,
        }
    }
}

#[async_trait]
impl CheckpointStore for CrashingStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let call = self.saves.fetch_add(1, Ordering::SeqCst);
        if call >= self.crash_after {
            return Err(StoreError::Io("simulated crash".to_string()));
        }
        self.inner.save(snapshot).await
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        self.inner.load_latest(run_id).await
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<Snapshot>, StoreError> {
        self.inner.list(run_id).await
    }
}

async fn run_uninterrupted(x: i64) -> i64 {
    let workflow = wirl_dsl::compile(CHAIN_SOURCE).unwrap();
    let engine = Engine::new(Arc::new(InMemoryCheckpointStore::new()), Arc::new(registry()), ExecutorConfig::default());
    let run_id = Uuid::now_v7();
    let inputs = Map::from_iter([("x".to_string(), Value::from(x))]);
    match engine.start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new()).await.unwrap() {
        EngineOutcome::Completed { result } => result["y"].as_i64().unwrap(),
        other => panic!("expected completion, got {other:?}"),
    }
}

/// Runs with a store that crashes after `crash_after` saves; if it crashes
/// mid-run, resumes against the real inner store and drives to completion.
/// Returns the final `y` either way.
async fn run_with_crash_at(x: i64, crash_after: u64) -> i64 {
    let workflow = wirl_dsl::compile(CHAIN_SOURCE).unwrap();
    let inner = Arc::new(InMemoryCheckpointStore::new());
    let crashing = Arc::new(CrashingStore::new(inner.clone(), crash_after));
    let engine = Engine::new(crashing, Arc::new(registry()), ExecutorConfig::default());
    let run_id = Uuid::now_v7();
    let inputs = Map::from_iter([("x".to_string(), Value::from(x))]);

    match engine.start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new()).await {
        Ok(EngineOutcome::Completed { result }) => return result["y"].as_i64().unwrap(),
        Ok(other) => panic!("chain workflow has no HITL node, got {other:?}"),
        Err(EngineError::Store(_)) => {}
        Err(other) => panic!("only the simulated store crash should surface, got {other:?}"),
    }

    let resume_engine = Engine::new(inner, Arc::new(registry()), ExecutorConfig::default());
    match resume_engine.resume(&workflow, run_id, None, Map::new(), &CancelFlag::new()).await.unwrap() {
        EngineOutcome::Completed { result } => result["y"].as_i64().unwrap(),
        other => panic!("expected completion after resume, got {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn resuming_after_a_crash_matches_an_uninterrupted_run(x in -1000i64..1000, crash_after in 0u64..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let baseline = rt.block_on(run_uninterrupted(x));
        let resumed = rt.block_on(run_with_crash_at(x, crash_after));
        prop_assert_eq!(baseline, resumed);
    }
}
