//! The execution engine: turns a compiled `wirl_dsl::Workflow` plus a set of
//! inputs into a run, one checkpointed superstep at a time.
//!
//! ```text
//! Workflow + inputs -> [Engine::start] -> Completed | Suspended | Canceled | Err
//!                       [Engine::resume] (from a Suspended checkpoint)
//! ```
//!
//! This crate knows nothing about Postgres, HTTP, or the CLI — it only
//! drives a run against the `CheckpointStore` and `CallableResolver` traits,
//! so the same engine backs both the standalone `runner` and the durable
//! orchestrator.

pub mod callable;
pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod value;

pub use callable::{Callable, CallableError, CallableResolver, FnCallable, InProcessRegistry, SubprocessCallable};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, SharedCheckpointStore, Snapshot};
pub use error::EngineError;
pub use executor::{CancelFlag, Engine, EngineOutcome, ExecutorConfig};
pub use value::apply_reducer;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn end_to_end_merge_cycle_then_workflow_output() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow MergeCycle {
                inputs { int rounds; }
                outputs { state = C.state; }
                cycle C {
                    inputs { int rounds; }
                    outputs { state = Step.state (merge); }
                    nodes {
                        node Step {
                            call "state.step";
                            inputs { int rounds = C.rounds; }
                            outputs { state; }
                        }
                        node Check {
                            call "state.check";
                            inputs { state = Step.state; }
                            outputs { more; }
                        }
                    }
                    guard Check.more;
                    max_iterations 3;
                }
            }
            "#,
        )
        .expect("workflow should compile");

        let mut registry = InProcessRegistry::new();
        registry.register(
            "state",
            "step",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                let rounds = inputs["rounds"].as_i64().unwrap_or(0);
                Ok(Map::from_iter([(
                    "state".to_string(),
                    serde_json::json!({ "rounds": rounds }),
                )]))
            })),
        );
        registry.register(
            "state",
            "check",
            Arc::new(FnCallable(|_: Map<String, Value>, _| async move {
                Ok(Map::from_iter([("more".to_string(), Value::Bool(false))]))
            })),
        );

        let engine = Engine::new(
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(registry),
            ExecutorConfig::default(),
        );
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("rounds".to_string(), Value::from(2))]);
        let outcome = engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .expect("run should complete");

        match outcome {
            EngineOutcome::Completed { result } => {
                assert_eq!(result["state"], serde_json::json!({ "rounds": 2 }));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_callable_surfaces_as_engine_error() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow Orphan {
                inputs { int x; }
                outputs { y = A.out; }
                node A {
                    call "nothing.registered";
                    inputs { int x = x; }
                    outputs { out; }
                }
            }
            "#,
        )
        .expect("workflow should compile");

        let engine = Engine::new(
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InProcessRegistry::new()),
            ExecutorConfig::default(),
        );
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("x".to_string(), Value::from(1))]);
        let err = engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .expect_err("should fail without a registered callable");

        assert!(matches!(err, EngineError::MissingCallable(ref t) if t == "nothing.registered"));
    }
}
