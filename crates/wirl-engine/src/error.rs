//! Error taxonomy for the execution engine (spec.md §7).

use crate::value::ReducerError;

/// A user-provided callable raised an error while executing a node.
///
/// `retryable` is surfaced for logging/API consumption only (e.g. the
/// orchestrator may choose to offer a "retry" affordance for retryable
/// failures) — the engine itself never retries, per spec.md §4.3.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeError {
    pub node: String,
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node '{}' failed ({}): {}", self.node, self.kind, self.message)
    }
}

impl std::error::Error for NodeError {}

/// Errors the engine can surface while driving a single run.
///
/// Fatal variants (`Node`, `Reducer`, `MissingCallable`) terminate the run
/// with `status = failed`; `Cancelled` terminates it with `status =
/// canceled`. The engine never retries internally — see spec.md §4.3.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("node error: {0}")]
    Node(NodeError),

    #[error("reducer error: {0}")]
    Reducer(#[from] ReducerError),

    #[error("no callable registered for target '{0}'")]
    MissingCallable(String),

    #[error("callable for '{target}' returned an output not declared by node '{node}': {field}")]
    UndeclaredOutput {
        node: String,
        target: String,
        field: String,
    },

    #[error("checkpoint store error: {0}")]
    Store(#[from] crate::checkpoint::StoreError),

    #[error("run was cancelled")]
    Cancelled,

    #[error("execution stalled: {0}")]
    Stalled(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
