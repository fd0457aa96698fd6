//! The callable resolver contract (spec.md §6): the engine's only way of
//! reaching user-supplied step implementations.
//!
//! Two binding modes are supported per spec.md §9: in-process (same address
//! space, `InProcessRegistry`) and sub-process (`SubprocessCallable`, one
//! spawn per call with JSON over stdio) so a crashing callable cannot take
//! the engine down with it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Error raised by a callable invocation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallableError {
    pub message: String,
    pub kind: String,
    pub retryable: bool,
}

impl CallableError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Marks this error as transient, e.g. a subprocess call that timed out
    /// or a downstream dependency that is temporarily unavailable. Surfaced
    /// for logging/API consumption only — the engine does not act on it.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for CallableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CallableError {}

/// `f(inputs, config) -> outputs`, per spec.md §6's callable resolver
/// contract. `inputs` keys match the node's declared input names; `config`
/// is the node's `const` block merged with the runner-supplied
/// `configurable` submap (including `thread_id = run_id`).
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(
        &self,
        inputs: Map<String, Value>,
        config: Map<String, Value>,
    ) -> Result<Map<String, Value>, CallableError>;
}

/// Resolves `(module, name)` to a callable. Implementations are looked up
/// once per node invocation; the engine holds no long-lived reference.
pub trait CallableResolver: Send + Sync {
    fn resolve(&self, module: &str, name: &str) -> Option<Arc<dyn Callable>>;
}

/// Splits a node's `call_target` (e.g. `"math.increment"`) into
/// `(module, name)`. The function name is the final dotted segment; anything
/// before it is the module path.
pub fn parse_call_target(target: &str) -> (&str, &str) {
    match target.rsplit_once('.') {
        Some((module, name)) => (module, name),
        None => ("", target),
    }
}

/// An in-process registry of named callables, keyed by `(module, name)`.
/// This is the binding mode used by the CLI and the orchestrator's default
/// worker configuration.
#[derive(Default, Clone)]
pub struct InProcessRegistry {
    callables: HashMap<(String, String), Arc<dyn Callable>>,
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        callable: Arc<dyn Callable>,
    ) {
        self.callables.insert((module.into(), name.into()), callable);
    }
}

impl CallableResolver for InProcessRegistry {
    fn resolve(&self, module: &str, name: &str) -> Option<Arc<dyn Callable>> {
        self.callables
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }
}

/// Wraps a closure as a `Callable`, for registering small native functions
/// without writing a struct + impl per node.
pub struct FnCallable<F>(pub F);

#[async_trait]
impl<F, Fut> Callable for FnCallable<F>
where
    F: Fn(Map<String, Value>, Map<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Map<String, Value>, CallableError>> + Send,
{
    async fn call(
        &self,
        inputs: Map<String, Value>,
        config: Map<String, Value>,
    ) -> Result<Map<String, Value>, CallableError> {
        (self.0)(inputs, config).await
    }
}

/// Invokes a callable out-of-process: spawns `program` with `args`, writes a
/// single JSON object `{"module", "name", "inputs", "config"}` to its stdin,
/// and expects a single JSON object (the outputs mapping) on its stdout.
/// Isolates callable crashes from the engine process at the cost of one
/// process spawn per invocation.
pub struct SubprocessCallable {
    pub program: String,
    pub args: Vec<String>,
    pub module: String,
    pub name: String,
}

#[async_trait]
impl Callable for SubprocessCallable {
    async fn call(
        &self,
        inputs: Map<String, Value>,
        config: Map<String, Value>,
    ) -> Result<Map<String, Value>, CallableError> {
        let request = serde_json::json!({
            "module": self.module,
            "name": self.name,
            "inputs": inputs,
            "config": config,
        });
        let payload = serde_json::to_vec(&request)
            .map_err(|e| CallableError::new("SerializationError", e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CallableError::new("SpawnError", e.to_string()).retryable())?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| CallableError::new("SpawnError", "missing stdin handle"))?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| CallableError::new("IoError", e.to_string()).retryable())?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CallableError::new("IoError", e.to_string()).retryable())?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CallableError::new(
                "SubprocessError",
                format!(
                    "subprocess exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            ));
        }

        serde_json::from_slice::<Map<String, Value>>(&output.stdout)
            .map_err(|e| CallableError::new("SerializationError", e.to_string()))
    }
}

