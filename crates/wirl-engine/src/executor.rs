//! The Pregel-style superstep driver (spec.md §4-5).
//!
//! One `Engine` drives many runs; a run is a `(Workflow, run_id)` pair plus
//! whatever checkpointed state exists for it. Each pass over the frontier —
//! every top-level node/cycle whose dependencies are satisfied and that
//! hasn't executed yet — is one superstep, persisted as a `Snapshot` before
//! the next one starts. `start` begins a run from its inputs; `resume`
//! re-enters a run parked at a HITL suspension.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;
use wirl_dsl::ast::{BoolExpr, ReducerKind, ValueExpr};
use wirl_dsl::graph::{ChannelRef, CompiledCycle, CompiledNode, GraphNode, Workflow};

use crate::callable::{parse_call_target, CallableResolver};
use crate::checkpoint::{
    CycleProgress, HitlLocation, PendingHitl, RunPhase, SharedCheckpointStore, Snapshot, Write,
    WriteKind,
};
use crate::error::{EngineError, NodeError};
use crate::value::{apply_reducer, literal_to_value};

/// Safety valve against a stalled or misbehaving graph; ordinary runs finish
/// in far fewer supersteps than this.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub max_supersteps: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_supersteps: 10_000,
        }
    }
}

/// A cooperative cancellation switch shared between the engine and whatever
/// holds the run (orchestrator worker, CLI signal handler).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The terminal, non-error states a run can end a `start`/`resume` call in.
/// Failures are not a variant here; they come back as `Err(EngineError)`,
/// with the checkpoint already recording `status = failed` by the time the
/// error is returned.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    Completed { result: BTreeMap<String, Value> },
    Suspended { hitl: PendingHitl },
    Canceled,
}

enum NodeStep {
    Done,
    Suspend(PendingHitl),
    Canceled,
}

/// Drives workflow runs against a checkpoint store and callable resolver.
/// Stateless beyond those two handles — all run state lives in the
/// checkpoint, so one `Engine` can drive any number of concurrent runs.
pub struct Engine {
    checkpoints: SharedCheckpointStore,
    resolver: Arc<dyn CallableResolver>,
    config: ExecutorConfig,
}

impl Engine {
    pub fn new(
        checkpoints: SharedCheckpointStore,
        resolver: Arc<dyn CallableResolver>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            checkpoints,
            resolver,
            config,
        }
    }

    /// Starts a fresh run: seeds the initial channel map from `inputs` and
    /// drives supersteps until the run completes, suspends, or cancels.
    pub async fn start(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        inputs: Map<String, Value>,
        configurable: Map<String, Value>,
        cancel: &CancelFlag,
    ) -> Result<EngineOutcome, EngineError> {
        let mut channels = BTreeMap::new();
        for name in &workflow.input_names {
            let value = inputs.get(name).cloned().unwrap_or(Value::Null);
            channels.insert(name.clone(), value);
        }
        let pending = (0..workflow.top_level.len()).collect();
        let snapshot = Snapshot::initial(run_id, pending, channels);
        self.drive(workflow, run_id, snapshot, configurable, cancel, None)
            .await
    }

    /// Re-enters a run from its latest checkpoint. Covers both shapes of
    /// `POST /workflows/{id}/continue` (spec.md §6): resuming a HITL
    /// suspension (pass `resume_payload`, fed to the exact node that
    /// suspended it) and retrying a failed or crash-interrupted run from its
    /// last checkpoint (pass `None` — the frontier simply re-resolves
    /// whatever was still pending, including the node that previously
    /// errored).
    pub async fn resume(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        resume_payload: Option<Value>,
        configurable: Map<String, Value>,
        cancel: &CancelFlag,
    ) -> Result<EngineOutcome, EngineError> {
        let mut snapshot = self
            .checkpoints
            .load_latest(run_id)
            .await?
            .ok_or(crate::checkpoint::StoreError::NotFound(run_id))?;

        let resume = match (snapshot.pending_hitl.take(), resume_payload) {
            (Some(hitl), Some(payload)) => Some((hitl.location, payload)),
            (Some(hitl), None) => {
                // Put it back — there is nothing to re-drive with yet.
                snapshot.pending_hitl = Some(hitl);
                return Err(EngineError::Node(NodeError {
                    node: workflow.name.clone(),
                    kind: "MissingResumePayload".to_string(),
                    message: format!("run {run_id} is suspended on a HITL node and needs a payload to continue"),
                    retryable: false,
                }));
            }
            (None, _) => None,
        };
        snapshot.status = RunPhase::Running;

        self.drive(workflow, run_id, snapshot, configurable, cancel, resume).await
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        mut snapshot: Snapshot,
        configurable: Map<String, Value>,
        cancel: &CancelFlag,
        mut resume: Option<(HitlLocation, Value)>,
    ) -> Result<EngineOutcome, EngineError> {
        loop {
            if cancel.is_set() {
                snapshot.status = RunPhase::Canceled;
                snapshot.writes.clear();
                self.checkpoints.save(snapshot).await?;
                return Ok(EngineOutcome::Canceled);
            }

            if snapshot.pending.is_empty() {
                let mut result = BTreeMap::new();
                for out in &workflow.outputs {
                    let value = resolve_channel(&out.source, &snapshot.channels).unwrap_or(Value::Null);
                    result.insert(out.name.clone(), value);
                }
                snapshot.status = RunPhase::Succeeded;
                snapshot.result = Some(result.clone());
                snapshot.writes.clear();
                self.checkpoints.save(snapshot).await?;
                return Ok(EngineOutcome::Completed { result });
            }

            if snapshot.superstep >= self.config.max_supersteps {
                let message = format!(
                    "workflow '{}' exceeded {} supersteps",
                    workflow.name, self.config.max_supersteps
                );
                snapshot.status = RunPhase::Failed;
                snapshot.error = Some(message.clone());
                self.checkpoints.save(snapshot).await?;
                return Err(EngineError::Stalled(message));
            }

            let resume_target = resume
                .as_ref()
                .map(|(loc, _)| location_top_level_index(loc, workflow));

            let frontier: Vec<usize> = workflow
                .topo_order
                .iter()
                .copied()
                .filter(|idx| snapshot.pending.contains(idx))
                .filter(|idx| top_level_ready(&workflow.top_level[*idx], &snapshot.channels))
                .collect();

            if frontier.is_empty() {
                let message = format!(
                    "{} pending item(s) in workflow '{}' have no satisfied dependency",
                    snapshot.pending.len(),
                    workflow.name
                );
                snapshot.status = RunPhase::Failed;
                snapshot.error = Some(message.clone());
                self.checkpoints.save(snapshot).await?;
                return Err(EngineError::Stalled(message));
            }

            let mut writes = Vec::new();
            let mut suspended = None;
            let mut canceled = false;

            for idx in frontier {
                if cancel.is_set() {
                    canceled = true;
                    break;
                }

                let carries_resume = resume_target == Some(idx);

                let step = match &workflow.top_level[idx] {
                    GraphNode::Node(node) => {
                        let answer = if carries_resume {
                            resume.take().map(|(_, v)| v)
                        } else {
                            None
                        };
                        self.run_top_level_node(
                            node,
                            &mut snapshot.channels,
                            &configurable,
                            run_id,
                            answer,
                            &mut writes,
                        )
                        .await?
                    }
                    GraphNode::Cycle(cycle) => {
                        let cycle_resume = if carries_resume {
                            match resume.take() {
                                Some((HitlLocation::InCycle { node_index, .. }, value)) => {
                                    Some((node_index, value))
                                }
                                _ => None,
                            }
                        } else {
                            None
                        };
                        self.run_cycle(
                            cycle,
                            &mut snapshot.channels,
                            &mut snapshot.cycle_iterations,
                            &mut snapshot.cycle_progress,
                            &configurable,
                            run_id,
                            cycle_resume,
                            cancel,
                            &mut writes,
                        )
                        .await?
                    }
                };

                match step {
                    NodeStep::Done => {
                        snapshot.pending.remove(&idx);
                    }
                    NodeStep::Suspend(hitl) => {
                        suspended = Some(hitl);
                        break;
                    }
                    NodeStep::Canceled => {
                        canceled = true;
                        break;
                    }
                }
            }

            snapshot.writes = writes;

            if canceled {
                snapshot.status = RunPhase::Canceled;
                self.checkpoints.save(snapshot).await?;
                return Ok(EngineOutcome::Canceled);
            }

            if let Some(hitl) = suspended {
                snapshot.pending_hitl = Some(hitl.clone());
                snapshot.status = RunPhase::NeedsInput;
                self.checkpoints.save(snapshot).await?;
                return Ok(EngineOutcome::Suspended { hitl });
            }

            snapshot.superstep += 1;
            self.checkpoints.save(snapshot.clone()).await?;
        }
    }

    async fn run_top_level_node(
        &self,
        node: &CompiledNode,
        channels: &mut BTreeMap<String, Value>,
        configurable: &Map<String, Value>,
        run_id: Uuid,
        hitl_answer: Option<Value>,
        writes: &mut Vec<Write>,
    ) -> Result<NodeStep, EngineError> {
        if let Some(when) = &node.when {
            if !eval_bool(when, None, channels) {
                skip_outputs(node, channels, writes);
                return Ok(NodeStep::Done);
            }
        }

        if node.hitl.is_some() && hitl_answer.is_none() {
            return Ok(NodeStep::Suspend(PendingHitl {
                node: node.name.clone(),
                correlation: hitl_correlation(node),
                location: HitlLocation::TopLevel { index: node.id },
            }));
        }

        let call_inputs = build_call_inputs(&node.inputs, channels, hitl_answer);
        let config = build_config(&node.consts, configurable, run_id);

        let outputs = self.invoke(&node.call_target, &node.name, call_inputs, config).await?;
        check_declared_outputs(node, &outputs)?;

        for out_name in &node.output_names {
            let raw = outputs.get(out_name).cloned().unwrap_or(Value::Null);
            let key = format!("{}.{}", node.name, out_name);
            writes.push(Write {
                kind: WriteKind::NodeOutput,
                channel: key.clone(),
                value: raw.clone(),
            });
            channels.insert(key, raw);
        }

        Ok(NodeStep::Done)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_cycle(
        &self,
        cycle: &CompiledCycle,
        channels: &mut BTreeMap<String, Value>,
        cycle_iterations: &mut BTreeMap<String, u32>,
        cycle_progress: &mut BTreeMap<String, CycleProgress>,
        configurable: &Map<String, Value>,
        run_id: Uuid,
        resume: Option<(usize, Value)>,
        cancel: &CancelFlag,
        writes: &mut Vec<Write>,
    ) -> Result<NodeStep, EngineError> {
        let resuming = cycle_progress.contains_key(&cycle.name);
        let mut internal = cycle_progress
            .get(&cycle.name)
            .map(|p| p.internal_channels.clone())
            .unwrap_or_default();
        let mut iteration = cycle_iterations.get(&cycle.name).copied().unwrap_or(0);

        if !resuming {
            for input_name in &cycle.input_names {
                let value = channels.get(input_name).cloned().unwrap_or(Value::Null);
                internal.insert(format!("{}.{}", cycle.name, input_name), value);
            }
        }

        let effective_reducers = effective_cycle_reducers(cycle);

        let (mut start_pos, mut resume_answer) = match resume {
            Some((pos, value)) => (pos, Some(value)),
            None => (0, None),
        };

        loop {
            if cancel.is_set() {
                cycle_progress.insert(
                    cycle.name.clone(),
                    CycleProgress {
                        iteration,
                        internal_channels: internal,
                    },
                );
                return Ok(NodeStep::Canceled);
            }

            for pos in start_pos..cycle.internal_topo_order.len() {
                let node_idx = cycle.internal_topo_order[pos];
                let node = &cycle.nodes[node_idx];
                let answer = if pos == start_pos { resume_answer.take() } else { None };

                if let Some(when) = &node.when {
                    if !eval_bool(when, Some(cycle.name.as_str()), &internal) {
                        skip_cycle_outputs(cycle, node, &mut internal, writes);
                        continue;
                    }
                }

                if node.hitl.is_some() && answer.is_none() {
                    cycle_progress.insert(
                        cycle.name.clone(),
                        CycleProgress {
                            iteration,
                            internal_channels: internal,
                        },
                    );
                    return Ok(NodeStep::Suspend(PendingHitl {
                        node: node.name.clone(),
                        correlation: hitl_correlation(node),
                        location: HitlLocation::InCycle {
                            cycle_index: cycle.id,
                            node_index: pos,
                        },
                    }));
                }

                let call_inputs = build_call_inputs(&node.inputs, &internal, answer);
                let config = build_config(&node.consts, configurable, run_id);

                let raw_outputs = self
                    .invoke(&node.call_target, &node.name, call_inputs, config)
                    .await?;
                check_declared_outputs(node, &raw_outputs)?;

                for out_name in &node.output_names {
                    let raw = raw_outputs.get(out_name).cloned().unwrap_or(Value::Null);
                    let key = format!("{}.{}", node.name, out_name);
                    let reducer = effective_reducers.get(&key).copied().unwrap_or(ReducerKind::Replace);
                    let combined = apply_reducer(&key, internal.get(&key), raw, reducer)?;
                    writes.push(Write {
                        kind: WriteKind::CycleOutput,
                        channel: format!("{}.{}", cycle.name, key),
                        value: combined.clone(),
                    });
                    internal.insert(key, combined);
                }
            }

            start_pos = 0;
            iteration += 1;
            cycle_iterations.insert(cycle.name.clone(), iteration);

            let guard_true = eval_bool(&cycle.guard, Some(cycle.name.as_str()), &internal);
            if !guard_true || iteration >= cycle.max_iterations {
                break;
            }
        }

        cycle_progress.remove(&cycle.name);

        for out in &cycle.outputs {
            let value = match &out.source {
                ChannelRef::NodeOutput { node, field } => {
                    internal.get(&format!("{node}.{field}")).cloned().unwrap_or(Value::Null)
                }
                other => resolve_channel(other, &internal).unwrap_or(Value::Null),
            };
            channels.insert(format!("{}.{}", cycle.name, out.name), value);
        }

        Ok(NodeStep::Done)
    }

    async fn invoke(
        &self,
        call_target: &str,
        node_name: &str,
        inputs: Map<String, Value>,
        config: Map<String, Value>,
    ) -> Result<Map<String, Value>, EngineError> {
        let (module, name) = parse_call_target(call_target);
        let callable = self
            .resolver
            .resolve(module, name)
            .ok_or_else(|| EngineError::MissingCallable(call_target.to_string()))?;

        callable.call(inputs, config).await.map_err(|e| {
            EngineError::Node(NodeError {
                node: node_name.to_string(),
                kind: e.kind,
                message: e.message,
                retryable: e.retryable,
            })
        })
    }
}

fn hitl_correlation(node: &CompiledNode) -> BTreeMap<String, Value> {
    node.hitl
        .as_ref()
        .map(|h| {
            h.correlation
                .iter()
                .map(|(k, v)| (k.clone(), literal_to_value(v)))
                .collect()
        })
        .unwrap_or_default()
}

fn skip_outputs(node: &CompiledNode, channels: &mut BTreeMap<String, Value>, writes: &mut Vec<Write>) {
    for out_name in &node.output_names {
        let key = format!("{}.{}", node.name, out_name);
        writes.push(Write {
            kind: WriteKind::NodeOutput,
            channel: key.clone(),
            value: Value::Null,
        });
        channels.insert(key, Value::Null);
    }
}

fn skip_cycle_outputs(
    cycle: &CompiledCycle,
    node: &CompiledNode,
    internal: &mut BTreeMap<String, Value>,
    writes: &mut Vec<Write>,
) {
    for out_name in &node.output_names {
        let key = format!("{}.{}", node.name, out_name);
        writes.push(Write {
            kind: WriteKind::CycleOutput,
            channel: format!("{}.{}", cycle.name, key),
            value: Value::Null,
        });
        internal.insert(key, Value::Null);
    }
}

fn build_call_inputs(
    inputs: &[wirl_dsl::graph::ResolvedInput],
    channels: &BTreeMap<String, Value>,
    hitl_answer: Option<Value>,
) -> Map<String, Value> {
    let mut call_inputs = Map::new();
    for ri in inputs {
        let value = resolve_channel(&ri.source, channels).unwrap_or(Value::Null);
        call_inputs.insert(ri.name.clone(), value);
    }
    if let Some(answer) = hitl_answer {
        match answer {
            Value::Object(map) => call_inputs.extend(map),
            other => {
                call_inputs.insert("answer".to_string(), other);
            }
        }
    }
    call_inputs
}

fn build_config(
    consts: &BTreeMap<String, wirl_dsl::ast::Literal>,
    configurable: &Map<String, Value>,
    run_id: Uuid,
) -> Map<String, Value> {
    let mut config = Map::new();
    for (k, v) in consts {
        config.insert(k.clone(), literal_to_value(v));
    }
    for (k, v) in configurable {
        config.insert(k.clone(), v.clone());
    }
    config.insert("thread_id".to_string(), Value::String(run_id.to_string()));
    config
}

fn check_declared_outputs(node: &CompiledNode, outputs: &Map<String, Value>) -> Result<(), EngineError> {
    let declared: HashSet<&str> = node.output_names.iter().map(|s| s.as_str()).collect();
    for field in outputs.keys() {
        if !declared.contains(field.as_str()) {
            return Err(EngineError::UndeclaredOutput {
                node: node.name.clone(),
                target: node.call_target.clone(),
                field: field.clone(),
            });
        }
    }
    Ok(())
}

/// A reducer tag on a cycle output binding or a cycle-internal node input is
/// metadata about the *channel*, not the read: whichever node produces that
/// channel has every write to it combined with the running accumulator via
/// that reducer, so every reader (within the cycle or via the cycle's own
/// output) sees the accumulated value.
fn effective_cycle_reducers(cycle: &CompiledCycle) -> HashMap<String, ReducerKind> {
    let mut map = HashMap::new();
    for out in &cycle.outputs {
        if !matches!(out.reducer, ReducerKind::Replace) {
            if let ChannelRef::NodeOutput { node, field } = &out.source {
                map.insert(format!("{node}.{field}"), out.reducer);
            }
        }
    }
    for node in &cycle.nodes {
        for ri in &node.inputs {
            if !matches!(ri.reducer, ReducerKind::Replace) {
                if let ChannelRef::NodeOutput { node: n, field } = &ri.source {
                    map.insert(format!("{n}.{field}"), ri.reducer);
                }
            }
        }
    }
    map
}

fn channel_key(channel: &ChannelRef) -> Option<String> {
    match channel {
        ChannelRef::WorkflowInput(name) => Some(name.clone()),
        ChannelRef::NodeOutput { node, field } => Some(format!("{node}.{field}")),
        ChannelRef::CycleOutput { cycle, field } => Some(format!("{cycle}.{field}")),
        ChannelRef::Literal(_) => None,
    }
}

fn resolve_channel(channel: &ChannelRef, channels: &BTreeMap<String, Value>) -> Option<Value> {
    match channel {
        ChannelRef::Literal(lit) => Some(literal_to_value(lit)),
        other => channel_key(other).and_then(|key| channels.get(&key).cloned()),
    }
}

fn top_level_ready(node: &GraphNode, channels: &BTreeMap<String, Value>) -> bool {
    match node {
        GraphNode::Node(n) => {
            let mut refs = n.depends_on.clone();
            if let Some(when) = &n.when {
                collect_bool_refs(when, None, &mut refs);
            }
            refs.iter().all(|r| resolve_channel(r, channels).is_some())
        }
        GraphNode::Cycle(c) => c.input_names.iter().all(|name| channels.contains_key(name)),
    }
}

fn location_top_level_index(location: &HitlLocation, workflow: &Workflow) -> usize {
    match location {
        HitlLocation::TopLevel { index } => *index,
        HitlLocation::InCycle { cycle_index, .. } => workflow
            .top_level
            .iter()
            .position(|gn| matches!(gn, GraphNode::Cycle(c) if c.id == *cycle_index))
            .unwrap_or(*cycle_index),
    }
}

fn collect_bool_refs(expr: &BoolExpr, scope_hint: Option<&str>, out: &mut Vec<ChannelRef>) {
    match expr {
        BoolExpr::Lit(_) => {}
        BoolExpr::Ref(v) => out.push(Workflow::value_expr_from_ast(scope_hint, v)),
        BoolExpr::Not(inner) => collect_bool_refs(inner, scope_hint, out),
        BoolExpr::And(a, b) | BoolExpr::Or(a, b) => {
            collect_bool_refs(a, scope_hint, out);
            collect_bool_refs(b, scope_hint, out);
        }
        BoolExpr::Eq(a, b) | BoolExpr::NotEq(a, b) => {
            out.push(Workflow::value_expr_from_ast(scope_hint, a));
            out.push(Workflow::value_expr_from_ast(scope_hint, b));
        }
    }
}

fn value_ref(expr: &ValueExpr, scope_hint: Option<&str>, channels: &BTreeMap<String, Value>) -> Value {
    let channel = Workflow::value_expr_from_ast(scope_hint, expr);
    resolve_channel(&channel, channels).unwrap_or(Value::Null)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn eval_bool(expr: &BoolExpr, scope_hint: Option<&str>, channels: &BTreeMap<String, Value>) -> bool {
    match expr {
        BoolExpr::Lit(b) => *b,
        BoolExpr::Ref(v) => is_truthy(&value_ref(v, scope_hint, channels)),
        BoolExpr::Not(inner) => !eval_bool(inner, scope_hint, channels),
        BoolExpr::And(a, b) => eval_bool(a, scope_hint, channels) && eval_bool(b, scope_hint, channels),
        BoolExpr::Or(a, b) => eval_bool(a, scope_hint, channels) || eval_bool(b, scope_hint, channels),
        BoolExpr::Eq(a, b) => value_ref(a, scope_hint, channels) == value_ref(b, scope_hint, channels),
        BoolExpr::NotEq(a, b) => value_ref(a, scope_hint, channels) != value_ref(b, scope_hint, channels),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::{CallableError, FnCallable, InProcessRegistry};
    use crate::checkpoint::InMemoryCheckpointStore;
    use std::sync::atomic::AtomicU32;

    fn engine(registry: InProcessRegistry) -> Engine {
        Engine::new(
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(registry),
            ExecutorConfig::default(),
        )
    }

    #[tokio::test]
    async fn linear_sum_completes_in_one_call() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow LinearSum {
                inputs { int x; }
                outputs { y = B.out; }
                node A {
                    call "math.increment";
                    inputs { int x = x; }
                    outputs { int out; }
                }
                node B {
                    call "math.double";
                    inputs { int x = A.out; }
                    outputs { int out; }
                }
            }
            "#,
        )
        .unwrap();

        let mut registry = InProcessRegistry::new();
        registry.register(
            "math",
            "increment",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                let x = inputs["x"].as_i64().unwrap();
                Ok(Map::from_iter([("out".to_string(), Value::from(x + 1))]))
            })),
        );
        registry.register(
            "math",
            "double",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                let x = inputs["x"].as_i64().unwrap();
                Ok(Map::from_iter([("out".to_string(), Value::from(x * 2))]))
            })),
        );

        let engine = engine(registry);
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("x".to_string(), Value::from(10))]);
        let outcome = engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .unwrap();

        match outcome {
            EngineOutcome::Completed { result } => {
                assert_eq!(result["y"], Value::from(22));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn branch_skipped_propagates_null_through_output() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow Branch {
                inputs { bool flag; }
                outputs { out = B.out; }
                node A {
                    call "flags.read";
                    inputs { bool flag = flag; }
                    outputs { bool flag; }
                }
                node B {
                    call "flags.act";
                    inputs { bool flag = A.flag; }
                    outputs { out; }
                    when A.flag;
                }
            }
            "#,
        )
        .unwrap();

        let mut registry = InProcessRegistry::new();
        registry.register(
            "flags",
            "read",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                Ok(Map::from_iter([("flag".to_string(), inputs["flag"].clone())]))
            })),
        );
        registry.register(
            "flags",
            "act",
            Arc::new(FnCallable(|_: Map<String, Value>, _| async move {
                Ok(Map::from_iter([("out".to_string(), Value::from("acted"))]))
            })),
        );

        let engine = engine(registry);
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("flag".to_string(), Value::Bool(false))]);
        let outcome = engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .unwrap();

        match outcome {
            EngineOutcome::Completed { result } => {
                assert_eq!(result["out"], Value::Null);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cycle_with_append_accumulates_until_guard_false() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow CycleWithAppend {
                inputs { int seed; }
                outputs { items = C.items; }
                cycle C {
                    inputs { int seed; }
                    outputs { items = Accumulate.items (append); }
                    nodes {
                        node Pick {
                            call "pick.next";
                            inputs { int seed = C.seed; }
                            outputs { value; done; }
                        }
                        node Accumulate {
                            call "acc.push";
                            inputs { value = Pick.value; }
                            outputs { items; }
                        }
                    }
                    guard !Pick.done;
                    max_iterations 10;
                }
            }
            "#,
        )
        .unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let pick_counter = counter.clone();

        let mut registry = InProcessRegistry::new();
        registry.register(
            "pick",
            "next",
            Arc::new(FnCallable(move |_: Map<String, Value>, _| {
                let pick_counter = pick_counter.clone();
                async move {
                    let n = pick_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(Map::from_iter([
                        ("value".to_string(), Value::from(n)),
                        ("done".to_string(), Value::Bool(n >= 3)),
                    ]))
                }
            })),
        );
        registry.register(
            "acc",
            "push",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                Ok(Map::from_iter([("items".to_string(), inputs["value"].clone())]))
            })),
        );

        let engine = engine(registry);
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("seed".to_string(), Value::from(0))]);
        let outcome = engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .unwrap();

        match outcome {
            EngineOutcome::Completed { result } => {
                assert_eq!(result["items"], serde_json::json!([1, 2, 3]));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hitl_node_suspends_then_resumes_with_answer() {
        let ast = wirl_dsl::parse(
            r#"
            workflow Approval {
                inputs { int amount; }
                outputs { out = Approve.out; }
                node Approve {
                    call "review.approve";
                    inputs { int amount = amount; }
                    outputs { out; }
                    hitl { team: "finance" }
                }
            }
            "#,
        )
        .unwrap();
        let workflow = wirl_dsl::compiler::compile(&ast).unwrap();

        let mut registry = InProcessRegistry::new();
        registry.register(
            "review",
            "approve",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                Ok(Map::from_iter([("out".to_string(), inputs["answer"].clone())]))
            })),
        );

        let engine = engine(registry);
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("amount".to_string(), Value::from(500))]);
        let outcome = engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .unwrap();

        let hitl = match outcome {
            EngineOutcome::Suspended { hitl } => hitl,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(hitl.node, "Approve");
        assert_eq!(hitl.correlation["team"], Value::from("finance"));

        let outcome = engine
            .resume(&workflow, run_id, Some(Value::from("approved")), Map::new(), &CancelFlag::new())
            .await
            .unwrap();

        match outcome {
            EngineOutcome::Completed { result } => {
                assert_eq!(result["out"], Value::from("approved"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_flag_stops_the_run_between_nodes() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow LinearSum {
                inputs { int x; }
                outputs { y = B.out; }
                node A {
                    call "math.increment";
                    inputs { int x = x; }
                    outputs { int out; }
                }
                node B {
                    call "math.double";
                    inputs { int x = A.out; }
                    outputs { int out; }
                }
            }
            "#,
        )
        .unwrap();

        let mut registry = InProcessRegistry::new();
        registry.register(
            "math",
            "increment",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                let x = inputs["x"].as_i64().unwrap();
                Ok(Map::from_iter([("out".to_string(), Value::from(x + 1))]))
            })),
        );
        registry.register(
            "math",
            "double",
            Arc::new(FnCallable(|_: Map<String, Value>, _| async move {
                Err(CallableError::new("ShouldNotRun", "B must not execute"))
            })),
        );

        let engine = engine(registry);
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("x".to_string(), Value::from(1))]);
        let cancel = CancelFlag::new();
        cancel.request();
        let outcome = engine
            .start(&workflow, run_id, inputs, Map::new(), &cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, EngineOutcome::Canceled));
    }

    #[tokio::test]
    async fn failed_node_can_be_retried_from_its_checkpoint() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow LinearSum {
                inputs { int x; }
                outputs { y = B.out; }
                node A {
                    call "math.increment";
                    inputs { int x = x; }
                    outputs { int out; }
                }
                node B {
                    call "math.double";
                    inputs { int x = A.out; }
                    outputs { int out; }
                }
            }
            "#,
        )
        .unwrap();

        let attempt = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut registry = InProcessRegistry::new();
        registry.register(
            "math",
            "increment",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                let x = inputs["x"].as_i64().unwrap();
                Ok(Map::from_iter([("out".to_string(), Value::from(x + 1))]))
            })),
        );
        let attempt_for_b = Arc::clone(&attempt);
        registry.register(
            "math",
            "double",
            Arc::new(FnCallable(move |inputs: Map<String, Value>, _| {
                let attempt = Arc::clone(&attempt_for_b);
                async move {
                    if attempt.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        return Err(CallableError::new("Flaky", "transient failure on first attempt"));
                    }
                    let x = inputs["x"].as_i64().unwrap();
                    Ok(Map::from_iter([("out".to_string(), Value::from(x * 2))]))
                }
            })),
        );

        let engine = engine(registry);
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("x".to_string(), Value::from(1))]);
        let err = engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Node(ref n) if n.node == "B"));

        let outcome = engine
            .resume(&workflow, run_id, None, Map::new(), &CancelFlag::new())
            .await
            .unwrap();

        match outcome {
            EngineOutcome::Completed { result } => assert_eq!(result["y"], Value::from(4)),
            other => panic!("expected completion on retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resuming_a_hitl_suspension_without_a_payload_is_rejected() {
        let workflow = wirl_dsl::compile(
            r#"
            workflow Ask {
                inputs { string x; }
                outputs { out = Approve.answer; }
                node Approve {
                    call "hitl.ask";
                    inputs { string x = x; }
                    outputs { answer; }
                    hitl { team: "finance" }
                }
            }
            "#,
        )
        .unwrap();

        let mut registry = InProcessRegistry::new();
        registry.register(
            "hitl",
            "ask",
            Arc::new(FnCallable(|inputs: Map<String, Value>, _| async move {
                Ok(Map::from_iter([("answer".to_string(), inputs["answer"].clone())]))
            })),
        );

        let engine = engine(registry);
        let run_id = Uuid::now_v7();
        let inputs = Map::from_iter([("x".to_string(), Value::from("hi"))]);
        engine
            .start(&workflow, run_id, inputs, Map::new(), &CancelFlag::new())
            .await
            .unwrap();

        let err = engine
            .resume(&workflow, run_id, None, Map::new(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Node(ref n) if n.kind == "MissingResumePayload"));
    }
}
