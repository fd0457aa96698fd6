//! The compiled, immutable execution graph produced by `compiler::compile`.
//!
//! Names from the AST are resolved into arena indices here; everything
//! downstream (the engine) walks parallel arrays indexed by these ids
//! rather than re-resolving names at run time.

use std::collections::BTreeMap;

use crate::ast::{BoolExpr, HitlBlock, Literal, ReducerKind, ValueExpr};

pub type NodeId = usize;
pub type CycleId = usize;

/// A resolved reference to a channel: either a workflow input or a named
/// output of a node/cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelRef {
    WorkflowInput(String),
    NodeOutput { node: String, field: String },
    CycleOutput { cycle: String, field: String },
    Literal(Literal),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub name: String,
    pub source: ChannelRef,
    pub reducer: ReducerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledNode {
    pub id: NodeId,
    pub name: String,
    pub call_target: String,
    pub inputs: Vec<ResolvedInput>,
    pub output_names: Vec<String>,
    pub consts: BTreeMap<String, Literal>,
    pub when: Option<BoolExpr>,
    pub hitl: Option<HitlBlock>,
    /// Channels this node transitively reads, used to compute the frontier.
    pub depends_on: Vec<ChannelRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledOutput {
    pub name: String,
    pub source: ChannelRef,
    pub reducer: ReducerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCycle {
    pub id: CycleId,
    pub name: String,
    pub input_names: Vec<String>,
    pub outputs: Vec<CompiledOutput>,
    pub nodes: Vec<CompiledNode>,
    /// Topological order of `nodes` indices, ties broken lexicographically.
    pub internal_topo_order: Vec<usize>,
    pub guard: BoolExpr,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    Node(CompiledNode),
    Cycle(CompiledCycle),
}

impl GraphNode {
    pub fn name(&self) -> &str {
        match self {
            GraphNode::Node(n) => &n.name,
            GraphNode::Cycle(c) => &c.name,
        }
    }
}

/// The fully compiled, immutable workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub name: String,
    pub source_hash: String,
    pub metadata: BTreeMap<String, Literal>,
    pub input_names: Vec<String>,
    pub outputs: Vec<CompiledOutput>,
    /// Top-level nodes and cycles, in declaration order (see `topo_order`
    /// for execution order).
    pub top_level: Vec<GraphNode>,
    /// Only the plain (non-cycle) nodes, in declaration order. Indices in
    /// `topo_order` refer into `top_level`.
    pub nodes: Vec<CompiledNode>,
    pub cycles: Vec<CompiledCycle>,
    /// Topological order of `top_level` indices, ties broken
    /// lexicographically by node/cycle name.
    pub topo_order: Vec<usize>,
}

impl Workflow {
    pub fn find_top_level(&self, name: &str) -> Option<&GraphNode> {
        self.top_level.iter().find(|n| n.name() == name)
    }

    pub fn value_expr_from_ast(
        scope_hint: Option<&str>,
        expr: &ValueExpr,
    ) -> ChannelRef {
        match expr {
            ValueExpr::Ident(name) => ChannelRef::WorkflowInput(name.clone()),
            ValueExpr::Dotted { scope, field, .. } => {
                if Some(scope.as_str()) == scope_hint {
                    ChannelRef::CycleOutput {
                        cycle: scope.clone(),
                        field: field.clone(),
                    }
                } else {
                    ChannelRef::NodeOutput {
                        node: scope.clone(),
                        field: field.clone(),
                    }
                }
            }
            ValueExpr::Literal(lit) => ChannelRef::Literal(lit.clone()),
        }
    }
}
