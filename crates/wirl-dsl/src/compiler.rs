//! Lowers a parsed AST into a validated `Workflow` graph, enforcing every
//! invariant in the data model.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ast::{BoolExpr, CycleDecl, NodeDecl, ReducerKind, ValueExpr, WorkflowAst};
use crate::error::CompileError;
use crate::graph::{
    ChannelRef, CompiledCycle, CompiledNode, CompiledOutput, GraphNode, ResolvedInput, Workflow,
};

pub fn compile(ast: &WorkflowAst) -> Result<Workflow, Vec<CompileError>> {
    let mut errors = Vec::new();

    if ast.inputs.is_empty() {
        errors.push(CompileError::NoInputs);
    }
    if ast.outputs.is_empty() {
        errors.push(CompileError::NoOutputs);
    }

    check_duplicate_names(
        ast.nodes.iter().map(|n| n.name.as_str()),
        ast.cycles.iter().map(|c| c.name.as_str()),
        "workflow",
        &mut errors,
    );

    let input_names: HashSet<&str> = ast.inputs.iter().map(|i| i.name.as_str()).collect();

    let node_outputs: HashMap<&str, HashSet<&str>> = ast
        .nodes
        .iter()
        .map(|n| (n.name.as_str(), n.outputs.iter().map(|o| o.name.as_str()).collect()))
        .collect();
    let cycle_outputs: HashMap<&str, HashSet<&str>> = ast
        .cycles
        .iter()
        .map(|c| (c.name.as_str(), c.outputs.iter().map(|o| o.name.as_str()).collect()))
        .collect();

    let mut compiled_nodes = Vec::new();
    for (idx, node) in ast.nodes.iter().enumerate() {
        compiled_nodes.push(compile_node(idx, node, &input_names, None, &mut errors));
        validate_top_level_node_fields(&compiled_nodes[idx], &node_outputs, &cycle_outputs, &mut errors);
    }

    let mut compiled_cycles = Vec::new();
    for (idx, cycle) in ast.cycles.iter().enumerate() {
        compiled_cycles.push(compile_cycle(idx, cycle, &input_names, &mut errors));
    }

    // Workflow-level outputs must resolve to a declared channel.
    let mut outputs = Vec::new();
    for out in &ast.outputs {
        match resolve_top_level_ref(&out.source, &input_names, &node_outputs, &cycle_outputs) {
            Some(channel) => {
                if !matches!(out.source.reducer(), ReducerKind::Replace) {
                    errors.push(CompileError::IllegalReducerTag(out.name.clone()));
                }
                outputs.push(CompiledOutput {
                    name: out.name.clone(),
                    source: channel,
                    reducer: out.source.reducer(),
                });
            }
            None => errors.push(CompileError::UnresolvedOutput(out.name.clone())),
        }
    }

    // Build the top-level dependency graph and topological order.
    let mut top_level: Vec<GraphNode> = Vec::new();
    for n in &compiled_nodes {
        top_level.push(GraphNode::Node(n.clone()));
    }
    for c in &compiled_cycles {
        top_level.push(GraphNode::Cycle(c.clone()));
    }

    let topo_order = match topo_sort_top_level(&top_level) {
        Ok(order) => order,
        Err(()) => {
            errors.push(CompileError::UnexpectedCycle);
            (0..top_level.len()).collect()
        }
    };

    if errors.is_empty() && !has_dead_start(&top_level, &input_names) {
        errors.push(CompileError::DeadStart);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Workflow {
        name: ast.name.clone(),
        source_hash: source_hash(ast),
        metadata: ast.metadata.clone(),
        input_names: ast.inputs.iter().map(|i| i.name.clone()).collect(),
        outputs,
        top_level,
        nodes: compiled_nodes,
        cycles: compiled_cycles,
        topo_order,
    })
}

fn source_hash(ast: &WorkflowAst) -> String {
    // A structural, order-stable hash of the AST (not a textual hash, since
    // we only have the AST at this point). Deterministic across identical
    // compiles.
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    format!("{ast:?}").hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn check_duplicate_names<'a>(
    node_names: impl Iterator<Item = &'a str>,
    cycle_names: impl Iterator<Item = &'a str>,
    scope: &str,
    errors: &mut Vec<CompileError>,
) {
    let mut seen = HashSet::new();
    for name in node_names.chain(cycle_names) {
        if !seen.insert(name) {
            errors.push(CompileError::DuplicateName(name.to_string(), scope.to_string()));
        }
    }
}

/// A top-level node's dotted inputs were resolved structurally by
/// `compile_node`; this checks the referenced field actually exists among
/// the producer's declared outputs.
fn validate_top_level_node_fields(
    node: &CompiledNode,
    node_outputs: &HashMap<&str, HashSet<&str>>,
    cycle_outputs: &HashMap<&str, HashSet<&str>>,
    errors: &mut Vec<CompileError>,
) {
    for input in &node.inputs {
        if let ChannelRef::NodeOutput { node: producer, field } = &input.source {
            let resolves = node_outputs
                .get(producer.as_str())
                .map(|fields| fields.contains(field.as_str()))
                .unwrap_or(false)
                || cycle_outputs
                    .get(producer.as_str())
                    .map(|fields| fields.contains(field.as_str()))
                    .unwrap_or(false);
            if !resolves {
                errors.push(CompileError::UnresolvedReference(format!(
                    "{}.{}",
                    producer, field
                )));
            }
        }
    }
}

fn resolve_top_level_ref(
    expr: &ValueExpr,
    input_names: &HashSet<&str>,
    node_outputs: &HashMap<&str, HashSet<&str>>,
    cycle_outputs: &HashMap<&str, HashSet<&str>>,
) -> Option<ChannelRef> {
    match expr {
        ValueExpr::Ident(name) => {
            if input_names.contains(name.as_str()) {
                Some(ChannelRef::WorkflowInput(name.clone()))
            } else {
                None
            }
        }
        ValueExpr::Dotted { scope, field, .. } => {
            if let Some(fields) = node_outputs.get(scope.as_str()) {
                if fields.contains(field.as_str()) {
                    return Some(ChannelRef::NodeOutput {
                        node: scope.clone(),
                        field: field.clone(),
                    });
                }
            }
            if let Some(fields) = cycle_outputs.get(scope.as_str()) {
                if fields.contains(field.as_str()) {
                    return Some(ChannelRef::CycleOutput {
                        cycle: scope.clone(),
                        field: field.clone(),
                    });
                }
            }
            None
        }
        ValueExpr::Literal(lit) => Some(ChannelRef::Literal(lit.clone())),
    }
}

/// Compiles a single node. `enclosing_cycle` is `Some(cycle_name)` when this
/// node lives inside a cycle's `nodes {}` block, which tightens reference
/// rules (dotted-only, same-cycle-only).
fn compile_node(
    id: usize,
    node: &NodeDecl,
    input_names: &HashSet<&str>,
    enclosing_cycle: Option<(&str, &HashSet<&str>, &HashSet<&str>)>,
    errors: &mut Vec<CompileError>,
) -> CompiledNode {
    let mut inputs = Vec::new();
    let mut depends_on = Vec::new();

    for ni in &node.inputs {
        validate_expr_scope(&ni.expr, &node.name, enclosing_cycle, errors);
        let reducer = ni.expr.reducer();
        let channel = resolve_expr_in_scope(&ni.expr, input_names, enclosing_cycle);
        if let Some(channel) = channel {
            if !matches!(reducer, ReducerKind::Replace) && !reducer_allowed_on_node_input(&ni.expr, enclosing_cycle) {
                errors.push(CompileError::IllegalReducerTag(format!("{}.{}", node.name, ni.name)));
            }
            depends_on.push(channel.clone());
            inputs.push(ResolvedInput {
                name: ni.name.clone(),
                source: channel,
                reducer,
            });
        } else {
            errors.push(CompileError::UnresolvedReference(format!(
                "{}.{}",
                node.name, ni.name
            )));
        }
    }

    if let Some(when) = &node.when {
        validate_bool_expr_scope(when, &node.name, enclosing_cycle, errors);
    }

    CompiledNode {
        id,
        name: node.name.clone(),
        call_target: node.call_target.clone(),
        inputs,
        output_names: node.outputs.iter().map(|o| o.name.clone()).collect(),
        consts: node.consts.clone(),
        when: node.when.clone(),
        hitl: node.hitl.clone(),
        depends_on,
    }
}

/// A reducer tag is legal on a cycle-internal node's input only when it
/// feeds the same channel being accumulated across iterations, i.e. the
/// reference is dotted and the node lives inside a cycle.
fn reducer_allowed_on_node_input(
    expr: &ValueExpr,
    enclosing_cycle: Option<(&str, &HashSet<&str>, &HashSet<&str>)>,
) -> bool {
    enclosing_cycle.is_some() && matches!(expr, ValueExpr::Dotted { .. })
}

fn validate_expr_scope(
    expr: &ValueExpr,
    node_name: &str,
    enclosing_cycle: Option<(&str, &HashSet<&str>, &HashSet<&str>)>,
    errors: &mut Vec<CompileError>,
) {
    let Some((cycle_name, sibling_nodes, _)) = enclosing_cycle else {
        return;
    };
    match expr {
        ValueExpr::Ident(name) => {
            errors.push(CompileError::NonDottedInCycle {
                cycle: cycle_name.to_string(),
                reference: name.clone(),
            });
        }
        ValueExpr::Dotted { scope, .. } => {
            if scope != cycle_name && !sibling_nodes.contains(scope.as_str()) {
                errors.push(CompileError::CrossCycleReference {
                    cycle: cycle_name.to_string(),
                    reference: format!("{scope}.* (from {node_name})"),
                });
            }
        }
        ValueExpr::Literal(_) => {}
    }
}

fn validate_bool_expr_scope(
    expr: &BoolExpr,
    node_name: &str,
    enclosing_cycle: Option<(&str, &HashSet<&str>, &HashSet<&str>)>,
    errors: &mut Vec<CompileError>,
) {
    match expr {
        BoolExpr::Lit(_) => {}
        BoolExpr::Ref(v) => validate_expr_scope(v, node_name, enclosing_cycle, errors),
        BoolExpr::Not(inner) => validate_bool_expr_scope(inner, node_name, enclosing_cycle, errors),
        BoolExpr::And(a, b) | BoolExpr::Or(a, b) => {
            validate_bool_expr_scope(a, node_name, enclosing_cycle, errors);
            validate_bool_expr_scope(b, node_name, enclosing_cycle, errors);
        }
        BoolExpr::Eq(a, b) | BoolExpr::NotEq(a, b) => {
            validate_expr_scope(a, node_name, enclosing_cycle, errors);
            validate_expr_scope(b, node_name, enclosing_cycle, errors);
        }
    }
}

fn resolve_expr_in_scope(
    expr: &ValueExpr,
    input_names: &HashSet<&str>,
    enclosing_cycle: Option<(&str, &HashSet<&str>, &HashSet<&str>)>,
) -> Option<ChannelRef> {
    match expr {
        ValueExpr::Ident(name) => {
            if enclosing_cycle.is_some() {
                // Non-dotted references inside a cycle are already flagged
                // by `validate_expr_scope`; still try to resolve against
                // the workflow's inputs so downstream passes have a value.
                if input_names.contains(name.as_str()) {
                    return Some(ChannelRef::WorkflowInput(name.clone()));
                }
                return None;
            }
            if input_names.contains(name.as_str()) {
                Some(ChannelRef::WorkflowInput(name.clone()))
            } else {
                None
            }
        }
        ValueExpr::Dotted { scope, field, .. } => {
            if let Some((cycle_name, sibling_nodes, cycle_input_names)) = enclosing_cycle {
                if scope == cycle_name {
                    if cycle_input_names.contains(field.as_str()) {
                        return Some(ChannelRef::CycleOutput {
                            cycle: scope.clone(),
                            field: field.clone(),
                        });
                    }
                    return None;
                }
                if sibling_nodes.contains(scope.as_str()) {
                    return Some(ChannelRef::NodeOutput {
                        node: scope.clone(),
                        field: field.clone(),
                    });
                }
                return None;
            }
            // Top-level: resolved later against the node/cycle output
            // tables; here we only need a placeholder reference for
            // dependency-graph purposes.
            Some(ChannelRef::NodeOutput {
                node: scope.clone(),
                field: field.clone(),
            })
        }
        ValueExpr::Literal(lit) => Some(ChannelRef::Literal(lit.clone())),
    }
}

fn compile_cycle(
    id: usize,
    cycle: &CycleDecl,
    outer_input_names: &HashSet<&str>,
    errors: &mut Vec<CompileError>,
) -> CompiledCycle {
    check_duplicate_names(
        cycle.nodes.iter().map(|n| n.name.as_str()),
        std::iter::empty(),
        &cycle.name,
        errors,
    );

    // A cycle's declared inputs are bound implicitly, by name, from the
    // enclosing scope at cycle entry.
    for input in &cycle.inputs {
        if !outer_input_names.contains(input.name.as_str()) {
            errors.push(CompileError::UnresolvedReference(format!(
                "{}.{}",
                cycle.name, input.name
            )));
        }
    }

    let cycle_input_names: HashSet<&str> = cycle.inputs.iter().map(|i| i.name.as_str()).collect();
    let sibling_nodes: HashSet<&str> = cycle.nodes.iter().map(|n| n.name.as_str()).collect();
    let node_output_fields: HashMap<&str, HashSet<&str>> = cycle
        .nodes
        .iter()
        .map(|n| (n.name.as_str(), n.outputs.iter().map(|o| o.name.as_str()).collect()))
        .collect();

    let mut compiled_nodes = Vec::new();
    for (idx, node) in cycle.nodes.iter().enumerate() {
        compiled_nodes.push(compile_node(
            idx,
            node,
            outer_input_names,
            Some((cycle.name.as_str(), &sibling_nodes, &cycle_input_names)),
            errors,
        ));
        for input in &compiled_nodes[idx].inputs {
            if let ChannelRef::NodeOutput { node: producer, field } = &input.source {
                let resolves = node_output_fields
                    .get(producer.as_str())
                    .map(|fields| fields.contains(field.as_str()))
                    .unwrap_or(false);
                if !resolves {
                    errors.push(CompileError::UnresolvedReference(format!("{producer}.{field}")));
                }
            }
        }
    }

    validate_bool_expr_scope(
        &cycle.guard,
        &cycle.name,
        Some((cycle.name.as_str(), &sibling_nodes, &cycle_input_names)),
        errors,
    );

    let mut outputs = Vec::new();
    for out in &cycle.outputs {
        match &out.source {
            ValueExpr::Dotted { scope, field, .. } => {
                let resolves = node_output_fields
                    .get(scope.as_str())
                    .map(|fields| fields.contains(field.as_str()))
                    .unwrap_or(false);
                if resolves {
                    outputs.push(CompiledOutput {
                        name: out.name.clone(),
                        source: ChannelRef::NodeOutput {
                            node: scope.clone(),
                            field: field.clone(),
                        },
                        reducer: out.source.reducer(),
                    });
                } else {
                    errors.push(CompileError::UnresolvedOutput(format!("{}.{}", cycle.name, out.name)));
                }
            }
            ValueExpr::Ident(name) => {
                errors.push(CompileError::NonDottedInCycle {
                    cycle: cycle.name.clone(),
                    reference: name.clone(),
                });
            }
            ValueExpr::Literal(lit) => outputs.push(CompiledOutput {
                name: out.name.clone(),
                source: ChannelRef::Literal(lit.clone()),
                reducer: ReducerKind::Replace,
            }),
        }
    }

    let internal_topo_order = match topo_sort_nodes(&compiled_nodes, &sibling_nodes) {
        Ok(order) => order,
        Err(()) => {
            errors.push(CompileError::InternalCycle(cycle.name.clone()));
            (0..compiled_nodes.len()).collect()
        }
    };

    CompiledCycle {
        id,
        name: cycle.name.clone(),
        input_names: cycle.inputs.iter().map(|i| i.name.clone()).collect(),
        outputs,
        nodes: compiled_nodes,
        internal_topo_order,
        guard: cycle.guard.clone(),
        max_iterations: cycle.max_iterations,
    }
}

/// Kahn's algorithm over a cycle's internal nodes, ties broken
/// lexicographically by node name.
fn topo_sort_nodes(nodes: &[CompiledNode], sibling_names: &HashSet<&str>) -> Result<Vec<usize>, ()> {
    let index_of: HashMap<&str, usize> = nodes.iter().map(|n| (n.name.as_str(), n.id)).collect();
    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for node in nodes {
        for dep in &node.depends_on {
            if let ChannelRef::NodeOutput { node: producer, .. } = dep {
                if sibling_names.contains(producer.as_str()) {
                    if let Some(&producer_idx) = index_of.get(producer.as_str()) {
                        dependents[producer_idx].push(node.id);
                        in_degree[node.id] += 1;
                    }
                }
            }
        }
    }

    kahn(nodes.iter().map(|n| n.name.as_str()).collect(), in_degree, dependents)
}

/// Kahn's algorithm over the top-level graph nodes (plain nodes and cycle
/// super-nodes), ties broken lexicographically by name.
fn topo_sort_top_level(top_level: &[GraphNode]) -> Result<Vec<usize>, ()> {
    let index_of: HashMap<&str, usize> = top_level
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name(), i))
        .collect();
    let mut in_degree = vec![0usize; top_level.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); top_level.len()];

    let depends_on = |n: &GraphNode| -> Vec<ChannelRef> {
        match n {
            GraphNode::Node(node) => node.depends_on.clone(),
            GraphNode::Cycle(cycle) => {
                // A cycle super-node's external dependencies are its
                // declared input names, matched by name against sibling
                // top-level producers.
                cycle
                    .input_names
                    .iter()
                    .map(|name| ChannelRef::NodeOutput {
                        node: String::new(),
                        field: name.clone(),
                    })
                    .collect()
            }
        }
    };

    for (idx, n) in top_level.iter().enumerate() {
        for dep in depends_on(n) {
            let producer_name = match &dep {
                ChannelRef::NodeOutput { node, field } if node.is_empty() => {
                    // Cycle input: find any sibling top-level node/cycle
                    // that produces an output of this name.
                    top_level.iter().find_map(|candidate| match candidate {
                        GraphNode::Node(cn) if cn.output_names.iter().any(|o| o == field) => {
                            Some(cn.name.as_str())
                        }
                        GraphNode::Cycle(cc) if cc.outputs.iter().any(|o| o.name == *field) => {
                            Some(cc.name.as_str())
                        }
                        _ => None,
                    })
                }
                ChannelRef::NodeOutput { node, .. } => Some(node.as_str()),
                _ => None,
            };
            if let Some(producer_name) = producer_name {
                if producer_name != n.name() {
                    if let Some(&producer_idx) = index_of.get(producer_name) {
                        dependents[producer_idx].push(idx);
                        in_degree[idx] += 1;
                    }
                }
            }
        }
    }

    kahn(top_level.iter().map(|n| n.name()).collect(), in_degree, dependents)
}

fn kahn(names: Vec<&str>, mut in_degree: Vec<usize>, dependents: Vec<Vec<usize>>) -> Result<Vec<usize>, ()> {
    let n = names.len();
    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    ready.sort_by_key(|&i| names[i]);

    let mut order = Vec::with_capacity(n);
    while !ready.is_empty() {
        let idx = ready.remove(0);
        order.push(idx);
        let mut newly_ready = Vec::new();
        for &dep in &dependents[idx] {
            in_degree[dep] -= 1;
            if in_degree[dep] == 0 {
                newly_ready.push(dep);
            }
        }
        newly_ready.sort_by_key(|&i| names[i]);
        ready.extend(newly_ready);
        ready.sort_by_key(|&i| names[i]);
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err(())
    }
}

fn has_dead_start(top_level: &[GraphNode], input_names: &HashSet<&str>) -> bool {
    top_level.iter().any(|n| match n {
        GraphNode::Node(node) => node
            .depends_on
            .iter()
            .any(|c| matches!(c, ChannelRef::WorkflowInput(name) if input_names.contains(name.as_str()))),
        GraphNode::Cycle(cycle) => cycle
            .input_names
            .iter()
            .any(|name| input_names.contains(name.as_str())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn ast(src: &str) -> WorkflowAst {
        Parser::new(src).unwrap().parse_workflow().unwrap()
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let src = r#"
            workflow Dup {
                inputs { int x; }
                outputs { y = A.out; }
                node A { call "m.f"; inputs { int x = x; } outputs { out; } }
                node A { call "m.g"; inputs { int x = x; } outputs { out; } }
            }
        "#;
        let errs = compile(&ast(src)).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, CompileError::DuplicateName(_, _))));
    }

    #[test]
    fn rejects_non_dotted_reference_inside_cycle() {
        let src = r#"
            workflow BadCycle {
                inputs { int seed; }
                outputs { items = C.items; }
                cycle C {
                    inputs { int seed; }
                    outputs { items = Accumulate.items (append); }
                    nodes {
                        node Pick {
                            call "p.next";
                            inputs { int seed = seed; }
                            outputs { value; done; }
                        }
                        node Accumulate {
                            call "a.push";
                            inputs { value = Pick.value; }
                            outputs { items; }
                        }
                    }
                    guard !Pick.done;
                    max_iterations 5;
                }
            }
        "#;
        let errs = compile(&ast(src)).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, CompileError::NonDottedInCycle { .. })));
    }

    #[test]
    fn accepts_cycle_with_append_example() {
        let src = r#"
            workflow CycleWithAppend {
                inputs { int seed; }
                outputs { items = C.items; }
                cycle C {
                    inputs { int seed; }
                    outputs { items = Accumulate.items (append); }
                    nodes {
                        node Pick {
                            call "p.next";
                            inputs { int seed = C.seed; }
                            outputs { value; done; }
                        }
                        node Accumulate {
                            call "a.push";
                            inputs { value = Pick.value; }
                            outputs { items; }
                        }
                    }
                    guard !Pick.done;
                    max_iterations 5;
                }
            }
        "#;
        let workflow = compile(&ast(src)).expect("should compile");
        assert_eq!(workflow.cycles[0].internal_topo_order, vec![0, 1]);
    }

    #[test]
    fn rejects_illegal_reducer_tag_on_workflow_output() {
        let src = r#"
            workflow Bad {
                inputs { int x; }
                outputs { y = A.out (append); }
                node A { call "m.f"; inputs { int x = x; } outputs { out; } }
            }
        "#;
        let errs = compile(&ast(src)).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, CompileError::IllegalReducerTag(_))));
    }
}
