/// Structural validation and compilation of workflow graphs
///
/// `compile` turns a stored `Workflow` into an `ExecutionPlan`: container bodies are
/// extracted, the top-level graph (container bodies collapsed into their container)
/// is topologically sorted with petgraph, and every structural rule is checked.
/// Any error is fatal and stops the run before a single node executes.

use crate::error::ValidationError;
use crate::workflow::subgraph::extract_scope;
use crate::workflow::types::{Edge, Node, NodeKind, Workflow};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Outcome of validating a graph
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A Loop or Iterator together with the body it owns
#[derive(Debug, Clone)]
pub struct ContainerScope {
    pub container_id: String,
    pub kind: NodeKind,
    pub boundary: String,
    /// Body nodes in topological order
    pub body_order: Vec<String>,
    pub body: BTreeSet<String>,
}

/// Execution-ready form of a workflow
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub workflow_id: String,
    pub nodes: HashMap<String, Node>,
    /// Top-level nodes in topological order; container bodies are absent
    pub order: Vec<String>,
    /// Incoming edges per target, without loop feedback edges
    pub incoming: HashMap<String, Vec<Edge>>,
    pub containers: HashMap<String, ContainerScope>,
    /// Body node id -> owning container id
    pub owner: HashMap<String, String>,
    /// Boundary node id -> container id
    pub boundary_owner: HashMap<String, String>,
    /// Loop id -> edges from its body back into the loop
    pub feedback: HashMap<String, Vec<Edge>>,
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn incoming(&self, id: &str) -> &[Edge] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Output nodes, sorted by id, designated ones first
    pub fn output_nodes(&self) -> Vec<&Node> {
        let mut outputs: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::Output && !self.owner.contains_key(&n.id))
            .collect();
        outputs.sort_by(|a, b| {
            let da = a.config_bool("designated").unwrap_or(false);
            let db = b.config_bool("designated").unwrap_or(false);
            db.cmp(&da).then_with(|| a.id.cmp(&b.id))
        });
        outputs
    }
}

/// Validate without keeping the plan
pub fn validate(workflow: &Workflow) -> ValidationReport {
    match compile(workflow) {
        Ok(plan) => ValidationReport {
            errors: vec![],
            warnings: plan.warnings,
        },
        Err(ValidationError(report)) => report,
    }
}

/// Validate and compile a workflow into an execution plan
pub fn compile(workflow: &Workflow) -> Result<ExecutionPlan, ValidationError> {
    let graph = &workflow.graph;
    let mut report = ValidationReport::default();

    if graph.nodes.is_empty() {
        report.errors.push("workflow has no nodes".to_string());
        return Err(ValidationError(report));
    }

    let mut nodes: HashMap<String, Node> = HashMap::new();
    for node in &graph.nodes {
        if nodes.insert(node.id.clone(), node.clone()).is_some() {
            report.errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    check_edges(workflow, &nodes, &mut report);
    check_triggers(&graph.nodes, &graph.edges, &mut report);

    // container scopes
    let mut containers: HashMap<String, ContainerScope> = HashMap::new();
    let mut owner: HashMap<String, String> = HashMap::new();
    let mut boundary_owner: HashMap<String, String> = HashMap::new();
    for node in graph.nodes.iter().filter(|n| n.kind.is_container()) {
        let Some(boundary_kind) = node.kind.boundary_kind() else { continue };
        let scope = match extract_scope(graph, &node.id, boundary_kind) {
            Ok(scope) => scope,
            Err(e) => {
                report.errors.push(e);
                continue;
            }
        };
        if scope.is_empty() {
            report.warnings.push(format!(
                "{} '{}' connects directly to '{}' with an empty body",
                node.kind, node.id, scope.boundary
            ));
        }
        for member in &scope.body {
            if let Some(inner) = nodes.get(member) {
                if inner.kind.is_container() {
                    report.errors.push(format!(
                        "{} '{}' may not contain {} '{}'",
                        node.kind, node.id, inner.kind, inner.id
                    ));
                }
            }
            if let Some(previous) = owner.insert(member.clone(), node.id.clone()) {
                report.errors.push(format!(
                    "node '{member}' belongs to both '{previous}' and '{}'",
                    node.id
                ));
            }
        }
        if let Some(previous) = boundary_owner.insert(scope.boundary.clone(), node.id.clone()) {
            report.errors.push(format!(
                "'{}' closes both '{previous}' and '{}'",
                scope.boundary, node.id
            ));
        }
        if node.kind == NodeKind::Loop
            && node.config_str("exitCondition") == Some("evaluator")
            && !scope
                .body
                .iter()
                .any(|id| nodes.get(id).map(|n| n.kind) == Some(NodeKind::Router))
        {
            report.errors.push(format!(
                "loop '{}' uses the evaluator exit condition but has no router in its body",
                node.id
            ));
        }
        containers.insert(
            node.id.clone(),
            ContainerScope {
                container_id: node.id.clone(),
                kind: node.kind,
                boundary: scope.boundary,
                body_order: Vec::new(),
                body: scope.body,
            },
        );
    }

    for node in &graph.nodes {
        if let Some(declared) = &node.container_id {
            if owner.get(&node.id) != Some(declared) {
                report.errors.push(format!(
                    "node '{}' declares container '{declared}' but is not inside its body",
                    node.id
                ));
            }
        }
    }

    // scope isolation, feedback edges, incoming map
    let mut incoming: HashMap<String, Vec<Edge>> = HashMap::new();
    let mut feedback: HashMap<String, Vec<Edge>> = HashMap::new();
    for edge in &graph.edges {
        let source_owner = owner.get(&edge.source);
        let target_owner = owner.get(&edge.target);
        if let Some(container) = source_owner {
            let leaves_scope = target_owner != Some(container);
            if leaves_scope && edge.target == *container {
                match containers.get(container).map(|c| c.kind) {
                    Some(NodeKind::Loop) => {
                        feedback.entry(container.clone()).or_default().push(edge.clone());
                        continue;
                    }
                    _ => {
                        report.errors.push(format!(
                            "iterator '{container}' cannot receive edges from its own body ('{}')",
                            edge.source
                        ));
                        continue;
                    }
                }
            }
            let to_boundary = containers.get(container).map(|c| c.boundary == edge.target) == Some(true);
            if leaves_scope && !to_boundary {
                report.errors.push(format!(
                    "'{}' reads container-internal output of '{}' (inside '{container}')",
                    edge.target, edge.source
                ));
            }
        }
        incoming.entry(edge.target.clone()).or_default().push(edge.clone());
    }

    // top-level order with bodies collapsed into their container
    let top_level: Vec<&Node> = graph.nodes.iter().filter(|n| !owner.contains_key(&n.id)).collect();
    let mut dag: DiGraph<String, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &top_level {
        index.insert(node.id.as_str(), dag.add_node(node.id.clone()));
    }
    let representative = |id: &str| -> String { owner.get(id).cloned().unwrap_or_else(|| id.to_string()) };
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let collapsed = graph
        .edges
        .iter()
        .map(|e| (representative(&e.source), representative(&e.target)))
        .chain(containers.values().map(|c| (c.container_id.clone(), c.boundary.clone())));
    for (from, to) in collapsed {
        if from == to || !seen.insert((from.clone(), to.clone())) {
            continue;
        }
        if let (Some(a), Some(b)) = (index.get(from.as_str()), index.get(to.as_str())) {
            dag.add_edge(*a, *b, ());
        }
    }
    let order = match toposort(&dag, None) {
        Ok(sorted) => sorted.into_iter().map(|i| dag[i].clone()).collect(),
        Err(cycle) => {
            report
                .errors
                .push(format!("cycle detected at node '{}'", dag[cycle.node_id()]));
            Vec::new()
        }
    };

    for scope in containers.values_mut() {
        match body_order(&scope.body, &graph.edges) {
            Ok(sorted) => scope.body_order = sorted,
            Err(at) => report.errors.push(format!(
                "cycle detected inside '{}' at node '{at}'",
                scope.container_id
            )),
        }
    }

    // warnings
    if graph.nodes.len() > 1 {
        let connected: HashSet<&str> = graph
            .edges
            .iter()
            .flat_map(|e| [e.source.as_str(), e.target.as_str()])
            .collect();
        for node in &graph.nodes {
            if !connected.contains(node.id.as_str()) {
                report.warnings.push(format!("node '{}' is not connected", node.id));
            }
        }
    }
    if !graph.nodes.iter().any(|n| n.kind == NodeKind::Output) {
        report.warnings.push("workflow has no output node".to_string());
    }

    if !report.is_valid() {
        return Err(ValidationError(report));
    }

    Ok(ExecutionPlan {
        workflow_id: workflow.id.clone(),
        nodes,
        order,
        incoming,
        containers,
        owner,
        boundary_owner,
        feedback,
        warnings: report.warnings,
    })
}

fn check_edges(workflow: &Workflow, nodes: &HashMap<String, Node>, report: &mut ValidationReport) {
    let mut fan_in: HashMap<(&str, &str), usize> = HashMap::new();
    for edge in &workflow.graph.edges {
        let (Some(source), Some(target)) = (nodes.get(&edge.source), nodes.get(&edge.target)) else {
            report.errors.push(format!(
                "edge {} -> {} references an unknown node",
                edge.source, edge.target
            ));
            continue;
        };
        if edge.source == edge.target {
            report.errors.push(format!("node '{}' is connected to itself", edge.source));
            continue;
        }
        let Some(source_type) = source.kind.output_type(source, edge.source_handle()) else {
            report.errors.push(format!(
                "{} '{}' has no output handle '{}'",
                source.kind,
                source.id,
                edge.source_handle()
            ));
            continue;
        };
        let Some(input) = target.kind.input_handle(edge.target_handle()) else {
            report.errors.push(format!(
                "{} '{}' has no input handle '{}'",
                target.kind,
                target.id,
                edge.target_handle()
            ));
            continue;
        };
        if !input.value_type.accepts(source_type) {
            report.errors.push(format!(
                "type mismatch: {}.{} ({source_type}) -> {}.{} ({})",
                source.id,
                edge.source_handle(),
                target.id,
                edge.target_handle(),
                input.value_type
            ));
        }
        let count = fan_in.entry((edge.target.as_str(), edge.target_handle())).or_insert(0);
        *count += 1;
        if *count == 2 && !input.multi {
            report.errors.push(format!(
                "handle '{}' of '{}' accepts a single connection",
                edge.target_handle(),
                target.id
            ));
        }
    }
}

fn check_triggers(nodes: &[Node], edges: &[Edge], report: &mut ValidationReport) {
    for kind in [NodeKind::WebhookTrigger, NodeKind::CronTrigger] {
        let count = nodes.iter().filter(|n| n.kind == kind).count();
        if count > 1 {
            report
                .errors
                .push(format!("a workflow may contain at most one {kind} node, found {count}"));
        }
    }
    for node in nodes.iter().filter(|n| n.kind.is_trigger()) {
        if edges.iter().any(|e| e.target == node.id) {
            report
                .errors
                .push(format!("{} '{}' cannot have incoming edges", node.kind, node.id));
        }
    }
}

/// Topological order of a container body using only its internal edges
fn body_order(body: &BTreeSet<String>, edges: &[Edge]) -> Result<Vec<String>, String> {
    let mut dag: DiGraph<String, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for id in body {
        index.insert(id.as_str(), dag.add_node(id.clone()));
    }
    for edge in edges {
        if let (Some(a), Some(b)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str())) {
            dag.add_edge(*a, *b, ());
        }
    }
    toposort(&dag, None)
        .map(|sorted| sorted.into_iter().map(|i| dag[i].clone()).collect())
        .map_err(|cycle| dag[cycle.node_id()].clone())
}
