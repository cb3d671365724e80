/// Bounded subgraph extraction
///
/// One traversal shared by every container kind: starting at a container entry node,
/// a forward search (stopping at nodes of the boundary kind) and a backward search
/// from the single boundary found (stopping at the entry) are intersected. The
/// intersection is the body the container owns.

use crate::workflow::types::{NodeKind, WorkflowGraph};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Result of extracting one container scope
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeExtraction {
    pub entry: String,
    pub boundary: String,
    /// Body node ids, excluding the entry and the boundary
    pub body: BTreeSet<String>,
    /// Nodes reachable from the entry that do not lead to the boundary
    pub dangling: BTreeSet<String>,
}

impl ScopeExtraction {
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Extract the body owned by `entry`, closed by a node of `boundary_kind`
pub fn extract_scope(
    graph: &WorkflowGraph,
    entry: &str,
    boundary_kind: NodeKind,
) -> Result<ScopeExtraction, String> {
    let kinds: HashMap<&str, NodeKind> = graph.nodes.iter().map(|n| (n.id.as_str(), n.kind)).collect();
    let mut forward_adj: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut backward_adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        forward_adj.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
        backward_adj.entry(edge.target.as_str()).or_default().push(edge.source.as_str());
    }

    // forward: everything reachable from the entry, not crossing a boundary
    let mut forward = BTreeSet::new();
    let mut boundaries = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([entry]);
    while let Some(current) = queue.pop_front() {
        for &next in forward_adj.get(current).into_iter().flatten() {
            if next == entry {
                continue;
            }
            if kinds.get(next) == Some(&boundary_kind) {
                boundaries.insert(next.to_string());
                continue;
            }
            if forward.insert(next.to_string()) {
                queue.push_back(next);
            }
        }
    }

    let boundary = match boundaries.len() {
        0 => return Err(format!("{entry}: no reachable {boundary_kind} node closes this container")),
        1 => boundaries.into_iter().next().unwrap_or_default(),
        _ => {
            let found: Vec<_> = boundaries.into_iter().collect();
            return Err(format!(
                "{entry}: container must reach exactly one {boundary_kind} node, found {}",
                found.join(", ")
            ));
        }
    };

    // backward: everything that leads into the boundary, not crossing the entry
    let mut backward = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([boundary.as_str()]);
    while let Some(current) = queue.pop_front() {
        for &prev in backward_adj.get(current).into_iter().flatten() {
            if prev == entry || prev == boundary {
                continue;
            }
            if backward.insert(prev.to_string()) {
                queue.push_back(prev);
            }
        }
    }

    let body: BTreeSet<String> = forward.intersection(&backward).cloned().collect();
    let dangling: BTreeSet<String> = forward.difference(&body).cloned().collect();

    Ok(ScopeExtraction {
        entry: entry.to_string(),
        boundary,
        body,
        dangling,
    })
}
