//! Dependency graph, cycle detection, and level computation.
//!
//! Uses `petgraph` to model operation dependencies as a directed graph.
//! Topological sort detects cycles, and depth-based grouping produces the
//! levels the orchestrator runs concurrently. The transaction manager reuses
//! the same check at commit time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use sheetflow_types::operation::Operation;

use super::builder::WorkflowError;

/// How to treat `depends_on` entries that name no operation in the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownDependencies {
    /// Fail with `UnknownDependency` (workflow build).
    Reject,
    /// Drop the edge (transaction commit; the dependency lives elsewhere).
    Ignore,
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build a `DiGraph` with one node per operation (weight = index) and an edge
/// from each dependency to its dependent, then verify it is acyclic.
fn dependency_graph(
    operations: &[Operation],
    unknown: UnknownDependencies,
) -> Result<(DiGraph<usize, ()>, Vec<NodeIndex>), WorkflowError> {
    let mut id_to_idx: HashMap<&str, usize> = HashMap::with_capacity(operations.len());
    for (i, op) in operations.iter().enumerate() {
        if id_to_idx.insert(op.id.as_str(), i).is_some() {
            return Err(WorkflowError::DuplicateOperation(op.id.clone()));
        }
    }

    let mut graph = DiGraph::<usize, ()>::with_capacity(operations.len(), operations.len());
    let nodes: Vec<NodeIndex> = (0..operations.len()).map(|i| graph.add_node(i)).collect();

    for (to_idx, op) in operations.iter().enumerate() {
        for dep in &op.depends_on {
            match id_to_idx.get(dep.as_str()) {
                Some(&from_idx) => {
                    graph.update_edge(nodes[from_idx], nodes[to_idx], ());
                }
                None if unknown == UnknownDependencies::Ignore => {}
                None => {
                    return Err(WorkflowError::UnknownDependency(format!(
                        "operation '{}' depends on unknown operation '{}'",
                        op.id, dep
                    )));
                }
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let idx = graph[cycle.node_id()];
        WorkflowError::CyclicDependency(format!(
            "cycle detected involving operation '{}'",
            operations[idx].id
        ))
    })?;

    Ok((graph, nodes))
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// Group operations into topological levels.
///
/// Level 0 holds operations with no dependencies; every other operation sits
/// one level past its deepest dependency. Indices within a level keep
/// declared order.
pub fn build_levels(operations: &[Operation]) -> Result<Vec<Vec<usize>>, WorkflowError> {
    if operations.is_empty() {
        return Ok(vec![]);
    }

    let (graph, nodes) = dependency_graph(operations, UnknownDependencies::Reject)?;
    let order = stable_order_of(&graph, &nodes);

    let mut depths = vec![0usize; operations.len()];
    for &idx in &order {
        let depth = graph
            .neighbors_directed(nodes[idx], Direction::Incoming)
            .map(|dep| depths[graph[dep]] + 1)
            .max()
            .unwrap_or(0);
        depths[idx] = depth;
    }

    let max_depth = depths.iter().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<usize>> = vec![vec![]; max_depth + 1];
    for (idx, &depth) in depths.iter().enumerate() {
        levels[depth].push(idx);
    }
    Ok(levels)
}

// ---------------------------------------------------------------------------
// Stable topological order
// ---------------------------------------------------------------------------

/// Topological order that keeps declared order wherever dependencies allow.
///
/// Among the operations whose dependencies are all placed, the one declared
/// first goes next. A valid declared order comes back unchanged.
pub fn stable_order(
    operations: &[Operation],
    unknown: UnknownDependencies,
) -> Result<Vec<usize>, WorkflowError> {
    let (graph, nodes) = dependency_graph(operations, unknown)?;
    Ok(stable_order_of(&graph, &nodes))
}

fn stable_order_of(graph: &DiGraph<usize, ()>, nodes: &[NodeIndex]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for next in graph.neighbors_directed(nodes[idx], Direction::Outgoing) {
            let next_idx = graph[next];
            in_degree[next_idx] -= 1;
            if in_degree[next_idx] == 0 {
                ready.push(Reverse(next_idx));
            }
        }
    }
    order
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
