use crate::{
    executor::{Plan, PlanNode},
    graph::FlowGraph,
    types::{HashSet, IndexMap, IndexSet, NodeId},
};
use rustc_hash::FxBuildHasher;
use std::collections::VecDeque;
use thiserror::Error;
use unzip3::Unzip3;

/// Error kind for graph compilation failures.
///
/// Currently indicates that the dependency graph contains cycle(s), making
/// it impossible to derive a valid topological ordering.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The dependency graph contains cycle(s); `task` is one of the tasks
    /// that can never become ready.
    #[error("graph `{graph}` contains cycle(s): task `{task}` can never run")]
    Cycle {
        /// Name of the offending graph.
        graph: String,
        /// Name of a task stuck behind the cycle.
        task: String,
    },
}

/// Adjacency view shared by host tasks and device operations.
pub(crate) trait DagNode {
    fn parents(&self) -> &IndexSet<NodeId>;
    fn children(&self) -> &IndexSet<NodeId>;
}

/// Result of a successful topological sort.
#[derive(Debug)]
pub(crate) struct TopoOrder {
    /// Every node in a valid execution order, with its position and depth.
    pub(crate) order: IndexMap<NodeId, TopoEntry>,
    /// Number of roots, guaranteed to be at the beginning of `order`.
    pub(crate) num_independent: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TopoEntry {
    pub(crate) index: u32,
    /// Longest distance (in edges) from any root.
    pub(crate) depth: u32,
}

/// Kahn-like topological sort with progress-based cycle detection.
///
/// Returns a node that cannot be placed when the graph is cyclic.
pub(crate) fn toposort<N: DagNode>(nodes: &[N]) -> Result<TopoOrder, NodeId> {
    // Example (intended invariants on order/depth):
    //
    //   A     B
    //    \   /
    //      C
    //      |
    //      D
    //
    // - Roots: A, B (no parents) => appear first in the final order; depth 0.
    // - C depends on both A and B => depth(C) = 1 + max(depth(A), depth(B)) = 1.
    // - D depends on C only       => depth(D) = 1 + depth(C) = 2.
    //
    // Phase 1: Seed the order with roots in insertion order.
    let mut order: IndexMap<_, _> = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.parents().is_empty())
        .enumerate()
        .map(|(idx, (node_idx, _))| {
            (
                NodeId::from_index(node_idx),
                TopoEntry {
                    index: idx.try_into().expect("toposort: [1]"),
                    depth: 0,
                },
            )
        })
        .collect();

    // If there are nodes but no roots, every connected component is cyclic.
    if order.is_empty() && !nodes.is_empty() {
        return Err(NodeId::from_index(0));
    }
    let num_independent = order.len();

    // Phase 2: Candidates whose parents might soon be fully known. We push all
    // children of the already-placed roots. `pending_set` prevents duplicates.
    let max_cap = nodes.len() - order.len();
    let mut pending_queue = VecDeque::with_capacity(max_cap);
    let mut pending_set = HashSet::with_capacity_and_hasher(max_cap, FxBuildHasher);
    for &root in order.keys() {
        for &child in nodes[root.index()].children() {
            if pending_set.insert(child) {
                pending_queue.push_back(child);
            }
        }
    }

    // Phase 3: A candidate is placed once ALL of its parents are placed;
    // otherwise it is dropped and re-enqueued by the missing parent later.
    //
    // If no progress is made for as many iterations as the queue held at the
    // last progress point, the remaining subgraph must be cyclic.
    let mut last_progress_iter = 0usize;
    let mut last_progress_queue_len = pending_queue.len();
    let mut iter = 0usize;

    'process_pending: while let Some(node_id) = pending_queue.pop_front() {
        let removed = pending_set.remove(&node_id);
        assert!(removed, "toposort: [2]");
        let since_progress = iter.checked_sub(last_progress_iter);
        if since_progress.expect("toposort: [3]") >= last_progress_queue_len {
            // An acyclic remainder yields at least one placement within
            // `last_progress_queue_len` iterations.
            return Err(node_id);
        }
        iter = iter.checked_add(1).expect("toposort: [4]");
        let node = &nodes[node_id.index()];
        let mut depth = 1;
        for parent_id in node.parents() {
            let Some(parent) = order.get(parent_id) else {
                continue 'process_pending;
            };
            depth = depth.max(parent.depth.checked_add(1).expect("toposort: [5]"));
        }
        let entry = TopoEntry {
            index: order.len().try_into().expect("toposort: [6]"),
            depth,
        };
        let inserted_new = order.insert(node_id, entry).is_none();
        assert!(inserted_new, "toposort: [7]");

        for &child in node.children() {
            if pending_set.insert(child) {
                pending_queue.push_back(child);
            }
        }
        last_progress_iter = iter;
        last_progress_queue_len = pending_queue.len();
    }

    // If we didn't place every node, there is at least one cyclic component.
    if order.len() != nodes.len() {
        let stuck = (0..nodes.len())
            .map(NodeId::from_index)
            .find(|id| !order.contains_key(id))
            .expect("toposort: [8]");
        return Err(stuck);
    }
    Ok(TopoOrder {
        order,
        num_independent,
    })
}

impl Plan {
    /// Compile `graph` into an execution plan:
    /// - topologically order the tasks with cycle detection,
    /// - split children into `owned` (single parent) and `shared` (several
    ///   parents) to minimize synchronization at run time,
    /// - record each task's parent count for the join counters.
    ///
    /// # Errors
    /// If the graph contains cycle(s).
    pub(crate) fn compile(name: &str, graph: &FlowGraph) -> Result<Self, GraphError> {
        graph.with_nodes(|nodes| {
            let TopoOrder {
                order,
                num_independent,
            } = toposort(nodes).map_err(|stuck| GraphError::Cycle {
                graph: name.to_owned(),
                task: nodes[stuck.index()].display_name(),
            })?;

            let (plan_nodes, parents_total, ids): (Vec<_>, Vec<_>, Vec<_>) = order
                .iter()
                .enumerate()
                .map(|(idx, (&id, entry))| {
                    assert_eq!(idx, entry.index as usize, "Plan::compile: [1]");
                    let task = &nodes[id.index()];
                    let mut owned_children = vec![];
                    let mut shared_children = vec![];
                    for child in &task.successors {
                        let child_idx = order[child].index;
                        if nodes[child.index()].dependents.len() == 1 {
                            // We are the only parent: the child can start right after us
                            // without cross-thread synchronization.
                            owned_children.push(child_idx);
                        } else {
                            shared_children.push(child_idx);
                        }
                    }
                    // Sorted indexes give better cache locality.
                    owned_children.sort_unstable();
                    shared_children.sort_unstable();
                    let parents: u32 = task
                        .dependents
                        .len()
                        .try_into()
                        .expect("Plan::compile: [2]");
                    let node = PlanNode {
                        name: task.display_name(),
                        kind: task.kind,
                        work: task.work.clone(),
                        module: task.module.clone(),
                        owned_children,
                        shared_children,
                    };
                    (node, parents, id)
                })
                .unzip3();

            let depth = order.values().map(|entry| entry.depth).max().unwrap_or(0);
            let plan = Self {
                name: name.to_owned(),
                nodes: plan_nodes,
                parents_total,
                ids,
                num_independent_tasks: num_independent,
                depth,
            };
            assert_eq!(plan.nodes.len(), nodes.len(), "Plan::compile: [3]");
            if !plan.nodes.is_empty() {
                assert_ne!(plan.num_independent_tasks, 0, "Plan::compile: [4]");
            }
            Ok(plan)
        })
    }
}
