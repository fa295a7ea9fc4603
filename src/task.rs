use crate::{
    graph::FlowGraph,
    types::{NodeId, TaskKind},
};
use core::{fmt, hash, ptr};

/// Handle to a task of a [`FlowGraph`].
///
/// Handles are cheap to copy and only live as long as the graph borrow they
/// were created from. Declaring `a.precede(b)` means `b` starts only after
/// `a` has finished, and observes everything `a` did.
#[derive(Copy, Clone)]
pub struct Task<'a> {
    graph: &'a FlowGraph,
    id: NodeId,
}

impl<'a> Task<'a> {
    pub(crate) fn new(graph: &'a FlowGraph, id: NodeId) -> Self {
        Self { graph, id }
    }

    /// Id of the task inside its graph.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Set the task name used in logs, errors and dumps.
    pub fn named(self, name: impl Into<String>) -> Self {
        self.graph.set_name(self.id, name.into());
        self
    }

    /// Task name; unnamed tasks are reported as `task_<id>`.
    #[must_use]
    pub fn name(&self) -> String {
        self.graph.with_node(self.id, |node| node.display_name())
    }

    /// What the task does when it runs.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.graph.with_node(self.id, |node| node.kind)
    }

    /// Replace the work of this task with a static closure.
    pub fn work<F>(self, work: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.graph.set_static_work(self.id, Box::new(work));
        self
    }

    /// Make `other` run after this task.
    ///
    /// # Panics
    /// If `other` belongs to a different graph.
    pub fn precede(self, other: Task<'a>) -> Self {
        self.assert_same_graph(other);
        self.graph.connect(self.id, other.id);
        self
    }

    /// Make every task of `others` run after this task.
    ///
    /// # Panics
    /// If one of `others` belongs to a different graph.
    pub fn precede_all(self, others: impl IntoIterator<Item = Task<'a>>) -> Self {
        for other in others {
            self.precede(other);
        }
        self
    }

    /// Make this task run after `other`.
    ///
    /// # Panics
    /// If `other` belongs to a different graph.
    pub fn succeed(self, other: Task<'a>) -> Self {
        other.precede(self);
        self
    }

    /// Make this task run after every task of `others`.
    ///
    /// # Panics
    /// If one of `others` belongs to a different graph.
    pub fn succeed_all(self, others: impl IntoIterator<Item = Task<'a>>) -> Self {
        for other in others {
            other.precede(self);
        }
        self
    }

    /// Number of tasks that run after this one.
    #[must_use]
    pub fn num_successors(&self) -> usize {
        self.graph.with_node(self.id, |node| node.successors.len())
    }

    /// Number of tasks this one waits for.
    #[must_use]
    pub fn num_dependents(&self) -> usize {
        self.graph.with_node(self.id, |node| node.dependents.len())
    }

    /// Tasks that run after this one, in declaration order.
    #[must_use]
    pub fn successors(&self) -> Vec<Task<'a>> {
        self.graph.with_node(self.id, |node| {
            node.successors
                .iter()
                .map(|&id| Task::new(self.graph, id))
                .collect()
        })
    }

    /// Tasks this one waits for, in declaration order.
    #[must_use]
    pub fn dependents(&self) -> Vec<Task<'a>> {
        self.graph.with_node(self.id, |node| {
            node.dependents
                .iter()
                .map(|&id| Task::new(self.graph, id))
                .collect()
        })
    }

    fn assert_same_graph(&self, other: Task<'_>) {
        assert!(
            ptr::eq(self.graph, other.graph),
            "Task {} and task {} belong to different graphs",
            self.name(),
            other.name()
        );
    }
}

impl PartialEq for Task<'_> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.graph, other.graph) && self.id == other.id
    }
}

impl Eq for Task<'_> {}

impl hash::Hash for Task<'_> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        ptr::hash(self.graph, state);
        self.id.hash(state);
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}
