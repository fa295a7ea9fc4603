use crate::{
    device::{Device, DeviceError, DeviceFlow},
    executor::{DagNode, GraphError, Plan},
    task::Task,
    taskflow::{Subflow, Taskflow},
    types::{IndexSet, NodeId, TaskKind},
};
use core::{
    cell::{Cell, RefCell},
    fmt,
};
use derive_more::Debug;
use parking_lot::Mutex;
use std::sync::Arc;

/// Task container shared by [`Taskflow`] and [`Subflow`].
///
/// Building goes through `&self` so that any number of [`Task`] handles can
/// be held while edges between them are declared.
#[must_use]
#[derive(Debug, Default)]
pub struct FlowGraph {
    nodes: RefCell<Vec<NodeSpec>>,
    revision: Cell<u64>,
}

pub(crate) type WorkCell = Mutex<Work>;

/// Runtime payload of a task. Locked for the duration of a single call, so
/// the same work never runs twice at once even when a module is shared by
/// several graphs.
pub(crate) enum Work {
    Placeholder,
    Static(Box<dyn FnMut() + Send>),
    Subflow(Box<dyn FnMut(&mut Subflow) + Send>),
    Device(DeviceWork),
}

pub(crate) struct DeviceWork {
    device: Arc<dyn Device>,
    build: Box<dyn FnMut(&mut DeviceFlow) -> Result<(), DeviceError> + Send>,
}

#[derive(Debug)]
pub(crate) struct NodeSpec {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: TaskKind,
    #[debug(skip)]
    pub(crate) work: Arc<WorkCell>,
    /// Captured graph of a module task.
    pub(crate) module: Option<Arc<Plan>>,
    pub(crate) successors: IndexSet<NodeId>,
    pub(crate) dependents: IndexSet<NodeId>,
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placeholder => f.write_str("Placeholder"),
            Self::Static(_) => f.write_str("Static(..)"),
            Self::Subflow(_) => f.write_str("Subflow(..)"),
            Self::Device(work) => f.debug_tuple("Device").field(&work.device.name()).finish(),
        }
    }
}

impl DeviceWork {
    /// Build a fresh device flow and offload it, unless the builder already did.
    pub(crate) fn run(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut flow = DeviceFlow::new(name, &self.device);
        (self.build)(&mut flow)?;
        if !flow.is_offloaded() {
            flow.offload()?;
        }
        Ok(())
    }
}

impl NodeSpec {
    pub(crate) fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("task_{}", self.id)
        } else {
            self.name.clone()
        }
    }
}

impl DagNode for NodeSpec {
    fn parents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    fn children(&self) -> &IndexSet<NodeId> {
        &self.successors
    }
}

impl FlowGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a static task running `work` once per execution.
    pub fn emplace<F>(&self, work: F) -> Task<'_>
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(TaskKind::Static, Work::Static(Box::new(work)), None)
    }

    /// Add a subflow task. `work` receives an empty [`Subflow`] every time
    /// the task runs; the graph it builds is executed and joined before the
    /// task's successors start.
    pub fn emplace_subflow<F>(&self, work: F) -> Task<'_>
    where
        F: FnMut(&mut Subflow) + Send + 'static,
    {
        self.insert(TaskKind::Subflow, Work::Subflow(Box::new(work)), None)
    }

    /// Add a device task. `build` receives an empty [`DeviceFlow`] bound to
    /// `device` every time the task runs; the flow is offloaded and
    /// synchronized before the task completes.
    pub fn emplace_device<F>(&self, device: &Arc<dyn Device>, build: F) -> Task<'_>
    where
        F: FnMut(&mut DeviceFlow) -> Result<(), DeviceError> + Send + 'static,
    {
        let work = DeviceWork {
            device: Arc::clone(device),
            build: Box::new(build),
        };
        self.insert(TaskKind::Device, Work::Device(work), None)
    }

    /// Add a task without work.
    pub fn placeholder(&self) -> Task<'_> {
        self.insert(TaskKind::Placeholder, Work::Placeholder, None)
    }

    /// Add a module task running the graph of `module`.
    ///
    /// The module captures the graph of `module` as it is now; later edits to
    /// `module` are not seen by this task.
    ///
    /// # Errors
    /// If `module` contains cycle(s).
    pub fn composed_of(&self, module: &Taskflow) -> Result<Task<'_>, GraphError> {
        let plan = module.compile()?;
        let task = self.insert(TaskKind::Module, Work::Placeholder, Some(plan));
        Ok(task.named(module.name()))
    }

    /// Chain `tasks` so that each one precedes the next.
    pub fn linearize(&self, tasks: &[Task<'_>]) {
        for pair in tasks.windows(2) {
            pair[0].precede(pair[1]);
        }
    }

    /// Number of tasks in the graph.
    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Whether the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Handles to every task, in insertion order.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task<'_>> {
        (0..self.num_tasks())
            .map(|idx| Task::new(self, NodeId::from_index(idx)))
            .collect()
    }

    /// Remove every task.
    pub fn clear(&mut self) {
        self.nodes.get_mut().clear();
        self.touch();
    }

    fn insert(&self, kind: TaskKind, work: Work, module: Option<Arc<Plan>>) -> Task<'_> {
        let id = {
            let mut nodes = self.nodes.borrow_mut();
            let id = NodeId::from_index(nodes.len());
            nodes.push(NodeSpec {
                id,
                name: String::new(),
                kind,
                work: Arc::new(Mutex::new(work)),
                module,
                successors: IndexSet::default(),
                dependents: IndexSet::default(),
            });
            id
        };
        self.touch();
        Task::new(self, id)
    }

    pub(crate) fn connect(&self, from: NodeId, to: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if nodes[from.index()].successors.insert(to) {
            nodes[to.index()].dependents.insert(from);
            drop(nodes);
            self.touch();
        }
    }

    pub(crate) fn set_name(&self, id: NodeId, name: String) {
        self.nodes.borrow_mut()[id.index()].name = name;
        self.touch();
    }

    pub(crate) fn set_static_work(&self, id: NodeId, work: Box<dyn FnMut() + Send>) {
        let mut nodes = self.nodes.borrow_mut();
        let node = &mut nodes[id.index()];
        // A fresh cell; plans compiled earlier keep the old work.
        node.work = Arc::new(Mutex::new(Work::Static(work)));
        node.kind = TaskKind::Static;
        node.module = None;
        drop(nodes);
        self.touch();
    }

    pub(crate) fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&NodeSpec) -> R) -> R {
        f(&self.nodes.borrow()[id.index()])
    }

    pub(crate) fn with_nodes<R>(&self, f: impl FnOnce(&[NodeSpec]) -> R) -> R {
        f(&self.nodes.borrow())
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision.get()
    }

    fn touch(&self) {
        self.revision.set(self.revision.get().wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emplace_assigns_dense_ids_and_kinds() {
        let graph = FlowGraph::new();
        let a = graph.emplace(|| {});
        let b = graph.placeholder();
        let c = graph.emplace_subflow(|_| {});
        assert_eq!(a.id().index(), 0);
        assert_eq!(b.id().index(), 1);
        assert_eq!(c.id().index(), 2);
        assert_eq!(a.kind(), TaskKind::Static);
        assert_eq!(b.kind(), TaskKind::Placeholder);
        assert_eq!(c.kind(), TaskKind::Subflow);
        assert_eq!(graph.num_tasks(), 3);
        assert_eq!(graph.tasks(), vec![a, b, c]);
    }

    #[test]
    fn every_mutation_bumps_the_revision() {
        let graph = FlowGraph::new();
        let r0 = graph.revision();
        let a = graph.emplace(|| {});
        let b = graph.emplace(|| {});
        let r1 = graph.revision();
        assert!(r1 > r0);
        a.precede(b);
        let r2 = graph.revision();
        assert!(r2 > r1);
        // A duplicate edge is not a mutation.
        a.precede(b);
        assert_eq!(graph.revision(), r2);
        b.named("b");
        assert!(graph.revision() > r2);
    }

    #[test]
    fn linearize_chains_in_order() {
        let graph = FlowGraph::new();
        let tasks: Vec<_> = (0..4).map(|_| graph.placeholder()).collect();
        graph.linearize(&tasks);
        assert_eq!(tasks[0].successors(), vec![tasks[1]]);
        assert_eq!(tasks[3].dependents(), vec![tasks[2]]);
        assert_eq!(tasks[3].num_successors(), 0);
    }

    #[test]
    fn clear_removes_everything() {
        let mut graph = FlowGraph::new();
        graph.emplace(|| {});
        graph.placeholder();
        graph.clear();
        assert!(graph.is_empty());
    }

    #[test]
    fn placeholder_becomes_static_once_given_work() {
        let graph = FlowGraph::new();
        let task = graph.placeholder().work(|| {});
        assert_eq!(task.kind(), TaskKind::Static);
    }
}
