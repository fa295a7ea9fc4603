use crate::{
    dump,
    executor::{FlowQueue, GraphError, Plan},
    graph::FlowGraph,
};
use core::cell::RefCell;
use derive_more::{Debug, Deref, DerefMut};
use std::{io, sync::Arc};
use tracing::debug;

/// A named task graph that can be run by an [`Executor`](crate::executor::Executor).
///
/// All graph-building operations come from [`FlowGraph`] through `Deref`.
/// Runs of the same taskflow never overlap: a run submitted while another
/// one is in flight waits for it.
#[must_use]
#[derive(Debug, Deref, DerefMut)]
pub struct Taskflow {
    name: String,
    #[deref]
    #[deref_mut]
    graph: FlowGraph,
    /// Last compiled plan together with the graph revision it was built from.
    #[debug(skip)]
    cache: RefCell<Option<(u64, Arc<Plan>)>>,
    #[debug(skip)]
    queue: Arc<FlowQueue>,
}

/// Builder handed to a subflow task while it runs.
///
/// The graph built here is executed as soon as the closure returns and is
/// joined before the successors of the subflow task start.
#[must_use]
#[derive(Debug, Deref, DerefMut)]
pub struct Subflow {
    name: String,
    #[deref]
    #[deref_mut]
    graph: FlowGraph,
}

impl Default for Taskflow {
    fn default() -> Self {
        Self::new("")
    }
}

impl Taskflow {
    /// Create an empty taskflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: FlowGraph::new(),
            cache: RefCell::new(None),
            queue: Arc::new(FlowQueue::default()),
        }
    }

    /// Name of the taskflow.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the taskflow.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.cache.get_mut().take();
    }

    /// Check that the graph can be scheduled.
    ///
    /// # Errors
    /// If the graph contains cycle(s).
    pub fn validate(&self) -> Result<(), GraphError> {
        self.compile().map(drop)
    }

    /// Write the graph in GraphViz DOT format.
    ///
    /// # Errors
    /// Propagates I/O errors of `out`.
    pub fn dump(&self, out: impl io::Write) -> io::Result<()> {
        dump::write_taskflow(out, &self.name, &self.graph)
    }

    /// The graph in GraphViz DOT format.
    #[must_use]
    pub fn dump_to_string(&self) -> String {
        let mut out = Vec::new();
        self.dump(&mut out).expect("Taskflow::dump_to_string: [1]");
        String::from_utf8(out).expect("Taskflow::dump_to_string: [2]")
    }

    pub(crate) fn compile(&self) -> Result<Arc<Plan>, GraphError> {
        let revision = self.graph.revision();
        if let Some((cached, plan)) = &*self.cache.borrow() {
            if *cached == revision {
                return Ok(Arc::clone(plan));
            }
        }
        let plan = Arc::new(Plan::compile(&self.name, &self.graph)?);
        debug!(
            taskflow = %self.name,
            tasks = plan.len(),
            depth = plan.depth(),
            "compiled taskflow"
        );
        *self.cache.borrow_mut() = Some((revision, Arc::clone(&plan)));
        Ok(plan)
    }

    pub(crate) fn queue(&self) -> &Arc<FlowQueue> {
        &self.queue
    }
}

impl Subflow {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: FlowGraph::new(),
        }
    }

    /// Name of the subflow, inherited from its task.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn compile(&self) -> Result<Arc<Plan>, GraphError> {
        Plan::compile(&self.name, &self.graph).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_is_cached_until_the_graph_changes() {
        let flow = Taskflow::new("cached");
        let a = flow.emplace(|| {});
        let first = flow.compile().unwrap();
        let second = flow.compile().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let b = flow.emplace(|| {});
        a.precede(b);
        let third = flow.compile().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn rename_invalidates_the_cache() {
        let mut flow = Taskflow::new("before");
        flow.emplace(|| {});
        let first = flow.compile().unwrap();
        flow.set_name("after");
        let second = flow.compile().unwrap();
        assert_eq!(first.name(), "before");
        assert_eq!(second.name(), "after");
    }

    #[test]
    fn validate_reports_cycles() {
        let flow = Taskflow::new("loop");
        let a = flow.placeholder().named("a");
        let b = flow.placeholder().named("b");
        a.precede(b);
        b.precede(a);
        assert!(matches!(flow.validate(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn composed_module_keeps_its_snapshot() {
        let module = Taskflow::new("inner");
        module.emplace(|| {});
        let outer = Taskflow::new("outer");
        let task = outer.composed_of(&module).unwrap();
        assert_eq!(task.name(), "inner");
        module.emplace(|| {});
        outer.with_node(task.id(), |node| {
            assert_eq!(node.module.as_ref().map(|plan| plan.len()), Some(1));
        });
    }

    #[test]
    fn cyclic_module_is_rejected() {
        let module = Taskflow::new("cyclic");
        let a = module.placeholder();
        a.precede(a);
        let outer = Taskflow::new("outer");
        assert!(outer.composed_of(&module).is_err());
        assert!(outer.is_empty());
    }
}
