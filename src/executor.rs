mod execute;
mod setup;
mod topology;

/// Why a run did not complete successfully.
pub use crate::executor::execute::RunError;
/// Error returned when a graph cannot be scheduled.
///
/// Produced when cycle detection determines that no valid topological order
/// exists for part or all of the graph.
pub use crate::executor::setup::GraphError;
/// Handle to a submitted run.
pub use crate::executor::topology::RunHandle;
pub(crate) use crate::executor::{
    setup::{DagNode, TopoOrder, toposort},
    topology::FlowQueue,
};
use crate::{
    config::ExecutorConfig,
    executor::topology::{InFlight, StopPredicate, Topology},
    graph::WorkCell,
    sync::AtomicU32,
    taskflow::Taskflow,
    types::{NodeId, TaskKind},
    utils::panic_message,
};
use derive_more::Debug;
use std::{panic, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error returned by [`Executor::new`] and [`Executor::with_config`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// An executor needs at least one worker.
    #[error("executor needs at least one worker")]
    NoWorkers,
    /// The worker pool could not be started.
    #[error("failed to start the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Work-stealing executor running taskflows on a pool of worker threads.
///
/// Key responsibilities:
/// - Compiles a taskflow into a plan (topological order, cycle detection,
///   owned/shared children) when it is submitted.
/// - Runs independent roots in parallel and propagates readiness downstream
///   using a fence+counter protocol for shared children.
/// - Serializes runs of the same taskflow and tracks every outstanding run so
///   that [`Executor::wait_for_all`] (and `Drop`) can wait for them.
#[must_use]
#[derive(Debug)]
pub struct Executor {
    #[cfg(not(feature = "loom"))]
    pool: rayon::ThreadPool,
    inflight: Arc<InFlight>,
    config: ExecutorConfig,
}

/// A graph compiled for execution: tasks in topological order.
#[must_use]
#[derive(Debug)]
pub(crate) struct Plan {
    name: String,
    nodes: Vec<PlanNode>,
    /// Number of dependents of each task, indexed like `nodes`.
    parents_total: Vec<u32>,
    /// Builder id of each task, indexed like `nodes`.
    ids: Vec<NodeId>,
    num_independent_tasks: usize,
    depth: u32,
}

#[must_use]
#[derive(Debug)]
pub(crate) struct PlanNode {
    pub(crate) name: String,
    pub(crate) kind: TaskKind,
    #[debug(skip)]
    work: Arc<WorkCell>,
    pub(crate) module: Option<Arc<Plan>>,
    /// Indexes of the downstream tasks that depend on the current task only.
    /// They can start right after it without any synchronization.
    pub(crate) owned_children: Vec<u32>,
    /// Indexes of the downstream tasks that depend on the current task and
    /// on others.
    pub(crate) shared_children: Vec<u32>,
}

/// Join counter of one task for one run.
#[must_use]
#[derive(Debug)]
#[repr(align(128))]
pub(crate) struct ParentInfoSlot {
    /// Total number of parent tasks.
    parents_total: u32,
    /// Number of parent tasks that haven't finished yet.
    parents_left: AtomicU32,
}

impl Plan {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Longest chain of edges from a root.
    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    pub(crate) fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub(crate) fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    /// Fresh join counters for one run of this plan.
    pub(crate) fn new_slots(&self) -> Vec<ParentInfoSlot> {
        self.parents_total
            .iter()
            .map(|&parents_total| ParentInfoSlot {
                parents_total,
                parents_left: AtomicU32::new(parents_total),
            })
            .collect()
    }
}

impl Executor {
    /// Start an executor with `num_workers` worker threads and otherwise
    /// default configuration.
    ///
    /// # Errors
    /// If `num_workers` is zero or the pool cannot be started.
    pub fn new(num_workers: usize) -> Result<Self, ExecutorError> {
        Self::with_config(ExecutorConfig::default().with_num_workers(num_workers))
    }

    /// Start an executor from `config`.
    ///
    /// # Errors
    /// If `config.num_workers` is zero or the pool cannot be started.
    pub fn with_config(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        if config.num_workers == 0 {
            return Err(ExecutorError::NoWorkers);
        }
        #[cfg(not(feature = "loom"))]
        let pool = {
            let prefix = config.thread_name_prefix.clone();
            let mut builder = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(move |idx| format!("{prefix}-{idx}"));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }
            builder.build()?
        };
        info!(
            workers = config.num_workers,
            prefix = %config.thread_name_prefix,
            "executor started"
        );
        Ok(Self {
            #[cfg(not(feature = "loom"))]
            pool,
            inflight: Arc::new(InFlight::default()),
            config,
        })
    }

    /// Configuration the executor was started with.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Index of the calling worker thread, or `None` when called from a
    /// thread that does not belong to this executor.
    #[must_use]
    pub fn this_worker_id(&self) -> Option<usize> {
        #[cfg(not(feature = "loom"))]
        return self.pool.current_thread_index();
        #[cfg(feature = "loom")]
        return None;
    }

    /// Number of runs and async jobs not finished yet.
    #[must_use]
    pub fn num_in_flight(&self) -> usize {
        self.inflight.count()
    }

    /// Run `taskflow` once.
    pub fn run(&self, taskflow: &Taskflow) -> RunHandle {
        self.run_n(taskflow, 1)
    }

    /// Run `taskflow` `times` times in a row.
    pub fn run_n(&self, taskflow: &Taskflow, times: usize) -> RunHandle {
        let mut left = times;
        self.run_until(taskflow, move || {
            if left == 0 {
                true
            } else {
                left -= 1;
                false
            }
        })
    }

    /// Run `taskflow` repeatedly until `stop` returns true.
    ///
    /// `stop` is called on a worker before the first iteration and after each
    /// one; a run queued behind earlier runs of `taskflow` consults it only
    /// once those have finished. A panicking `stop` fails the run.
    /// A failed or cancelled iteration ends the run without consulting it.
    pub fn run_until<P>(&self, taskflow: &Taskflow, stop: P) -> RunHandle
    where
        P: FnMut() -> bool + Send + 'static,
    {
        self.submit(taskflow, Box::new(stop))
    }

    fn submit(&self, taskflow: &Taskflow, stop: StopPredicate) -> RunHandle {
        let handle = RunHandle::new(taskflow.name());
        let plan = match taskflow.compile() {
            Ok(plan) => plan,
            Err(err) => {
                warn!(taskflow = %taskflow.name(), error = %err, "rejecting run");
                handle.state().finish(Err(err.into()));
                return handle;
            }
        };
        if plan.is_empty() {
            handle.state().finish(Ok(()));
            return handle;
        }
        self.inflight.begin();
        let topology = Topology {
            plan,
            stop,
            state: Arc::clone(handle.state()),
            queue: Arc::clone(taskflow.queue()),
            inflight: Arc::clone(&self.inflight),
        };
        match taskflow.queue().enqueue(topology) {
            Some(topology) => self.dispatch(topology),
            None => debug!(taskflow = %taskflow.name(), "run queued behind a previous run"),
        }
        handle
    }

    #[cfg(not(feature = "loom"))]
    fn dispatch(&self, topology: Topology) {
        self.pool.spawn(move || topology.drive_all());
    }

    #[cfg(feature = "loom")]
    fn dispatch(&self, topology: Topology) {
        topology.drive_all();
    }

    /// Run `job` on the pool without a handle. A panic is logged and
    /// swallowed; [`Executor::wait_for_all`] waits for the job.
    pub fn silent_async<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inflight.begin();
        let inflight = Arc::clone(&self.inflight);
        let job = move || {
            if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(job)) {
                warn!(message = %panic_message(payload.as_ref()), "async job panicked");
            }
            inflight.end();
        };
        #[cfg(not(feature = "loom"))]
        self.pool.spawn(job);
        #[cfg(feature = "loom")]
        job();
    }

    /// Block until every submitted run and async job has finished.
    pub fn wait_for_all(&self) {
        self.inflight.wait_idle();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.wait_for_all();
        info!(workers = self.config.num_workers, "executor stopped");
    }
}
