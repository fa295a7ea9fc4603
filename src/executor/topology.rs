use crate::executor::{
    Plan,
    execute::{RunError, RunState, run_plan},
};
use derive_more::Debug;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::debug;

/// Decides whether a topology stops; called before the first iteration and
/// after every iteration.
pub(crate) type StopPredicate = Box<dyn FnMut() -> bool + Send>;

/// Handle to a run submitted to an [`Executor`](crate::executor::Executor).
///
/// Clones observe the same run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    state: Arc<TopologyState>,
}

#[derive(Debug)]
pub(crate) struct TopologyState {
    taskflow: String,
    pub(crate) run: Arc<RunState>,
    outcome: Mutex<Option<Result<(), RunError>>>,
    done: Condvar,
}

/// One submitted run (once, N times, or until a predicate holds) of a
/// taskflow.
#[derive(Debug)]
pub(crate) struct Topology {
    pub(crate) plan: Arc<Plan>,
    #[debug(skip)]
    pub(crate) stop: StopPredicate,
    pub(crate) state: Arc<TopologyState>,
    pub(crate) queue: Arc<FlowQueue>,
    pub(crate) inflight: Arc<InFlight>,
}

/// Per-taskflow FIFO of topologies; at most one of them runs at a time.
#[derive(Debug, Default)]
pub(crate) struct FlowQueue {
    inner: Mutex<FlowQueueInner>,
}

#[derive(Debug, Default)]
struct FlowQueueInner {
    busy: bool,
    pending: VecDeque<Topology>,
}

/// Count of outstanding topologies and async jobs of one executor.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl RunHandle {
    pub(crate) fn new(taskflow: &str) -> Self {
        Self {
            state: Arc::new(TopologyState {
                taskflow: taskflow.to_owned(),
                run: Arc::new(RunState::new()),
                outcome: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> &Arc<TopologyState> {
        &self.state
    }

    /// Name of the taskflow this run belongs to.
    #[must_use]
    pub fn taskflow(&self) -> &str {
        &self.state.taskflow
    }

    /// Block until the run completes.
    ///
    /// Must not be called from a task of the same executor that the run is
    /// queued behind.
    ///
    /// # Errors
    /// The first task failure of the run, a scheduling error, or
    /// [`RunError::Cancelled`].
    pub fn wait(&self) -> Result<(), RunError> {
        let mut outcome = self.state.outcome.lock();
        loop {
            if let Some(result) = &*outcome {
                return result.clone();
            }
            self.state.done.wait(&mut outcome);
        }
    }

    /// Block until the run completes or `timeout` elapses; `None` on timeout.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), RunError>> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.state.outcome.lock();
        loop {
            if let Some(result) = &*outcome {
                return Some(result.clone());
            }
            let waited = self.state.done.wait_until(&mut outcome, deadline);
            if waited.timed_out() {
                return outcome.clone();
            }
        }
    }

    /// Whether the run has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.outcome.lock().is_some()
    }

    /// Request cancellation. Tasks that have not started yet are skipped and
    /// no further iterations are started; running tasks finish normally.
    pub fn cancel(&self) {
        debug!(taskflow = %self.state.taskflow, "cancelling run");
        self.state.run.cancel();
    }
}

impl TopologyState {
    pub(crate) fn finish(&self, outcome: Result<(), RunError>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.notify_all();
        }
    }
}

impl Topology {
    /// Run this topology and every topology of the same taskflow queued
    /// behind it.
    pub(crate) fn drive_all(self) {
        let mut next = Some(self);
        while let Some(topology) = next {
            next = topology.drive();
        }
    }

    fn drive(self) -> Option<Topology> {
        let Self {
            plan,
            mut stop,
            state,
            queue,
            inflight,
        } = self;
        let run = &state.run;
        debug!(taskflow = %plan.name(), tasks = plan.len(), "topology started");

        let slots = Arc::new(plan.new_slots());
        let mut iterations = 0usize;
        // Only consulted at the head of the queue, after every earlier run.
        while run.outcome().is_ok() && !run.guard("stop predicate", || stop()).unwrap_or(true) {
            run_plan(&plan, &slots, run);
            iterations += 1;
        }
        let outcome = run.outcome();
        debug!(
            taskflow = %plan.name(),
            iterations,
            ok = outcome.is_ok(),
            "topology finished"
        );
        state.finish(outcome);
        inflight.end();
        queue.next()
    }
}

impl FlowQueue {
    /// Queue `topology`; returns it back when nothing of this taskflow is
    /// running, in which case the caller must start it.
    pub(crate) fn enqueue(&self, topology: Topology) -> Option<Topology> {
        let mut inner = self.inner.lock();
        if inner.busy {
            inner.pending.push_back(topology);
            None
        } else {
            inner.busy = true;
            Some(topology)
        }
    }

    fn next(&self) -> Option<Topology> {
        let mut inner = self.inner.lock();
        let next = inner.pending.pop_front();
        if next.is_none() {
            inner.busy = false;
        }
        next
    }
}

impl InFlight {
    pub(crate) fn begin(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn end(&self) {
        let mut count = self.count.lock();
        *count = count.checked_sub(1).expect("InFlight::end");
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock()
    }
}
