use crate::{
    device::DeviceError,
    executor::{GraphError, ParentInfoSlot, Plan, PlanNode},
    graph::Work,
    sync::*,
    taskflow::Subflow,
    utils::{RangeSplitAtHalf, panic_message},
};
use core::{
    marker::PhantomData,
    ops::{Deref, Range},
    panic::AssertUnwindSafe,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{panic, sync::Arc};
use thiserror::Error;
use tracing::{trace, warn};

/// Why a run did not complete successfully.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum RunError {
    /// The taskflow (or a subflow built at run time) could not be scheduled.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// A task panicked.
    #[error("task `{task}` panicked: {message}")]
    TaskPanicked {
        /// Name of the panicking task.
        task: String,
        /// Panic message, when it was a string.
        message: String,
    },
    /// A device task failed to build or offload its device flow.
    #[error("device task `{task}` failed")]
    Device {
        /// Name of the failing task.
        task: String,
        /// Device-side cause.
        #[source]
        source: DeviceError,
    },
    /// The run was cancelled through its handle.
    #[error("run was cancelled")]
    Cancelled,
}

/// Cancellation flag and first failure of one run, shared by every task of
/// the run including nested subflows and modules.
#[derive(Debug)]
pub(crate) struct RunState {
    cancelled: AtomicBool,
    error: Mutex<Option<RunError>>,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Record `err` unless an earlier failure was recorded, then cancel.
    pub(crate) fn fail(&self, err: RunError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                warn!(error = %err, "run failed, skipping remaining tasks");
                *slot = Some(err);
            }
        }
        self.cancel();
    }

    /// Run `f`, turning a panic into a recorded failure of `task`.
    pub(crate) fn guard<R>(&self, task: &str, f: impl FnOnce() -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.fail(RunError::TaskPanicked {
                    task: task.to_owned(),
                    message: panic_message(payload.as_ref()),
                });
                None
            }
        }
    }

    pub(crate) fn outcome(&self) -> Result<(), RunError> {
        if let Some(err) = self.error.lock().clone() {
            return Err(err);
        }
        if self.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(not(feature = "loom"))]
pub(super) struct ExecCtx<'a> {
    plan: Shared<'a, Plan>,
    slots: Shared<'a, Vec<ParentInfoSlot>>,
    run: Shared<'a, RunState>,
    _marker: PhantomData<&'a ()>,
}

#[cfg(feature = "loom")]
pub(super) struct ExecCtx<'a: 'static> {
    plan: Shared<'a, Plan>,
    slots: Shared<'a, Vec<ParentInfoSlot>>,
    run: Shared<'a, RunState>,
    _marker: PhantomData<&'a ()>,
}

impl Clone for ExecCtx<'_> {
    fn clone(&self) -> Self {
        let Self {
            plan,
            slots,
            run,
            _marker,
        } = self;
        // Copies references outside of `loom`, clones `Arc`s under it.
        #[allow(noop_method_call)]
        Self {
            plan: plan.clone(),
            slots: slots.clone(),
            run: run.clone(),
            _marker: PhantomData,
        }
    }
}

/// Run every task of `plan` once, reusing `slots` as join counters.
///
/// Returns when all tasks (and everything nested in them) have finished.
/// `slots` must come from `plan.new_slots()` and must not be used by another
/// run at the same time.
pub(crate) fn run_plan(plan: &Arc<Plan>, slots: &Arc<Vec<ParentInfoSlot>>, run: &Arc<RunState>) {
    let ctx = ExecCtx {
        plan: share(plan),
        slots: share(slots),
        run: share(run),
        _marker: PhantomData,
    };
    join_independent_tasks(ctx, 0..plan.num_independent_tasks);
}

fn join_independent_tasks(ctx: ExecCtx<'_>, independent_task_range: Range<usize>) {
    match independent_task_range.len() {
        0 => return,
        1 => {
            ctx.exec(independent_task_range.start);
            return;
        }
        _ => {}
    }
    let (left_range, right_range) = independent_task_range.split_at_half();
    let rhs = ctx.clone();
    join(
        move || join_independent_tasks(ctx, left_range),
        move || join_independent_tasks(rhs, right_range),
    );
}

fn join_owned_tasks(ctx: ExecCtx<'_>, owned_task_indexes: impl Deref<Target = [u32]>) {
    match *owned_task_indexes {
        [] => return,
        [task_index] => {
            ctx.exec(task_index as usize);
            return;
        }
        _ => {}
    }
    let (left, right) = owned_task_indexes.split_at(owned_task_indexes.len() / 2);
    #[cfg(feature = "loom")]
    let (left, right) = (Arc::<[u32]>::from(left), Arc::<[u32]>::from(right));
    let rhs = ctx.clone();
    join(
        move || join_owned_tasks(ctx, left),
        move || join_owned_tasks(rhs, right),
    );
}

impl ExecCtx<'_> {
    /// Run the task at `task_index` and everything that becomes ready
    /// because of it.
    ///
    /// When a task finishes, it:
    /// - performs a Release fence if it has shared children,
    /// - decrements each shared child's `parents_left` (Relaxed),
    /// - treats a child whose counter it brought to zero as owned, performing
    ///   an Acquire fence before running it.
    ///
    /// A single ready child keeps running on this worker; several are joined.
    fn exec(&self, task_index: usize) {
        let mut idx = task_index;
        loop {
            let node = &self.plan.nodes[idx];
            let slot = &self.slots[idx];
            // Every parent has already decremented this counter; re-arm it for
            // the next iteration of the same plan.
            let total = slot.parents_total;
            slot.parents_left.store(total, Ordering::Relaxed);

            self.invoke(node);

            let mut ready: SmallVec<[u32; 8]> = SmallVec::from_slice(&node.owned_children);
            let num_owned = ready.len();
            if !node.shared_children.is_empty() {
                fence(Ordering::Release);
            }
            for &child in &node.shared_children {
                let parent_info = &self.slots[child as usize];
                if parent_info.parents_left.fetch_sub(1, Ordering::Relaxed) == 1 {
                    ready.push(child);
                }
            }
            if ready.len() != num_owned {
                fence(Ordering::Acquire);
            }

            match ready.len() {
                0 => return,
                1 => idx = ready[0] as usize,
                _ => {
                    join_owned_tasks(self.clone(), ready);
                    return;
                }
            }
        }
    }

    fn invoke(&self, node: &PlanNode) {
        if self.run.is_cancelled() {
            trace!(task = %node.name, "skipping task of a cancelled run");
            return;
        }
        trace!(task = %node.name, kind = %node.kind, "running task");
        if let Some(module) = &node.module {
            self.run_nested(module);
            return;
        }
        // The work lock is released before a nested graph runs.
        let nested = {
            let mut cell = node.work.lock();
            match &mut *cell {
                Work::Placeholder => None,
                Work::Static(work) => {
                    self.run.guard(&node.name, || work());
                    None
                }
                Work::Subflow(work) => {
                    let mut subflow = Subflow::new(node.name.as_str());
                    self.run
                        .guard(&node.name, || work(&mut subflow))
                        .and_then(|()| match subflow.compile() {
                            Ok(plan) => Some(plan),
                            Err(err) => {
                                self.run.fail(err.into());
                                None
                            }
                        })
                }
                Work::Device(work) => {
                    if let Some(Err(source)) = self.run.guard(&node.name, || work.run(&node.name)) {
                        self.run.fail(RunError::Device {
                            task: node.name.clone(),
                            source,
                        });
                    }
                    None
                }
            }
        };
        if let Some(plan) = nested {
            self.run_nested(&plan);
        }
    }

    fn run_nested(&self, plan: &Arc<Plan>) {
        let slots = Arc::new(plan.new_slots());
        #[allow(noop_method_call)]
        let ctx = ExecCtx {
            plan: share(plan),
            slots: share(&slots),
            run: self.run.clone(),
            _marker: PhantomData,
        };
        join_independent_tasks(ctx, 0..plan.num_independent_tasks);
    }
}
