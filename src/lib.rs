//! Task-graph programming with a work-stealing executor.
//!
//! A [`Taskflow`](taskflow::Taskflow) is a directed acyclic graph of tasks
//! connected by precedence edges. An [`Executor`](executor::Executor) owns a
//! pool of worker threads and runs a taskflow once, a number of times, or
//! until a predicate holds. It:
//! - Compiles the graph into a topological order and detects cycles before
//!   anything runs.
//! - Distinguishes children with a single parent (owned) from children with
//!   several parents (shared) so that only the latter pay for
//!   synchronization.
//! - Uses a lightweight join-counter protocol with Release/Relaxed/Acquire
//!   fences, so a task observes everything its predecessors did.
//!
//! Besides plain closures, a task can build a nested graph at run time
//! (subflow), compose another taskflow (module), or offload a graph of
//! device operations to a [`Device`](device::Device) (device task).
//!
//! Quick start:
//! 1. Create a `Taskflow` and add tasks with `emplace`.
//! 2. Declare dependencies with `Task::precede` / `Task::succeed`.
//! 3. Start an `Executor`, call `run` and `wait` on the returned handle.
//! 4. Optionally `dump` the graph in GraphViz DOT format.

/// Executor configuration, with defaults and environment overrides.
pub mod config;
/// Heterogeneous offload: devices, device buffers, launch geometry and
/// device flows.
pub mod device;
mod dump;
/// The work-stealing executor.
///
/// Contains graph compilation (topological ordering, cycle detection,
/// owned/shared children), parallel execution with memory fences upholding
/// the happens-before relations between tasks, and run bookkeeping.
pub mod executor;
/// The task container shared by taskflows and subflows.
pub mod graph;
mod sync;
/// Task handles used to name tasks and declare dependencies.
pub mod task;
/// Taskflows and subflows.
pub mod taskflow;
/// Core identifiers shared across the crate.
pub mod types;
mod utils;
