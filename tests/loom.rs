#![allow(missing_docs)]
#![cfg(feature = "loom")]

use loom::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};
use taskgraph::{executor::Executor, task::Task, taskflow::Taskflow};

/// Outputs and execution counters, indexed by task position.
///
/// Outputs are written and read with `Relaxed` ordering: only the executor's
/// fences make a parent's output visible to its children.
#[derive(Clone)]
struct Shared {
    outputs: Arc<Vec<AtomicU32>>,
    counts: Arc<Vec<AtomicUsize>>,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self {
            outputs: Arc::new((0..capacity).map(|_| AtomicU32::new(0)).collect()),
            counts: Arc::new((0..capacity).map(|_| AtomicUsize::new(0)).collect()),
        }
    }

    fn output(&self, idx: usize) -> u32 {
        self.outputs[idx].load(Ordering::Relaxed)
    }

    fn count(&self, idx: usize) -> usize {
        self.counts[idx].load(Ordering::Relaxed)
    }
}

/// Add a task storing `value` plus the outputs of `parents`.
fn summing_task<'a>(
    flow: &'a Taskflow,
    shared: &Shared,
    idx: usize,
    value: u32,
    parents: &[usize],
) -> Task<'a> {
    let shared = shared.clone();
    let parents = parents.to_vec();
    flow.emplace(move || {
        shared.counts[idx].fetch_add(1, Ordering::Relaxed);
        let acc = parents
            .iter()
            .map(|&parent| shared.output(parent))
            .fold(value, |acc, out| acc + out);
        shared.outputs[idx].store(acc, Ordering::Relaxed);
    })
}

#[test]
fn loom_diamond_correctness_and_single_exec() {
    loom::model(|| {
        // Graph:
        //   A(0)   B(1)
        //     \    /
        //       C(2)
        //        |
        //       D(3)
        // Values: A=1, B=10, C=100, D=1000
        // Expectation: C = 1 + 10 + 100 = 111; D = 111 + 1000 = 1111
        let shared = Shared::new(4);
        let flow = Taskflow::new("diamond");
        // Insertion order differs from execution order on purpose.
        let c = summing_task(&flow, &shared, 2, 100, &[0, 1]);
        let a = summing_task(&flow, &shared, 0, 1, &[]);
        let d = summing_task(&flow, &shared, 3, 1000, &[2]);
        let b = summing_task(&flow, &shared, 1, 10, &[]);
        c.succeed_all([a, b]);
        d.succeed(c);

        let executor = Executor::new(2).expect("executor must start");
        executor.run(&flow).wait().expect("run must succeed");

        assert_eq!(
            (0..4).map(|idx| shared.output(idx)).collect::<Vec<_>>(),
            vec![1, 10, 111, 1111]
        );
        assert!((0..4).all(|idx| shared.count(idx) == 1));
    });
}

#[test]
fn loom_three_parents_visibility_and_single_exec() {
    loom::model(|| {
        // Graph:
        //   A(0)   B(1)   C(2)
        //       \   |   /
        //          D(3)
        // Values: A=1, B=2, C=4, D=8
        // Expectation: D = 1 + 2 + 4 + 8 = 15
        let shared = Shared::new(4);
        let flow = Taskflow::new("fan-in");
        let d = summing_task(&flow, &shared, 3, 8, &[0, 1, 2]);
        let b = summing_task(&flow, &shared, 1, 2, &[]);
        let a = summing_task(&flow, &shared, 0, 1, &[]);
        let c = summing_task(&flow, &shared, 2, 4, &[]);
        d.succeed_all([a, b, c]);

        let executor = Executor::new(3).expect("executor must start");
        executor.run(&flow).wait().expect("run must succeed");

        assert_eq!(shared.output(3), 15);
        assert!((0..4).all(|idx| shared.count(idx) == 1));
    });
}

#[test]
fn loom_two_parents_two_shared_children() {
    loom::model(|| {
        // Graph:
        //   A(0)   B(1)
        //    | \ / |
        //    |  X  |
        //    | / \ |
        //   C(2)  D(3)
        // Values: A=1, B=10, C=100, D=1000
        // Expectations:
        //   C = 1 + 10 + 100  = 111
        //   D = 1 + 10 + 1000 = 1011
        //
        // Two independent join counters; either parent may be the last one
        // for either child.
        let shared = Shared::new(4);
        let flow = Taskflow::new("crossed");
        let a = summing_task(&flow, &shared, 0, 1, &[]);
        let b = summing_task(&flow, &shared, 1, 10, &[]);
        let c = summing_task(&flow, &shared, 2, 100, &[0, 1]);
        let d = summing_task(&flow, &shared, 3, 1000, &[0, 1]);
        a.precede_all([c, d]);
        b.precede_all([c, d]);

        let executor = Executor::new(2).expect("executor must start");
        executor.run(&flow).wait().expect("run must succeed");

        assert_eq!(shared.output(2), 111);
        assert_eq!(shared.output(3), 1011);
        assert!((0..4).all(|idx| shared.count(idx) == 1));
    });
}
