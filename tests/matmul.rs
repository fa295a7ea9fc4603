//! Matrix multiplication `C = A * B`, on host workers and offloaded to a device.

#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use std::sync::Arc;
use taskgraph::{
    device::{Device, DeviceBuffer, DeviceError, HostBuffer, HostDevice, LaunchConfig},
    executor::{Executor, RunError},
    taskflow::Taskflow,
};

const M: usize = 24;
const K: usize = 16;
const N: usize = 20;

#[allow(clippy::cast_precision_loss)]
fn a_at(row: usize, col: usize) -> f64 {
    (row + col) as f64
}

#[allow(clippy::cast_precision_loss)]
fn b_at(row: usize, col: usize) -> f64 {
    (row * col) as f64
}

fn expected() -> Vec<f64> {
    let mut c = vec![0.0; M * N];
    for row in 0..M {
        for col in 0..N {
            c[row * N + col] = (0..K).map(|k| a_at(row, k) * b_at(k, col)).sum();
        }
    }
    c
}

fn dot(a: &[f64], b: &[f64], row: usize, col: usize) -> f64 {
    (0..K).map(|k| a[row * K + k] * b[k * N + col]).sum()
}

/// Adds the tasks initializing `A` and `B`, returning them.
fn init_inputs<'a>(
    flow: &'a Taskflow,
    a: &HostBuffer<f64>,
    b: &HostBuffer<f64>,
) -> [taskgraph::task::Task<'a>; 2] {
    let init_a = flow
        .emplace({
            let a = a.clone();
            move || {
                let mut a = a.write();
                for row in 0..M {
                    for col in 0..K {
                        a[row * K + col] = a_at(row, col);
                    }
                }
            }
        })
        .named("init_a");
    let init_b = flow
        .emplace({
            let b = b.clone();
            move || {
                let mut b = b.write();
                for row in 0..K {
                    for col in 0..N {
                        b[row * N + col] = b_at(row, col);
                    }
                }
            }
        })
        .named("init_b");
    [init_a, init_b]
}

#[test]
fn matmul_on_host_workers() {
    let executor = Executor::new(4).unwrap();
    let a = HostBuffer::<f64>::new(M * K);
    let b = HostBuffer::<f64>::new(K * N);
    let c = HostBuffer::<f64>::new(M * N);

    let flow = Taskflow::new("matmul");
    let inputs = init_inputs(&flow, &a, &b);
    let rows: Vec<_> = (0..M)
        .map(|row| {
            let (a, b, c) = (a.clone(), b.clone(), c.clone());
            flow.emplace(move || {
                let values: Vec<f64> = {
                    let (a, b) = (a.read(), b.read());
                    (0..N).map(|col| dot(&a, &b, row, col)).collect()
                };
                c.write()[row * N..(row + 1) * N].copy_from_slice(&values);
            })
            .named(format!("row_{row}"))
        })
        .collect();
    for &row in &rows {
        row.succeed_all(inputs);
    }

    executor.run(&flow).wait().unwrap();
    assert_eq!(c.to_vec(), expected());
    assert!(flow.dump_to_string().contains("n0 -> n2;"));
}

#[test]
fn matmul_offloaded_to_a_device() {
    let executor = Executor::new(2).unwrap();
    let host = Arc::new(HostDevice::new("emulated-gpu"));
    let device: Arc<dyn Device> = host.clone();
    let a = HostBuffer::<f64>::new(M * K);
    let b = HostBuffer::<f64>::new(K * N);
    let c = HostBuffer::<f64>::new(M * N);

    let flow = Taskflow::new("matmul-device");
    let inputs = init_inputs(&flow, &a, &b);
    let gpu = flow
        .emplace_device(&device, {
            let (a, b, c) = (a.clone(), b.clone(), c.clone());
            move |df| {
                let da = DeviceBuffer::<f64>::new(df.device(), M * K)?;
                let db = DeviceBuffer::<f64>::new(df.device(), K * N)?;
                let dc = DeviceBuffer::<f64>::new(df.device(), M * N)?;
                let copy_a = df.upload(&da, &a)?;
                let copy_b = df.upload(&db, &b)?;
                let kernel = df.kernel(LaunchConfig::for_grid_2d(N, M, 8), {
                    let (da, db, dc) = (da.clone(), db.clone(), dc.clone());
                    move |launch| {
                        let (a, b) = (da.read(), db.read());
                        let mut c = dc.write();
                        for thread in launch.threads() {
                            let (row, col) = (thread.global_y(), thread.global_x());
                            if row < M && col < N {
                                c[row * N + col] = dot(&a, &b, row, col);
                            }
                        }
                    }
                });
                let copy_c = df.download(&c, &dc)?;
                df.set_name(kernel, "matmul");
                df.precede(copy_a, kernel);
                df.precede(copy_b, kernel);
                df.precede(kernel, copy_c);
                Ok(())
            }
        })
        .named("gpu");
    gpu.succeed_all(inputs);

    executor.run(&flow).wait().unwrap();
    assert_eq!(c.to_vec(), expected());

    let stats = host.stats();
    assert_eq!(stats.kernels_launched, 1);
    assert_eq!(stats.bytes_uploaded, ((M * K + K * N) * 8) as u64);
    assert_eq!(stats.bytes_downloaded, (M * N * 8) as u64);
    // Device buffers are released once the device flow is dropped.
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.peak_bytes, (M * K + K * N + M * N) * 8);
}

#[test]
fn device_failures_fail_the_run() {
    let executor = Executor::new(2).unwrap();
    let device: Arc<dyn Device> = Arc::new(HostDevice::new("tiny").with_memory_limit(64));
    let flow = Taskflow::new("oom");
    flow.emplace_device(&device, |df| {
        DeviceBuffer::<f64>::new(df.device(), M * N)?;
        Ok(())
    })
    .named("alloc");

    let err = executor.run(&flow).wait().unwrap_err();
    assert_eq!(
        err,
        RunError::Device {
            task: "alloc".into(),
            source: DeviceError::OutOfMemory {
                requested: M * N * 8,
                available: 64,
            },
        }
    );
}

#[test]
fn panicking_device_builder_fails_the_run() {
    let executor = Executor::new(2).unwrap();
    let device: Arc<dyn Device> = Arc::new(HostDevice::new("emulated-gpu"));
    let flow = Taskflow::new("bad-device");
    flow.emplace_device(&device, |_| panic!("no ops")).named("gpu");

    let err = executor.run(&flow).wait().unwrap_err();
    assert_eq!(
        err,
        RunError::TaskPanicked {
            task: "gpu".into(),
            message: "no ops".into(),
        }
    );
}

#[test]
fn cyclic_device_flow_fails_the_run() {
    let executor = Executor::new(2).unwrap();
    let host = Arc::new(HostDevice::new("emulated-gpu"));
    let device: Arc<dyn Device> = host.clone();
    let flow = Taskflow::new("device-loop");
    flow.emplace_device(&device, |df| {
        let a = df.noop();
        let b = df.noop();
        df.precede(a, b);
        df.precede(b, a);
        Ok(())
    })
    .named("gpu");

    let err = executor.run(&flow).wait().unwrap_err();
    assert!(
        matches!(
            err,
            RunError::Device { ref task, source: DeviceError::Cycle { ref flow, .. } }
                if task == "gpu" && flow == "gpu"
        ),
        "{err:?}"
    );
    assert_eq!(host.stats().ops_executed, 0);
}
