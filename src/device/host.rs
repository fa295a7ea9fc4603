use crate::device::{Device, DeviceError, DeviceOp, OpKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Threads per block accepted by default.
const DEFAULT_MAX_THREADS_PER_BLOCK: u32 = 1024;

/// A device emulated on the host.
///
/// Device memory is host memory accounted against an optional limit; kernels
/// run their bodies on the calling thread, one thread index after another.
/// Submissions are serialized on a single stream.
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    memory_limit: Option<usize>,
    max_threads_per_block: u32,
    allocated: AtomicUsize,
    peak: AtomicUsize,
    stream: Mutex<()>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    copied: AtomicU64,
    kernels: AtomicU64,
    ops: AtomicU64,
}

/// Counters of a [`HostDevice`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    /// Bytes currently allocated.
    pub allocated_bytes: usize,
    /// Highest value of `allocated_bytes` so far.
    pub peak_bytes: usize,
    /// Bytes moved from host to device.
    pub bytes_uploaded: u64,
    /// Bytes moved from device to host.
    pub bytes_downloaded: u64,
    /// Bytes moved within the device.
    pub bytes_copied: u64,
    /// Kernels launched.
    pub kernels_launched: u64,
    /// Operations executed, kernels included.
    pub ops_executed: u64,
}

impl HostDevice {
    /// An unlimited device.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_limit: None,
            max_threads_per_block: DEFAULT_MAX_THREADS_PER_BLOCK,
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            stream: Mutex::new(()),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            copied: AtomicU64::new(0),
            kernels: AtomicU64::new(0),
            ops: AtomicU64::new(0),
        }
    }

    /// Limit device memory to `bytes`.
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Accept at most `threads` threads per block.
    #[must_use]
    pub fn with_max_threads_per_block(mut self, threads: u32) -> Self {
        self.max_threads_per_block = threads;
        self
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            allocated_bytes: self.allocated.load(Ordering::Relaxed),
            peak_bytes: self.peak.load(Ordering::Relaxed),
            bytes_uploaded: self.uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.downloaded.load(Ordering::Relaxed),
            bytes_copied: self.copied.load(Ordering::Relaxed),
            kernels_launched: self.kernels.load(Ordering::Relaxed),
            ops_executed: self.ops.load(Ordering::Relaxed),
        }
    }

    fn check_launch(&self, kind: OpKind) -> Result<(), DeviceError> {
        let OpKind::Kernel(config) = kind else {
            return Ok(());
        };
        let invalid = |reason: String| Err(DeviceError::InvalidLaunch { reason });
        let block_threads = config.block.volume();
        if block_threads == 0 || config.grid.volume() == 0 {
            return invalid(format!("empty launch {config}"));
        }
        if block_threads > u64::from(self.max_threads_per_block) {
            return invalid(format!(
                "{block_threads} threads per block exceed the limit of {}",
                self.max_threads_per_block
            ));
        }
        Ok(())
    }

    fn record(&self, kind: OpKind) {
        let add = |counter: &AtomicU64, bytes: usize| {
            counter.fetch_add(bytes as u64, Ordering::Relaxed);
        };
        match kind {
            OpKind::Upload { bytes } => add(&self.uploaded, bytes),
            OpKind::Download { bytes } => add(&self.downloaded, bytes),
            OpKind::Copy { bytes } => add(&self.copied, bytes),
            OpKind::Kernel(_) => add(&self.kernels, 1),
            OpKind::Noop | OpKind::Fill { .. } => {}
        }
        self.ops.fetch_add(1, Ordering::Relaxed);
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, bytes: usize) -> Result<(), DeviceError> {
        let limit = self.memory_limit.unwrap_or(usize::MAX);
        let grow = |current: usize| current.checked_add(bytes).filter(|&next| next <= limit);
        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, grow);
        match reserved {
            Ok(previous) => {
                self.peak.fetch_max(previous + bytes, Ordering::Relaxed);
                Ok(())
            }
            Err(current) => Err(DeviceError::OutOfMemory {
                requested: bytes,
                available: limit.saturating_sub(current),
            }),
        }
    }

    fn release(&self, bytes: usize) {
        let shrink = |current: usize| current.checked_sub(bytes);
        let released = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, shrink);
        assert!(released.is_ok(), "HostDevice::release");
    }

    fn submit(&self, op: &mut DeviceOp) -> Result<(), DeviceError> {
        self.check_launch(op.kind())?;
        let _stream = self.stream.lock();
        op.execute()?;
        self.record(op.kind());
        Ok(())
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        // Submissions complete before `submit` returns; waiting for the
        // stream covers ones issued from other threads.
        drop(self.stream.lock());
        Ok(())
    }
}
