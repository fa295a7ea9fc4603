mod buffer;
mod flow;
mod host;
mod launch;

pub(crate) use crate::device::flow::OpNode;
pub use crate::device::{
    buffer::{DeviceBuffer, HostBuffer},
    flow::{DeviceFlow, DeviceTask},
    host::{DeviceStats, HostDevice},
    launch::{Dim3, Launch, LaunchConfig, ThreadIndex},
};
use derive_more::{Debug, Display};
use std::fmt;
use thiserror::Error;

/// Errors raised while building or offloading a [`DeviceFlow`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceError {
    /// An allocation does not fit in the remaining device memory.
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Size of the rejected allocation.
        requested: usize,
        /// Bytes still free on the device.
        available: usize,
    },
    /// A kernel launch geometry is not supported by the device.
    #[error("invalid launch: {reason}")]
    InvalidLaunch {
        /// What is wrong with the launch.
        reason: String,
    },
    /// Source and destination of a transfer differ in length.
    #[error("size mismatch: destination holds {dst} elements, source {src}")]
    SizeMismatch {
        /// Destination length.
        dst: usize,
        /// Source length.
        src: usize,
    },
    /// A buffer allocated on another device was used in this flow.
    #[error("buffer belongs to another device")]
    ForeignBuffer,
    /// The device flow contains cycle(s).
    #[error("device flow `{flow}` contains cycle(s): op `{op}` can never run")]
    Cycle {
        /// Name of the device flow.
        flow: String,
        /// Name of an operation stuck behind the cycle.
        op: String,
    },
}

/// A compute device operations are offloaded to.
///
/// Implementations serialize submitted operations on their own stream;
/// [`Device::synchronize`] returns once every submitted operation completed.
pub trait Device: Send + Sync + fmt::Debug {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Reserve `bytes` of device memory.
    ///
    /// # Errors
    /// [`DeviceError::OutOfMemory`] when the reservation does not fit.
    fn allocate(&self, bytes: usize) -> Result<(), DeviceError>;

    /// Return `bytes` previously reserved with [`Device::allocate`].
    fn release(&self, bytes: usize);

    /// Enqueue `op` on the device stream.
    ///
    /// # Errors
    /// When the device rejects the operation or the operation fails.
    fn submit(&self, op: &mut DeviceOp) -> Result<(), DeviceError>;

    /// Wait for every submitted operation.
    ///
    /// # Errors
    /// When a previously submitted operation failed asynchronously.
    fn synchronize(&self) -> Result<(), DeviceError>;
}

/// What a device operation does.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Nothing; orders its neighbours.
    #[display("noop")]
    Noop,
    /// Host to device transfer.
    #[display("upload {bytes}B")]
    Upload {
        /// Transferred bytes.
        bytes: usize,
    },
    /// Device to host transfer.
    #[display("download {bytes}B")]
    Download {
        /// Transferred bytes.
        bytes: usize,
    },
    /// Device to device transfer.
    #[display("copy {bytes}B")]
    Copy {
        /// Transferred bytes.
        bytes: usize,
    },
    /// Device memory set to a value.
    #[display("fill {bytes}B")]
    Fill {
        /// Written bytes.
        bytes: usize,
    },
    /// Kernel launch.
    #[display("kernel {_0}")]
    Kernel(LaunchConfig),
}

/// One operation of a device flow, as seen by [`Device::submit`].
#[derive(Debug)]
pub struct DeviceOp {
    name: String,
    kind: OpKind,
    #[debug(skip)]
    body: Box<dyn FnMut() -> Result<(), DeviceError> + Send>,
}

impl DeviceOp {
    pub(crate) fn new(
        kind: OpKind,
        body: impl FnMut() -> Result<(), DeviceError> + Send + 'static,
    ) -> Self {
        Self {
            name: String::new(),
            kind,
            body: Box::new(body),
        }
    }

    /// Name of the operation; empty when unnamed.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// What the operation does.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Perform the operation. Called by the device on its stream.
    ///
    /// # Errors
    /// Propagates the failure of the operation.
    pub fn execute(&mut self) -> Result<(), DeviceError> {
        (self.body)()
    }
}
