use crate::{
    device::{
        Device, DeviceBuffer, DeviceError, DeviceOp, HostBuffer, Launch, LaunchConfig, OpKind,
    },
    dump,
    executor::{DagNode, TopoOrder, toposort},
    types::{IndexSet, NodeId},
};
use derive_more::Debug;
use std::{io, sync::Arc};
use tracing::debug;

/// A dependency graph of device operations offloaded to one [`Device`].
///
/// Operations are only recorded while the flow is built; nothing touches the
/// device until [`DeviceFlow::offload`] (or one of its variants) is called.
#[must_use]
#[derive(Debug)]
pub struct DeviceFlow {
    name: String,
    #[debug("{}", device.name())]
    device: Arc<dyn Device>,
    ops: Vec<OpNode>,
    offloaded: bool,
}

/// Handle to an operation of a [`DeviceFlow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceTask(NodeId);

#[derive(Debug)]
pub(crate) struct OpNode {
    pub(crate) id: NodeId,
    pub(crate) op: DeviceOp,
    pub(crate) successors: IndexSet<NodeId>,
    pub(crate) dependents: IndexSet<NodeId>,
}

impl OpNode {
    pub(crate) fn display_name(&self) -> String {
        if self.op.name().is_empty() {
            format!("op_{}", self.id)
        } else {
            self.op.name().to_owned()
        }
    }
}

impl DagNode for OpNode {
    fn parents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    fn children(&self) -> &IndexSet<NodeId> {
        &self.successors
    }
}

impl DeviceTask {
    /// Position of the operation in its flow.
    #[must_use]
    pub fn index(self) -> usize {
        self.0.index()
    }
}

fn check_len(dst: usize, src: usize) -> Result<(), DeviceError> {
    if dst == src {
        Ok(())
    } else {
        Err(DeviceError::SizeMismatch { dst, src })
    }
}

impl DeviceFlow {
    /// An empty flow bound to `device`.
    pub fn new(name: impl Into<String>, device: &Arc<dyn Device>) -> Self {
        Self {
            name: name.into(),
            device: Arc::clone(device),
            ops: Vec::new(),
            offloaded: false,
        }
    }

    /// Name of the flow.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the flow is offloaded to.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Number of recorded operations.
    #[must_use]
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Whether the flow has no operation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether the flow has been offloaded at least once.
    #[must_use]
    pub fn is_offloaded(&self) -> bool {
        self.offloaded
    }

    fn push(&mut self, op: DeviceOp) -> DeviceTask {
        let id = NodeId::from_index(self.ops.len());
        self.ops.push(OpNode {
            id,
            op,
            successors: IndexSet::default(),
            dependents: IndexSet::default(),
        });
        DeviceTask(id)
    }

    fn check_owner<T>(&self, buffer: &DeviceBuffer<T>) -> Result<(), DeviceError>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        if buffer.belongs_to(&self.device) {
            Ok(())
        } else {
            Err(DeviceError::ForeignBuffer)
        }
    }

    /// Copy `src` from the host into `dst`.
    ///
    /// # Errors
    /// If `dst` lives on another device or the lengths differ.
    pub fn upload<T>(
        &mut self,
        dst: &DeviceBuffer<T>,
        src: &HostBuffer<T>,
    ) -> Result<DeviceTask, DeviceError>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.check_owner(dst)?;
        check_len(dst.len(), src.len())?;
        let (dst, src) = (dst.clone(), src.clone());
        let bytes = dst.bytes();
        let op = DeviceOp::new(OpKind::Upload { bytes }, move || {
            dst.write().copy_from_slice(&src.read());
            Ok(())
        });
        Ok(self.push(op))
    }

    /// Copy `src` from the device into `dst`.
    ///
    /// # Errors
    /// If `src` lives on another device or the lengths differ.
    pub fn download<T>(
        &mut self,
        dst: &HostBuffer<T>,
        src: &DeviceBuffer<T>,
    ) -> Result<DeviceTask, DeviceError>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.check_owner(src)?;
        check_len(dst.len(), src.len())?;
        let (dst, src) = (dst.clone(), src.clone());
        let bytes = src.bytes();
        let op = DeviceOp::new(OpKind::Download { bytes }, move || {
            dst.write().copy_from_slice(&src.read());
            Ok(())
        });
        Ok(self.push(op))
    }

    /// Copy `src` into `dst` on the device. Copying a buffer onto itself
    /// records a no-op.
    ///
    /// # Errors
    /// If either buffer lives on another device or the lengths differ.
    pub fn copy<T>(
        &mut self,
        dst: &DeviceBuffer<T>,
        src: &DeviceBuffer<T>,
    ) -> Result<DeviceTask, DeviceError>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.check_owner(dst)?;
        self.check_owner(src)?;
        if dst.same_memory(src) {
            return Ok(self.noop());
        }
        check_len(dst.len(), src.len())?;
        let (dst, src) = (dst.clone(), src.clone());
        let bytes = src.bytes();
        let op = DeviceOp::new(OpKind::Copy { bytes }, move || {
            dst.write().copy_from_slice(&src.read());
            Ok(())
        });
        Ok(self.push(op))
    }

    /// Set every element of `dst` to `value`.
    ///
    /// # Errors
    /// If `dst` lives on another device.
    pub fn fill<T>(&mut self, dst: &DeviceBuffer<T>, value: T) -> Result<DeviceTask, DeviceError>
    where
        T: Copy + Default + Send + Sync + 'static,
    {
        self.check_owner(dst)?;
        let dst = dst.clone();
        let bytes = dst.bytes();
        Ok(self.push(DeviceOp::new(OpKind::Fill { bytes }, move || {
            dst.write().fill(value);
            Ok(())
        })))
    }

    /// Launch `body` with the geometry `config`. The geometry is validated by
    /// the device when the flow is offloaded.
    pub fn kernel<F>(&mut self, config: LaunchConfig, mut body: F) -> DeviceTask
    where
        F: FnMut(&Launch) + Send + 'static,
    {
        let launch = Launch::new(config);
        self.push(DeviceOp::new(OpKind::Kernel(config), move || {
            body(&launch);
            Ok(())
        }))
    }

    /// An operation without work, used for ordering.
    pub fn noop(&mut self) -> DeviceTask {
        self.push(DeviceOp::new(OpKind::Noop, || Ok(())))
    }

    /// Make `from` run before `to`.
    ///
    /// # Panics
    /// If either handle does not belong to this flow.
    pub fn precede(&mut self, from: DeviceTask, to: DeviceTask) {
        self.check_member(from);
        self.check_member(to);
        if self.ops[from.index()].successors.insert(to.0) {
            self.ops[to.index()].dependents.insert(from.0);
        }
    }

    /// Make `to` run after `from`.
    ///
    /// # Panics
    /// If either handle does not belong to this flow.
    pub fn succeed(&mut self, to: DeviceTask, from: DeviceTask) {
        self.precede(from, to);
    }

    /// Name the operation `op`.
    ///
    /// # Panics
    /// If `op` does not belong to this flow.
    pub fn set_name(&mut self, op: DeviceTask, name: impl Into<String>) {
        self.check_member(op);
        self.ops[op.index()].op.set_name(name.into());
    }

    fn check_member(&self, op: DeviceTask) {
        assert!(
            op.index() < self.ops.len(),
            "DeviceTask does not belong to device flow `{}`",
            self.name
        );
    }

    /// Submit every operation in dependency order and synchronize.
    ///
    /// # Errors
    /// If the flow contains cycle(s) or the device rejects an operation.
    pub fn offload(&mut self) -> Result<(), DeviceError> {
        self.offload_n(1)
    }

    /// Offload the flow `times` times in a row.
    ///
    /// # Errors
    /// See [`DeviceFlow::offload`].
    pub fn offload_n(&mut self, times: usize) -> Result<(), DeviceError> {
        let mut left = times;
        self.offload_until(move || {
            if left == 0 {
                true
            } else {
                left -= 1;
                false
            }
        })
    }

    /// Offload the flow repeatedly until `stop` returns true. `stop` is
    /// called before the first offload and after each one.
    ///
    /// # Errors
    /// See [`DeviceFlow::offload`]; the first failure ends the loop.
    pub fn offload_until(&mut self, mut stop: impl FnMut() -> bool) -> Result<(), DeviceError> {
        let TopoOrder { order, .. } = toposort(&self.ops).map_err(|stuck| DeviceError::Cycle {
            flow: self.name.clone(),
            op: self.ops[stuck.index()].display_name(),
        })?;
        let order: Vec<usize> = order.keys().map(|id| id.index()).collect();
        let mut iterations = 0usize;
        while !stop() {
            for &idx in &order {
                self.device.submit(&mut self.ops[idx].op)?;
            }
            self.device.synchronize()?;
            iterations += 1;
        }
        self.offloaded = true;
        debug!(
            flow = %self.name,
            device = %self.device.name(),
            ops = order.len(),
            iterations,
            "device flow offloaded"
        );
        Ok(())
    }

    /// Drop every recorded operation.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.offloaded = false;
    }

    /// Write the flow in GraphViz DOT format.
    ///
    /// # Errors
    /// Propagates I/O errors of `out`.
    pub fn dump(&self, out: impl io::Write) -> io::Result<()> {
        dump::write_device_flow(out, &self.name, &self.ops)
    }

    /// The flow in GraphViz DOT format.
    #[must_use]
    pub fn dump_to_string(&self) -> String {
        let mut out = Vec::new();
        self.dump(&mut out)
            .expect("DeviceFlow::dump_to_string: [1]");
        String::from_utf8(out)
            .expect("DeviceFlow::dump_to_string: [2]")
    }
}
