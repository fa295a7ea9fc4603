use crate::device::{Device, DeviceError};
use derive_more::Debug;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::{mem, ptr, sync::Arc};

/// Memory allocated on a [`Device`]; released when the last clone is dropped.
///
/// Clones refer to the same memory.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    inner: Arc<DeviceMemory<T>>,
}

#[derive(Debug)]
struct DeviceMemory<T> {
    #[debug("{}", device.name())]
    device: Arc<dyn Device>,
    bytes: usize,
    /// Fixed at allocation; read without taking the data lock.
    len: usize,
    #[debug(skip)]
    data: RwLock<Vec<T>>,
}

/// Host memory shared between host tasks and device transfers.
///
/// Clones refer to the same memory; the length is fixed at creation.
#[derive(Debug)]
pub struct HostBuffer<T> {
    #[debug(skip)]
    data: Arc<RwLock<Vec<T>>>,
    len: usize,
}

impl<T> Drop for DeviceMemory<T> {
    fn drop(&mut self) {
        self.device.release(self.bytes);
    }
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Clone for HostBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            len: self.len,
        }
    }
}

impl<T: Copy + Default + Send + Sync + 'static> DeviceBuffer<T> {
    /// Allocate `len` default-initialized elements on `device`.
    ///
    /// # Errors
    /// [`DeviceError::OutOfMemory`] when the device cannot hold the buffer,
    /// including sizes that overflow `usize` bytes.
    pub fn new(device: &Arc<dyn Device>, len: usize) -> Result<Self, DeviceError> {
        let bytes = len
            .checked_mul(mem::size_of::<T>())
            .ok_or(DeviceError::OutOfMemory {
                requested: usize::MAX,
                available: 0,
            })?;
        device.allocate(bytes)?;
        Ok(Self {
            inner: Arc::new(DeviceMemory {
                device: Arc::clone(device),
                bytes,
                len,
                data: RwLock::new(vec![T::default(); len]),
            }),
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the buffer holds no element.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated size in bytes.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.inner.bytes
    }

    /// Device the buffer lives on.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.inner.device
    }

    /// Device-side read view, for kernel bodies.
    #[must_use]
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [T]> {
        RwLockReadGuard::map(self.inner.data.read(), Vec::as_slice)
    }

    /// Device-side write view, for kernel bodies.
    #[must_use]
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [T]> {
        RwLockWriteGuard::map(self.inner.data.write(), Vec::as_mut_slice)
    }

    pub(crate) fn belongs_to(&self, device: &Arc<dyn Device>) -> bool {
        ptr::addr_eq(Arc::as_ptr(&self.inner.device), Arc::as_ptr(device))
    }

    pub(crate) fn same_memory(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Copy + Default + Send + Sync + 'static> HostBuffer<T> {
    /// `len` default-initialized elements.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![T::default(); len])
    }

    /// Take ownership of `data`.
    #[must_use]
    pub fn from_vec(data: Vec<T>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(RwLock::new(data)),
            len,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no element.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read view.
    #[must_use]
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [T]> {
        RwLockReadGuard::map(self.data.read(), Vec::as_slice)
    }

    /// Write view.
    #[must_use]
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [T]> {
        RwLockWriteGuard::map(self.data.write(), Vec::as_mut_slice)
    }

    /// Copy of the contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.read().to_vec()
    }
}

impl<T: Copy + Default + Send + Sync + 'static> From<Vec<T>> for HostBuffer<T> {
    fn from(data: Vec<T>) -> Self {
        Self::from_vec(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    #[test]
    fn device_memory_is_released_with_the_last_clone() {
        let host = Arc::new(HostDevice::new("host"));
        let device: Arc<dyn Device> = host.clone();
        let buffer = DeviceBuffer::<f32>::new(&device, 16).unwrap();
        let clone = buffer.clone();
        assert_eq!(buffer.bytes(), 64);
        assert_eq!(host.stats().allocated_bytes, 64);
        drop(buffer);
        assert_eq!(host.stats().allocated_bytes, 64);
        drop(clone);
        assert_eq!(host.stats().allocated_bytes, 0);
        assert_eq!(host.stats().peak_bytes, 64);
    }

    #[test]
    fn views_share_the_same_memory() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new("host"));
        let buffer = DeviceBuffer::<u32>::new(&device, 3).unwrap();
        buffer.write()[1] = 7;
        assert_eq!(&*buffer.clone().read(), &[0, 7, 0]);

        let host = HostBuffer::from(vec![1u8, 2, 3]);
        host.clone().write()[0] = 9;
        assert_eq!(host.to_vec(), vec![9, 2, 3]);
        assert_eq!(host.len(), 3);
    }

    #[test]
    fn len_is_available_while_a_view_is_held() {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new("host"));
        let buffer = DeviceBuffer::<u16>::new(&device, 5).unwrap();
        let mut view = buffer.write();
        for idx in 0..buffer.len() {
            view[idx] = 1;
        }
        assert_eq!(buffer.len(), 5);
        assert!(!buffer.is_empty());
        drop(view);
        assert_eq!(&*buffer.read(), &[1; 5]);
    }

    #[test]
    fn overflowing_sizes_are_out_of_memory() {
        let host = Arc::new(HostDevice::new("unlimited"));
        let device: Arc<dyn Device> = host.clone();
        let err = DeviceBuffer::<u64>::new(&device, usize::MAX / 2).unwrap_err();
        assert_eq!(
            err,
            DeviceError::OutOfMemory {
                requested: usize::MAX,
                available: 0,
            }
        );
        assert_eq!(host.stats().allocated_bytes, 0);
    }

    #[test]
    fn ownership_is_tracked_per_device() {
        let a: Arc<dyn Device> = Arc::new(HostDevice::new("a"));
        let b: Arc<dyn Device> = Arc::new(HostDevice::new("b"));
        let buffer = DeviceBuffer::<u8>::new(&a, 1).unwrap();
        assert!(buffer.belongs_to(&a));
        assert!(!buffer.belongs_to(&b));
        assert!(buffer.same_memory(&buffer.clone()));
    }
}
