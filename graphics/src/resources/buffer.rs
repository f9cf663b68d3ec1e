//! Pool-owned device buffer.

use std::sync::Arc;

use crate::error::GraphicsError;
use crate::types::{BufferDescriptor, BufferId, BufferUsage};

use super::pool::PoolShared;

/// A device buffer owned by exactly one holder.
///
/// Buffers are created by [`BufferPool`](super::BufferPool) and are released
/// back through it when dropped, which makes a second release impossible.
///
/// # Example
///
/// ```ignore
/// let buffer = pool.create_buffer(&BufferDescriptor::storage(1024))?;
/// buffer.write_slice(0, &[1.0f32, 2.0, 3.0])?;
/// device.bind_storage_buffer(0, buffer.id())?;
/// ```
pub struct DeviceBuffer {
    id: BufferId,
    descriptor: BufferDescriptor,
    pool: Arc<PoolShared>,
}

impl DeviceBuffer {
    pub(super) fn new(id: BufferId, descriptor: BufferDescriptor, pool: Arc<PoolShared>) -> Self {
        Self {
            id,
            descriptor,
            pool,
        }
    }

    /// Device-wide id, used for binding.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.descriptor.usage
    }

    /// Get the buffer label, if set.
    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    /// Upload raw bytes at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        self.pool.device.write_buffer(self.id, offset, data)
    }

    /// Upload plain-old-data values at byte `offset`.
    pub fn write_slice<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<(), GraphicsError> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    /// Read back `size` bytes at `offset`. Blocks until prior work completes.
    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, GraphicsError> {
        self.pool.device.read_buffer(self.id, offset, size)
    }

    pub(super) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.pool.release(self.id, self.descriptor.size);
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("size", &self.descriptor.size)
            .field("usage", &self.descriptor.usage)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

static_assertions::assert_impl_all!(DeviceBuffer: Send, Sync);
