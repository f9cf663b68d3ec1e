//! Buffer pool: the single owner of device and staging allocations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::device::GraphicsDevice;
use crate::error::{DisposeError, GraphicsError};
use crate::types::{BufferDescriptor, BufferId};

use super::{DeviceBuffer, StagingBuffer};

/// Allocation counters of a [`BufferPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live_buffers: usize,
    pub device_bytes: u64,
    pub staging_buffers: u64,
    pub staging_bytes: u64,
    /// Device buffers created over the pool's lifetime.
    pub allocations: u64,
    /// Device buffers released over the pool's lifetime.
    pub releases: u64,
    /// Releases refused because the buffer was already gone.
    pub refused_releases: u64,
}

pub(crate) struct PoolShared {
    pub(super) device: Arc<GraphicsDevice>,
    live: Mutex<HashMap<BufferId, u64>>,
    staging_buffers: AtomicU64,
    staging_bytes: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
    refused_releases: AtomicU64,
}

impl PoolShared {
    pub(super) fn release(&self, id: BufferId, size: u64) {
        let tracked = self.live.lock().remove(&id).is_some();
        if !tracked || !self.device.destroy_buffer(id) {
            self.refused_releases.fetch_add(1, Ordering::Relaxed);
            log::warn!("BufferPool: buffer {} ({} bytes) was already released", id, size);
            return;
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn release_staging(&self, size: u64) {
        self.staging_buffers.fetch_sub(1, Ordering::Relaxed);
        self.staging_bytes.fetch_sub(size, Ordering::Relaxed);
    }
}

/// Allocates and releases device buffers and host staging buffers.
///
/// Every buffer handed out is an owned [`DeviceBuffer`] or
/// [`StagingBuffer`]; dropping the handle is the only way to release it, so
/// the pool never frees an allocation twice. Cloning the pool shares its
/// bookkeeping.
///
/// # Example
///
/// ```ignore
/// let pool = BufferPool::new(device.clone());
/// let bones = pool.create_buffer(&BufferDescriptor::storage(64 * 128).with_label("bones"))?;
/// assert_eq!(pool.stats().live_buffers, 1);
/// drop(bones);
/// assert_eq!(pool.stats().live_buffers, 0);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(device: Arc<GraphicsDevice>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                device,
                live: Mutex::new(HashMap::new()),
                staging_buffers: AtomicU64::new(0),
                staging_bytes: AtomicU64::new(0),
                allocations: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                refused_releases: AtomicU64::new(0),
            }),
        }
    }

    /// The device buffers are allocated on.
    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.shared.device
    }

    /// Allocate an uninitialized device buffer.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<DeviceBuffer, GraphicsError> {
        let id = self.shared.device.create_buffer(descriptor)?;
        self.shared.live.lock().insert(id, descriptor.size);
        self.shared.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceBuffer::new(id, descriptor.clone(), self.shared.clone()))
    }

    /// Allocate a device buffer and upload `contents` at offset 0.
    ///
    /// The buffer is released again if the upload fails.
    pub fn create_buffer_init(
        &self,
        descriptor: &BufferDescriptor,
        contents: &[u8],
    ) -> Result<DeviceBuffer, GraphicsError> {
        if contents.len() as u64 > descriptor.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} bytes of contents exceed buffer {:?} of {} bytes",
                contents.len(),
                descriptor.label,
                descriptor.size
            )));
        }
        let buffer = self.create_buffer(descriptor)?;
        buffer.write(0, contents)?;
        Ok(buffer)
    }

    /// Allocate host staging memory of at least `size` bytes.
    pub fn create_staging(&self, size: u64) -> StagingBuffer {
        let staging = StagingBuffer::new(size, self.shared.clone());
        self.shared.staging_buffers.fetch_add(1, Ordering::Relaxed);
        self.shared
            .staging_bytes
            .fetch_add(staging.size(), Ordering::Relaxed);
        staging
    }

    /// Release a device buffer now.
    pub fn release(&self, buffer: DeviceBuffer) {
        if !buffer.belongs_to(&self.shared) {
            log::warn!(
                "BufferPool: releasing buffer {} owned by another pool",
                buffer.id()
            );
        }
        drop(buffer);
    }

    /// Release everything `value` owns, provided this is the last reference.
    ///
    /// When other holders remain the value is still dropped here, and its
    /// resources are released once the last holder lets go.
    pub fn dispose<T>(&self, value: Arc<T>) -> Result<(), DisposeError> {
        match Arc::try_unwrap(value) {
            Ok(owned) => {
                drop(owned);
                Ok(())
            }
            Err(shared) => Err(DisposeError::StillReferenced {
                holders: Arc::strong_count(&shared) - 1,
            }),
        }
    }

    /// Whether `id` is a live buffer of this pool.
    pub fn is_live(&self, id: BufferId) -> bool {
        self.shared.live.lock().contains_key(&id)
    }

    /// Current allocation counters.
    pub fn stats(&self) -> PoolStats {
        let live = self.shared.live.lock();
        PoolStats {
            live_buffers: live.len(),
            device_bytes: live.values().sum(),
            staging_buffers: self.shared.staging_buffers.load(Ordering::Relaxed),
            staging_bytes: self.shared.staging_bytes.load(Ordering::Relaxed),
            allocations: self.shared.allocations.load(Ordering::Relaxed),
            releases: self.shared.releases.load(Ordering::Relaxed),
            refused_releases: self.shared.refused_releases.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

static_assertions::assert_impl_all!(BufferPool: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn pool() -> BufferPool {
        BufferPool::new(GraphicsDevice::new(Arc::new(CpuBackend::new())))
    }

    #[test]
    fn test_drop_releases_once() {
        let pool = pool();
        let buffer = pool.create_buffer(&BufferDescriptor::storage(128)).unwrap();
        let id = buffer.id();
        assert!(pool.is_live(id));
        assert_eq!(pool.stats().device_bytes, 128);

        pool.release(buffer);

        let stats = pool.stats();
        assert!(!pool.is_live(id));
        assert!(!pool.device().is_buffer(id));
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.refused_releases, 0);
    }

    #[test]
    fn test_create_buffer_init_uploads() {
        let pool = pool();
        let buffer = pool
            .create_buffer_init(&BufferDescriptor::storage(8), &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        assert_eq!(buffer.read(4, 4).unwrap(), vec![5, 6, 7, 8]);
        assert!(
            pool.create_buffer_init(&BufferDescriptor::storage(4), &[0; 8])
                .is_err()
        );
    }

    #[test]
    fn test_failed_allocation_leaves_nothing() {
        let device = GraphicsDevice::new(Arc::new(CpuBackend::with_memory_budget(64)));
        let pool = BufferPool::new(device);
        assert!(pool.create_buffer(&BufferDescriptor::storage(128)).is_err());
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_staging_accounting() {
        let pool = pool();
        let staging = pool.create_staging(10);
        assert_eq!(staging.size(), 12);
        assert_eq!(pool.stats().staging_bytes, 12);
        drop(staging);
        assert_eq!(pool.stats().staging_buffers, 0);
        assert_eq!(pool.stats().staging_bytes, 0);
    }

    #[test]
    fn test_staging_copy() {
        let pool = pool();
        let buffer = pool.create_buffer(&BufferDescriptor::storage(16)).unwrap();
        buffer.write_slice(0, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();

        let mut staging = pool.create_staging(16);
        let values = staging.copy_from(&buffer, 4, 8).unwrap();
        assert_eq!(values, &[2.0, 3.0]);
        assert!(staging.copy_from(&buffer, 0, 32).is_err());
    }

    #[test]
    fn test_dispose_reports_other_holders() {
        let pool = pool();
        let value = Arc::new(pool.create_buffer(&BufferDescriptor::storage(16)).unwrap());
        let other = value.clone();

        let err = pool.dispose(value).unwrap_err();
        assert_eq!(err, DisposeError::StillReferenced { holders: 1 });
        assert_eq!(pool.stats().live_buffers, 1);

        drop(other);
        assert_eq!(pool.stats().live_buffers, 0);
    }
}
