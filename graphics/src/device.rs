//! Graphics device.
//!
//! The [`GraphicsDevice`] wraps a backend and owns the state that the
//! skinning runtime shares with the host renderer:
//!
//! - the registry of live buffers (the liveness query behind
//!   [`GraphicsDevice::is_buffer`]),
//! - the table of indexed storage binding slots,
//! - the render-thread affinity used by the second load phase.
//!
//! Buffers are created and released through the
//! [`BufferPool`](crate::resources::BufferPool); the device only tracks them.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use parking_lot::{Mutex, RwLock};

use crate::backend::{
    BackendType, BoundBuffer, ComputePipelineDescriptor, GpuBackend, GpuBuffer,
    GpuComputePipeline, StorageSlot, create_backend,
};
use crate::binding::StorageBinding;
use crate::error::GraphicsError;
use crate::types::{BufferDescriptor, BufferId, BufferUsage, MemoryBarrier};

/// Capabilities of a graphics device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Number of indexed storage binding slots.
    pub max_storage_bindings: u32,
    /// Maximum buffer size.
    pub max_buffer_size: u64,
    /// Required alignment for ranged storage binding offsets.
    pub storage_offset_alignment: u64,
}

struct RegisteredBuffer {
    gpu: GpuBuffer,
    size: u64,
    usage: BufferUsage,
    label: Option<String>,
}

/// A compute pipeline created on a device.
pub struct ComputePipeline {
    gpu: GpuComputePipeline,
    label: Option<String>,
    slots: Vec<StorageSlot>,
    workgroup_size: u32,
}

impl ComputePipeline {
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Storage slots read or written by the pipeline.
    pub fn slots(&self) -> &[StorageSlot] {
        &self.slots
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("label", &self.label)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// A graphics device shared between the loader, the skinning engine and the
/// host renderer.
///
/// # Thread Safety
///
/// `GraphicsDevice` is `Send + Sync`. Buffer creation and upload may happen
/// on any thread; binding-table manipulation and dispatch belong to the
/// render thread.
///
/// # Example
///
/// ```ignore
/// let device = GraphicsDevice::create(BackendType::Auto)?;
/// device.bind_render_thread();
/// let pool = BufferPool::new(device.clone());
/// ```
pub struct GraphicsDevice {
    backend: Arc<dyn GpuBackend>,
    capabilities: DeviceCapabilities,
    next_buffer_id: AtomicU64,
    buffers: RwLock<HashMap<BufferId, RegisteredBuffer>>,
    bindings: Mutex<Vec<Option<StorageBinding>>>,
    render_thread: Mutex<Option<ThreadId>>,
    dispatch_count: AtomicU64,
    barrier_count: AtomicU64,
}

impl GraphicsDevice {
    /// Create a device on an existing backend.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Arc<Self> {
        let limits = backend.limits();
        log::info!(
            "GraphicsDevice: {} ({} storage binding slots)",
            backend.name(),
            limits.max_storage_bindings
        );
        Arc::new(Self {
            capabilities: DeviceCapabilities {
                max_storage_bindings: limits.max_storage_bindings,
                max_buffer_size: limits.max_buffer_size,
                storage_offset_alignment: limits.storage_offset_alignment,
            },
            backend,
            next_buffer_id: AtomicU64::new(1),
            buffers: RwLock::new(HashMap::new()),
            bindings: Mutex::new(vec![None; limits.max_storage_bindings as usize]),
            render_thread: Mutex::new(None),
            dispatch_count: AtomicU64::new(0),
            barrier_count: AtomicU64::new(0),
        })
    }

    /// Create a device on a freshly created backend.
    pub fn create(kind: BackendType) -> Result<Arc<Self>, GraphicsError> {
        Ok(Self::new(create_backend(kind)?))
    }

    /// Get the backend name.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Get the device capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    // ========================================================================
    // Render thread affinity
    // ========================================================================

    /// Declare the calling thread to be the render thread.
    pub fn bind_render_thread(&self) {
        let id = std::thread::current().id();
        log::debug!("GraphicsDevice: render thread bound to {:?}", id);
        *self.render_thread.lock() = Some(id);
    }

    /// Whether the calling thread may perform render-thread work.
    ///
    /// Before [`bind_render_thread`](Self::bind_render_thread) is called every
    /// thread qualifies.
    pub fn is_render_thread(&self) -> bool {
        let current = std::thread::current().id();
        self.render_thread.lock().is_none_or(|id| id == current)
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    pub(crate) fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
    ) -> Result<BufferId, GraphicsError> {
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer {:?} has zero size",
                descriptor.label
            )));
        }
        if descriptor.size > self.capabilities.max_buffer_size {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer {:?} size {} exceeds maximum {}",
                descriptor.label, descriptor.size, self.capabilities.max_buffer_size
            )));
        }

        let gpu = self.backend.create_buffer(descriptor)?;
        let raw = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        let id = BufferId::new(NonZeroU64::new(raw).ok_or_else(|| {
            GraphicsError::Internal("buffer id counter wrapped".into())
        })?);

        log::trace!(
            "GraphicsDevice: created buffer {} {:?}, size={}",
            id,
            descriptor.label,
            descriptor.size
        );
        self.buffers.write().insert(
            id,
            RegisteredBuffer {
                gpu,
                size: descriptor.size,
                usage: descriptor.usage,
                label: descriptor.label.clone(),
            },
        );
        Ok(id)
    }

    /// Destroy a buffer. Returns `false` if the id was not live.
    ///
    /// Bindings that reference the buffer are left in place; a later dispatch
    /// through such a slot fails and a binding guard restoring it unbinds it.
    pub(crate) fn destroy_buffer(&self, id: BufferId) -> bool {
        let Some(buffer) = self.buffers.write().remove(&id) else {
            return false;
        };
        log::trace!(
            "GraphicsDevice: destroyed buffer {} {:?}",
            id,
            buffer.label
        );
        self.backend.destroy_buffer(&buffer.gpu, buffer.size);
        true
    }

    /// Whether `id` names a live buffer.
    pub fn is_buffer(&self, id: BufferId) -> bool {
        self.buffers.read().contains_key(&id)
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.read().len()
    }

    /// Size of a live buffer.
    pub fn buffer_size(&self, id: BufferId) -> Option<u64> {
        self.buffers.read().get(&id).map(|b| b.size)
    }

    /// Usage flags of a live buffer.
    pub fn buffer_usage(&self, id: BufferId) -> Option<BufferUsage> {
        self.buffers.read().get(&id).map(|b| b.usage)
    }

    fn resolve(&self, id: BufferId) -> Result<(GpuBuffer, u64), GraphicsError> {
        self.buffers
            .read()
            .get(&id)
            .map(|b| (b.gpu.clone(), b.size))
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("buffer {id} is not live")))
    }

    /// Write data to a buffer.
    pub fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        let (gpu, size) = self.resolve(id)?;
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {} exceeds buffer {} size {}",
                data.len(),
                offset,
                id,
                size
            )));
        }
        self.backend.write_buffer(&gpu, offset, data)
    }

    /// Read data back from a buffer. Blocks until prior work completes.
    pub fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, GraphicsError> {
        let (gpu, buffer_size) = self.resolve(id)?;
        if offset.checked_add(size).is_none_or(|end| end > buffer_size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "read of {size} bytes at {offset} exceeds buffer {id} size {buffer_size}"
            )));
        }
        self.backend.read_buffer(&gpu, offset, size)
    }

    // ========================================================================
    // Storage binding table
    // ========================================================================

    /// Number of indexed storage binding slots.
    pub fn max_storage_bindings(&self) -> u32 {
        self.capabilities.max_storage_bindings
    }

    fn check_slot(&self, slot: u32) -> Result<(), GraphicsError> {
        if slot >= self.capabilities.max_storage_bindings {
            return Err(GraphicsError::InvalidParameter(format!(
                "storage slot {slot} out of range (max {})",
                self.capabilities.max_storage_bindings
            )));
        }
        Ok(())
    }

    /// Bind a whole buffer to a storage slot.
    pub fn bind_storage_buffer(&self, slot: u32, id: BufferId) -> Result<(), GraphicsError> {
        self.check_slot(slot)?;
        self.resolve(id)?;
        self.bindings.lock()[slot as usize] = Some(StorageBinding::whole(id));
        Ok(())
    }

    /// Bind a byte range of a buffer to a storage slot.
    pub fn bind_storage_buffer_range(
        &self,
        slot: u32,
        id: BufferId,
        offset: u64,
        size: u64,
    ) -> Result<(), GraphicsError> {
        self.check_slot(slot)?;
        let (_, buffer_size) = self.resolve(id)?;
        let alignment = self.capabilities.storage_offset_alignment;
        if offset % alignment != 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "storage binding offset {offset} is not a multiple of {alignment}"
            )));
        }
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > buffer_size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "storage range {offset}+{size} invalid for buffer {id} of {buffer_size} bytes"
            )));
        }
        self.bindings.lock()[slot as usize] = Some(StorageBinding::range(id, offset, size));
        Ok(())
    }

    /// Clear a storage slot.
    pub fn unbind_storage_buffer(&self, slot: u32) -> Result<(), GraphicsError> {
        self.check_slot(slot)?;
        self.bindings.lock()[slot as usize] = None;
        Ok(())
    }

    /// Current binding of a storage slot.
    pub fn storage_binding(&self, slot: u32) -> Option<StorageBinding> {
        self.bindings.lock().get(slot as usize).copied().flatten()
    }

    /// Current binding of every storage slot.
    pub fn storage_bindings(&self) -> Vec<Option<StorageBinding>> {
        self.bindings.lock().clone()
    }

    // ========================================================================
    // Compute
    // ========================================================================

    /// Create a compute pipeline.
    pub fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<ComputePipeline, GraphicsError> {
        if let Some(slot) = descriptor
            .storage_slots
            .iter()
            .find(|s| s.binding >= self.capabilities.max_storage_bindings)
        {
            return Err(GraphicsError::FeatureNotSupported(format!(
                "pipeline {:?} needs storage slot {} but the device has {}",
                descriptor.label, slot.binding, self.capabilities.max_storage_bindings
            )));
        }
        if descriptor.workgroup_size == 0 {
            return Err(GraphicsError::InvalidParameter("workgroup size is zero".into()));
        }

        let gpu = self.backend.create_compute_pipeline(descriptor)?;
        log::debug!("GraphicsDevice: created compute pipeline {:?}", descriptor.label);
        Ok(ComputePipeline {
            gpu,
            label: descriptor.label.clone(),
            slots: descriptor.storage_slots.clone(),
            workgroup_size: descriptor.workgroup_size,
        })
    }

    /// Dispatch `invocations` invocations of `pipeline`, reading its buffers
    /// from the storage binding table.
    ///
    /// Fails if a slot the pipeline uses is empty or bound to a dead buffer,
    /// or if a written slot shares its buffer with any other slot.
    pub fn dispatch_compute(
        &self,
        pipeline: &ComputePipeline,
        uniforms: &[u8],
        invocations: u32,
    ) -> Result<(), GraphicsError> {
        let mut bound = Vec::with_capacity(pipeline.slots.len());
        let mut ids = Vec::with_capacity(pipeline.slots.len());
        {
            let table = self.bindings.lock();
            for slot in &pipeline.slots {
                let binding = table.get(slot.binding as usize).copied().flatten().ok_or_else(|| {
                    GraphicsError::InvalidParameter(format!(
                        "storage slot {} has no buffer bound",
                        slot.binding
                    ))
                })?;
                let (gpu, size) = self.resolve(binding.buffer)?;
                let range_size = binding.size.unwrap_or(size.saturating_sub(binding.offset));
                bound.push(BoundBuffer {
                    slot: slot.binding,
                    buffer: gpu,
                    offset: binding.offset,
                    size: range_size,
                    read_only: slot.read_only,
                });
                ids.push(binding.buffer);
            }
        }

        for (i, slot) in pipeline.slots.iter().enumerate() {
            if slot.read_only {
                continue;
            }
            if let Some(j) = (0..ids.len()).find(|&j| j != i && ids[j] == ids[i]) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "output slot {} aliases slot {} (buffer {})",
                    slot.binding, pipeline.slots[j].binding, ids[i]
                )));
            }
        }

        let workgroups = invocations.div_ceil(pipeline.workgroup_size);
        self.backend
            .dispatch(&pipeline.gpu, &bound, uniforms, invocations, workgroups)?;
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Make dispatch writes visible to later consumers.
    pub fn memory_barrier(&self, barrier: MemoryBarrier) {
        self.backend.memory_barrier(barrier);
        self.barrier_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of dispatches issued.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Relaxed)
    }

    /// Number of memory barriers issued.
    pub fn barrier_count(&self) -> u64 {
        self.barrier_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("backend", &self.backend.name())
            .field("capabilities", &self.capabilities)
            .field("buffers", &self.buffer_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(GraphicsDevice: Send, Sync);
