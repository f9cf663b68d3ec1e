//! Host-memory reference backend.
//!
//! Buffers live in word-aligned host memory and compute pipelines run
//! through their [`HostKernel`](super::HostKernel). The backend can be given
//! a memory budget so that allocation failures can be provoked on demand.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::error::GraphicsError;
use crate::types::{BufferDescriptor, MemoryBarrier};

use super::{
    BackendLimits, BoundBuffer, ComputePipelineDescriptor, GpuBackend, GpuBuffer,
    GpuComputePipeline,
};

/// Slots in the CPU backend's storage binding table.
pub const CPU_STORAGE_BINDINGS: u32 = 16;

/// Host buffer storage, kept as 32-bit words so that any 4-byte aligned
/// range can be viewed as `f32`/`i32` without copying.
#[derive(Clone)]
pub struct HostBuffer {
    words: Arc<RwLock<Vec<u32>>>,
    size: u64,
}

impl HostBuffer {
    fn new(size: u64) -> Self {
        Self {
            words: Arc::new(RwLock::new(vec![0; size.div_ceil(4) as usize])),
            size,
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), GraphicsError> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "range {offset}+{len} exceeds buffer size {}",
                self.size
            )));
        }
        Ok(())
    }
}

fn word_range(offset: u64, size: u64) -> Result<Range<usize>, GraphicsError> {
    if offset % 4 != 0 || size % 4 != 0 {
        return Err(GraphicsError::InvalidParameter(format!(
            "storage range {offset}+{size} is not 4-byte aligned"
        )));
    }
    let start = (offset / 4) as usize;
    Ok(start..start + (size / 4) as usize)
}

/// Inputs and outputs of one host kernel invocation batch.
pub struct HostDispatch<'a> {
    invocations: u32,
    uniforms: &'a [u8],
    inputs: Vec<(u32, &'a [u32])>,
    outputs: Vec<(u32, Vec<u32>)>,
}

impl<'a> HostDispatch<'a> {
    /// Number of invocations requested; kernels must ignore ids beyond it.
    pub fn invocations(&self) -> u32 {
        self.invocations
    }

    /// Decode the uniform block.
    pub fn uniforms<T: bytemuck::Pod>(&self) -> Result<T, GraphicsError> {
        bytemuck::try_pod_read_unaligned(self.uniforms)
            .map_err(|e| GraphicsError::InvalidParameter(format!("uniform block: {e}")))
    }

    /// Read-only storage binding at `slot` as raw words.
    pub fn input(&self, slot: u32) -> Result<&'a [u32], GraphicsError> {
        self.inputs
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, words)| *words)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("storage slot {slot} is not a read binding"))
            })
    }

    pub fn input_f32(&self, slot: u32) -> Result<&'a [f32], GraphicsError> {
        Ok(bytemuck::cast_slice(self.input(slot)?))
    }

    pub fn input_i32(&self, slot: u32) -> Result<&'a [i32], GraphicsError> {
        Ok(bytemuck::cast_slice(self.input(slot)?))
    }

    /// Writable storage bindings at `slots`, as `f32` views.
    pub fn outputs_f32<const N: usize>(
        &mut self,
        slots: [u32; N],
    ) -> Result<[&mut [f32]; N], GraphicsError> {
        let mut found: Vec<Option<&mut [f32]>> = (0..N).map(|_| None).collect();
        for (slot, words) in self.outputs.iter_mut() {
            if let Some(i) = slots.iter().position(|s| s == slot) {
                found[i] = Some(bytemuck::cast_slice_mut(words.as_mut_slice()));
            }
        }

        let mut views = Vec::with_capacity(N);
        for (view, slot) in found.into_iter().zip(slots) {
            views.push(view.ok_or_else(|| {
                GraphicsError::InvalidParameter(format!(
                    "storage slot {slot} is not a write binding"
                ))
            })?);
        }
        views
            .try_into()
            .map_err(|_| GraphicsError::Internal("output view count mismatch".into()))
    }
}

/// CPU reference backend.
#[derive(Debug, Default)]
pub struct CpuBackend {
    budget: Option<u64>,
    allocated: Mutex<u64>,
}

impl CpuBackend {
    /// Create a backend with unlimited memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that fails allocations beyond `bytes` of live buffers.
    pub fn with_memory_budget(bytes: u64) -> Self {
        Self {
            budget: Some(bytes),
            allocated: Mutex::new(0),
        }
    }

    /// Bytes of live buffer memory.
    pub fn allocated_bytes(&self) -> u64 {
        *self.allocated.lock()
    }

    fn host(buffer: &GpuBuffer) -> Result<&HostBuffer, GraphicsError> {
        match buffer {
            GpuBuffer::Host(host) => Ok(host),
            #[cfg(feature = "wgpu-backend")]
            _ => Err(GraphicsError::Internal(
                "CPU backend given a foreign buffer".into(),
            )),
        }
    }
}

impl GpuBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "CPU Backend"
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits {
            max_storage_bindings: CPU_STORAGE_BINDINGS,
            max_buffer_size: 1 << 32,
            storage_offset_alignment: 4,
        }
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        let mut allocated = self.allocated.lock();
        if let Some(budget) = self.budget {
            let available = budget.saturating_sub(*allocated);
            if descriptor.size > available {
                log::debug!(
                    "CpuBackend: refusing buffer {:?} ({} bytes, {} available)",
                    descriptor.label,
                    descriptor.size,
                    available
                );
                return Err(GraphicsError::OutOfMemory {
                    requested: descriptor.size,
                    available,
                });
            }
        }
        *allocated += descriptor.size;

        log::trace!(
            "CpuBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Ok(GpuBuffer::Host(HostBuffer::new(descriptor.size)))
    }

    fn destroy_buffer(&self, _buffer: &GpuBuffer, size: u64) {
        let mut allocated = self.allocated.lock();
        *allocated = allocated.saturating_sub(size);
    }

    fn write_buffer(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let host = Self::host(buffer)?;
        host.check_range(offset, data.len() as u64)?;
        let mut words = host.words.write();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        let host = Self::host(buffer)?;
        host.check_range(offset, size)?;
        let words = host.words.read();
        let bytes: &[u8] = bytemuck::cast_slice(words.as_slice());
        let start = offset as usize;
        Ok(bytes[start..start + size as usize].to_vec())
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<GpuComputePipeline, GraphicsError> {
        let kernel = descriptor.host_kernel.ok_or_else(|| {
            GraphicsError::FeatureNotSupported(format!(
                "pipeline {:?} has no host kernel",
                descriptor.label
            ))
        })?;
        log::trace!("CpuBackend: creating compute pipeline {:?}", descriptor.label);
        Ok(GpuComputePipeline::Host(kernel))
    }

    fn dispatch(
        &self,
        pipeline: &GpuComputePipeline,
        bindings: &[BoundBuffer],
        uniforms: &[u8],
        invocations: u32,
        _workgroups: u32,
    ) -> Result<(), GraphicsError> {
        let GpuComputePipeline::Host(kernel) = pipeline else {
            return Err(GraphicsError::Internal(
                "CPU backend given a foreign pipeline".into(),
            ));
        };

        // Outputs are computed on copies and written back after every read
        // guard is released.
        let mut outputs = Vec::new();
        for binding in bindings.iter().filter(|b| !b.read_only) {
            let host = Self::host(&binding.buffer)?;
            host.check_range(binding.offset, binding.size)?;
            let range = word_range(binding.offset, binding.size)?;
            outputs.push((binding.slot, host.words.read()[range].to_vec()));
        }

        let written = {
            let mut guards: Vec<(u32, RwLockReadGuard<'_, Vec<u32>>, Range<usize>)> = Vec::new();
            for binding in bindings.iter().filter(|b| b.read_only) {
                let host = Self::host(&binding.buffer)?;
                host.check_range(binding.offset, binding.size)?;
                let range = word_range(binding.offset, binding.size)?;
                guards.push((binding.slot, host.words.read_recursive(), range));
            }

            let mut dispatch = HostDispatch {
                invocations,
                uniforms,
                inputs: guards
                    .iter()
                    .map(|(slot, words, range)| (*slot, &words[range.clone()]))
                    .collect(),
                outputs,
            };
            kernel(&mut dispatch)?;
            dispatch.outputs
        };

        for (slot, words) in written {
            if let Some(binding) = bindings.iter().find(|b| b.slot == slot) {
                let host = Self::host(&binding.buffer)?;
                let range = word_range(binding.offset, binding.size)?;
                host.words.write()[range].copy_from_slice(&words);
            }
        }

        Ok(())
    }

    fn memory_barrier(&self, barrier: MemoryBarrier) {
        // Host writes are visible as soon as dispatch returns.
        log::trace!("CpuBackend: memory barrier {:?}", barrier);
    }
}
