//! GPU backend abstraction layer.
//!
//! Each backend implements the [`GpuBackend`] trait, which provides:
//! - Buffer creation, upload, readback and destruction
//! - Compute pipeline creation
//! - Compute dispatch against a resolved set of storage bindings
//! - Memory barriers between dispatches and later consumers
//!
//! # Available Backends
//!
//! - `cpu` (always available): host-memory reference backend that runs
//!   compute pipelines through their host kernel
//! - `wgpu-backend`: GPU backend using wgpu and WGSL compute shaders

pub mod cpu;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

use std::sync::Arc;

use crate::error::GraphicsError;
use crate::types::{BufferDescriptor, MemoryBarrier};

pub use cpu::{CpuBackend, HostBuffer, HostDispatch};

/// Host implementation of a compute pipeline, used by the CPU backend.
pub type HostKernel = fn(&mut HostDispatch<'_>) -> Result<(), GraphicsError>;

/// Handle to a backend buffer.
#[derive(Clone)]
pub enum GpuBuffer {
    /// Host memory owned by the CPU backend.
    Host(HostBuffer),
    /// wgpu backend buffer
    #[cfg(feature = "wgpu-backend")]
    Wgpu(Arc<wgpu::Buffer>),
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(buffer) => f
                .debug_struct("GpuBuffer::Host")
                .field("size", &buffer.size())
                .finish(),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu(buffer) => f.debug_tuple("GpuBuffer::Wgpu").field(buffer).finish(),
        }
    }
}

/// Handle to a backend compute pipeline.
pub enum GpuComputePipeline {
    /// Host kernel executed by the CPU backend.
    Host(HostKernel),
    /// wgpu compute pipeline with its bind group layout and uniform buffer.
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        pipeline: wgpu::ComputePipeline,
        layout: wgpu::BindGroupLayout,
        uniforms: Option<(u32, wgpu::Buffer)>,
    },
}

impl std::fmt::Debug for GpuComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(_) => write!(f, "GpuComputePipeline::Host"),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu { pipeline, .. } => f
                .debug_tuple("GpuComputePipeline::Wgpu")
                .field(pipeline)
                .finish(),
        }
    }
}

/// One storage binding slot a compute pipeline reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageSlot {
    pub binding: u32,
    pub read_only: bool,
}

impl StorageSlot {
    pub const fn read(binding: u32) -> Self {
        Self {
            binding,
            read_only: true,
        }
    }

    pub const fn write(binding: u32) -> Self {
        Self {
            binding,
            read_only: false,
        }
    }
}

/// Descriptor for creating a compute pipeline.
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    /// WGSL source for GPU backends.
    pub wgsl: &'static str,
    pub entry_point: &'static str,
    pub workgroup_size: u32,
    /// Storage slots the shader declares, in binding order.
    pub storage_slots: Vec<StorageSlot>,
    /// Uniform block binding and size in bytes, if any.
    pub uniforms: Option<(u32, u64)>,
    /// Host implementation for the CPU backend.
    pub host_kernel: Option<HostKernel>,
}

/// A storage binding resolved to backend memory for one dispatch.
#[derive(Debug, Clone)]
pub struct BoundBuffer {
    pub slot: u32,
    pub buffer: GpuBuffer,
    pub offset: u64,
    pub size: u64,
    pub read_only: bool,
}

/// Limits a backend reports to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    /// Number of slots in the shared storage binding table.
    pub max_storage_bindings: u32,
    pub max_buffer_size: u64,
    /// Required alignment of ranged storage binding offsets.
    pub storage_offset_alignment: u64,
}

/// GPU backend trait for abstracting different GPU APIs.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Limits of this backend.
    fn limits(&self) -> BackendLimits;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError>;

    /// Destroy a buffer resource. Called exactly once per created buffer.
    fn destroy_buffer(&self, buffer: &GpuBuffer, size: u64);

    /// Write data to a buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8])
    -> Result<(), GraphicsError>;

    /// Read data from a buffer.
    ///
    /// This is a blocking operation that waits for outstanding work.
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64)
    -> Result<Vec<u8>, GraphicsError>;

    /// Create a compute pipeline.
    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<GpuComputePipeline, GraphicsError>;

    /// Run `invocations` invocations of a compute pipeline over `workgroups` groups.
    fn dispatch(
        &self,
        pipeline: &GpuComputePipeline,
        bindings: &[BoundBuffer],
        uniforms: &[u8],
        invocations: u32,
        workgroups: u32,
    ) -> Result<(), GraphicsError>;

    /// Make prior dispatch writes visible to the given consumers.
    fn memory_barrier(&self, barrier: MemoryBarrier);
}

/// Which backend to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendType {
    /// Prefer a GPU backend, fall back to the CPU backend.
    #[default]
    Auto,
    /// Host-memory reference backend.
    Cpu,
    /// wgpu backend; fails if unavailable.
    Wgpu,
}

/// Create a backend of the requested type.
pub fn create_backend(kind: BackendType) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    match kind {
        BackendType::Cpu => {
            log::info!("Using CPU backend");
            Ok(Arc::new(CpuBackend::new()))
        }
        BackendType::Wgpu => {
            #[cfg(feature = "wgpu-backend")]
            {
                let backend = wgpu_backend::WgpuBackend::new()?;
                log::info!("Using wgpu backend");
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "wgpu-backend"))]
            {
                Err(GraphicsError::FeatureNotSupported(
                    "built without the wgpu-backend feature".into(),
                ))
            }
        }
        BackendType::Auto => {
            #[cfg(feature = "wgpu-backend")]
            {
                match wgpu_backend::WgpuBackend::new() {
                    Ok(backend) => {
                        log::info!("Using wgpu backend");
                        return Ok(Arc::new(backend));
                    }
                    Err(e) => {
                        log::warn!("Failed to create wgpu backend: {}", e);
                    }
                }
            }

            log::info!("Using CPU backend");
            Ok(Arc::new(CpuBackend::new()))
        }
    }
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "wgpu-backend")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_backend_always_available() {
        let backend = create_backend(BackendType::Cpu).unwrap();
        assert_eq!(backend.name(), "CPU Backend");
    }

    #[test]
    fn test_auto_backend_resolves() {
        let backend = create_backend(BackendType::Auto).unwrap();
        assert!(!backend.name().is_empty());
    }

    #[cfg(not(feature = "wgpu-backend"))]
    #[test]
    fn test_wgpu_requires_feature() {
        assert!(matches!(
            create_backend(BackendType::Wgpu),
            Err(GraphicsError::FeatureNotSupported(_))
        ));
    }
}
