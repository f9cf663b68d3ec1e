//! wgpu GPU backend implementation.
//!
//! This backend uses wgpu for cross-platform GPU access, supporting
//! Vulkan, Metal, DX12, and WebGPU. Compute pipelines are built from WGSL;
//! every storage slot lives in bind group 0 next to the uniform block.

use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use crate::error::GraphicsError;
use crate::types::{BufferDescriptor, BufferUsage, MemoryBarrier};

use super::{
    BackendLimits, BoundBuffer, ComputePipelineDescriptor, GpuBackend, GpuBuffer,
    GpuComputePipeline,
};

/// Storage buffers per stage requested from the adapter.
const REQUIRED_STORAGE_BUFFERS: u32 = 16;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// wgpu-based GPU backend.
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: BackendLimits,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter.get_info().name)
            .finish()
    }
}

impl WgpuBackend {
    /// Create a new wgpu backend.
    pub fn new() -> Result<Self, GraphicsError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            backend_options: wgpu::BackendOptions::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| GraphicsError::InitializationFailed(format!("No compatible GPU adapter: {e}")))?;

        log::info!("wgpu adapter: {:?}", adapter.get_info());

        let supported = adapter.limits();
        if supported.max_storage_buffers_per_shader_stage < REQUIRED_STORAGE_BUFFERS {
            return Err(GraphicsError::FeatureNotSupported(format!(
                "adapter allows {} storage buffers per stage, skinning needs {}",
                supported.max_storage_buffers_per_shader_stage, REQUIRED_STORAGE_BUFFERS
            )));
        }
        let required_limits = wgpu::Limits {
            max_storage_buffers_per_shader_stage: REQUIRED_STORAGE_BUFFERS,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("toonskin device"),
            required_features: wgpu::Features::empty(),
            required_limits: required_limits.clone(),
            memory_hints: wgpu::MemoryHints::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| GraphicsError::InitializationFailed(format!("Device creation failed: {e}")))?;

        let limits = BackendLimits {
            max_storage_bindings: REQUIRED_STORAGE_BUFFERS,
            max_buffer_size: required_limits
                .max_buffer_size
                .min(required_limits.max_storage_buffer_binding_size as u64),
            storage_offset_alignment: required_limits.min_storage_buffer_offset_alignment as u64,
        };

        Ok(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            limits,
        })
    }

    /// Get the wgpu device.
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    /// Get the wgpu queue.
    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    fn wgpu_buffer(buffer: &GpuBuffer) -> Result<&wgpu::Buffer, GraphicsError> {
        match buffer {
            GpuBuffer::Wgpu(buffer) => Ok(buffer),
            GpuBuffer::Host(_) => Err(GraphicsError::Internal(
                "wgpu backend given a host buffer".into(),
            )),
        }
    }

    fn wait(&self, submission: wgpu::SubmissionIndex) -> Result<(), GraphicsError> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: Some(SUBMIT_TIMEOUT),
            })
            .map(|_| ())
            .map_err(|e| GraphicsError::Internal(format!("waiting for submission: {e}")))
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        // Every buffer stays copyable so uploads and readback work regardless
        // of its declared use.
        let usage = convert_buffer_usage(descriptor.usage)
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: descriptor.label.as_deref(),
            size: descriptor.size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::debug!("WgpuBackend: buffer {:?} refused: {error}", descriptor.label);
            buffer.destroy();
            return Err(GraphicsError::OutOfMemory {
                requested: descriptor.size,
                available: 0,
            });
        }

        log::trace!(
            "WgpuBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Ok(GpuBuffer::Wgpu(Arc::new(buffer)))
    }

    fn destroy_buffer(&self, buffer: &GpuBuffer, _size: u64) {
        if let GpuBuffer::Wgpu(buffer) = buffer {
            buffer.destroy();
        }
    }

    fn write_buffer(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let buffer = Self::wgpu_buffer(buffer)?;
        if offset
            .checked_add(data.len() as u64)
            .is_none_or(|end| end > buffer.size())
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                buffer.size()
            )));
        }
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        let buffer = Self::wgpu_buffer(buffer)?;
        if offset.checked_add(size).is_none_or(|end| end > buffer.size()) {
            return Err(GraphicsError::InvalidParameter(format!(
                "read of {size} bytes at {offset} exceeds buffer size {}",
                buffer.size()
            )));
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, size);
        let submission = self.queue.submit(std::iter::once(encoder.finish()));
        self.wait(submission)?;

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::wait_indefinitely());
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GraphicsError::Internal(format!("mapping readback: {e}"))),
            Err(_) => return Err(GraphicsError::DeviceLost),
        }

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> Result<GpuComputePipeline, GraphicsError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: descriptor.label.as_deref(),
                source: wgpu::ShaderSource::Wgsl(descriptor.wgsl.into()),
            });

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = descriptor
            .storage_slots
            .iter()
            .map(|slot| wgpu::BindGroupLayoutEntry {
                binding: slot.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: slot.read_only,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        if let Some((binding, size)) = descriptor.uniforms {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(size),
                },
                count: None,
            });
        }
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: descriptor.label.as_deref(),
                entries: &entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("compute pipeline layout"),
                bind_group_layouts: &[&layout],
                immediate_size: 0,
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: descriptor.label.as_deref(),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(descriptor.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GraphicsError::ShaderCompilationFailed(error.to_string()));
        }

        let uniforms = descriptor.uniforms.map(|(binding, size)| {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("compute uniforms"),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            (binding, buffer)
        });

        log::trace!("WgpuBackend: created compute pipeline {:?}", descriptor.label);
        Ok(GpuComputePipeline::Wgpu {
            pipeline,
            layout,
            uniforms,
        })
    }

    fn dispatch(
        &self,
        pipeline: &GpuComputePipeline,
        bindings: &[BoundBuffer],
        uniforms: &[u8],
        _invocations: u32,
        workgroups: u32,
    ) -> Result<(), GraphicsError> {
        let GpuComputePipeline::Wgpu {
            pipeline,
            layout,
            uniforms: uniform_buffer,
        } = pipeline
        else {
            return Err(GraphicsError::Internal(
                "wgpu backend given a host pipeline".into(),
            ));
        };

        let mut entries = Vec::with_capacity(bindings.len() + 1);
        for bound in bindings {
            entries.push(wgpu::BindGroupEntry {
                binding: bound.slot,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: Self::wgpu_buffer(&bound.buffer)?,
                    offset: bound.offset,
                    size: NonZeroU64::new(bound.size),
                }),
            });
        }
        if let Some((binding, buffer)) = uniform_buffer {
            self.queue.write_buffer(buffer, 0, uniforms);
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("compute bindings"),
            layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compute encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("compute dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn memory_barrier(&self, barrier: MemoryBarrier) {
        // wgpu orders submissions on one queue and inserts the hazards itself.
        log::trace!("WgpuBackend: barrier {barrier:?}");
    }
}

fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut result = wgpu::BufferUsages::empty();

    if usage.contains(BufferUsage::VERTEX) {
        result |= wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(BufferUsage::INDEX) {
        result |= wgpu::BufferUsages::INDEX;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        result |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::STORAGE) {
        result |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        result |= wgpu::BufferUsages::COPY_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        result |= wgpu::BufferUsages::COPY_DST;
    }

    result
}
