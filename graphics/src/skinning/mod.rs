//! Compute skinning engine.
//!
//! One dispatch poses one submesh: vertex morphs are blended onto the rest
//! position, up to four bone influences are renormalized and blended into a
//! single matrix, and UV morphs are blended onto the rest UV. Every dispatch
//! runs inside a [`BindingGuard`] so the host renderer's storage bindings
//! survive it, and is followed by a memory barrier covering vertex fetch and
//! storage reads.
//!
//! The kernel exists twice: `skinning.wgsl` for GPU backends and
//! [`kernel::skin_host`] for the CPU backend.

mod kernel;
mod params;

use std::sync::Arc;

use crate::backend::{ComputePipelineDescriptor, StorageSlot};
use crate::binding::BindingGuard;
use crate::device::{ComputePipeline, GraphicsDevice};
use crate::error::GraphicsError;
use crate::profiling::profile_function;
use crate::resources::{BufferPool, DeviceBuffer};
use crate::types::{BufferDescriptor, BufferId, MemoryBarrier};

pub use kernel::{
    BONE_WEIGHT_EPSILON, PosedVertex, SkinningInputs, UV_MORPH_THRESHOLD, VERTEX_MORPH_THRESHOLD,
};
pub use params::{DispatchParams, SkinningUniforms};

/// Invocations per workgroup.
pub const LOCAL_SIZE_X: u32 = 256;

/// WGSL source of the skinning kernel.
pub const SKINNING_WGSL: &str = include_str!("skinning.wgsl");

/// Storage binding slots used by the kernel.
pub mod slots {
    pub const REST_POSITIONS: u32 = 0;
    pub const REST_NORMALS: u32 = 1;
    pub const BONE_INDICES: u32 = 2;
    pub const BONE_WEIGHTS: u32 = 3;
    pub const BONE_MATRICES: u32 = 4;
    pub const MORPH_OFFSETS: u32 = 5;
    pub const MORPH_WEIGHTS: u32 = 6;
    pub const SKINNED_POSITIONS: u32 = 7;
    pub const SKINNED_NORMALS: u32 = 8;
    pub const REST_UVS: u32 = 9;
    pub const UV_MORPH_OFFSETS: u32 = 10;
    pub const UV_MORPH_WEIGHTS: u32 = 11;
    pub const SKINNED_UVS: u32 = 12;
    /// Uniform block binding; not part of the storage table.
    pub const UNIFORMS: u32 = 13;
}

const STORAGE_SLOTS: [StorageSlot; 13] = [
    StorageSlot::read(slots::REST_POSITIONS),
    StorageSlot::read(slots::REST_NORMALS),
    StorageSlot::read(slots::BONE_INDICES),
    StorageSlot::read(slots::BONE_WEIGHTS),
    StorageSlot::read(slots::BONE_MATRICES),
    StorageSlot::read(slots::MORPH_OFFSETS),
    StorageSlot::read(slots::MORPH_WEIGHTS),
    StorageSlot::write(slots::SKINNED_POSITIONS),
    StorageSlot::write(slots::SKINNED_NORMALS),
    StorageSlot::read(slots::REST_UVS),
    StorageSlot::read(slots::UV_MORPH_OFFSETS),
    StorageSlot::read(slots::UV_MORPH_WEIGHTS),
    StorageSlot::write(slots::SKINNED_UVS),
];

/// Runs the skinning kernel over device buffers.
pub struct SkinningEngine {
    device: Arc<GraphicsDevice>,
    pipeline: ComputePipeline,
    /// Bound to optional slots (morph tables and weights) a dispatch leaves empty.
    placeholder: DeviceBuffer,
}

impl SkinningEngine {
    /// Build the skinning pipeline on the pool's device.
    pub fn new(pool: &BufferPool) -> Result<Self, GraphicsError> {
        let device = pool.device().clone();
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("skinning".into()),
            wgsl: SKINNING_WGSL,
            entry_point: "main",
            workgroup_size: LOCAL_SIZE_X,
            storage_slots: STORAGE_SLOTS.to_vec(),
            uniforms: Some((
                slots::UNIFORMS,
                std::mem::size_of::<SkinningUniforms>() as u64,
            )),
            host_kernel: Some(kernel::skin_host),
        })?;
        let placeholder = pool.create_buffer_init(
            &BufferDescriptor::storage(16).with_label("skinning_placeholder"),
            &[0; 16],
        )?;
        log::debug!("SkinningEngine: pipeline ready on {}", device.backend_name());
        Ok(Self {
            device,
            pipeline,
            placeholder,
        })
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    /// Pose one submesh.
    ///
    /// Binds the buffers named by `params`, dispatches, issues the barrier
    /// and puts the binding table back exactly as it was found, on success
    /// and on failure alike.
    pub fn dispatch(&self, params: &DispatchParams) -> Result<(), GraphicsError> {
        profile_function!();
        params.validate()?;

        let mut guard = BindingGuard::capture(&self.device);
        let result = self.bind_and_dispatch(params);
        guard.restore();
        result
    }

    fn bind_and_dispatch(&self, params: &DispatchParams) -> Result<(), GraphicsError> {
        let placeholder = self.placeholder.id();
        let optional = |id: Option<BufferId>| id.unwrap_or(placeholder);
        let bindings = [
            (slots::REST_POSITIONS, params.rest_positions),
            (slots::REST_NORMALS, params.rest_normals),
            (slots::BONE_INDICES, params.bone_indices),
            (slots::BONE_WEIGHTS, params.bone_weights),
            (slots::BONE_MATRICES, params.bone_matrices),
            (slots::MORPH_OFFSETS, optional(params.morph_offsets)),
            (slots::MORPH_WEIGHTS, optional(params.morph_weights)),
            (slots::SKINNED_POSITIONS, params.out_positions),
            (slots::SKINNED_NORMALS, params.out_normals),
            (slots::REST_UVS, params.rest_uvs),
            (slots::UV_MORPH_OFFSETS, optional(params.uv_morph_offsets)),
            (slots::UV_MORPH_WEIGHTS, optional(params.uv_morph_weights)),
            (slots::SKINNED_UVS, params.out_uvs),
        ];
        for (slot, buffer) in bindings {
            self.device.bind_storage_buffer(slot, buffer)?;
        }

        let uniforms = params.uniforms();
        self.device.dispatch_compute(
            &self.pipeline,
            bytemuck::bytes_of(&uniforms),
            params.vertex_count,
        )?;
        self.device
            .memory_barrier(MemoryBarrier::VERTEX_ATTRIB_ARRAY | MemoryBarrier::SHADER_STORAGE);
        log::trace!(
            "SkinningEngine: posed vertices {}..{}",
            params.base_vertex,
            params.base_vertex + params.vertex_count
        );
        Ok(())
    }
}

impl std::fmt::Debug for SkinningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkinningEngine")
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::binding::StorageBinding;

    struct Scene {
        pool: BufferPool,
        engine: SkinningEngine,
        buffers: Vec<DeviceBuffer>,
    }

    /// Two vertices, one bone translating by +X, vertex 1 morphed by +Y.
    fn scene() -> (Scene, DispatchParams) {
        let device = GraphicsDevice::new(Arc::new(CpuBackend::new()));
        let pool = BufferPool::new(device);
        let engine = SkinningEngine::new(&pool).unwrap();

        let upload = |data: &[u8]| {
            pool.create_buffer_init(&BufferDescriptor::storage(data.len() as u64), data)
                .unwrap()
        };
        let translate: [f32; 16] = [
            1.0, 0.0, 0.0, 1.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        let buffers = vec![
            upload(bytemuck::cast_slice(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0])),
            upload(bytemuck::cast_slice(&[0.0f32, 0.0, 1.0, 0.0, 0.0, 1.0])),
            upload(bytemuck::cast_slice(&[0.0f32, 0.0, 0.5, 0.5])),
            upload(bytemuck::cast_slice(&[0i32, 0, 0, 0, 0, 0, 0, 0])),
            upload(bytemuck::cast_slice(&[1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0])),
            upload(bytemuck::cast_slice(&translate)),
            upload(bytemuck::cast_slice(&[0.0f32, 0.0, 0.0, 0.0, 2.0, 0.0])),
            upload(bytemuck::cast_slice(&[0.5f32])),
            pool.create_buffer(&BufferDescriptor::vertex_output(24)).unwrap(),
            pool.create_buffer(&BufferDescriptor::vertex_output(24)).unwrap(),
            pool.create_buffer(&BufferDescriptor::vertex_output(16)).unwrap(),
        ];
        let params = DispatchParams {
            rest_positions: buffers[0].id(),
            rest_normals: buffers[1].id(),
            rest_uvs: buffers[2].id(),
            bone_indices: buffers[3].id(),
            bone_weights: buffers[4].id(),
            bone_matrices: buffers[5].id(),
            morph_offsets: Some(buffers[6].id()),
            morph_weights: Some(buffers[7].id()),
            uv_morph_offsets: None,
            uv_morph_weights: None,
            out_positions: buffers[8].id(),
            out_normals: buffers[9].id(),
            out_uvs: buffers[10].id(),
            base_vertex: 0,
            vertex_count: 2,
            total_vertex_count: 2,
            bone_count: 1,
            morph_count: 1,
            uv_morph_count: 0,
        };
        (
            Scene {
                pool,
                engine,
                buffers,
            },
            params,
        )
    }

    fn read_f32(buffer: &DeviceBuffer) -> Vec<f32> {
        buffer
            .read(0, buffer.size())
            .unwrap()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_dispatch_poses_vertices() {
        let (scene, params) = scene();
        scene.engine.dispatch(&params).unwrap();

        assert_eq!(read_f32(&scene.buffers[8]), vec![1.0, 0.0, 0.0, 2.0, 2.0, 1.0]);
        assert_eq!(read_f32(&scene.buffers[9]), vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        assert_eq!(read_f32(&scene.buffers[10]), vec![0.0, 0.0, 0.5, 0.5]);
        assert_eq!(scene.pool.device().barrier_count(), 1);
    }

    #[test]
    fn test_dispatch_second_submesh_uses_base_vertex() {
        let (scene, params) = scene();
        let out = scene
            .pool
            .create_buffer(&BufferDescriptor::vertex_output(12))
            .unwrap();
        let params = DispatchParams {
            base_vertex: 1,
            vertex_count: 1,
            out_positions: out.id(),
            ..params
        };
        scene.engine.dispatch(&params).unwrap();
        assert_eq!(read_f32(&out), vec![2.0, 2.0, 1.0]);
    }

    #[test]
    fn test_dispatch_restores_bindings() {
        let (scene, params) = scene();
        let device = scene.pool.device();
        let foreign = scene
            .pool
            .create_buffer(&BufferDescriptor::storage(64))
            .unwrap();
        device.bind_storage_buffer_range(7, foreign.id(), 16, 32).unwrap();
        device.bind_storage_buffer(15, foreign.id()).unwrap();
        let before = device.storage_bindings();

        scene.engine.dispatch(&params).unwrap();

        assert_eq!(device.storage_bindings(), before);
        assert_eq!(
            device.storage_binding(7),
            Some(StorageBinding::range(foreign.id(), 16, 32))
        );
    }

    #[test]
    fn test_failed_dispatch_restores_bindings() {
        let (scene, params) = scene();
        let device = scene.pool.device();
        let before = device.storage_bindings();
        let dead = scene.buffers[5].id();
        let Scene {
            pool,
            engine,
            mut buffers,
        } = scene;
        drop(buffers.remove(5));

        let params = DispatchParams {
            bone_matrices: dead,
            ..params
        };
        assert!(engine.dispatch(&params).is_err());
        assert_eq!(pool.device().storage_bindings(), before);
    }
}
