//! Loaded model handle.
//!
//! A [`GpuModel`] owns every device buffer of one loaded model. Its buffers
//! are released when the last handle is dropped, which in normal operation
//! happens when the model cache evicts it.

use glam::Mat4;
use parking_lot::Mutex;
use serde::Serialize;
use toonskin_core::model::ModelInfo;

use crate::error::GraphicsError;
use crate::resources::{DeviceBuffer, StagingBuffer};
use crate::skinning::DispatchParams;

/// Bytes of one posed position or normal.
pub const POSITION_STRIDE: u64 = 12;

/// Bytes of one posed UV.
pub const UV_STRIDE: u64 = 8;

/// Bytes of one bone matrix.
pub const BONE_MATRIX_SIZE: u64 = 64;

/// Buffers uploaded by the first load phase; immutable afterwards.
pub(crate) struct StaticBuffers {
    pub(crate) rest_positions: DeviceBuffer,
    pub(crate) rest_normals: DeviceBuffer,
    pub(crate) rest_uvs: DeviceBuffer,
    pub(crate) bone_indices: DeviceBuffer,
    pub(crate) bone_weights: DeviceBuffer,
    pub(crate) morph_offsets: Option<DeviceBuffer>,
    pub(crate) uv_morph_offsets: Option<DeviceBuffer>,
}

impl StaticBuffers {
    pub(crate) fn device_bytes(&self) -> u64 {
        [
            Some(&self.rest_positions),
            Some(&self.rest_normals),
            Some(&self.rest_uvs),
            Some(&self.bone_indices),
            Some(&self.bone_weights),
            self.morph_offsets.as_ref(),
            self.uv_morph_offsets.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(DeviceBuffer::size)
        .sum()
    }
}

/// Posed output and index buffers of one submesh.
///
/// Positions and normals are tightly packed `f32 x 3`, UVs `f32 x 2`, one
/// entry per submesh vertex.
#[derive(Debug)]
pub struct SubmeshBuffers {
    pub positions: DeviceBuffer,
    pub normals: DeviceBuffer,
    pub uvs: DeviceBuffer,
    /// `u32` indices local to the submesh.
    pub indices: DeviceBuffer,
    pub index_count: u32,
}

impl SubmeshBuffers {
    fn device_bytes(&self) -> u64 {
        self.positions.size() + self.normals.size() + self.uvs.size() + self.indices.size()
    }
}

/// Render state of one submesh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubmeshState {
    pub material: usize,
    pub alpha: f32,
    pub visible: bool,
    pub double_sided: bool,
}

/// Posed vertices read back to the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PosedVertices {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
}

/// Memory and size figures of a loaded model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelStats {
    /// Host memory held by the model.
    pub ram_bytes: u64,
    /// Device memory held by the model.
    pub vram_bytes: u64,
    pub submeshes: usize,
    pub vertices: u32,
    pub faces: u32,
    pub bones: u32,
    pub materials: usize,
    pub vertex_morphs: usize,
    pub uv_morphs: usize,
}

/// A model whose device resources are fully allocated.
pub struct GpuModel {
    info: ModelInfo,
    layer_count: u32,
    statics: StaticBuffers,
    bone_matrices: DeviceBuffer,
    morph_weights: Option<DeviceBuffer>,
    uv_morph_weights: Option<DeviceBuffer>,
    submeshes: Vec<SubmeshBuffers>,
    states: Mutex<Vec<SubmeshState>>,
    staging: Mutex<StagingBuffer>,
}

impl GpuModel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: ModelInfo,
        layer_count: u32,
        statics: StaticBuffers,
        bone_matrices: DeviceBuffer,
        morph_weights: Option<DeviceBuffer>,
        uv_morph_weights: Option<DeviceBuffer>,
        submeshes: Vec<SubmeshBuffers>,
        staging: StagingBuffer,
    ) -> Self {
        let states = info
            .submeshes
            .iter()
            .map(|submesh| {
                let material = info.materials.get(submesh.material);
                SubmeshState {
                    material: submesh.material,
                    alpha: material.map_or(1.0, |m| m.alpha),
                    visible: true,
                    double_sided: material.is_some_and(|m| m.double_sided),
                }
            })
            .collect();
        Self {
            info,
            layer_count,
            statics,
            bone_matrices,
            morph_weights,
            uv_morph_weights,
            submeshes,
            states: Mutex::new(states),
            staging: Mutex::new(staging),
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Animation layer count requested at load.
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn submesh_count(&self) -> usize {
        self.submeshes.len()
    }

    pub fn submesh_buffers(&self, submesh: usize) -> Option<&SubmeshBuffers> {
        self.submeshes.get(submesh)
    }

    /// Bones the bone-matrix buffer can hold; at least one.
    pub fn bone_capacity(&self) -> u32 {
        (self.bone_matrices.size() / BONE_MATRIX_SIZE) as u32
    }

    pub fn stats(&self) -> ModelStats {
        let vram_bytes = self.statics.device_bytes()
            + self.bone_matrices.size()
            + self.morph_weights.as_ref().map_or(0, DeviceBuffer::size)
            + self.uv_morph_weights.as_ref().map_or(0, DeviceBuffer::size)
            + self.submeshes.iter().map(SubmeshBuffers::device_bytes).sum::<u64>();
        ModelStats {
            ram_bytes: self.staging.lock().size(),
            vram_bytes,
            submeshes: self.submeshes.len(),
            vertices: self.info.vertex_count,
            faces: self.info.face_count,
            bones: self.info.bone_count,
            materials: self.info.materials.len(),
            vertex_morphs: self.info.vertex_morphs.len(),
            uv_morphs: self.info.uv_morphs.len(),
        }
    }

    // ========================================================================
    // Per-frame inputs
    // ========================================================================

    /// Upload bone matrices, row-major 4x4 per bone.
    ///
    /// Fewer matrices than the declared bone count leave the remaining bones
    /// as they were.
    pub fn upload_bone_matrices(&self, matrices: &[[f32; 16]]) -> Result<(), GraphicsError> {
        if matrices.len() > self.info.bone_count as usize {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} bone matrices for model {:?} with {} bones",
                matrices.len(),
                self.info.name,
                self.info.bone_count
            )));
        }
        if matrices.is_empty() {
            return Ok(());
        }
        self.bone_matrices.write_slice(0, matrices)
    }

    /// Upload bone transforms given as glam matrices.
    pub fn upload_bone_transforms(&self, transforms: &[Mat4]) -> Result<(), GraphicsError> {
        let rows: Vec<[f32; 16]> = transforms
            .iter()
            .map(|m| m.transpose().to_cols_array())
            .collect();
        self.upload_bone_matrices(&rows)
    }

    /// Upload vertex-morph weights; morphs past the end of `weights` get 0.
    pub fn update_morph_weights(&self, weights: &[f32]) -> Result<(), GraphicsError> {
        write_weights(
            self.morph_weights.as_ref(),
            weights,
            self.info.vertex_morphs.len(),
            "vertex",
        )
    }

    /// Upload signed UV-morph weights; morphs past the end of `weights` get 0.
    pub fn update_uv_morph_weights(&self, weights: &[f32]) -> Result<(), GraphicsError> {
        write_weights(
            self.uv_morph_weights.as_ref(),
            weights,
            self.info.uv_morphs.len(),
            "uv",
        )
    }

    /// Buffers and counts to pose `submesh`.
    pub fn dispatch_params(&self, submesh: usize) -> Result<DispatchParams, GraphicsError> {
        let (info, buffers) = self
            .info
            .submeshes
            .get(submesh)
            .zip(self.submeshes.get(submesh))
            .ok_or_else(|| self.no_submesh(submesh))?;
        Ok(DispatchParams {
            rest_positions: self.statics.rest_positions.id(),
            rest_normals: self.statics.rest_normals.id(),
            rest_uvs: self.statics.rest_uvs.id(),
            bone_indices: self.statics.bone_indices.id(),
            bone_weights: self.statics.bone_weights.id(),
            bone_matrices: self.bone_matrices.id(),
            morph_offsets: self.statics.morph_offsets.as_ref().map(DeviceBuffer::id),
            morph_weights: self.morph_weights.as_ref().map(DeviceBuffer::id),
            uv_morph_offsets: self.statics.uv_morph_offsets.as_ref().map(DeviceBuffer::id),
            uv_morph_weights: self.uv_morph_weights.as_ref().map(DeviceBuffer::id),
            out_positions: buffers.positions.id(),
            out_normals: buffers.normals.id(),
            out_uvs: buffers.uvs.id(),
            base_vertex: info.first_vertex,
            vertex_count: info.vertex_count,
            total_vertex_count: self.info.vertex_count,
            bone_count: self.info.bone_count,
            morph_count: self.info.vertex_morphs.len() as u32,
            uv_morph_count: self.info.uv_morphs.len() as u32,
        })
    }

    // ========================================================================
    // Submesh state
    // ========================================================================

    pub fn submesh_state(&self, submesh: usize) -> Option<SubmeshState> {
        self.states.lock().get(submesh).copied()
    }

    /// Set the alpha of a submesh, clamped to `[0, 1]`. NaN counts as fully
    /// transparent. Returns `false` if the submesh does not exist.
    pub fn set_submesh_alpha(&self, submesh: usize, alpha: f32) -> bool {
        match self.states.lock().get_mut(submesh) {
            Some(state) => {
                state.alpha = if alpha.is_nan() { 0.0 } else { alpha.clamp(0.0, 1.0) };
                true
            }
            None => false,
        }
    }

    /// Show or hide a submesh. Returns `false` if it does not exist.
    pub fn set_submesh_visible(&self, submesh: usize, visible: bool) -> bool {
        match self.states.lock().get_mut(submesh) {
            Some(state) => {
                state.visible = visible;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Readback
    // ========================================================================

    /// Read the posed vertices of a submesh through the staging buffer.
    ///
    /// Blocks until outstanding dispatches complete.
    pub fn read_posed(&self, submesh: usize) -> Result<PosedVertices, GraphicsError> {
        let buffers = self
            .submeshes
            .get(submesh)
            .ok_or_else(|| self.no_submesh(submesh))?;
        let mut staging = self.staging.lock();

        let positions = staging
            .copy_from(&buffers.positions, 0, buffers.positions.size())?
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        let normals = staging
            .copy_from(&buffers.normals, 0, buffers.normals.size())?
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        let uvs = staging
            .copy_from(&buffers.uvs, 0, buffers.uvs.size())?
            .chunks_exact(2)
            .map(|c| [c[0], c[1]])
            .collect();
        Ok(PosedVertices {
            positions,
            normals,
            uvs,
        })
    }

    fn no_submesh(&self, submesh: usize) -> GraphicsError {
        GraphicsError::InvalidParameter(format!(
            "model {:?} has no submesh {} ({} submeshes)",
            self.info.name,
            submesh,
            self.submeshes.len()
        ))
    }
}

fn write_weights(
    buffer: Option<&DeviceBuffer>,
    weights: &[f32],
    count: usize,
    kind: &str,
) -> Result<(), GraphicsError> {
    if weights.len() > count {
        return Err(GraphicsError::InvalidParameter(format!(
            "{} {kind} morph weights for {count} morphs",
            weights.len()
        )));
    }
    let Some(buffer) = buffer else {
        return Ok(());
    };
    let mut padded = weights.to_vec();
    padded.resize(count, 0.0);
    buffer.write_slice(0, &padded)
}

impl std::fmt::Debug for GpuModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuModel")
            .field("name", &self.info.name)
            .field("submeshes", &self.submeshes.len())
            .field("vertices", &self.info.vertex_count)
            .field("bones", &self.info.bone_count)
            .finish()
    }
}

static_assertions::assert_impl_all!(GpuModel: Send, Sync);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use toonskin_core::model::{ModelAsset, SkinnedVertex};

    use super::*;
    use crate::backend::CpuBackend;
    use crate::device::GraphicsDevice;
    use crate::loader::ModelLoader;
    use crate::resources::BufferPool;

    fn model() -> GpuModel {
        let loader = ModelLoader::new(BufferPool::new(GraphicsDevice::new(Arc::new(
            CpuBackend::new(),
        ))));
        let triangle = [
            SkinnedVertex::rigid([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], 0),
            SkinnedVertex::rigid([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], 1),
            SkinnedVertex::rigid([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], 2),
        ];
        let asset = ModelAsset::builder("tri")
            .bone_count(3)
            .submesh(&triangle, vec![0, 1, 2], 0)
            .vertex_morph("a", vec![(0, [1.0, 0.0, 0.0])])
            .vertex_morph("b", vec![(1, [0.0, 1.0, 0.0])])
            .build()
            .unwrap();
        let prepared = loader.prepare_asset(asset, None).unwrap();
        loader.finalize(prepared).unwrap()
    }

    fn read_f32(buffer: &DeviceBuffer) -> Vec<f32> {
        bytemuck::cast_slice(&buffer.read(0, buffer.size()).unwrap()).to_vec()
    }

    #[test]
    fn test_bones_start_at_identity() {
        let model = model();
        let identity = Mat4::IDENTITY.to_cols_array();
        let bones = read_f32(&model.bone_matrices);
        assert_eq!(bones.len(), 3 * 16);
        for chunk in bones.chunks_exact(16) {
            assert_eq!(chunk, identity);
        }
    }

    #[test]
    fn test_partial_bone_upload_keeps_the_rest() {
        let model = model();
        let moved = Mat4::from_translation(glam::Vec3::X);
        model.upload_bone_transforms(&[moved]).unwrap();

        let bones = read_f32(&model.bone_matrices);
        assert_eq!(&bones[..16], moved.transpose().to_cols_array());
        assert_eq!(&bones[16..32], Mat4::IDENTITY.to_cols_array());
    }

    #[test]
    fn test_too_many_bones_rejected() {
        let model = model();
        let bones = vec![Mat4::IDENTITY; 4];
        assert!(matches!(
            model.upload_bone_transforms(&bones),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_short_morph_weights_are_padded() {
        let model = model();
        model.update_morph_weights(&[0.25, 0.75]).unwrap();
        model.update_morph_weights(&[0.5]).unwrap();
        let weights = read_f32(model.morph_weights.as_ref().unwrap());
        assert_eq!(weights, vec![0.5, 0.0]);

        assert!(model.update_morph_weights(&[0.0; 3]).is_err());
        // No UV morphs: an empty update is the no-deformation state.
        model.update_uv_morph_weights(&[]).unwrap();
    }

    #[test]
    fn test_submesh_state() {
        let model = model();
        let state = model.submesh_state(0).unwrap();
        assert_eq!(state.alpha, 1.0);
        assert!(state.visible);

        assert!(model.set_submesh_alpha(0, 1.5));
        assert_eq!(model.submesh_state(0).unwrap().alpha, 1.0);
        assert!(model.set_submesh_alpha(0, -0.5));
        assert_eq!(model.submesh_state(0).unwrap().alpha, 0.0);
        assert!(model.set_submesh_alpha(0, f32::INFINITY));
        assert_eq!(model.submesh_state(0).unwrap().alpha, 1.0);
        assert!(model.set_submesh_alpha(0, f32::NAN));
        assert_eq!(model.submesh_state(0).unwrap().alpha, 0.0);
        assert!(!model.set_submesh_visible(3, false));
        assert!(model.submesh_state(3).is_none());
    }

    #[test]
    fn test_dispatch_params_cover_submesh() {
        let model = model();
        let params = model.dispatch_params(0).unwrap();
        assert_eq!(params.vertex_count, 3);
        assert_eq!(params.total_vertex_count, 3);
        assert_eq!(params.morph_count, 2);
        assert_eq!(params.uv_morph_count, 0);
        assert!(params.uv_morph_weights.is_none());
        assert!(params.validate().is_ok());
        assert!(model.dispatch_params(1).is_err());
    }

    #[test]
    fn test_stats() {
        let model = model();
        let stats = model.stats();
        assert_eq!(stats.vertices, 3);
        assert_eq!(stats.faces, 1);
        assert_eq!(stats.bones, 3);
        assert_eq!(stats.vertex_morphs, 2);
        assert_eq!(stats.ram_bytes, 3 * (POSITION_STRIDE * 2 + UV_STRIDE));
    }
}
