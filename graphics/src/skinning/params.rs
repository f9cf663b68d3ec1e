//! Per-dispatch skinning parameters.

use toonskin_core::model::{MAX_BONES, MAX_UV_MORPHS, MAX_VERTEX_MORPHS};

use crate::error::GraphicsError;
use crate::types::BufferId;

/// Uniform block of the skinning kernel (binding 13).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SkinningUniforms {
    /// Vertices processed by this dispatch.
    pub vertex_count: u32,
    /// First model-wide vertex of the submesh.
    pub base_vertex: u32,
    /// Vertices in the whole model; the stride of one morph in the dense tables.
    pub total_vertex_count: u32,
    pub bone_count: u32,
    pub morph_count: u32,
    pub uv_morph_count: u32,
    pub _pad: [u32; 2],
}

static_assertions::const_assert_eq!(std::mem::size_of::<SkinningUniforms>(), 32);

/// Buffers and counts for one skinning dispatch over one submesh.
///
/// Rest-pose, bone and morph buffers cover the whole model and are indexed
/// from `base_vertex`; output buffers cover only the submesh and are
/// indexed from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchParams {
    pub rest_positions: BufferId,
    pub rest_normals: BufferId,
    pub rest_uvs: BufferId,
    pub bone_indices: BufferId,
    pub bone_weights: BufferId,
    pub bone_matrices: BufferId,
    pub morph_offsets: Option<BufferId>,
    pub morph_weights: Option<BufferId>,
    pub uv_morph_offsets: Option<BufferId>,
    pub uv_morph_weights: Option<BufferId>,
    pub out_positions: BufferId,
    pub out_normals: BufferId,
    pub out_uvs: BufferId,
    pub base_vertex: u32,
    pub vertex_count: u32,
    pub total_vertex_count: u32,
    pub bone_count: u32,
    pub morph_count: u32,
    pub uv_morph_count: u32,
}

impl DispatchParams {
    /// The same dispatch with UV morphing switched off.
    pub fn without_uv_morph(self) -> Self {
        Self {
            uv_morph_offsets: None,
            uv_morph_weights: None,
            uv_morph_count: 0,
            ..self
        }
    }

    pub fn uniforms(&self) -> SkinningUniforms {
        SkinningUniforms {
            vertex_count: self.vertex_count,
            base_vertex: self.base_vertex,
            total_vertex_count: self.total_vertex_count,
            bone_count: self.bone_count,
            morph_count: self.morph_count,
            uv_morph_count: self.uv_morph_count,
            _pad: [0; 2],
        }
    }

    fn inputs(&self) -> impl Iterator<Item = BufferId> + '_ {
        [
            Some(self.rest_positions),
            Some(self.rest_normals),
            Some(self.rest_uvs),
            Some(self.bone_indices),
            Some(self.bone_weights),
            Some(self.bone_matrices),
            self.morph_offsets,
            self.morph_weights,
            self.uv_morph_offsets,
            self.uv_morph_weights,
        ]
        .into_iter()
        .flatten()
    }

    /// Check counts and buffer roles.
    pub fn validate(&self) -> Result<(), GraphicsError> {
        if self.vertex_count == 0 {
            return Err(GraphicsError::InvalidParameter(
                "skinning dispatch over zero vertices".into(),
            ));
        }
        if self
            .base_vertex
            .checked_add(self.vertex_count)
            .is_none_or(|end| end > self.total_vertex_count)
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "vertex range {}+{} exceeds model of {} vertices",
                self.base_vertex, self.vertex_count, self.total_vertex_count
            )));
        }
        if self.bone_count > MAX_BONES {
            return Err(GraphicsError::InvalidParameter(format!(
                "bone count {} exceeds {}",
                self.bone_count, MAX_BONES
            )));
        }
        if self.morph_count as usize > MAX_VERTEX_MORPHS
            || self.uv_morph_count as usize > MAX_UV_MORPHS
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "morph counts {}/{} exceed {}/{}",
                self.morph_count, self.uv_morph_count, MAX_VERTEX_MORPHS, MAX_UV_MORPHS
            )));
        }
        if self.morph_count > 0 && (self.morph_offsets.is_none() || self.morph_weights.is_none()) {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} vertex morphs without morph buffers",
                self.morph_count
            )));
        }
        if self.uv_morph_count > 0
            && (self.uv_morph_offsets.is_none() || self.uv_morph_weights.is_none())
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} UV morphs without UV morph buffers",
                self.uv_morph_count
            )));
        }

        let outputs = [self.out_positions, self.out_normals, self.out_uvs];
        for (i, output) in outputs.iter().enumerate() {
            if self.inputs().any(|input| input == *output)
                || outputs[i + 1..].contains(output)
            {
                return Err(GraphicsError::InvalidParameter(format!(
                    "output buffer {output} aliases another skinning buffer"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use super::*;

    fn id(raw: u64) -> BufferId {
        BufferId::new(NonZeroU64::new(raw).unwrap())
    }

    fn params() -> DispatchParams {
        DispatchParams {
            rest_positions: id(1),
            rest_normals: id(2),
            rest_uvs: id(3),
            bone_indices: id(4),
            bone_weights: id(5),
            bone_matrices: id(6),
            morph_offsets: None,
            morph_weights: None,
            uv_morph_offsets: None,
            uv_morph_weights: None,
            out_positions: id(7),
            out_normals: id(8),
            out_uvs: id(9),
            base_vertex: 10,
            vertex_count: 20,
            total_vertex_count: 30,
            bone_count: 4,
            morph_count: 0,
            uv_morph_count: 0,
        }
    }

    #[test]
    fn test_valid_params() {
        params().validate().unwrap();
        let uniforms = params().uniforms();
        assert_eq!(uniforms.base_vertex, 10);
        assert_eq!(uniforms.total_vertex_count, 30);
    }

    #[test]
    fn test_range_past_model_rejected() {
        let params = DispatchParams {
            vertex_count: 21,
            ..params()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_output_aliasing_rejected() {
        let aliased_input = DispatchParams {
            out_normals: id(1),
            ..params()
        };
        assert!(aliased_input.validate().is_err());

        let aliased_output = DispatchParams {
            out_uvs: id(7),
            ..params()
        };
        assert!(aliased_output.validate().is_err());
    }

    #[test]
    fn test_morph_count_requires_buffers() {
        let params = DispatchParams {
            morph_count: 2,
            ..params()
        };
        assert!(params.validate().is_err());

        let params = DispatchParams {
            morph_offsets: Some(id(11)),
            morph_weights: Some(id(12)),
            ..params
        };
        params.validate().unwrap();
    }

    #[test]
    fn test_without_uv_morph() {
        let params = DispatchParams {
            uv_morph_offsets: Some(id(13)),
            uv_morph_weights: Some(id(14)),
            uv_morph_count: 3,
            ..params()
        }
        .without_uv_morph();
        assert_eq!(params.uv_morph_count, 0);
        assert_eq!(params.uv_morph_offsets, None);
        params.validate().unwrap();
    }
}
