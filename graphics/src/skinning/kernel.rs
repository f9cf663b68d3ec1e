//! Host implementation of the skinning kernel.
//!
//! Mirrors `skinning.wgsl` vertex for vertex. The CPU backend runs it as
//! the pipeline's host kernel.

use glam::{Mat3, Mat4, Vec2, Vec3};

use crate::backend::HostDispatch;
use crate::error::GraphicsError;

use super::params::SkinningUniforms;
use super::slots;

/// Vertex morphs with weight at or below this contribute nothing.
pub const VERTEX_MORPH_THRESHOLD: f32 = 0.001;

/// UV morphs with absolute weight at or below this contribute nothing.
pub const UV_MORPH_THRESHOLD: f32 = 0.0001;

/// Total valid bone weight below which a vertex keeps its unskinned pose.
pub const BONE_WEIGHT_EPSILON: f32 = 1e-6;

/// One posed vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosedVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

/// Flat views of every kernel input.
///
/// Bone matrices are row-major, 16 floats per bone. Morph tables are dense
/// and morph-major over the whole model.
#[derive(Debug, Clone, Copy)]
pub struct SkinningInputs<'a> {
    pub rest_positions: &'a [f32],
    pub rest_normals: &'a [f32],
    pub rest_uvs: &'a [f32],
    pub bone_indices: &'a [i32],
    pub bone_weights: &'a [f32],
    pub bone_matrices: &'a [f32],
    pub morph_offsets: &'a [f32],
    pub morph_weights: &'a [f32],
    pub uv_morph_offsets: &'a [f32],
    pub uv_morph_weights: &'a [f32],
    pub total_vertex_count: u32,
    pub bone_count: u32,
    pub morph_count: u32,
    pub uv_morph_count: u32,
}

fn require(name: &str, len: usize, needed: usize) -> Result<(), GraphicsError> {
    if len < needed {
        return Err(GraphicsError::InvalidParameter(format!(
            "{name} holds {len} values, skinning needs {needed}"
        )));
    }
    Ok(())
}

impl SkinningInputs<'_> {
    /// Check that every buffer covers what the kernel will read.
    pub fn check(&self) -> Result<(), GraphicsError> {
        let vertices = self.total_vertex_count as usize;
        require("rest positions", self.rest_positions.len(), vertices * 3)?;
        require("rest normals", self.rest_normals.len(), vertices * 3)?;
        require("rest uvs", self.rest_uvs.len(), vertices * 2)?;
        require("bone indices", self.bone_indices.len(), vertices * 4)?;
        require("bone weights", self.bone_weights.len(), vertices * 4)?;
        require("bone matrices", self.bone_matrices.len(), self.bone_count as usize * 16)?;

        let morphs = self.morph_count as usize;
        require("morph offsets", self.morph_offsets.len(), morphs * vertices * 3)?;
        require("morph weights", self.morph_weights.len(), morphs)?;

        let uv_morphs = self.uv_morph_count as usize;
        require("uv morph offsets", self.uv_morph_offsets.len(), uv_morphs * vertices * 2)?;
        require("uv morph weights", self.uv_morph_weights.len(), uv_morphs)
    }

    fn bone_matrix(&self, bone: usize) -> Mat4 {
        Mat4::from_cols_slice(&self.bone_matrices[bone * 16..bone * 16 + 16]).transpose()
    }

    /// Pose vertex `v` (a model-wide index). Inputs must pass [`check`](Self::check).
    pub fn skin_vertex(&self, v: usize) -> PosedVertex {
        let total = self.total_vertex_count as usize;
        let rest_position = Vec3::from_slice(&self.rest_positions[v * 3..]);
        let rest_normal = Vec3::from_slice(&self.rest_normals[v * 3..]);

        let mut position = rest_position;
        for m in 0..self.morph_count as usize {
            let weight = self.morph_weights[m];
            if weight > VERTEX_MORPH_THRESHOLD {
                position += Vec3::from_slice(&self.morph_offsets[(m * total + v) * 3..]) * weight;
            }
        }

        let mut skin = Mat4::ZERO;
        let mut weight_sum = 0.0;
        for k in 0..4 {
            let bone = self.bone_indices[v * 4 + k];
            let weight = self.bone_weights[v * 4 + k];
            if bone < 0 || bone as u32 >= self.bone_count || weight <= 0.0 {
                continue;
            }
            skin += self.bone_matrix(bone as usize) * weight;
            weight_sum += weight;
        }

        let (position, normal) = if weight_sum > BONE_WEIGHT_EPSILON {
            let skin = skin * (1.0 / weight_sum);
            let posed = (skin * position.extend(1.0)).truncate();
            let normal = (Mat3::from_mat4(skin) * rest_normal)
                .try_normalize()
                .unwrap_or(rest_normal);
            (posed, normal)
        } else {
            (position, rest_normal)
        };

        let mut uv = Vec2::from_slice(&self.rest_uvs[v * 2..]);
        for m in 0..self.uv_morph_count as usize {
            let weight = self.uv_morph_weights[m];
            if weight.abs() > UV_MORPH_THRESHOLD {
                uv += Vec2::from_slice(&self.uv_morph_offsets[(m * total + v) * 2..]) * weight;
            }
        }

        PosedVertex {
            position,
            normal,
            uv,
        }
    }
}

/// Host kernel registered with the skinning pipeline.
pub(crate) fn skin_host(dispatch: &mut HostDispatch<'_>) -> Result<(), GraphicsError> {
    let uniforms: SkinningUniforms = dispatch.uniforms()?;
    let inputs = SkinningInputs {
        rest_positions: dispatch.input_f32(slots::REST_POSITIONS)?,
        rest_normals: dispatch.input_f32(slots::REST_NORMALS)?,
        rest_uvs: dispatch.input_f32(slots::REST_UVS)?,
        bone_indices: dispatch.input_i32(slots::BONE_INDICES)?,
        bone_weights: dispatch.input_f32(slots::BONE_WEIGHTS)?,
        bone_matrices: dispatch.input_f32(slots::BONE_MATRICES)?,
        morph_offsets: dispatch.input_f32(slots::MORPH_OFFSETS)?,
        morph_weights: dispatch.input_f32(slots::MORPH_WEIGHTS)?,
        uv_morph_offsets: dispatch.input_f32(slots::UV_MORPH_OFFSETS)?,
        uv_morph_weights: dispatch.input_f32(slots::UV_MORPH_WEIGHTS)?,
        total_vertex_count: uniforms.total_vertex_count,
        bone_count: uniforms.bone_count,
        morph_count: uniforms.morph_count,
        uv_morph_count: uniforms.uv_morph_count,
    };
    inputs.check()?;

    let count = dispatch.invocations().min(uniforms.vertex_count) as usize;
    let base = uniforms.base_vertex as usize;
    if base + count > uniforms.total_vertex_count as usize {
        return Err(GraphicsError::InvalidParameter(format!(
            "vertex range {base}+{count} exceeds {} vertices",
            uniforms.total_vertex_count
        )));
    }

    let [positions, normals, uvs] = dispatch.outputs_f32([
        slots::SKINNED_POSITIONS,
        slots::SKINNED_NORMALS,
        slots::SKINNED_UVS,
    ])?;
    require("skinned positions", positions.len(), count * 3)?;
    require("skinned normals", normals.len(), count * 3)?;
    require("skinned uvs", uvs.len(), count * 2)?;

    for local in 0..count {
        let posed = inputs.skin_vertex(base + local);
        posed.position.write_to_slice(&mut positions[local * 3..local * 3 + 3]);
        posed.normal.write_to_slice(&mut normals[local * 3..local * 3 + 3]);
        posed.uv.write_to_slice(&mut uvs[local * 2..local * 2 + 2]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use glam::Quat;
    use rstest::rstest;

    use super::*;

    struct Fixture {
        positions: Vec<f32>,
        normals: Vec<f32>,
        uvs: Vec<f32>,
        indices: Vec<i32>,
        weights: Vec<f32>,
        bones: Vec<f32>,
        morph_offsets: Vec<f32>,
        morph_weights: Vec<f32>,
        uv_offsets: Vec<f32>,
        uv_weights: Vec<f32>,
        bone_count: u32,
    }

    fn row_major(m: Mat4) -> [f32; 16] {
        m.transpose().to_cols_array()
    }

    impl Fixture {
        /// One vertex at (1, 2, 3) with normal +Y.
        fn single(joints: [i32; 4], weights: [f32; 4], bones: &[Mat4]) -> Self {
            Self {
                positions: vec![1.0, 2.0, 3.0],
                normals: vec![0.0, 1.0, 0.0],
                uvs: vec![0.25, 0.75],
                indices: joints.to_vec(),
                weights: weights.to_vec(),
                bones: bones.iter().flat_map(|m| row_major(*m)).collect(),
                morph_offsets: Vec::new(),
                morph_weights: Vec::new(),
                uv_offsets: Vec::new(),
                uv_weights: Vec::new(),
                bone_count: bones.len() as u32,
            }
        }

        fn inputs(&self) -> SkinningInputs<'_> {
            SkinningInputs {
                rest_positions: &self.positions,
                rest_normals: &self.normals,
                rest_uvs: &self.uvs,
                bone_indices: &self.indices,
                bone_weights: &self.weights,
                bone_matrices: &self.bones,
                morph_offsets: &self.morph_offsets,
                morph_weights: &self.morph_weights,
                uv_morph_offsets: &self.uv_offsets,
                uv_morph_weights: &self.uv_weights,
                total_vertex_count: (self.positions.len() / 3) as u32,
                bone_count: self.bone_count,
                morph_count: self.morph_weights.len() as u32,
                uv_morph_count: self.uv_weights.len() as u32,
            }
        }

        fn skin(&self) -> PosedVertex {
            let inputs = self.inputs();
            inputs.check().unwrap();
            inputs.skin_vertex(0)
        }
    }

    fn assert_near(a: Vec3, b: Vec3) {
        assert!(a.abs_diff_eq(b, 1e-5), "{a:?} != {b:?}");
    }

    #[test]
    fn test_identity_bone_keeps_rest_pose() {
        let fixture = Fixture::single([0, 0, 0, 0], [1.0, 0.0, 0.0, 0.0], &[Mat4::IDENTITY]);
        let posed = fixture.skin();
        assert_near(posed.position, Vec3::new(1.0, 2.0, 3.0));
        assert_near(posed.normal, Vec3::Y);
        assert_eq!(posed.uv, Vec2::new(0.25, 0.75));
    }

    #[test]
    fn test_translation_moves_position_not_normal() {
        let bone = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let fixture = Fixture::single([0, -1, -1, -1], [1.0, 0.0, 0.0, 0.0], &[bone]);
        let posed = fixture.skin();
        assert_near(posed.position, Vec3::new(11.0, 2.0, 3.0));
        assert_near(posed.normal, Vec3::Y);
    }

    #[test]
    fn test_rotation_turns_normal() {
        let bone = Mat4::from_quat(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let fixture = Fixture::single([0, 0, 0, 0], [1.0, 0.0, 0.0, 0.0], &[bone]);
        let posed = fixture.skin();
        assert_near(posed.position, Vec3::new(-2.0, 1.0, 3.0));
        assert_near(posed.normal, Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_weights_are_renormalized() {
        let a = Mat4::from_translation(Vec3::X * 2.0);
        let b = Mat4::from_translation(Vec3::Y * 4.0);
        // 0.2 and 0.2 renormalize to 0.5 each.
        let fixture = Fixture::single([0, 1, 0, 0], [0.2, 0.2, 0.0, 0.0], &[a, b]);
        let posed = fixture.skin();
        assert_near(posed.position, Vec3::new(2.0, 4.0, 3.0));
    }

    #[rstest]
    #[case::all_zero([0, 1, 0, 1], [0.0, 0.0, 0.0, 0.0])]
    #[case::negative_index([-1, -2, -3, -4], [1.0, 1.0, 1.0, 1.0])]
    #[case::index_past_bone_count([2, 5, 9, 2], [0.5, 0.5, 0.5, 0.5])]
    #[case::negative_weights([0, 1, 0, 1], [-1.0, -0.5, 0.0, 0.0])]
    fn test_degenerate_weights_fall_back_to_identity(
        #[case] joints: [i32; 4],
        #[case] weights: [f32; 4],
    ) {
        let bones = [
            Mat4::from_translation(Vec3::splat(5.0)),
            Mat4::from_scale(Vec3::splat(3.0)),
        ];
        let fixture = Fixture::single(joints, weights, &bones);
        let posed = fixture.skin();
        assert_near(posed.position, Vec3::new(1.0, 2.0, 3.0));
        assert_near(posed.normal, Vec3::Y);
    }

    #[test]
    fn test_invalid_entries_ignored_among_valid() {
        let bone = Mat4::from_translation(Vec3::Z);
        let fixture = Fixture::single([0, 7, -1, 0], [0.5, 0.9, 0.9, 0.5], &[bone]);
        let posed = fixture.skin();
        assert_near(posed.position, Vec3::new(1.0, 2.0, 4.0));
    }

    #[test]
    fn test_collapsed_normal_falls_back_to_rest() {
        let bone = Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0));
        let fixture = Fixture::single([0, 0, 0, 0], [1.0, 0.0, 0.0, 0.0], &[bone]);
        let posed = fixture.skin();
        assert_near(posed.normal, Vec3::Y);
        assert_near(posed.position, Vec3::new(1.0, 0.0, 3.0));
    }

    #[rstest]
    #[case::zero(0.0, 1.0)]
    #[case::below_threshold(0.0009, 1.0)]
    #[case::at_threshold(0.001, 1.0)]
    #[case::negative(-0.5, 1.0)]
    #[case::half(0.5, 2.0)]
    #[case::full(1.0, 3.0)]
    fn test_vertex_morph_threshold(#[case] weight: f32, #[case] expected_x: f32) {
        let mut fixture = Fixture::single([0, 0, 0, 0], [1.0, 0.0, 0.0, 0.0], &[Mat4::IDENTITY]);
        fixture.morph_offsets = vec![2.0, 0.0, 0.0];
        fixture.morph_weights = vec![weight];
        let posed = fixture.skin();
        assert!((posed.position.x - expected_x).abs() < 1e-5);
    }

    #[test]
    fn test_morph_applies_before_skinning() {
        let bone = Mat4::from_scale(Vec3::splat(2.0));
        let mut fixture = Fixture::single([0, 0, 0, 0], [1.0, 0.0, 0.0, 0.0], &[bone]);
        fixture.morph_offsets = vec![1.0, 0.0, 0.0];
        fixture.morph_weights = vec![1.0];
        assert_near(fixture.skin().position, Vec3::new(4.0, 4.0, 6.0));
    }

    #[test]
    fn test_morph_applies_under_identity_fallback() {
        let mut fixture = Fixture::single([0, 0, 0, 0], [0.0; 4], &[Mat4::IDENTITY]);
        fixture.morph_offsets = vec![0.0, 1.0, 0.0];
        fixture.morph_weights = vec![1.0];
        assert_near(fixture.skin().position, Vec3::new(1.0, 3.0, 3.0));
    }

    #[rstest]
    #[case::zero(0.0, 0.25)]
    #[case::below_threshold(0.00009, 0.25)]
    #[case::positive(0.5, 0.75)]
    #[case::negative(-0.25, 0.0)]
    fn test_uv_morph_signed_weights(#[case] weight: f32, #[case] expected_u: f32) {
        let mut fixture = Fixture::single([0, 0, 0, 0], [1.0, 0.0, 0.0, 0.0], &[Mat4::IDENTITY]);
        fixture.uv_offsets = vec![1.0, 0.0];
        fixture.uv_weights = vec![weight];
        let posed = fixture.skin();
        assert!((posed.uv.x - expected_u).abs() < 1e-6);
        assert_eq!(posed.uv.y, 0.75);
    }

    #[test]
    fn test_short_buffers_rejected() {
        let mut fixture = Fixture::single([0, 0, 0, 0], [1.0, 0.0, 0.0, 0.0], &[Mat4::IDENTITY]);
        fixture.morph_weights = vec![1.0];
        assert!(fixture.inputs().check().is_err());
    }
}
