//! Structural validation of parsed assets.
//!
//! Validation runs before any device upload so that a malformed asset is
//! rejected without touching device memory.

use super::asset::ModelAsset;
use super::error::AssetError;
use super::{MAX_BONES, MAX_UV_MORPHS, MAX_VERTEX_MORPHS};

impl ModelAsset {
    /// Check counts, ranges and limits.
    pub fn validate(&self) -> Result<(), AssetError> {
        let vertex_count = self.vertex_count();
        if vertex_count == 0 || self.submeshes.is_empty() {
            return Err(AssetError::Empty(self.name.clone()));
        }

        check_count("normals", vertex_count, self.normals.len())?;
        check_count("uvs", vertex_count, self.uvs.len())?;
        check_count("bone indices", vertex_count, self.bone_indices.len())?;
        check_count("bone weights", vertex_count, self.bone_weights.len())?;

        if self.bone_count > MAX_BONES {
            return Err(AssetError::TooManyBones {
                count: self.bone_count,
                max: MAX_BONES,
            });
        }
        if self.vertex_morphs.len() > MAX_VERTEX_MORPHS {
            return Err(AssetError::TooManyMorphs {
                kind: "vertex",
                count: self.vertex_morphs.len(),
                max: MAX_VERTEX_MORPHS,
            });
        }
        if self.uv_morphs.len() > MAX_UV_MORPHS {
            return Err(AssetError::TooManyMorphs {
                kind: "uv",
                count: self.uv_morphs.len(),
                max: MAX_UV_MORPHS,
            });
        }

        self.validate_submeshes()?;

        for (vertex, (p, n)) in self.positions.iter().zip(&self.normals).enumerate() {
            if !p.iter().all(|c| c.is_finite()) {
                return Err(AssetError::NonFinite {
                    attribute: "position",
                    vertex,
                });
            }
            if !n.iter().all(|c| c.is_finite()) {
                return Err(AssetError::NonFinite {
                    attribute: "normal",
                    vertex,
                });
            }
        }

        let limit = vertex_count as u32;
        for morph in &self.vertex_morphs {
            if let Some(&(vertex, _)) = morph.offsets.iter().find(|(v, _)| *v >= limit) {
                return Err(AssetError::MorphVertexOutOfRange {
                    kind: "vertex",
                    morph: morph.name.clone(),
                    vertex,
                    vertex_count: limit,
                });
            }
        }
        for morph in &self.uv_morphs {
            if let Some(&(vertex, _)) = morph.offsets.iter().find(|(v, _)| *v >= limit) {
                return Err(AssetError::MorphVertexOutOfRange {
                    kind: "uv",
                    morph: morph.name.clone(),
                    vertex,
                    vertex_count: limit,
                });
            }
        }

        Ok(())
    }

    fn validate_submeshes(&self) -> Result<(), AssetError> {
        let vertex_count = self.vertex_count() as u32;
        let mut expected_first = 0u32;

        for (i, submesh) in self.submeshes.iter().enumerate() {
            let end = submesh.first_vertex.saturating_add(submesh.vertex_count);
            if submesh.first_vertex != expected_first || submesh.vertex_count == 0 || end > vertex_count {
                return Err(AssetError::InvalidSubmeshRange {
                    submesh: i,
                    first: submesh.first_vertex,
                    end,
                    expected_first,
                    vertex_count,
                });
            }
            expected_first = end;

            if submesh.indices.len() % 3 != 0 {
                return Err(AssetError::IncompleteTriangles {
                    submesh: i,
                    count: submesh.indices.len(),
                });
            }
            if let Some(&index) = submesh.indices.iter().find(|&&idx| idx >= submesh.vertex_count) {
                return Err(AssetError::IndexOutOfRange {
                    submesh: i,
                    index,
                    vertex_count: submesh.vertex_count,
                });
            }
            if submesh.material >= self.materials.len() {
                return Err(AssetError::InvalidMaterial {
                    submesh: i,
                    material: submesh.material,
                    material_count: self.materials.len(),
                });
            }
        }

        if expected_first != vertex_count {
            log::warn!(
                "Model '{}': {} vertices are not referenced by any submesh",
                self.name,
                vertex_count - expected_first
            );
        }

        Ok(())
    }
}

fn check_count(attribute: &'static str, expected: usize, actual: usize) -> Result<(), AssetError> {
    if expected == actual {
        Ok(())
    } else {
        Err(AssetError::CountMismatch {
            attribute,
            expected,
            actual,
        })
    }
}
