//! Host-side model asset data.

use std::path::PathBuf;

use serde::Serialize;

use super::error::AssetError;

/// A single vertex as supplied to [`ModelAssetBuilder::submesh`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkinnedVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    /// Bone indices. Entries outside `0..bone_count` are ignored when skinning.
    pub joints: [i32; 4],
    pub weights: [f32; 4],
}

impl SkinnedVertex {
    /// Vertex bound entirely to one bone.
    pub fn rigid(position: [f32; 3], normal: [f32; 3], bone: i32) -> Self {
        Self {
            position,
            normal,
            uv: [0.0; 2],
            joints: [bone, 0, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        }
    }

    /// Set the texture coordinate.
    pub fn with_uv(mut self, uv: [f32; 2]) -> Self {
        self.uv = uv;
        self
    }

    /// Set up to four bone influences.
    pub fn with_influences(mut self, joints: [i32; 4], weights: [f32; 4]) -> Self {
        self.joints = joints;
        self.weights = weights;
        self
    }
}

/// A contiguous vertex range drawn with one material.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmeshDesc {
    /// First vertex of the range in the model-wide vertex arrays.
    pub first_vertex: u32,
    pub vertex_count: u32,
    /// Triangle list, relative to `first_vertex`.
    pub indices: Vec<u32>,
    pub material: usize,
}

/// Material parameters the skinning runtime carries for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialDesc {
    pub name: String,
    /// Diffuse texture, resolved against the model directory.
    pub texture: Option<PathBuf>,
    /// Base opacity.
    pub alpha: f32,
    pub double_sided: bool,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            name: "default".into(),
            texture: None,
            alpha: 1.0,
            double_sided: false,
        }
    }
}

/// A named set of per-vertex position offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexMorph {
    pub name: String,
    /// `(vertex, offset)` pairs; vertices are model-wide.
    pub offsets: Vec<(u32, [f32; 3])>,
}

/// A named set of per-vertex texture-coordinate offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct UvMorph {
    pub name: String,
    pub offsets: Vec<(u32, [f32; 2])>,
}

/// Fully parsed model, ready for validation and upload.
#[derive(Debug, Clone, Default)]
pub struct ModelAsset {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub bone_indices: Vec<[i32; 4]>,
    pub bone_weights: Vec<[f32; 4]>,
    pub submeshes: Vec<SubmeshDesc>,
    pub materials: Vec<MaterialDesc>,
    /// Declared skeleton size; sizes the bone-matrix buffer.
    pub bone_count: u32,
    pub vertex_morphs: Vec<VertexMorph>,
    pub uv_morphs: Vec<UvMorph>,
}

impl ModelAsset {
    /// Start building an asset in memory.
    pub fn builder(name: impl Into<String>) -> ModelAssetBuilder {
        ModelAssetBuilder::new(name)
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.submeshes.iter().map(|s| s.indices.len() / 3).sum()
    }

    /// Vertex-morph offsets as a dense morph-major table:
    /// `(morph * vertex_count + vertex) * 3`.
    pub fn dense_vertex_morph_offsets(&self) -> Vec<f32> {
        dense_table(
            self.vertex_count(),
            self.vertex_morphs.iter().map(|m| m.offsets.as_slice()),
        )
    }

    /// UV-morph offsets as a dense morph-major table:
    /// `(morph * vertex_count + vertex) * 2`.
    pub fn dense_uv_morph_offsets(&self) -> Vec<f32> {
        dense_table(
            self.vertex_count(),
            self.uv_morphs.iter().map(|m| m.offsets.as_slice()),
        )
    }

    /// Bytes of host memory held by this asset.
    pub fn host_bytes(&self) -> u64 {
        let vertices = self.vertex_count() * (12 + 12 + 8 + 16 + 16);
        let indices: usize = self.submeshes.iter().map(|s| s.indices.len() * 4).sum();
        let morphs: usize = self.vertex_morphs.iter().map(|m| m.offsets.len() * 16).sum::<usize>()
            + self.uv_morphs.iter().map(|m| m.offsets.len() * 12).sum::<usize>();
        (vertices + indices + morphs) as u64
    }

    /// Metadata kept alongside the device resources once the asset is uploaded.
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            vertex_count: self.vertex_count() as u32,
            face_count: self.face_count() as u32,
            bone_count: self.bone_count,
            submeshes: self
                .submeshes
                .iter()
                .map(|s| SubmeshInfo {
                    first_vertex: s.first_vertex,
                    vertex_count: s.vertex_count,
                    index_count: s.indices.len() as u32,
                    material: s.material,
                })
                .collect(),
            materials: self.materials.clone(),
            vertex_morphs: self.vertex_morphs.iter().map(|m| m.name.clone()).collect(),
            uv_morphs: self.uv_morphs.iter().map(|m| m.name.clone()).collect(),
        }
    }
}

fn dense_table<'a, const N: usize>(
    vertex_count: usize,
    morphs: impl ExactSizeIterator<Item = &'a [(u32, [f32; N])]>,
) -> Vec<f32> {
    let mut table = vec![0.0f32; morphs.len() * vertex_count * N];
    for (m, offsets) in morphs.enumerate() {
        for &(vertex, delta) in offsets {
            let base = (m * vertex_count + vertex as usize) * N;
            for (c, d) in delta.iter().enumerate() {
                table[base + c] += d;
            }
        }
    }
    table
}

/// Per-submesh metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmeshInfo {
    pub first_vertex: u32,
    pub vertex_count: u32,
    pub index_count: u32,
    pub material: usize,
}

/// Model metadata without vertex payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub vertex_count: u32,
    pub face_count: u32,
    pub bone_count: u32,
    pub submeshes: Vec<SubmeshInfo>,
    pub materials: Vec<MaterialDesc>,
    pub vertex_morphs: Vec<String>,
    pub uv_morphs: Vec<String>,
}

impl ModelInfo {
    /// Vertex count of the largest submesh.
    pub fn max_submesh_vertices(&self) -> u32 {
        self.submeshes
            .iter()
            .map(|s| s.vertex_count)
            .max()
            .unwrap_or(0)
    }
}

/// Incremental construction of a [`ModelAsset`].
///
/// # Example
///
/// ```ignore
/// let asset = ModelAsset::builder("cube")
///     .bone_count(1)
///     .submesh(&vertices, indices, 0)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct ModelAssetBuilder {
    asset: ModelAsset,
}

impl ModelAssetBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            asset: ModelAsset {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn bone_count(mut self, count: u32) -> Self {
        self.asset.bone_count = count;
        self
    }

    pub fn material(mut self, material: MaterialDesc) -> Self {
        self.asset.materials.push(material);
        self
    }

    /// Append a submesh. Indices are relative to the submesh's first vertex.
    pub fn submesh(mut self, vertices: &[SkinnedVertex], indices: Vec<u32>, material: usize) -> Self {
        let first_vertex = self.asset.positions.len() as u32;
        for v in vertices {
            self.asset.positions.push(v.position);
            self.asset.normals.push(v.normal);
            self.asset.uvs.push(v.uv);
            self.asset.bone_indices.push(v.joints);
            self.asset.bone_weights.push(v.weights);
        }
        self.asset.submeshes.push(SubmeshDesc {
            first_vertex,
            vertex_count: vertices.len() as u32,
            indices,
            material,
        });
        self
    }

    /// Append a vertex morph addressed by model-wide vertex indices.
    pub fn vertex_morph(mut self, name: impl Into<String>, offsets: Vec<(u32, [f32; 3])>) -> Self {
        self.asset.vertex_morphs.push(VertexMorph {
            name: name.into(),
            offsets,
        });
        self
    }

    /// Append a UV morph addressed by model-wide vertex indices.
    pub fn uv_morph(mut self, name: impl Into<String>, offsets: Vec<(u32, [f32; 2])>) -> Self {
        self.asset.uv_morphs.push(UvMorph {
            name: name.into(),
            offsets,
        });
        self
    }

    /// Validate and return the asset. A default material is added when none was given.
    pub fn build(mut self) -> Result<ModelAsset, AssetError> {
        if self.asset.materials.is_empty() {
            self.asset.materials.push(MaterialDesc::default());
        }
        self.asset.validate()?;
        Ok(self.asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Vec<SkinnedVertex> {
        vec![
            SkinnedVertex::rigid([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], 0),
            SkinnedVertex::rigid([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], 0),
            SkinnedVertex::rigid([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], 0),
        ]
    }

    #[test]
    fn test_builder_concatenates_submeshes() {
        let asset = ModelAsset::builder("pair")
            .bone_count(1)
            .submesh(&triangle(), vec![0, 1, 2], 0)
            .submesh(&triangle(), vec![2, 1, 0], 0)
            .build()
            .unwrap();

        assert_eq!(asset.vertex_count(), 6);
        assert_eq!(asset.face_count(), 2);
        assert_eq!(asset.submeshes[1].first_vertex, 3);
        assert_eq!(asset.materials.len(), 1);
    }

    #[test]
    fn test_dense_tables_are_morph_major() {
        let asset = ModelAsset::builder("morphs")
            .bone_count(1)
            .submesh(&triangle(), vec![0, 1, 2], 0)
            .vertex_morph("a", vec![(1, [1.0, 2.0, 3.0])])
            .vertex_morph("b", vec![(2, [0.5, 0.0, 0.0])])
            .uv_morph("scroll", vec![(0, [0.25, -0.25])])
            .build()
            .unwrap();

        let table = asset.dense_vertex_morph_offsets();
        assert_eq!(table.len(), 2 * 3 * 3);
        assert_eq!(&table[3..6], &[1.0, 2.0, 3.0]);
        assert_eq!(table[(3 + 2) * 3], 0.5);

        let uv = asset.dense_uv_morph_offsets();
        assert_eq!(uv, vec![0.25, -0.25, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_info_reports_largest_submesh() {
        let quad = [triangle(), triangle()].concat();
        let asset = ModelAsset::builder("info")
            .bone_count(2)
            .submesh(&triangle(), vec![0, 1, 2], 0)
            .submesh(&quad, vec![0, 1, 2, 3, 4, 5], 0)
            .build()
            .unwrap();

        let info = asset.info();
        assert_eq!(info.max_submesh_vertices(), 6);
        assert_eq!(info.submeshes[1].index_count, 6);
        assert_eq!(info.bone_count, 2);
    }
}
