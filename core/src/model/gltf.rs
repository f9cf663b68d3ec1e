//! glTF 2.0 import of skinned models.
//!
//! Every primitive of every mesh becomes one submesh occupying a contiguous
//! range of the model-wide vertex arrays. Morph targets carrying `POSITION`
//! deltas become vertex morphs; targets carrying `TEXCOORD_0` deltas become
//! UV morphs. The typed document does not expose texture-coordinate morph
//! targets, so target layout is read from the raw JSON chunk.
//!
//! # Example
//!
//! ```ignore
//! let bytes = std::fs::read("models/miku/miku.glb")?;
//! let asset = import_gltf(&bytes, "miku", Path::new("models/miku"))?;
//! asset.validate()?;
//! ```

use std::collections::HashMap;
use std::path::Path;

use gltf_dep::accessor::DataType;
use serde::Deserialize;

use super::asset::{MaterialDesc, ModelAsset, SubmeshDesc, UvMorph, VertexMorph};
use super::error::AssetError;

/// Parse a `.glb` or self-contained `.gltf` into a [`ModelAsset`].
///
/// The result is not validated; call [`ModelAsset::validate`] before upload.
pub fn import_gltf(data: &[u8], name: &str, model_dir: &Path) -> Result<ModelAsset, AssetError> {
    crate::profile_function!();

    let gltf = gltf_dep::Gltf::from_slice(data)?;
    let raw = RawDocument::from_container(data)?;
    let buffers = resolve_buffers(&gltf.document, gltf.blob.clone())?;
    let accessors: Vec<gltf_dep::Accessor<'_>> = gltf.document.accessors().collect();

    let mut asset = ModelAsset {
        name: name.to_string(),
        bone_count: gltf
            .document
            .skins()
            .next()
            .map_or(0, |skin| skin.joints().count() as u32),
        materials: gltf
            .document
            .materials()
            .map(|m| material_desc(&m, model_dir))
            .collect(),
        ..Default::default()
    };
    let default_material = asset.materials.len();
    let mut needs_default_material = false;

    for mesh in gltf.document.meshes() {
        let mesh_index = mesh.index();
        let raw_mesh = raw.meshes.get(mesh_index);
        let (vertex_slots, uv_slots) = register_morphs(&mut asset, raw_mesh);

        for primitive in mesh.primitives() {
            let prim_index = primitive.index();
            if primitive.mode() != gltf_dep::mesh::Mode::Triangles {
                return Err(AssetError::UnsupportedTopology {
                    mesh: mesh_index,
                    primitive: prim_index,
                    mode: format!("{:?}", primitive.mode()),
                });
            }

            let required = |semantic: gltf_dep::Semantic, attribute: &'static str| {
                primitive.get(&semantic).ok_or(AssetError::MissingAttribute {
                    mesh: mesh_index,
                    primitive: prim_index,
                    attribute,
                })
            };

            let positions = read_components(&required(gltf_dep::Semantic::Positions, "POSITION")?, &buffers)?;
            let normals = read_components(&required(gltf_dep::Semantic::Normals, "NORMAL")?, &buffers)?;
            let vertex_count = positions.len() / 3;
            check_len("NORMAL", vertex_count * 3, normals.len())?;

            let uvs = match primitive.get(&gltf_dep::Semantic::TexCoords(0)) {
                Some(accessor) => read_components(&accessor, &buffers)?,
                None => vec![0.0; vertex_count * 2],
            };
            check_len("TEXCOORD_0", vertex_count * 2, uvs.len())?;

            let joints = match primitive.get(&gltf_dep::Semantic::Joints(0)) {
                Some(accessor) => read_integers(&accessor, &buffers)?,
                None => vec![0; vertex_count * 4],
            };
            check_len("JOINTS_0", vertex_count * 4, joints.len())?;

            let weights = match primitive.get(&gltf_dep::Semantic::Weights(0)) {
                Some(accessor) => read_components(&accessor, &buffers)?,
                None => vec![0.0; vertex_count * 4],
            };
            check_len("WEIGHTS_0", vertex_count * 4, weights.len())?;

            let indices = match primitive.indices() {
                Some(accessor) => read_integers(&accessor, &buffers)?,
                None => (0..vertex_count as u32).collect(),
            };

            let material = primitive.material().index().unwrap_or_else(|| {
                needs_default_material = true;
                default_material
            });

            let first_vertex = asset.positions.len() as u32;
            asset
                .positions
                .extend(positions.chunks_exact(3).map(|c| [c[0], c[1], c[2]]));
            asset
                .normals
                .extend(normals.chunks_exact(3).map(|c| [c[0], c[1], c[2]]));
            asset.uvs.extend(uvs.chunks_exact(2).map(|c| [c[0], c[1]]));
            asset.bone_indices.extend(
                joints
                    .chunks_exact(4)
                    .map(|c| [c[0] as i32, c[1] as i32, c[2] as i32, c[3] as i32]),
            );
            asset
                .bone_weights
                .extend(weights.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]));

            if let Some(raw_prim) = raw_mesh.and_then(|m| m.primitives.get(prim_index)) {
                for (t, target) in raw_prim.targets.iter().enumerate() {
                    if let (Some(slot), Some(&index)) =
                        (vertex_slots.get(t).copied().flatten(), target.get("POSITION"))
                    {
                        let deltas = read_components(accessor_at(&accessors, index)?, &buffers)?;
                        check_len("morph POSITION", vertex_count * 3, deltas.len())?;
                        asset.vertex_morphs[slot].offsets.extend(
                            deltas
                                .chunks_exact(3)
                                .enumerate()
                                .filter(|(_, d)| d.iter().any(|c| *c != 0.0))
                                .map(|(i, d)| (first_vertex + i as u32, [d[0], d[1], d[2]])),
                        );
                    }
                    if let (Some(slot), Some(&index)) =
                        (uv_slots.get(t).copied().flatten(), target.get("TEXCOORD_0"))
                    {
                        let deltas = read_components(accessor_at(&accessors, index)?, &buffers)?;
                        check_len("morph TEXCOORD_0", vertex_count * 2, deltas.len())?;
                        asset.uv_morphs[slot].offsets.extend(
                            deltas
                                .chunks_exact(2)
                                .enumerate()
                                .filter(|(_, d)| d.iter().any(|c| *c != 0.0))
                                .map(|(i, d)| (first_vertex + i as u32, [d[0], d[1]])),
                        );
                    }
                }
            }

            asset.submeshes.push(SubmeshDesc {
                first_vertex,
                vertex_count: vertex_count as u32,
                indices,
                material,
            });
        }
    }

    if needs_default_material || asset.materials.is_empty() {
        asset.materials.push(MaterialDesc::default());
    }

    log::debug!(
        "Imported '{}': {} vertices, {} submeshes, {} bones, {} vertex morphs, {} uv morphs",
        asset.name,
        asset.vertex_count(),
        asset.submeshes.len(),
        asset.bone_count,
        asset.vertex_morphs.len(),
        asset.uv_morphs.len()
    );

    Ok(asset)
}

/// Allocate morph slots for one mesh's targets; returns per-target slot indices.
fn register_morphs(
    asset: &mut ModelAsset,
    raw_mesh: Option<&RawMesh>,
) -> (Vec<Option<usize>>, Vec<Option<usize>>) {
    let Some(raw_mesh) = raw_mesh else {
        return (Vec::new(), Vec::new());
    };
    let target_count = raw_mesh
        .primitives
        .iter()
        .map(|p| p.targets.len())
        .max()
        .unwrap_or(0);
    let names = raw_mesh.target_names();

    let has = |t: usize, key: &str| {
        raw_mesh
            .primitives
            .iter()
            .any(|p| p.targets.get(t).is_some_and(|target| target.contains_key(key)))
    };

    let mut vertex_slots = vec![None; target_count];
    let mut uv_slots = vec![None; target_count];
    for t in 0..target_count {
        if has(t, "POSITION") {
            let slot = asset.vertex_morphs.len();
            vertex_slots[t] = Some(slot);
            asset.vertex_morphs.push(VertexMorph {
                name: names.get(t).cloned().unwrap_or_else(|| format!("morph_{slot}")),
                offsets: Vec::new(),
            });
        }
        if has(t, "TEXCOORD_0") {
            let slot = asset.uv_morphs.len();
            uv_slots[t] = Some(slot);
            asset.uv_morphs.push(UvMorph {
                name: names.get(t).cloned().unwrap_or_else(|| format!("uv_morph_{slot}")),
                offsets: Vec::new(),
            });
        }
    }
    (vertex_slots, uv_slots)
}

fn material_desc(material: &gltf_dep::Material<'_>, model_dir: &Path) -> MaterialDesc {
    let pbr = material.pbr_metallic_roughness();
    let texture = pbr
        .base_color_texture()
        .and_then(|info| match info.texture().source().source() {
            gltf_dep::image::Source::Uri { uri, .. } if !uri.starts_with("data:") => {
                Some(model_dir.join(uri))
            }
            _ => None,
        });

    MaterialDesc {
        name: material
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("material_{}", material.index().unwrap_or(0))),
        texture,
        alpha: pbr.base_color_factor()[3],
        double_sided: material.double_sided(),
    }
}

fn check_len(attribute: &'static str, expected: usize, actual: usize) -> Result<(), AssetError> {
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

fn accessor_at<'a, 'd>(
    accessors: &'a [gltf_dep::Accessor<'d>],
    index: usize,
) -> Result<&'a gltf_dep::Accessor<'d>, AssetError> {
    accessors
        .get(index)
        .ok_or_else(|| AssetError::Accessor(format!("accessor index {index} out of range")))
}

// ============================================================================
// Raw JSON view
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default)]
    meshes: Vec<RawMesh>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMesh {
    #[serde(default)]
    primitives: Vec<RawPrimitive>,
    #[serde(default)]
    extras: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawPrimitive {
    #[serde(default)]
    targets: Vec<HashMap<String, usize>>,
}

impl RawDocument {
    fn from_container(data: &[u8]) -> Result<Self, AssetError> {
        if data.starts_with(b"glTF") {
            let glb = gltf_dep::Glb::from_slice(data)?;
            Ok(serde_json::from_slice(&glb.json)?)
        } else {
            Ok(serde_json::from_slice(data)?)
        }
    }
}

impl RawMesh {
    fn target_names(&self) -> Vec<String> {
        self.extras
            .get("targetNames")
            .and_then(|v| v.as_array())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// Accessor and buffer helpers
// ============================================================================

/// Locate an accessor's bytes, returning `(data, stride)` or `None` for
/// view-less accessors, which read as zeros.
fn accessor_bytes<'a>(
    accessor: &gltf_dep::Accessor<'_>,
    buffers: &'a [Vec<u8>],
) -> Result<Option<(&'a [u8], usize)>, AssetError> {
    if accessor.sparse().is_some() {
        return Err(AssetError::Accessor(format!(
            "accessor {} is sparse (not supported)",
            accessor.index()
        )));
    }
    let Some(view) = accessor.view() else {
        return Ok(None);
    };

    let buffer_index = view.buffer().index();
    let buffer_data = buffers
        .get(buffer_index)
        .ok_or_else(|| AssetError::Buffer(format!("buffer index {buffer_index} out of range")))?;

    let element_size = accessor.data_type().size() * accessor.dimensions().multiplicity();
    let stride = view.stride().unwrap_or(element_size);
    let start = view.offset().checked_add(accessor.offset());
    let end = start.and_then(|start| {
        accessor_span(accessor.count(), stride, element_size).and_then(|len| start.checked_add(len))
    });
    match (start, end) {
        (Some(start), Some(end)) if end <= buffer_data.len() => {
            Ok(Some((&buffer_data[start..end], stride)))
        }
        _ => Err(AssetError::Accessor(format!(
            "accessor {} reads past the end of buffer {buffer_index}",
            accessor.index()
        ))),
    }
}

/// Bytes covered by `count` elements laid out `stride` apart, or `None`
/// if that does not fit in `usize`.
fn accessor_span(count: usize, stride: usize, element_size: usize) -> Option<usize> {
    match count {
        0 => Some(0),
        n => (n - 1).checked_mul(stride)?.checked_add(element_size),
    }
}

/// Read an accessor as flat `f32` components, applying normalization.
fn read_components(
    accessor: &gltf_dep::Accessor<'_>,
    buffers: &[Vec<u8>],
) -> Result<Vec<f32>, AssetError> {
    let components = accessor.dimensions().multiplicity();
    let count = accessor.count();
    let Some((data, stride)) = accessor_bytes(accessor, buffers)? else {
        return Ok(vec![0.0; count * components]);
    };

    let data_type = accessor.data_type();
    let normalized = accessor.normalized();
    let size = data_type.size();
    let mut result = Vec::with_capacity(count * components);

    for i in 0..count {
        for c in 0..components {
            let at = i * stride + c * size;
            let b = &data[at..at + size];
            let value = match data_type {
                DataType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                DataType::U8 if normalized => b[0] as f32 / 255.0,
                DataType::U8 => b[0] as f32,
                DataType::I8 if normalized => (b[0] as i8 as f32 / 127.0).max(-1.0),
                DataType::I8 => b[0] as i8 as f32,
                DataType::U16 if normalized => u16::from_le_bytes([b[0], b[1]]) as f32 / 65535.0,
                DataType::U16 => u16::from_le_bytes([b[0], b[1]]) as f32,
                DataType::I16 if normalized => {
                    (i16::from_le_bytes([b[0], b[1]]) as f32 / 32767.0).max(-1.0)
                }
                DataType::I16 => i16::from_le_bytes([b[0], b[1]]) as f32,
                DataType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
            };
            result.push(value);
        }
    }

    Ok(result)
}

/// Read an unsigned integer accessor (indices, joints) as flat `u32` components.
fn read_integers(
    accessor: &gltf_dep::Accessor<'_>,
    buffers: &[Vec<u8>],
) -> Result<Vec<u32>, AssetError> {
    let components = accessor.dimensions().multiplicity();
    let count = accessor.count();
    let Some((data, stride)) = accessor_bytes(accessor, buffers)? else {
        return Ok(vec![0; count * components]);
    };

    let data_type = accessor.data_type();
    let size = data_type.size();
    let mut result = Vec::with_capacity(count * components);

    for i in 0..count {
        for c in 0..components {
            let at = i * stride + c * size;
            let b = &data[at..at + size];
            result.push(match data_type {
                DataType::U8 => b[0] as u32,
                DataType::U16 => u16::from_le_bytes([b[0], b[1]]) as u32,
                DataType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                other => {
                    return Err(AssetError::Accessor(format!(
                        "accessor {} has non-integer component type {other:?}",
                        accessor.index()
                    )));
                }
            });
        }
    }

    Ok(result)
}

/// Resolve all buffer data from the glTF document.
///
/// For binary glTF the embedded blob backs `Source::Bin`; otherwise only
/// base64 data URIs are accepted.
fn resolve_buffers(
    document: &gltf_dep::Document,
    blob: Option<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, AssetError> {
    let mut buffers = Vec::new();

    for buffer in document.buffers() {
        match buffer.source() {
            gltf_dep::buffer::Source::Bin => {
                let data = blob.as_ref().ok_or_else(|| {
                    AssetError::Buffer("binary buffer referenced but no blob present".into())
                })?;
                buffers.push(data.clone());
            }
            gltf_dep::buffer::Source::Uri(uri) => match parse_data_uri(uri) {
                Some(data) => buffers.push(data),
                None => {
                    return Err(AssetError::Buffer(format!(
                        "external buffer URIs not supported: {uri}"
                    )));
                }
            },
        }
    }

    Ok(buffers)
}

fn parse_data_uri(uri: &str) -> Option<Vec<u8>> {
    let rest = uri.strip_prefix("data:")?;
    let base64_start = rest.find(";base64,")?;
    base64_decode(&rest[base64_start + 8..])
}

/// Standard-alphabet base64. Padding is optional; a lone trailing
/// character or a `=` before the end is rejected.
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    fn sextet(c: u8) -> Option<u32> {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => return None,
        };
        Some(u32::from(value))
    }

    let symbols: Vec<u8> = input.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    let data = symbols
        .strip_suffix(b"==")
        .or_else(|| symbols.strip_suffix(b"="))
        .unwrap_or(&symbols);
    if data.len() % 4 == 1 {
        return None;
    }

    let mut out = Vec::with_capacity(data.len() * 3 / 4);
    let (mut acc, mut bits) = (0u32, 0u32);
    for &c in data {
        acc = (acc << 6) | sextet(c)?;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Some(out)
}
