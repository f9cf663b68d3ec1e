//! Error types for model asset import and validation.

/// Errors raised while parsing or validating a model asset.
///
/// Every variant is a load failure: it is produced before any device
/// resource exists for the model.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// The glTF container or document could not be parsed.
    #[cfg(feature = "gltf")]
    #[error("glTF parse error: {0}")]
    Parse(#[from] gltf_dep::Error),
    /// The raw JSON chunk could not be decoded.
    #[error("glTF JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A primitive uses a topology other than triangle lists.
    #[error("unsupported topology in mesh {mesh} primitive {primitive}: {mode}")]
    UnsupportedTopology {
        mesh: usize,
        primitive: usize,
        mode: String,
    },
    /// A required vertex attribute is missing.
    #[error("mesh {mesh} primitive {primitive} has no {attribute} attribute")]
    MissingAttribute {
        mesh: usize,
        primitive: usize,
        attribute: &'static str,
    },
    /// Accessor data could not be read.
    #[error("accessor error: {0}")]
    Accessor(String),
    /// Buffer data could not be resolved.
    #[error("buffer error: {0}")]
    Buffer(String),
    /// The model has no vertices or no submeshes.
    #[error("model '{0}' contains no geometry")]
    Empty(String),
    /// A per-vertex attribute array does not match the vertex count.
    #[error("{attribute} has {actual} entries, expected {expected}")]
    CountMismatch {
        attribute: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A submesh vertex range does not follow the previous one or exceeds the vertex array.
    #[error("submesh {submesh} covers vertices {first}..{end}, expected to start at {expected_first} within {vertex_count}")]
    InvalidSubmeshRange {
        submesh: usize,
        first: u32,
        end: u32,
        expected_first: u32,
        vertex_count: u32,
    },
    /// A triangle index points outside its submesh.
    #[error("submesh {submesh} index {index} is outside its {vertex_count} vertices")]
    IndexOutOfRange {
        submesh: usize,
        index: u32,
        vertex_count: u32,
    },
    /// A submesh index list is not a whole number of triangles.
    #[error("submesh {submesh} has {count} indices, not a multiple of 3")]
    IncompleteTriangles { submesh: usize, count: usize },
    /// A submesh references a material that does not exist.
    #[error("submesh {submesh} references material {material} of {material_count}")]
    InvalidMaterial {
        submesh: usize,
        material: usize,
        material_count: usize,
    },
    /// The declared bone count exceeds the supported maximum.
    #[error("model declares {count} bones, maximum is {max}")]
    TooManyBones { count: u32, max: u32 },
    /// The morph count exceeds the supported maximum.
    #[error("model declares {count} {kind} morphs, maximum is {max}")]
    TooManyMorphs {
        kind: &'static str,
        count: usize,
        max: usize,
    },
    /// A morph offset references a vertex outside the model.
    #[error("{kind} morph '{morph}' references vertex {vertex} of {vertex_count}")]
    MorphVertexOutOfRange {
        kind: &'static str,
        morph: String,
        vertex: u32,
        vertex_count: u32,
    },
    /// Vertex data contains NaN or infinity.
    #[error("{attribute} of vertex {vertex} is not finite")]
    NonFinite {
        attribute: &'static str,
        vertex: usize,
    },
}
