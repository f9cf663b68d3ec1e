//! Model assets: parsed geometry, skin and morph data held in host memory.
//!
//! This is the output of the first load phase. Nothing here touches a
//! device; the graphics crate uploads a validated [`ModelAsset`] and keeps
//! its [`ModelInfo`] alongside the device resources.

mod asset;
mod error;
#[cfg(feature = "gltf")]
mod gltf;
mod validate;

pub use asset::{
    MaterialDesc, ModelAsset, ModelAssetBuilder, ModelInfo, SkinnedVertex, SubmeshDesc,
    SubmeshInfo, UvMorph, VertexMorph,
};
pub use error::AssetError;
#[cfg(feature = "gltf")]
pub use gltf::import_gltf;

/// Upper bound on the declared bone count of a model.
pub const MAX_BONES: u32 = 2048;

/// Upper bound on vertex morphs per model.
pub const MAX_VERTEX_MORPHS: usize = 1024;

/// Upper bound on UV morphs per model.
pub const MAX_UV_MORPHS: usize = 256;
