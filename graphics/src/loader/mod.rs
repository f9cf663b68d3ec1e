//! Two-phase model loading.
//!
//! - **Phase 1** ([`ModelLoader::prepare`], [`ModelLoader::prepare_asset`])
//!   runs on any thread. It reads and parses the asset, validates it, and
//!   uploads the static buffers (rest pose, skin weights, morph tables).
//!   Nothing is allocated on the device before validation passes.
//! - **Phase 2** ([`ModelLoader::finalize`]) runs on the render thread. It
//!   allocates the per-submesh output and index buffers, the bone-matrix
//!   buffer, the morph-weight buffers and the staging buffer. If any
//!   allocation fails, everything allocated so far is released before the
//!   error is returned.
//!
//! [`LoadWorker`] runs Phase 1 on background threads.

mod error;
mod worker;

use std::path::{Path, PathBuf};

use toonskin_core::model::{ModelAsset, ModelInfo, import_gltf};

use crate::config::LoaderConfig;
use crate::model::{
    BONE_MATRIX_SIZE, GpuModel, POSITION_STRIDE, StaticBuffers, SubmeshBuffers, UV_STRIDE,
};
use crate::profiling::{profile_function, profile_scope};
use crate::resources::{BufferPool, DeviceBuffer};
use crate::types::{BufferDescriptor, BufferUsage};

pub use error::{LoadError, LoadFailureKind};
pub use worker::{LoadTicket, LoadWorker};

/// What to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// `.glb` or `.gltf` file.
    pub asset_path: PathBuf,
    /// Directory textures and side data are resolved against.
    pub model_dir: PathBuf,
    /// Animation layer count; the loader default when `None`.
    pub layer_count: Option<u32>,
}

impl LoadRequest {
    /// Load `asset_path`, resolving side data next to it.
    pub fn new(asset_path: impl Into<PathBuf>) -> Self {
        let asset_path = asset_path.into();
        let model_dir = asset_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            asset_path,
            model_dir,
            layer_count: None,
        }
    }

    pub fn with_model_dir(mut self, model_dir: impl Into<PathBuf>) -> Self {
        self.model_dir = model_dir.into();
        self
    }

    pub fn with_layer_count(mut self, layer_count: u32) -> Self {
        self.layer_count = Some(layer_count);
        self
    }
}

/// Output of the first load phase, ready for [`ModelLoader::finalize`].
///
/// Owns the static device buffers; dropping it releases them.
pub struct PreparedModel {
    asset: ModelAsset,
    statics: StaticBuffers,
    layer_count: u32,
}

impl PreparedModel {
    pub fn name(&self) -> &str {
        &self.asset.name
    }

    pub fn info(&self) -> ModelInfo {
        self.asset.info()
    }

    pub fn vertex_count(&self) -> usize {
        self.asset.vertex_count()
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    /// Host memory held by the parsed asset.
    pub fn host_bytes(&self) -> u64 {
        self.asset.host_bytes()
    }

    /// Device memory held by the static buffers.
    pub fn device_bytes(&self) -> u64 {
        self.statics.device_bytes()
    }
}

impl std::fmt::Debug for PreparedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedModel")
            .field("name", &self.asset.name)
            .field("vertices", &self.asset.vertex_count())
            .field("layer_count", &self.layer_count)
            .finish()
    }
}

/// Builds [`GpuModel`]s in two phases.
pub struct ModelLoader {
    pool: BufferPool,
    config: LoaderConfig,
}

impl ModelLoader {
    pub fn new(pool: BufferPool) -> Self {
        Self::with_config(pool, LoaderConfig::default())
    }

    pub fn with_config(pool: BufferPool, config: LoaderConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    // ========================================================================
    // Phase 1
    // ========================================================================

    /// Phase 1 from a file on disk.
    pub fn prepare(&self, request: &LoadRequest) -> Result<PreparedModel, LoadError> {
        profile_function!();
        let extension = request
            .asset_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if extension != "glb" && extension != "gltf" {
            return Err(LoadError::UnsupportedFormat(
                request.asset_path.display().to_string(),
            ));
        }

        let data = std::fs::read(&request.asset_path).map_err(|source| LoadError::Io {
            path: request.asset_path.clone(),
            source,
        })?;
        let name = request
            .asset_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model");
        let asset = {
            profile_scope!("parse");
            import_gltf(&data, name, &request.model_dir)?
        };
        self.prepare_asset(asset, request.layer_count)
    }

    /// Phase 1 from an in-memory asset.
    pub fn prepare_asset(
        &self,
        asset: ModelAsset,
        layer_count: Option<u32>,
    ) -> Result<PreparedModel, LoadError> {
        profile_function!();
        asset.validate()?;

        let statics = self.upload_statics(&asset)?;
        log::debug!(
            "ModelLoader: prepared {:?} ({} vertices, {} static bytes)",
            asset.name,
            asset.vertex_count(),
            statics.device_bytes()
        );
        Ok(PreparedModel {
            asset,
            statics,
            layer_count: layer_count.unwrap_or(self.config.default_layer_count),
        })
    }

    fn upload(&self, label: String, contents: &[u8]) -> Result<DeviceBuffer, LoadError> {
        self.pool
            .create_buffer_init(
                &BufferDescriptor::storage(contents.len() as u64).with_label(label),
                contents,
            )
            .map_err(LoadError::device("static buffers"))
    }

    fn upload_statics(&self, asset: &ModelAsset) -> Result<StaticBuffers, LoadError> {
        profile_scope!("upload_statics");
        let name = &asset.name;
        let morph_offsets = if asset.vertex_morphs.is_empty() {
            None
        } else {
            let table = asset.dense_vertex_morph_offsets();
            Some(self.upload(format!("{name}/morph_offsets"), bytemuck::cast_slice(&table))?)
        };
        let uv_morph_offsets = if asset.uv_morphs.is_empty() {
            None
        } else {
            let table = asset.dense_uv_morph_offsets();
            Some(self.upload(format!("{name}/uv_morph_offsets"), bytemuck::cast_slice(&table))?)
        };

        Ok(StaticBuffers {
            rest_positions: self.upload(
                format!("{name}/rest_positions"),
                bytemuck::cast_slice(&asset.positions),
            )?,
            rest_normals: self.upload(
                format!("{name}/rest_normals"),
                bytemuck::cast_slice(&asset.normals),
            )?,
            rest_uvs: self.upload(format!("{name}/rest_uvs"), bytemuck::cast_slice(&asset.uvs))?,
            bone_indices: self.upload(
                format!("{name}/bone_indices"),
                bytemuck::cast_slice(&asset.bone_indices),
            )?,
            bone_weights: self.upload(
                format!("{name}/bone_weights"),
                bytemuck::cast_slice(&asset.bone_weights),
            )?,
            morph_offsets,
            uv_morph_offsets,
        })
    }

    // ========================================================================
    // Phase 2
    // ========================================================================

    /// Phase 2: allocate the remaining device objects.
    ///
    /// Must run on the render thread. The prepared model is consumed either
    /// way; on failure every buffer it owned and every buffer this call
    /// allocated has been released.
    pub fn finalize(&self, prepared: PreparedModel) -> Result<GpuModel, LoadError> {
        profile_function!();
        if !self.pool.device().is_render_thread() {
            return Err(LoadError::NotRenderThread);
        }

        let PreparedModel {
            asset,
            statics,
            layer_count,
        } = prepared;
        let info = asset.info();
        let name = &info.name;

        let mut submeshes = Vec::with_capacity(asset.submeshes.len());
        for (index, submesh) in asset.submeshes.iter().enumerate() {
            let vertices = submesh.vertex_count as u64;
            let output = |what: &str, stride: u64| {
                self.pool
                    .create_buffer(
                        &BufferDescriptor::vertex_output(vertices * stride)
                            .with_label(format!("{name}/{index}/{what}")),
                    )
                    .map_err(LoadError::device("submesh output buffers"))
            };
            let positions = output("positions", POSITION_STRIDE)?;
            let normals = output("normals", POSITION_STRIDE)?;
            let uvs = output("uvs", UV_STRIDE)?;
            let index_bytes: &[u8] = bytemuck::cast_slice(&submesh.indices);
            let indices = self
                .pool
                .create_buffer_init(
                    &BufferDescriptor::new(
                        (index_bytes.len() as u64).max(4),
                        BufferUsage::INDEX | BufferUsage::COPY_DST,
                    )
                    .with_label(format!("{name}/{index}/indices")),
                    index_bytes,
                )
                .map_err(LoadError::device("index buffers"))?;
            submeshes.push(SubmeshBuffers {
                positions,
                normals,
                uvs,
                indices,
                index_count: submesh.indices.len() as u32,
            });
        }

        // Bones start at identity so an un-animated model shows its rest pose.
        let bone_slots = info.bone_count.max(1) as usize;
        let identity = glam::Mat4::IDENTITY.to_cols_array();
        let bones = vec![identity; bone_slots];
        let bone_matrices = self
            .pool
            .create_buffer_init(
                &BufferDescriptor::storage(bone_slots as u64 * BONE_MATRIX_SIZE)
                    .with_label(format!("{name}/bone_matrices")),
                bytemuck::cast_slice(&bones),
            )
            .map_err(LoadError::device("bone matrices"))?;

        let weights = |count: usize, what: &str| -> Result<Option<DeviceBuffer>, LoadError> {
            if count == 0 {
                return Ok(None);
            }
            let zeros = vec![0.0f32; count];
            self.pool
                .create_buffer_init(
                    &BufferDescriptor::storage(count as u64 * 4)
                        .with_label(format!("{name}/{what}")),
                    bytemuck::cast_slice(&zeros),
                )
                .map(Some)
                .map_err(LoadError::device("morph weights"))
        };
        let morph_weights = weights(info.vertex_morphs.len(), "morph_weights")?;
        let uv_morph_weights = weights(info.uv_morphs.len(), "uv_morph_weights")?;

        let largest = info.max_submesh_vertices() as u64;
        let staging = self
            .pool
            .create_staging(largest * (POSITION_STRIDE * 2 + UV_STRIDE));

        log::info!(
            "ModelLoader: loaded {:?} ({} submeshes, {} vertices, {} bones)",
            info.name,
            submeshes.len(),
            info.vertex_count,
            info.bone_count
        );
        Ok(GpuModel::new(
            info,
            layer_count,
            statics,
            bone_matrices,
            morph_weights,
            uv_morph_weights,
            submeshes,
            staging,
        ))
    }

    /// Run both phases on the calling thread, which must be the render thread.
    pub fn load_blocking(&self, request: &LoadRequest) -> Result<GpuModel, LoadError> {
        let prepared = self.prepare(request)?;
        self.finalize(prepared)
    }
}

impl std::fmt::Debug for ModelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLoader")
            .field("config", &self.config)
            .finish()
    }
}
