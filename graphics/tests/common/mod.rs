//! Common utilities for the integration tests.
//!
//! Every test runs on the CPU reference backend, which executes the
//! skinning kernel on the host.

#![allow(dead_code)]

use std::sync::Arc;

use toonskin_core::model::{ModelAsset, SkinnedVertex};
use toonskin_graphics::{
    BufferPool, CacheConfig, CpuBackend, GpuModel, GraphicsDevice, ManualClock, ModelCache,
    ModelLoader, PosedMeshSink, PosedSubmesh, PosedVertices, RendererCapabilities, SkinningEngine,
};

pub const EPSILON: f32 = 1e-4;

/// Enable `RUST_LOG` output for a test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device, pool, engine and loader on a fresh CPU backend, with the test
/// thread bound as render thread.
pub struct TestContext {
    pub device: Arc<GraphicsDevice>,
    pub pool: BufferPool,
    pub engine: SkinningEngine,
    pub loader: Arc<ModelLoader>,
    pub clock: Arc<ManualClock>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_backend(CpuBackend::new())
    }

    /// Context whose backend refuses allocations beyond `bytes`.
    pub fn with_memory_budget(bytes: u64) -> Self {
        Self::with_backend(CpuBackend::with_memory_budget(bytes))
    }

    fn with_backend(backend: CpuBackend) -> Self {
        init_logging();
        let device = GraphicsDevice::new(Arc::new(backend));
        device.bind_render_thread();
        let pool = BufferPool::new(device.clone());
        let engine = SkinningEngine::new(&pool).expect("skinning pipeline");
        let loader = Arc::new(ModelLoader::new(pool.clone()));
        Self {
            device,
            pool,
            engine,
            loader,
            clock: Arc::new(ManualClock::new()),
        }
    }

    pub fn cache(&self, config: CacheConfig) -> ModelCache<Arc<GpuModel>> {
        ModelCache::new("models", config, self.clock.clone())
    }

    pub fn load(&self, asset: ModelAsset) -> Arc<GpuModel> {
        let prepared = self.loader.prepare_asset(asset, None).expect("phase 1");
        Arc::new(self.loader.finalize(prepared).expect("phase 2"))
    }
}

/// A strip of `vertices` vertices spread over `bones` bones, split into two
/// submeshes. Vertices blend two neighbouring bones.
pub fn strip_model(name: &str, vertices: usize, bones: u32) -> ModelAsset {
    let make = |i: usize| {
        let x = i as f32 * 0.1;
        let bone = (i as u32 * bones / vertices as u32) as i32;
        let next = (bone + 1).min(bones as i32 - 1);
        SkinnedVertex::rigid([x, (i % 3) as f32, 0.5], [0.0, 1.0, 0.0], bone)
            .with_uv([x / 10.0, 0.25])
            .with_influences([bone, next, 0, 0], [0.75, 0.25, 0.0, 0.0])
    };
    let all: Vec<SkinnedVertex> = (0..vertices).map(make).collect();
    let half = vertices / 2;
    let triangles = |count: usize| -> Vec<u32> {
        (0..count.saturating_sub(2) as u32)
            .flat_map(|i| [i, i + 1, i + 2])
            .collect()
    };

    ModelAsset::builder(name)
        .bone_count(bones)
        .submesh(&all[..half], triangles(half), 0)
        .submesh(&all[half..], triangles(vertices - half), 0)
        .vertex_morph("lift", vec![(0, [0.0, 1.0, 0.0]), (half as u32, [0.0, 2.0, 0.0])])
        .uv_morph("scroll", vec![(1, [0.5, 0.0])])
        .build()
        .expect("valid strip")
}

/// Row-major identity matrices.
pub fn identity_bones(count: usize) -> Vec<[f32; 16]> {
    vec![glam::Mat4::IDENTITY.transpose().to_cols_array(); count]
}

/// Row-major translation matrix.
pub fn translation(x: f32, y: f32, z: f32) -> [f32; 16] {
    glam::Mat4::from_translation(glam::Vec3::new(x, y, z))
        .transpose()
        .to_cols_array()
}

/// Rest-pose vertices of a submesh, in the layout of [`PosedVertices`].
pub fn rest_vertices(asset: &ModelAsset, submesh: usize) -> PosedVertices {
    let desc = &asset.submeshes[submesh];
    let range = desc.first_vertex as usize..(desc.first_vertex + desc.vertex_count) as usize;
    PosedVertices {
        positions: asset.positions[range.clone()].to_vec(),
        normals: asset.normals[range.clone()].to_vec(),
        uvs: asset.uvs[range].to_vec(),
    }
}

pub fn assert_close<const N: usize>(actual: &[[f32; N]], expected: &[[f32; N]]) {
    assert_eq!(actual.len(), expected.len(), "vertex count");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        for k in 0..N {
            assert!(
                (a[k] - e[k]).abs() < EPSILON,
                "vertex {i} component {k}: {a:?} != {e:?}"
            );
        }
    }
}

/// What a [`RecordingSink`] saw for one submesh.
#[derive(Debug)]
pub struct DrawRecord {
    pub index: usize,
    pub alpha: f32,
    pub host: Option<PosedVertices>,
}

/// Renderer stand-in that records every draw.
#[derive(Default)]
pub struct RecordingSink {
    pub capabilities: RendererCapabilities,
    pub draws: Vec<DrawRecord>,
}

impl RecordingSink {
    pub fn with_readback() -> Self {
        Self {
            capabilities: RendererCapabilities::HOST_READBACK,
            draws: Vec::new(),
        }
    }
}

impl PosedMeshSink for RecordingSink {
    fn capabilities(&self) -> RendererCapabilities {
        self.capabilities
    }

    fn draw(&mut self, submesh: PosedSubmesh<'_>) {
        self.draws.push(DrawRecord {
            index: submesh.index,
            alpha: submesh.state.alpha,
            host: submesh.host,
        });
    }
}
