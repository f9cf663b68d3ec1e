//! # toonskin graphics
//!
//! GPU skinning and model resource lifecycle for toonskin.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GraphicsDevice`] - backend wrapper with a shared storage binding table
//! - [`BufferPool`] - owner of every device and staging buffer
//! - [`SkinningEngine`] - the bone, vertex morph and UV morph compute kernel
//! - [`BindingGuard`] - saves and restores the binding table around a dispatch
//! - [`ModelLoader`] / [`LoadWorker`] - two-phase model loading
//! - [`ModelCache`] - active and pending-release tiers with TTL and LRU eviction
//! - [`SkinningPass`] - per-frame upload, dispatch and hand-off to a renderer
//! - Backends: CPU reference (always) and wgpu (`wgpu-backend` feature)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use toonskin_graphics::*;
//!
//! let device = GraphicsDevice::create(BackendType::Auto)?;
//! device.bind_render_thread();
//! let pool = BufferPool::new(device);
//! let engine = SkinningEngine::new(&pool)?;
//! let loader = ModelLoader::new(pool.clone());
//! let cache = ModelCache::new("models", CacheConfig::default(), Arc::new(SystemClock));
//!
//! let model = Arc::new(loader.load_blocking(&LoadRequest::new("miku.glb"))?);
//! cache.put("miku", model.clone());
//!
//! // each frame
//! SkinningPass::new(&engine).run(&model, &AnimationFrame::animating(&bones), &mut renderer)?;
//! cache.tick(|_, model| pool.dispose(model));
//! ```

pub mod backend;
pub mod binding;
pub mod cache;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod loader;
pub mod model;
pub mod profiling;
pub mod resources;
pub mod skinning;
pub mod types;

// Re-export main types for convenience
pub use backend::{BackendType, CpuBackend, GpuBackend, create_backend, has_gpu_backend};
pub use binding::{BindingGuard, BindingSnapshot, StorageBinding};
pub use cache::{CacheStats, Clock, ManualClock, ModelCache, SystemClock, TickReport};
pub use config::{CacheConfig, ConfigError, LoaderConfig, RuntimeConfig};
pub use device::GraphicsDevice;
pub use diagnostics::DiagnosticsReport;
pub use error::{DisposeError, GraphicsError};
pub use frame::{
    AnimationFrame, PassReport, PlaybackState, PosedMeshSink, PosedSubmesh, RendererCapabilities,
    SkinningPass,
};
pub use loader::{
    LoadError, LoadFailureKind, LoadRequest, LoadTicket, LoadWorker, ModelLoader, PreparedModel,
};
pub use model::{GpuModel, ModelStats, PosedVertices, SubmeshBuffers, SubmeshState};
pub use resources::{BufferPool, DeviceBuffer, PoolStats, StagingBuffer};
pub use skinning::{DispatchParams, SkinningEngine};
pub use types::{BufferDescriptor, BufferId, BufferUsage, MemoryBarrier};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// Only logs the version; safe to call more than once.
pub fn init() {
    log::info!("toonskin graphics v{} initialized", VERSION);
}
