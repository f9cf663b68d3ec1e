//! Load error types.

use std::path::PathBuf;

use toonskin_core::model::AssetError;

use crate::error::GraphicsError;

/// Broad class of a load failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadFailureKind {
    /// The asset could not be read or is malformed. No device memory was
    /// allocated.
    LoadFailure,
    /// A device allocation failed; everything allocated by the failing call
    /// was released before returning.
    DeviceAllocationFailure,
}

/// Errors returned by [`ModelLoader`](super::ModelLoader).
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The asset file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The asset is malformed.
    #[error("invalid asset: {0}")]
    Asset(#[from] AssetError),

    /// The asset's file format is not supported.
    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),

    /// A device allocation or upload failed.
    #[error("device allocation failed while creating {stage}: {source}")]
    DeviceAllocation {
        stage: &'static str,
        #[source]
        source: GraphicsError,
    },

    /// The second load phase was called off the render thread.
    #[error("model finalization must run on the render thread")]
    NotRenderThread,

    /// The background load worker has shut down.
    #[error("load worker is not running")]
    WorkerUnavailable,
}

impl LoadError {
    pub(crate) fn device(stage: &'static str) -> impl FnOnce(GraphicsError) -> Self {
        move |source| Self::DeviceAllocation { stage, source }
    }

    /// The broad class of this failure.
    pub fn kind(&self) -> LoadFailureKind {
        match self {
            Self::DeviceAllocation { .. } => LoadFailureKind::DeviceAllocationFailure,
            _ => LoadFailureKind::LoadFailure,
        }
    }
}
