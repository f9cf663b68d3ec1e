//! Graphics error types.

/// Errors that can occur in the graphics system.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphicsError {
    /// Failed to initialize the graphics system.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// Failed to create a resource.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// A requested feature is not supported.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    /// Out of device memory.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    /// The device was lost.
    #[error("device lost")]
    DeviceLost,
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Shader module or pipeline creation failed.
    #[error("shader compilation failed: {0}")]
    ShaderCompilationFailed(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure reported by a cache disposer.
///
/// Disposal failures are logged by the cache and never abort eviction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisposeError {
    /// Another holder still references the value; its resources are freed
    /// when that holder lets go.
    #[error("value is still referenced by {holders} other holder(s)")]
    StillReferenced { holders: usize },
    /// Releasing a device resource failed.
    #[error("releasing {resource} failed: {reason}")]
    ReleaseFailed { resource: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory {
            requested: 64,
            available: 0,
        };
        assert_eq!(
            err.to_string(),
            "out of device memory: requested 64 bytes, 0 available"
        );

        let err = GraphicsError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no GPU found");

        let err = DisposeError::StillReferenced { holders: 2 };
        assert_eq!(err.to_string(), "value is still referenced by 2 other holder(s)");
    }
}
