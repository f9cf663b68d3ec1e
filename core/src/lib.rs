//! # toonskin core
//!
//! Host-side model data for the toonskin skinning runtime: asset import,
//! validation and profiling helpers shared with the graphics crate.

pub mod model;
pub mod profiling;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
