//! Profiling support via Tracy.
//!
//! Re-exports the CPU profiling macros from [`toonskin_core::profiling`].
//! They compile to nothing unless the `profiling` feature is enabled:
//!
//! ```bash
//! cargo run --features profiling
//! ```
//!
//! ```ignore
//! use toonskin_graphics::profiling::{frame_mark, profile_scope};
//!
//! fn render_frame() {
//!     {
//!         profile_scope!("skinning");
//!         // dispatch ...
//!     }
//!     frame_mark!();
//! }
//! ```

pub use toonskin_core::profiling::*;
