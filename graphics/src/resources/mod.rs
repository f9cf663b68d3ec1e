//! Device and staging buffer ownership.
//!
//! - [`BufferPool`] - allocates and releases every buffer the runtime uses
//! - [`DeviceBuffer`] - an owned device buffer, released on drop
//! - [`StagingBuffer`] - host memory for vertex readback
//!
//! [`GraphicsDevice`]: crate::GraphicsDevice

mod buffer;
mod pool;
mod staging;

pub use buffer::DeviceBuffer;
pub use pool::{BufferPool, PoolStats};
pub use staging::StagingBuffer;
