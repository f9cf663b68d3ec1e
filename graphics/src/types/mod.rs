//! Core graphics types.

mod buffer;

pub use buffer::{BufferDescriptor, BufferId, BufferUsage, MemoryBarrier};
