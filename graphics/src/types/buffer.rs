//! Buffer types and descriptors.

use std::num::NonZeroU64;

use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 0;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 1;
        /// Buffer can be used as a uniform buffer.
        const UNIFORM = 1 << 2;
        /// Buffer can be used as a storage buffer.
        const STORAGE = 1 << 3;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 5;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 6;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Visibility scopes for writes made by a compute dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryBarrier: u32 {
        /// Later vertex fetches observe the writes.
        const VERTEX_ATTRIB_ARRAY = 1 << 0;
        /// Later storage-buffer reads observe the writes.
        const SHADER_STORAGE = 1 << 1;
        /// Later buffer reads and copies observe the writes.
        const BUFFER_UPDATE = 1 << 2;
    }
}

/// Identifier of a live device buffer.
///
/// Ids are never reused, so a stale id reliably reports as dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(NonZeroU64);

impl BufferId {
    pub(crate) fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    /// Raw numeric value, for logging.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    /// Read-only storage buffer filled once at upload.
    pub fn storage(size: u64) -> Self {
        Self::new(size, BufferUsage::STORAGE | BufferUsage::COPY_DST)
    }

    /// Storage buffer written by compute and consumed as vertex input.
    pub fn vertex_output(size: u64) -> Self {
        Self::new(
            size,
            BufferUsage::STORAGE | BufferUsage::VERTEX | BufferUsage::COPY_SRC,
        )
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
