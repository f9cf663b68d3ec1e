//! Host staging memory.

use std::sync::Arc;

use crate::error::GraphicsError;

use super::DeviceBuffer;
use super::pool::PoolShared;

/// Word-aligned host memory used to move vertex data off the device.
///
/// Staging buffers are counted by the pool that created them and give the
/// memory back when dropped.
pub struct StagingBuffer {
    words: Vec<u32>,
    pool: Arc<PoolShared>,
}

impl StagingBuffer {
    pub(super) fn new(size: u64, pool: Arc<PoolShared>) -> Self {
        Self {
            words: vec![0; size.div_ceil(4) as usize],
            pool,
        }
    }

    /// Capacity in bytes.
    pub fn size(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    /// Copy `size` bytes of `buffer` at `offset` into the start of this
    /// staging buffer and return them as `f32` values.
    pub fn copy_from(
        &mut self,
        buffer: &DeviceBuffer,
        offset: u64,
        size: u64,
    ) -> Result<&[f32], GraphicsError> {
        if size > self.size() || size % 4 != 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "staging copy of {size} bytes does not fit {} bytes",
                self.size()
            )));
        }
        let bytes = buffer.read(offset, size)?;
        let words = (size / 4) as usize;
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut self.words[..words]);
        dst.copy_from_slice(&bytes);
        Ok(bytemuck::cast_slice(&self.words[..words]))
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.pool.release_staging(self.words.len() as u64 * 4);
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("size", &self.size())
            .finish()
    }
}
