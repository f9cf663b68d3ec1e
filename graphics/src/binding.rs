//! Storage binding state capture and restore.
//!
//! The storage binding table on a [`GraphicsDevice`] is shared with the
//! host renderer. Anything that rebinds slots for its own dispatches wraps
//! the work in a [`BindingGuard`] so that the renderer finds every slot as
//! it left it.
//!
//! A captured buffer may be destroyed by a third party while the guard is
//! held. Restoring never rebinds a dead buffer: that slot is unbound instead.
//!
//! # Example
//!
//! ```ignore
//! let mut guard = BindingGuard::capture(&device);
//! device.bind_storage_buffer(0, positions.id())?;
//! device.dispatch_compute(&pipeline, &uniforms, vertex_count)?;
//! guard.restore();
//! ```

use crate::device::GraphicsDevice;
use crate::types::BufferId;

/// The contents of one storage binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageBinding {
    pub buffer: BufferId,
    /// Byte offset of the bound range.
    pub offset: u64,
    /// Byte size of the bound range; `None` binds to the end of the buffer.
    pub size: Option<u64>,
}

impl StorageBinding {
    /// Whole-buffer binding.
    pub fn whole(buffer: BufferId) -> Self {
        Self {
            buffer,
            offset: 0,
            size: None,
        }
    }

    /// Ranged binding.
    pub fn range(buffer: BufferId, offset: u64, size: u64) -> Self {
        Self {
            buffer,
            offset,
            size: Some(size),
        }
    }
}

/// Snapshot of every storage binding slot of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSnapshot {
    slots: Vec<Option<StorageBinding>>,
}

impl BindingSnapshot {
    /// Record the binding of every slot.
    pub fn capture(device: &GraphicsDevice) -> Self {
        Self {
            slots: device.storage_bindings(),
        }
    }

    /// Captured binding of a slot.
    pub fn slot(&self, slot: u32) -> Option<StorageBinding> {
        self.slots.get(slot as usize).copied().flatten()
    }

    /// Put every slot back as captured. Idempotent.
    ///
    /// Slots whose captured buffer has since been destroyed are unbound.
    pub fn restore(&self, device: &GraphicsDevice) {
        for (index, captured) in self.slots.iter().enumerate() {
            let slot = index as u32;
            let result = match captured {
                None => device.unbind_storage_buffer(slot),
                Some(binding) if !device.is_buffer(binding.buffer) => {
                    log::debug!(
                        "BindingSnapshot: slot {} held destroyed buffer {}, unbinding",
                        slot,
                        binding.buffer
                    );
                    device.unbind_storage_buffer(slot)
                }
                Some(StorageBinding {
                    buffer,
                    offset: 0,
                    size: None,
                }) => device.bind_storage_buffer(slot, *buffer),
                Some(StorageBinding {
                    buffer,
                    offset,
                    size,
                }) => {
                    let size = size.unwrap_or_else(|| {
                        device
                            .buffer_size(*buffer)
                            .unwrap_or(*offset)
                            .saturating_sub(*offset)
                    });
                    device.bind_storage_buffer_range(slot, *buffer, *offset, size)
                }
            };

            if let Err(e) = result {
                // The buffer died between the liveness check and the rebind.
                log::warn!("BindingSnapshot: restoring slot {} failed: {}", slot, e);
                let _ = device.unbind_storage_buffer(slot);
            }
        }
    }
}

/// Scoped capture of the storage binding table.
///
/// Restores on [`restore`](Self::restore) or, failing that, on drop.
pub struct BindingGuard<'d> {
    device: &'d GraphicsDevice,
    snapshot: BindingSnapshot,
    restored: bool,
}

impl<'d> BindingGuard<'d> {
    /// Capture the binding table of `device`.
    pub fn capture(device: &'d GraphicsDevice) -> Self {
        Self {
            device,
            snapshot: BindingSnapshot::capture(device),
            restored: false,
        }
    }

    /// The captured state.
    pub fn snapshot(&self) -> &BindingSnapshot {
        &self.snapshot
    }

    /// Put the binding table back as captured. Safe to call repeatedly.
    pub fn restore(&mut self) {
        self.snapshot.restore(self.device);
        self.restored = true;
    }
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        if !self.restored {
            self.snapshot.restore(self.device);
        }
    }
}
