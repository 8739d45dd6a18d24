//! Per-frame resources and the dynamic uniform offset allocator.
//!
//! One [`FrameSlot`] exists per swapchain image and is indexed by the
//! acquired image index, never round-robin. The slot's fence guarantees
//! the GPU has drained the previous use of the slot before its command
//! buffer or uniform buffer is touched again.

use keel_vk::ash::vk;
use keel_vk::buffer::HostVisibleBuffer;
use keel_vk::descriptor::DescriptorSet;
use keel_vk::sync::Fence;
use thiserror::Error;

/// Capacity of each frame slot's uniform buffer in bytes.
pub const PER_FRAME_UNIFORM_BYTES: u32 = 65535;

/// Bytes each draw claims from the uniform buffer: one column-major
/// 4x4 float matrix.
pub const TRANSFORM_FIELD_BYTES: u32 = 64;

/// Everything owned by one swapchain image's frame slot.
///
/// The command buffer is allocated from the device's shared pool and is
/// freed with it; the fence starts signaled so the first use of the
/// slot does not wait.
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub commands_complete: Fence,
    pub uniform: HostVisibleBuffer,
    pub mutable_set: DescriptorSet,
}

#[derive(Debug, Error)]
#[error(
    "Frame uniform buffer is full: draw needs bytes {needed_start}..{needed_end} of {capacity}"
)]
pub struct UniformBudgetExceeded {
    pub needed_start: u32,
    pub needed_end: u32,
    pub capacity: u32,
}

/// Allocates aligned offsets into one frame slot's uniform buffer.
///
/// Offsets are handed out front to back and every offset is a multiple
/// of the device's minimum dynamic uniform alignment, so they are valid
/// dynamic offsets for a `UNIFORM_BUFFER_DYNAMIC` binding.
#[derive(Debug)]
pub struct UniformCursor {
    offset: u32,
    alignment: u32,
    capacity: u32,
}

impl UniformCursor {
    /// `alignment` must be a power of two (Vulkan guarantees this for
    /// `minUniformBufferOffsetAlignment`).
    pub fn new(alignment: u32, capacity: u32) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            offset: 0,
            alignment,
            capacity,
        }
    }

    /// Claim `size` bytes and return the offset they start at.
    ///
    /// The cursor advances to the next alignment boundary past the
    /// claimed range, so consecutive claims never overlap.
    pub fn push(&mut self, size: u32) -> Result<u32, UniformBudgetExceeded> {
        let claimed = self.offset;
        let end = claimed
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or(UniformBudgetExceeded {
                needed_start: claimed,
                needed_end: claimed.saturating_add(size),
                capacity: self.capacity,
            })?;
        self.offset = align_up(end, self.alignment);
        Ok(claimed)
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_the_next_boundary() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(64, 1), 64);
    }

    #[test]
    fn offsets_are_alignment_multiples() {
        let mut cursor = UniformCursor::new(256, PER_FRAME_UNIFORM_BYTES);
        for _ in 0..16 {
            let offset = cursor.push(TRANSFORM_FIELD_BYTES).unwrap();
            assert_eq!(offset % 256, 0);
        }
    }

    #[test]
    fn claims_never_overlap() {
        // A claim size that is not itself aligned exercises the
        // round-up between claims.
        let mut cursor = UniformCursor::new(64, 4096);
        let mut previous_end = 0;
        for _ in 0..8 {
            let offset = cursor.push(100).unwrap();
            assert!(offset >= previous_end);
            previous_end = offset + 100;
        }
    }

    #[test]
    fn tight_packing_when_alignment_is_one() {
        let mut cursor = UniformCursor::new(1, 4096);
        assert_eq!(cursor.push(64).unwrap(), 0);
        assert_eq!(cursor.push(64).unwrap(), 64);
        assert_eq!(cursor.push(64).unwrap(), 128);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut cursor = UniformCursor::new(256, 600);
        assert_eq!(cursor.push(64).unwrap(), 0);
        assert_eq!(cursor.push(64).unwrap(), 256);
        assert_eq!(cursor.push(64).unwrap(), 512);
        let e = cursor.push(64).unwrap_err();
        assert_eq!(e.needed_start, 768);
        assert_eq!(e.capacity, 600);
    }

    #[test]
    fn oversized_first_claim_is_rejected() {
        let mut cursor = UniformCursor::new(256, 600);
        assert!(cursor.push(601).is_err());
    }
}
