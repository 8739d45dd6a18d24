//! CPU-GPU synchronisation: [`Fence`].
//!
//! The frame loop runs entirely on fences. Fences are created in the
//! signaled state and [`wait_and_reset`](Fence::wait_and_reset) at the
//! start of each slot's turn, so the first pass through the loop returns
//! immediately. Every queue operation that signals a fence must be
//! followed by [`mark_submitted`](Fence::mark_submitted) so the CPU-side
//! bookkeeping knows a wait is legal.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
    #[error("Asked to wait for fence but fence was never marked as submitted")]
    NotSubmitted,
}

#[derive(Debug, Error)]
pub enum MarkSubmittedError {
    #[error(
        "This fence is already marked as submitted but was marked \
         submitted again"
    )]
    AlreadySubmitted,
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceStatus {
    Submitted,
    Ready,
}

/// CPU-side bookkeeping for a binary fence.
///
/// `Submitted` means some queue operation will signal (or has signaled)
/// the fence, so waiting is legal. `Ready` means the fence is unsignaled
/// and free to hand to the next submission. A fence created signaled
/// counts as `Submitted`: the wait that opens its first cycle returns
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FenceState {
    status: FenceStatus,
}

impl FenceState {
    fn new(signaled: bool) -> Self {
        Self {
            status: if signaled {
                FenceStatus::Submitted
            } else {
                FenceStatus::Ready
            },
        }
    }

    fn try_begin_wait(&self) -> Result<(), WaitFenceError> {
        if self.status == FenceStatus::Submitted {
            Ok(())
        } else {
            Err(WaitFenceError::NotSubmitted)
        }
    }

    fn complete_reset(&mut self) {
        debug_assert!(self.status == FenceStatus::Submitted);
        self.status = FenceStatus::Ready;
    }

    fn try_mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        if self.status == FenceStatus::Ready {
            self.status = FenceStatus::Submitted;
            Ok(())
        } else {
            Err(MarkSubmittedError::AlreadySubmitted)
        }
    }

    fn is_ready(&self) -> bool {
        self.status == FenceStatus::Ready
    }

    fn is_submitted(&self) -> bool {
        self.status == FenceStatus::Submitted
    }
}

/// An owned binary fence used for CPU-GPU synchronisation.
///
/// Use [`wait`](Self::wait) to block the CPU until the GPU signals the
/// fence, then [`reset`](Self::reset) to return it to the unsignaled
/// state before the next submission.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    state: FenceState,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence.
    ///
    /// `signaled` controls the initial state. Pass `true` so the first
    /// `wait` + `reset` cycle in a render loop returns immediately.
    ///
    /// `name` is a debug label applied via `VK_EXT_debug_utils` when the
    /// extension is available. Naming failures are logged as warnings and
    /// do not cause the call to fail.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: &str,
    ) -> Result<Self, CreateFenceError> {
        let handle = device
            .create_raw_fence(signaled)
            .map_err(CreateFenceError::Vulkan)?;

        if let Err(e) = device.set_object_name(handle, name) {
            tracing::warn!("Failed to name fence {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            state: FenceState::new(signaled),
        })
    }

    /// Block until the fence is signaled or `timeout_ns` nanoseconds
    /// elapse.
    ///
    /// Pass `u64::MAX` to wait indefinitely. Waiting on a fence no queued
    /// operation will signal fails with
    /// [`WaitFenceError::NotSubmitted`] instead of deadlocking.
    pub fn wait(&self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        self.state.try_begin_wait()?;
        // SAFETY: handle is a valid fence created from parent.
        unsafe { self.parent.wait_for_raw_fence(self.handle, timeout_ns) }
            .map_err(|e| {
                if e == vk::Result::TIMEOUT {
                    WaitFenceError::Timeout
                } else {
                    WaitFenceError::Vulkan(e)
                }
            })
    }

    /// Reset the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be currently pending on any queue submission
    /// (i.e. the GPU must have already signaled it, or it was never
    /// submitted).
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the fence is not pending.
        unsafe { self.parent.reset_raw_fence(self.handle) }?;
        self.state.complete_reset();
        Ok(())
    }

    /// Wait for the fence to be signaled and then immediately reset it.
    ///
    /// This is the canonical render-loop operation: block until the GPU
    /// finishes the work the fence tracks, then return the fence to the
    /// unsignaled state so it can be handed to the next submission.
    ///
    /// # Safety
    /// No other thread may re-submit this fence's raw handle between the
    /// wait returning and the reset completing. The `&mut` receiver
    /// prevents same-thread re-submission via `raw_fence`, but
    /// cross-thread raw-handle usage is still the caller's responsibility.
    pub unsafe fn wait_and_reset(
        &mut self,
        timeout_ns: u64,
    ) -> Result<(), WaitFenceError> {
        self.wait(timeout_ns)?;
        // SAFETY: wait() succeeded so the fence is signaled and not
        // pending. &mut self prevents any same-thread re-submission of
        // raw_fence() between the wait and reset.
        unsafe { self.reset() }.map_err(WaitFenceError::Vulkan)
    }

    /// This marks the fence as submitted, so that it can properly be
    /// waited.
    ///
    /// # Safety
    /// The fence must actually be submitted to some operation that will
    /// signal it when the operation is completed, such as vkQueueSubmit
    /// or vkAcquireNextImageKHR. It is undefined behavior if this
    /// operation is called while the underlying VkFence is not submitted.
    pub unsafe fn mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        self.state.try_mark_submitted()
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Is the fence in an unsignaled state where we can submit it to
    /// something like vkQueueSubmit
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Is the fence in a submitted state where we can wait on it and
    /// reset it
    pub fn is_submitted(&self) -> bool {
        self.state.is_submitted()
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed
        // during teardown. No GPU work may reference this fence.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_signaled_fence_starts_submitted() {
        let state = FenceState::new(true);
        assert!(state.is_submitted());
        assert!(state.try_begin_wait().is_ok());
    }

    #[test]
    fn created_unsignaled_fence_starts_ready() {
        let state = FenceState::new(false);
        assert!(state.is_ready());
    }

    #[test]
    fn waiting_requires_prior_submission() {
        let state = FenceState::new(false);
        assert!(matches!(
            state.try_begin_wait(),
            Err(WaitFenceError::NotSubmitted)
        ));
    }

    #[test]
    fn double_submission_is_rejected() {
        let mut state = FenceState::new(false);
        state.try_mark_submitted().expect("first submission");
        assert!(matches!(
            state.try_mark_submitted(),
            Err(MarkSubmittedError::AlreadySubmitted)
        ));
    }

    #[test]
    fn reset_reopens_the_cycle() {
        let mut state = FenceState::new(true);
        state.try_begin_wait().expect("signaled fence is waitable");
        state.complete_reset();
        assert!(state.is_ready());
        state.try_mark_submitted().expect("ready fence is submittable");
        assert!(state.is_submitted());
    }

    /// Runs the per-frame fence choreography for many frames over a
    /// small slot pool: wait+reset the acquire fence, hand it to the
    /// acquire call, wait+reset the slot's fence, re-record, block on
    /// the acquire fence, then submit signaling the slot's fence. Every
    /// transition must stay legal no matter how many times the slots
    /// wrap around.
    #[test]
    fn frame_fence_cycle_survives_slot_round_robin() {
        let mut acquire = FenceState::new(true);
        let mut slots = [FenceState::new(true); 3];

        for frame in 0..10usize {
            acquire.try_begin_wait().expect("acquire fence waitable");
            acquire.complete_reset();
            // The acquire call takes the fence with it.
            acquire.try_mark_submitted().expect("acquire fence ready");

            let slot = &mut slots[frame % 3];
            slot.try_begin_wait().expect("slot fence waitable");
            slot.complete_reset();

            // Command buffer re-recording happens here.

            // Block until the presentation engine releases the image.
            // The wait leaves the fence submitted; the reset happens at
            // the top of the next frame.
            acquire.try_begin_wait().expect("acquire fence still waitable");

            // Queue submission signals the slot's fence.
            slot.try_mark_submitted().expect("slot fence ready");
        }

        assert!(acquire.is_submitted());
        assert!(slots.iter().all(FenceState::is_submitted));
    }
}
