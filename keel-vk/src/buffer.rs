//! GPU buffer types.
//!
//! Two concrete buffer wrappers are provided:
//!
//! - [`HostVisibleBuffer`]: CPU-writable memory, suitable for staging
//!   or small per-frame uploads. Write data with
//!   [`write_pod`](HostVisibleBuffer::write_pod), or hold a
//!   [`HostMapping`] open for cursor-style writes into a uniform ring.
//! - [`DeviceLocalBuffer`]: GPU-only memory, highest bandwidth.
//!   Populate via a recorded copy using
//!   [`record_copy_from`](DeviceLocalBuffer::record_copy_from).
//!
//! Every buffer owns a dedicated `VkDeviceMemory` block sized to its
//! requirements and frees it on drop. Host-visible buffers always
//! request `HOST_COHERENT` memory, so writes become visible to the GPU
//! without explicit flushes.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use thiserror::Error;

use crate::device::{AllocateDeviceMemoryError, Device};

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error("Failed to allocate buffer memory: {0}")]
    AllocateMemory(#[from] AllocateDeviceMemoryError),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error(
        "Data size ({data_bytes} bytes) exceeds buffer size ({buffer_bytes} bytes)"
    )]
    DataTooLarge {
        data_bytes: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error(
        "Write of {data_bytes} bytes at offset {offset} runs past the end \
         of the buffer ({buffer_bytes} bytes)"
    )]
    OutOfBounds {
        offset: vk::DeviceSize,
        data_bytes: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error("Vulkan error mapping buffer memory: {0}")]
    MapMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum UploadBufferError {
    #[error(
        "Source buffer ({src_bytes} bytes) exceeds destination buffer \
         ({dst_bytes} bytes)"
    )]
    SourceTooLarge {
        src_bytes: vk::DeviceSize,
        dst_bytes: vk::DeviceSize,
    },
}

fn check_write_bounds(
    offset: vk::DeviceSize,
    data_bytes: usize,
    buffer_bytes: vk::DeviceSize,
) -> Result<(), WriteBufferError> {
    let end = offset.checked_add(data_bytes as vk::DeviceSize);
    match end {
        Some(end) if end <= buffer_bytes => Ok(()),
        _ => Err(WriteBufferError::OutOfBounds {
            offset,
            data_bytes,
            buffer_bytes,
        }),
    }
}

struct AllocatedBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl std::fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl AllocatedBuffer {
    fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        required_memory: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<Self, CreateBufferError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info is fully initialised and has no borrowed
        // data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;

        if let Err(e) = device.set_object_name(handle, name) {
            tracing::warn!("Failed to name buffer {:?}: {e}", handle);
        }

        // SAFETY: handle is a valid buffer created from this device.
        let requirements =
            unsafe { device.get_buffer_memory_requirements(handle) };
        let memory = device
            .allocate_memory_for_requirements(requirements, required_memory)
            .map_err(|e| {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { device.destroy_raw_buffer(handle) };
                CreateBufferError::AllocateMemory(e)
            })?;

        // SAFETY: handle and memory are valid, belong to this device, and
        // the memory block covers the buffer's full requirements from
        // offset 0.
        let bind_result = unsafe { device.bind_buffer_memory(handle, memory, 0) };
        if let Err(e) = bind_result {
            // SAFETY: memory was allocated above and never bound.
            unsafe { device.free_raw_memory(memory) };
            // SAFETY: handle is valid and owned by this scope.
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            memory,
            size,
        })
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this
        // wrapper. No GPU work may still reference it.
        unsafe { self.parent.destroy_raw_buffer(self.handle) };
        // SAFETY: memory backs only this buffer, which was destroyed
        // above.
        unsafe { self.parent.free_raw_memory(self.memory) };
    }
}

/// A CPU-writable GPU buffer backed by host-visible, host-coherent
/// memory.
///
/// Suitable for staging uploads or small per-frame data. Coherent memory
/// means no flush is needed after a write.
#[derive(Debug)]
pub struct HostVisibleBuffer {
    inner: AllocatedBuffer,
}

impl HostVisibleBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                usage,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                name,
            )?,
        })
    }

    /// Copy `data` to the start of the buffer via a transient mapping.
    pub fn write_pod<T: Pod>(
        &mut self,
        data: &[T],
    ) -> Result<(), WriteBufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() as vk::DeviceSize > self.inner.size {
            return Err(WriteBufferError::DataTooLarge {
                data_bytes: bytes.len(),
                buffer_bytes: self.inner.size,
            });
        }

        let mut mapping = self.map()?;
        mapping.write_pod_at(0, data)
    }

    /// Map the whole buffer for writing. The mapping unmaps itself on
    /// drop.
    ///
    /// The `&mut` receiver keeps the mapping exclusive: no other write
    /// can start while a [`HostMapping`] is live.
    pub fn map(&mut self) -> Result<HostMapping<'_>, WriteBufferError> {
        // SAFETY: inner.memory is host-visible by construction, belongs
        // to this device, and the exclusive receiver guarantees it is not
        // currently mapped.
        let ptr = unsafe { self.inner.parent.map_raw_memory(self.inner.memory) }
            .map_err(WriteBufferError::MapMemory)?;

        Ok(HostMapping {
            buffer: &self.inner,
            ptr: ptr.cast::<u8>(),
        })
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }
}

/// An open CPU mapping of a [`HostVisibleBuffer`].
///
/// Writes go through [`write_pod_at`](Self::write_pod_at), which bounds
/// checks every access against the buffer size. The backing memory is
/// coherent, so the GPU sees the bytes as soon as the write returns.
pub struct HostMapping<'a> {
    buffer: &'a AllocatedBuffer,
    ptr: *mut u8,
}

impl HostMapping<'_> {
    /// Copy `data` into the buffer at byte offset `offset`.
    pub fn write_pod_at<T: Pod>(
        &mut self,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<(), WriteBufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        check_write_bounds(offset, bytes.len(), self.buffer.size)?;
        if bytes.is_empty() {
            return Ok(());
        }

        // SAFETY: ptr maps the full buffer, and the bounds check above
        // guarantees offset + bytes.len() stays within it. The source and
        // destination cannot overlap since one is GPU memory.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }
}

impl Drop for HostMapping<'_> {
    fn drop(&mut self) {
        // SAFETY: the memory was mapped when this mapping was created and
        // nothing else can have unmapped it.
        unsafe { self.buffer.parent.unmap_raw_memory(self.buffer.memory) };
    }
}

/// A GPU-only buffer backed by device-local memory.
///
/// Provides the highest memory bandwidth but cannot be written by the
/// CPU directly. Populate from a [`HostVisibleBuffer`] using
/// [`record_copy_from`](Self::record_copy_from).
#[derive(Debug)]
pub struct DeviceLocalBuffer {
    inner: AllocatedBuffer,
}

impl DeviceLocalBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                usage,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                name,
            )?,
        })
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }

    /// Record a copy of the entire source buffer into this device-local
    /// buffer. Returns [`UploadBufferError::SourceTooLarge`] if `src` is
    /// larger than `self`.
    ///
    /// The caller is responsible for begin/end/submit and any CPU/GPU
    /// synchronization.
    ///
    /// # Safety
    /// - `command_buffer` must be in the recording state.
    /// - The caller must ensure `src` and `self` remain alive until GPU
    ///   execution of the recorded copy has completed.
    /// - `src` must be created with `TRANSFER_SRC` usage and `self` with
    ///   `TRANSFER_DST` usage.
    pub unsafe fn record_copy_from(
        &mut self,
        command_buffer: vk::CommandBuffer,
        src: &HostVisibleBuffer,
    ) -> Result<(), UploadBufferError> {
        let copy_size = src.size();
        if copy_size > self.size() {
            return Err(UploadBufferError::SourceTooLarge {
                src_bytes: copy_size,
                dst_bytes: self.size(),
            });
        }

        let copy_region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(0)
            .size(copy_size);
        // SAFETY: caller guarantees recording state, buffer usages and
        // liveness; the region is in-bounds for both buffers.
        unsafe {
            self.inner.parent.cmd_copy_buffer(
                command_buffer,
                src.raw_buffer(),
                self.raw_buffer(),
                std::slice::from_ref(&copy_region),
            )
        };

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_bounds_accept_exact_fit() {
        assert!(check_write_bounds(192, 64, 256).is_ok());
    }

    #[test]
    fn write_bounds_reject_overrun() {
        assert!(matches!(
            check_write_bounds(200, 64, 256),
            Err(WriteBufferError::OutOfBounds {
                offset: 200,
                data_bytes: 64,
                buffer_bytes: 256,
            })
        ));
    }

    #[test]
    fn write_bounds_reject_offset_overflow() {
        assert!(check_write_bounds(vk::DeviceSize::MAX, 16, 256).is_err());
    }
}
