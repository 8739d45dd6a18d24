//! GPU image types: [`DeviceLocalImage`].
//!
//! A [`DeviceLocalImage`] wraps a `VkImage` in device-local memory
//! together with the single `VkImageView` the renderer reads or renders
//! it through. Two constructors cover everything the frame needs:
//! [`texture_2d`](DeviceLocalImage::texture_2d) stages RGBA pixels
//! through a host-visible buffer and leaves the image shader-readable,
//! and [`depth_target`](DeviceLocalImage::depth_target) creates a depth
//! attachment already transitioned to its attachment layout.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::{CreateBufferError, HostVisibleBuffer, WriteBufferError};
use crate::device::{AllocateDeviceMemoryError, Device, OneTimeSubmitError};

/// Format for sampled base-color textures. sRGB so the hardware decodes
/// gamma on sample.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Format for the per-swapchain-image depth attachments.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error("Failed to allocate image memory: {0}")]
    AllocateMemory(#[from] AllocateDeviceMemoryError),

    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),

    #[error("Vulkan error creating image view: {0}")]
    CreateView(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateTextureError {
    #[error(
        "Pixel data is {actual} bytes but a {width}x{height} RGBA image \
         needs {expected}"
    )]
    PixelDataSize {
        width: u32,
        height: u32,
        expected: u64,
        actual: usize,
    },

    #[error(transparent)]
    Image(#[from] CreateImageError),

    #[error("Failed to create staging buffer: {0}")]
    Staging(#[from] CreateBufferError),

    #[error("Failed to write staging buffer: {0}")]
    WriteStaging(#[from] WriteBufferError),

    #[error("Failed to submit texture upload: {0}")]
    Upload(#[from] OneTimeSubmitError),
}

#[derive(Debug, Error)]
pub enum CreateDepthTargetError {
    #[error(transparent)]
    Image(#[from] CreateImageError),

    #[error("Failed to submit depth layout transition: {0}")]
    Transition(#[from] OneTimeSubmitError),
}

// ---------------------------------------------------------------------------
// AllocatedImage: private inner state
// ---------------------------------------------------------------------------

struct AllocatedImage {
    parent: Arc<Device>,
    handle: vk::Image,
    memory: vk::DeviceMemory,
    extent: vk::Extent3D,
    format: vk::Format,
}

impl std::fmt::Debug for AllocatedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedImage")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl AllocatedImage {
    fn new(
        device: &Arc<Device>,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<Self, CreateImageError> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info is fully initialised and has no borrowed
        // data.
        let handle = unsafe { device.create_raw_image(&create_info) }
            .map_err(CreateImageError::CreateImage)?;

        if let Err(e) = device.set_object_name(handle, name) {
            tracing::warn!("Failed to name image {:?}: {e}", handle);
        }

        // SAFETY: handle is a valid image created from this device.
        let requirements =
            unsafe { device.get_image_memory_requirements(handle) };
        let memory = device
            .allocate_memory_for_requirements(
                requirements,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .map_err(|e| {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { device.destroy_raw_image(handle) };
                CreateImageError::AllocateMemory(e)
            })?;

        // SAFETY: handle and memory are valid, belong to this device, and
        // the memory block covers the image's full requirements from
        // offset 0.
        let bind_result = unsafe { device.bind_image_memory(handle, memory, 0) };
        if let Err(e) = bind_result {
            // SAFETY: memory was allocated above and never bound.
            unsafe { device.free_raw_memory(memory) };
            // SAFETY: handle is valid and owned by this scope.
            unsafe { device.destroy_raw_image(handle) };
            return Err(CreateImageError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            memory,
            extent,
            format,
        })
    }
}

impl Drop for AllocatedImage {
    fn drop(&mut self) {
        tracing::debug!("Dropping image {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this
        // wrapper. No GPU work may still reference it.
        unsafe { self.parent.destroy_raw_image(self.handle) };
        // SAFETY: memory backs only this image, which was destroyed above.
        unsafe { self.parent.free_raw_memory(self.memory) };
    }
}

// ---------------------------------------------------------------------------
// DeviceLocalImage
// ---------------------------------------------------------------------------

/// A GPU-only 2-D image with `OPTIMAL` tiling and an attached view.
#[derive(Debug)]
pub struct DeviceLocalImage {
    inner: AllocatedImage,
    view: vk::ImageView,
}

impl DeviceLocalImage {
    fn new_with_view(
        device: &Arc<Device>,
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        name: &str,
    ) -> Result<Self, CreateImageError> {
        let inner = AllocatedImage::new(device, extent, format, usage, name)?;

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);
        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(inner.handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range);

        // SAFETY: view_create_info references a valid image from the same
        // device. On failure `inner` drops and cleans up the image.
        let view = unsafe { device.create_raw_image_view(&view_create_info) }
            .map_err(CreateImageError::CreateView)?;

        if let Err(e) = device
            .set_object_name_with(view, || format!("{name} View"))
        {
            tracing::warn!("Failed to name image view {:?}: {e}", view);
        }

        Ok(Self { inner, view })
    }

    /// Create a sampled texture from tightly packed RGBA8 pixels.
    ///
    /// Pixels are staged through a transient host-visible buffer, copied
    /// into the image with a one-time submission, and the image is left
    /// in `SHADER_READ_ONLY_OPTIMAL`. The method blocks until the copy
    /// has executed, so the staging buffer is dropped before returning.
    pub fn texture_2d(
        device: &Arc<Device>,
        width: u32,
        height: u32,
        rgba_pixels: &[u8],
        name: &str,
    ) -> Result<Self, CreateTextureError> {
        let expected = u64::from(width) * u64::from(height) * 4;
        if rgba_pixels.len() as u64 != expected {
            return Err(CreateTextureError::PixelDataSize {
                width,
                height,
                expected,
                actual: rgba_pixels.len(),
            });
        }

        let extent = vk::Extent3D {
            width,
            height,
            depth: 1,
        };
        let image = Self::new_with_view(
            device,
            extent,
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            name,
        )?;

        let mut staging = HostVisibleBuffer::new(
            device,
            expected,
            vk::BufferUsageFlags::TRANSFER_SRC,
            &format!("{name} Staging"),
        )?;
        staging.write_pod(rgba_pixels)?;

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);

        device.one_time_submit(|cmd| {
            let to_transfer = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.raw_image())
                .subresource_range(subresource_range);
            // SAFETY: cmd is in the recording state for the duration of
            // this closure; the image handle is valid.
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    std::slice::from_ref(&to_transfer),
                )
            };

            let subresource_layers = vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1);
            let copy_region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(subresource_layers)
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(extent);
            // SAFETY: recording state; the staging buffer holds exactly
            // the bytes the region covers and the image is in
            // TRANSFER_DST_OPTIMAL after the barrier above.
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.raw_buffer(),
                    image.raw_image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&copy_region),
                )
            };

            let to_shader = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.raw_image())
                .subresource_range(subresource_range);
            // SAFETY: recording state; the image handle is valid.
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    std::slice::from_ref(&to_shader),
                )
            };
        })?;

        Ok(image)
    }

    /// Create a depth attachment already in
    /// `DEPTH_STENCIL_ATTACHMENT_OPTIMAL`.
    pub fn depth_target(
        device: &Arc<Device>,
        extent: vk::Extent2D,
        name: &str,
    ) -> Result<Self, CreateDepthTargetError> {
        let extent = vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        };
        let image = Self::new_with_view(
            device,
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            name,
        )?;

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::DEPTH)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);

        device.one_time_submit(|cmd| {
            let to_attachment = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.raw_image())
                .subresource_range(subresource_range);
            // SAFETY: cmd is in the recording state for the duration of
            // this closure; the image handle is valid.
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                    std::slice::from_ref(&to_attachment),
                )
            };
        })?;

        Ok(image)
    }

    pub fn raw_image(&self) -> vk::Image {
        self.inner.handle
    }

    pub fn raw_view(&self) -> vk::ImageView {
        self.view
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.inner.extent
    }

    pub fn format(&self) -> vk::Format {
        self.inner.format
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }
}

impl Drop for DeviceLocalImage {
    fn drop(&mut self) {
        tracing::debug!("Dropping image view {:?}", self.view);
        // SAFETY: view was created from the image's device and is owned
        // by this wrapper. The image itself is destroyed when `inner`
        // drops right after.
        unsafe { self.inner.parent.destroy_raw_image_view(self.view) };
    }
}
