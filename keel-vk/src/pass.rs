//! Render pass and framebuffer wrappers.
//!
//! [`RenderPass`] describes the single forward pass the renderer uses:
//! one color attachment cleared on load and handed to the presentation
//! engine on store, plus one depth attachment cleared on load and
//! discarded on store. [`Framebuffer`] binds one swapchain image view
//! and its paired depth view to that pass.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::image::DEPTH_FORMAT;

/// An owned `VkRenderPass` configured for single-subpass forward
/// rendering.
pub struct RenderPass {
    parent: Arc<Device>,
    handle: vk::RenderPass,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl RenderPass {
    /// Create the forward pass.
    ///
    /// `color_format` must match the swapchain's image format. The depth
    /// attachment uses [`DEPTH_FORMAT`] and expects images already in
    /// `DEPTH_STENCIL_ATTACHMENT_OPTIMAL`, which is where
    /// [`depth_target`](crate::image::DeviceLocalImage::depth_target)
    /// leaves them.
    pub fn new(
        device: &Arc<Device>,
        color_format: vk::Format,
        name: &str,
    ) -> Result<Self, vk::Result> {
        let color_attachment = vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let depth_attachment = vk::AttachmentDescription::default()
            .format(DEPTH_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let attachments = [color_attachment, depth_attachment];

        let color_attachment_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_attachment_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_attachment_ref))
            .depth_stencil_attachment(&depth_attachment_ref);

        // Order this frame's attachment writes after whatever previously
        // read or wrote the same images (the presentation engine for
        // color, the prior frame for depth).
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));

        // SAFETY: create_info references only stack data that outlives
        // the call.
        let handle = unsafe { device.create_raw_render_pass(&create_info) }?;

        if let Err(e) = device.set_object_name(handle, name) {
            tracing::warn!("Failed to name render pass {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_render_pass(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        tracing::debug!("Dropping render pass {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed
        // during teardown. All framebuffers and pipelines created against
        // it must already be gone.
        unsafe { self.parent.destroy_raw_render_pass(self.handle) };
    }
}

/// An owned `VkFramebuffer` binding one color view and one depth view to
/// a [`RenderPass`].
pub struct Framebuffer {
    parent: Arc<Device>,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    /// Create a framebuffer for `render_pass`.
    ///
    /// `color_view` and `depth_view` must match the pass's attachment
    /// order and formats and stay alive as long as the framebuffer does;
    /// the swapchain and depth images the views come from are owned by
    /// the renderer alongside this wrapper.
    pub fn new(
        render_pass: &RenderPass,
        color_view: vk::ImageView,
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
        name: &str,
    ) -> Result<Self, vk::Result> {
        let device = render_pass.parent();
        let attachments = [color_view, depth_view];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.raw_render_pass())
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        // SAFETY: create_info references a valid render pass and views
        // from the same device.
        let handle = unsafe { device.create_raw_framebuffer(&create_info) }?;

        if let Err(e) = device.set_object_name(handle, name) {
            tracing::warn!("Failed to name framebuffer {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            extent,
        })
    }

    pub fn raw_framebuffer(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping framebuffer {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed
        // during teardown. No submitted work may still render into it.
        unsafe { self.parent.destroy_raw_framebuffer(self.handle) };
    }
}
