use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::pass::RenderPass;
use crate::shader::EntryPoint;

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

/// An owned wrapper around a `VkPipelineLayout`.
///
/// Multiple pipelines that share the same descriptor set signature can
/// hold the layout behind an `Arc<PipelineLayout>`.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// Create a pipeline layout over the given descriptor set layouts,
    /// in set-index order. No push constant ranges are declared.
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[&DescriptorSetLayout],
    ) -> Result<Self, vk::Result> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|l| l.raw_descriptor_set_layout())
            .collect();
        let create_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_layouts);
        // SAFETY: create_info references valid descriptor set layouts
        // from this device for the duration of the call.
        let handle =
            unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed
        // during teardown. All pipelines using this layout must be
        // dropped first.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateGraphicsPipelineError {
    #[error("No shader stages provided")]
    NoStages,

    #[error("Vulkan error creating graphics pipeline: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// GraphicsPipelineDesc
// ---------------------------------------------------------------------------

/// Description of a [`GraphicsPipeline`] to create.
///
/// Only the state that varies between callers appears here; everything
/// else is fixed by [`GraphicsPipeline::new`].
pub struct GraphicsPipelineDesc<'a> {
    /// Shader entry points that form this pipeline's stages.
    ///
    /// Must contain at least one entry.
    pub stages: &'a [EntryPoint<'a>],

    /// Vertex buffer binding descriptions.
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],

    /// Vertex attribute descriptions.
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],

    /// Render pass this pipeline will draw inside (subpass 0).
    pub render_pass: &'a RenderPass,

    /// Fixed viewport and scissor extent. The swapchain never resizes,
    /// so neither does the pipeline's viewport.
    pub extent: vk::Extent2D,

    /// Pipeline layout describing the descriptor set signature.
    pub layout: Arc<PipelineLayout>,
}

// ---------------------------------------------------------------------------
// GraphicsPipeline
// ---------------------------------------------------------------------------

/// A graphics pipeline for the forward pass.
///
/// Fixed pipeline state applied during construction:
/// - Input assembly: `TRIANGLE_LIST`
/// - Viewport/scissor: static, covering `desc.extent`
/// - Rasterization: fill, back-face culling, counter-clockwise front
///   faces, line width 1.0
/// - Multisample: single sample
/// - Depth: test and write enabled, `LESS` compare
/// - Color blend: no blending, full RGBA write mask
pub struct GraphicsPipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl GraphicsPipeline {
    /// Create a [`GraphicsPipeline`] from a description.
    ///
    /// `name` is a debug label applied via `VK_EXT_debug_utils` when the
    /// extension is available. Naming failures are logged as warnings and
    /// do not cause the call to fail.
    pub fn new(
        device: &Arc<Device>,
        desc: &GraphicsPipelineDesc<'_>,
        name: &str,
    ) -> Result<Self, CreateGraphicsPipelineError> {
        if desc.stages.is_empty() {
            return Err(CreateGraphicsPipelineError::NoStages);
        }

        let layout = Arc::clone(&desc.layout);

        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> =
            desc.stages
                .iter()
                .map(|ep| ep.as_pipeline_stage_create_info())
                .collect();

        let vertex_input_state =
            vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(desc.vertex_bindings)
                .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly_state =
            vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewport = vk::Viewport::default()
            .x(0.0)
            .y(0.0)
            .width(desc.extent.width as f32)
            .height(desc.extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: desc.extent,
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(std::slice::from_ref(&viewport))
            .scissors(std::slice::from_ref(&scissor));

        let rasterization_state =
            vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(vk::CullModeFlags::BACK)
                .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
                .line_width(1.0);

        let multisample_state =
            vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state =
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(true)
                .depth_compare_op(vk::CompareOp::LESS);

        let color_blend_attachment =
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA);
        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default()
                .attachments(std::slice::from_ref(&color_blend_attachment));

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .layout(layout.raw_handle())
            .render_pass(desc.render_pass.raw_render_pass())
            .subpass(0);

        // SAFETY: create_info references valid shader stages, a valid
        // pipeline layout, and a valid render pass, all derived from
        // device and valid for the duration of this call.
        let handle =
            unsafe { device.create_raw_graphics_pipeline(&create_info) }
                .map_err(CreateGraphicsPipelineError::Vulkan)?;

        if let Err(e) = device.set_object_name(handle, name) {
            tracing::warn!("Failed to name pipeline {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout,
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent and is being destroyed
        // during teardown. All in-flight GPU work referencing this
        // pipeline must be completed before drop.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
        // self.layout Arc is released here; the layout itself is
        // destroyed only when all pipelines sharing it have been dropped.
    }
}
