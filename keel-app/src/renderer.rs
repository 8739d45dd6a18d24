//! The renderer: owns every GPU object and drives the frame loop.
//!
//! Construction runs the whole bring-up chain in dependency order
//! (surface, device, swapchain, shaders, render pass, sampler,
//! per-frame resources, pipeline, built-in and scene geometry) and
//! either succeeds completely or fails with the first error. After
//! that, [`Renderer::draw`] is the only steady-state entry point; it
//! records and submits one frame per call and never allocates.
//!
//! Teardown is the reverse: [`Drop`] waits for the device to go idle,
//! then fields drop in declaration order, children before parents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::Mat4;
use keel_vk::ash::vk;
use keel_vk::buffer::{
    CreateBufferError, DeviceLocalBuffer, HostVisibleBuffer, UploadBufferError,
    WriteBufferError,
};
use keel_vk::descriptor::{
    DescriptorBindingDesc, DescriptorPool, DescriptorSet, DescriptorSetLayout,
};
use keel_vk::device::{
    CreateCompatibleDeviceError, Device, OneTimeSubmitError,
};
use keel_vk::image::{CreateDepthTargetError, DeviceLocalImage};
use keel_vk::instance::Instance;
use keel_vk::pass::{Framebuffer, RenderPass};
use keel_vk::pipeline::{
    CreateGraphicsPipelineError, GraphicsPipeline, GraphicsPipelineDesc,
    PipelineLayout,
};
use keel_vk::sampler::Sampler;
use keel_vk::shader::{CreateShaderModuleError, ShaderModule, ShaderStage};
use keel_vk::surface::{CreateSurfaceError, Surface};
use keel_vk::swapchain::{CreateSwapchainError, Swapchain};
use keel_vk::sync::{CreateFenceError, Fence, MarkSubmittedError, WaitFenceError};
use thiserror::Error;
use winit::window::Window;

use crate::frame::{
    FrameSlot, PER_FRAME_UNIFORM_BYTES, TRANSFORM_FIELD_BYTES,
    UniformBudgetExceeded, UniformCursor,
};
use crate::ingest::{
    DrawRecord, GeometryStore, IngestError, TextureStore, ingest_geometry,
    ingest_textures,
};
use crate::vertex::Vertex;

/// Shader bytecode is read from here, relative to the working
/// directory, which the build tooling arranges to be the staging
/// directory.
const VERTEX_SHADER_PATH: &str = "shaders/scene.vert.spv";
const FRAGMENT_SHADER_PATH: &str = "shaders/scene.frag.spv";

const INFINITE: u64 = u64::MAX;

/// The quad every scene gets for free, occupying static pool entries 0
/// and 1. A unit square in the XY plane with a zeroed basis block.
const QUAD_VERTICES: [Vertex; 4] = [
    Vertex {
        position: [0.0, 0.0, 0.0],
        basis: [0, 0, 0],
        tex_coord: [0.0, 0.0],
    },
    Vertex {
        position: [0.0, 1.0, 0.0],
        basis: [0, 0, 0],
        tex_coord: [0.0, 1.0],
    },
    Vertex {
        position: [1.0, 1.0, 0.0],
        basis: [0, 0, 0],
        tex_coord: [1.0, 1.0],
    },
    Vertex {
        position: [1.0, 0.0, 0.0],
        basis: [0, 0, 0],
        tex_coord: [1.0, 0.0],
    },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 3, 1, 2, 3];

// ---- Errors ---------------------------------------------------------

#[derive(Debug, Error)]
pub enum RendererInitError {
    #[error("Couldn't create window surface: {0}")]
    Surface(#[from] CreateSurfaceError),
    #[error("Couldn't create a compatible device: {0}")]
    Device(#[from] CreateCompatibleDeviceError),
    #[error("Couldn't create swapchain: {0}")]
    Swapchain(#[from] CreateSwapchainError),
    #[error("Couldn't create depth target: {0}")]
    DepthTarget(#[from] CreateDepthTargetError),
    #[error("Couldn't read shader bytecode {path}: {source}")]
    ReadShader {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Couldn't create shader module: {0}")]
    ShaderModule(#[from] CreateShaderModuleError),
    #[error("Shader entry point name contains a NUL byte: {0}")]
    EntryPointName(#[from] std::ffi::NulError),
    #[error("Couldn't create graphics pipeline: {0}")]
    Pipeline(#[from] CreateGraphicsPipelineError),
    #[error("Couldn't create frame uniform buffer: {0}")]
    FrameUniform(#[from] CreateBufferError),
    #[error("Couldn't create fence: {0}")]
    Fence(#[from] CreateFenceError),
    #[error("Couldn't upload static geometry: {0}")]
    StaticUpload(#[from] StaticUploadError),
    #[error("Couldn't load scene {path}: {source}")]
    Scene {
        path: PathBuf,
        source: keel_scene::LoadSceneError,
    },
    #[error("Couldn't ingest scene: {0}")]
    Ingest(#[from] IngestError),
    #[error("Vulkan error during renderer setup: {0}")]
    Vulkan(#[from] vk::Result),
}

#[derive(Debug, Error)]
pub enum DrawError {
    #[error("Vulkan validation reported an error")]
    Validation,
    #[error("Couldn't wait for a frame fence: {0}")]
    Wait(#[from] WaitFenceError),
    #[error("Fence state tracking failure: {0}")]
    FenceState(#[from] MarkSubmittedError),
    #[error(transparent)]
    UniformBudget(#[from] UniformBudgetExceeded),
    #[error("Couldn't write per-draw uniforms: {0}")]
    WriteUniform(#[from] WriteBufferError),
    #[error("Vulkan error during frame submission: {0}")]
    Vulkan(#[from] vk::Result),
}

/// Failure in the staging-copy path shared by the built-in quad and
/// scene geometry uploads.
#[derive(Debug, Error)]
pub enum StaticUploadError {
    #[error("Couldn't create staging or device buffer: {0}")]
    Create(#[from] CreateBufferError),
    #[error("Couldn't write staging memory: {0}")]
    Write(#[from] WriteBufferError),
    #[error("Couldn't record the staging copy: {0}")]
    RecordCopy(#[from] UploadBufferError),
    #[error("Couldn't submit the staging copy: {0}")]
    Submit(#[from] OneTimeSubmitError),
}

// ---- Renderer -------------------------------------------------------

/// Field order is teardown order: framebuffers drop before the views
/// they reference, descriptor pools before the sampler and textures
/// their sets point at, everything before the device.
pub struct Renderer {
    frame_slots: Vec<FrameSlot>,
    next_image_ready: Fence,
    pipeline: GraphicsPipeline,
    immutable_sets: Vec<DescriptorSet>,
    _immutable_pool: Option<DescriptorPool>,
    _mutable_pool: DescriptorPool,
    framebuffers: Vec<Framebuffer>,
    _depth_targets: Vec<DeviceLocalImage>,
    render_pass: RenderPass,
    _textures: Vec<DeviceLocalImage>,
    static_buffers: Vec<DeviceLocalBuffer>,
    _sampler: Sampler,
    _mutable_set_layout: DescriptorSetLayout,
    _immutable_set_layout: DescriptorSetLayout,
    swapchain: Swapchain<Window>,
    draws: Vec<DrawRecord>,
    camera_transform: Mat4,
    uniform_alignment: u32,
    device: Arc<Device>,
}

impl Renderer {
    /// Run the full bring-up chain and load the scene at `scene_path`.
    pub fn new(
        instance: Arc<Instance>,
        window: Arc<Window>,
        scene_path: &Path,
    ) -> Result<Self, RendererInitError> {
        // SAFETY: the renderer holds an Arc of the window through the
        // surface, and Drop waits for device idle before teardown.
        let surface = Arc::new(unsafe { Surface::new(&instance, window.clone()) }?);
        let device = Device::create_compatible(instance, &surface)?;

        let window_size = window.inner_size();
        let swapchain = Swapchain::new(
            &device,
            &surface,
            vk::Extent2D {
                width: window_size.width,
                height: window_size.height,
            },
        )?;
        let extent = swapchain.extent();
        let image_count = swapchain.image_count();

        let render_pass =
            RenderPass::new(&device, swapchain.format(), "Scene Render Pass")?;
        let mut depth_targets = Vec::with_capacity(image_count);
        let mut framebuffers = Vec::with_capacity(image_count);
        for (i, &color_view) in swapchain.image_views().iter().enumerate() {
            let depth = DeviceLocalImage::depth_target(
                &device,
                extent,
                &format!("Depth Target {i}"),
            )?;
            framebuffers.push(Framebuffer::new(
                &render_pass,
                color_view,
                depth.raw_view(),
                extent,
                &format!("Framebuffer {i}"),
            )?);
            depth_targets.push(depth);
        }

        let sampler = Sampler::new(&device, "Scene Sampler")?;

        let mutable_set_layout = DescriptorSetLayout::new(
            &device,
            &[DescriptorBindingDesc {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX,
            }],
        )?;
        let immutable_set_layout = DescriptorSetLayout::new(
            &device,
            &[DescriptorBindingDesc {
                binding: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
            }],
        )?;

        let (frame_slots, mutable_pool) = Self::create_frame_slots(
            &device,
            &mutable_set_layout,
            image_count,
        )?;
        let next_image_ready = Fence::new(&device, true, "Next Image Ready")?;

        let pipeline = Self::create_pipeline(
            &device,
            &render_pass,
            extent,
            &mutable_set_layout,
            &immutable_set_layout,
        )?;

        let mut static_buffers = Vec::new();
        upload_static(
            &device,
            &mut static_buffers,
            bytemuck::cast_slice(&QUAD_VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "Built-in Quad Vertex Buffer",
        )?;
        upload_static(
            &device,
            &mut static_buffers,
            bytemuck::cast_slice(&QUAD_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
            "Built-in Quad Index Buffer",
        )?;

        let scene = keel_scene::LoadedDocument::load(scene_path).map_err(
            |source| RendererInitError::Scene {
                path: scene_path.to_owned(),
                source,
            },
        )?;
        let viewport_aspect = extent.width as f32 / extent.height as f32;
        let ingested = {
            let mut store = PoolGeometry {
                device: &device,
                pool: &mut static_buffers,
            };
            ingest_geometry(&scene, viewport_aspect, &mut store)?
        };

        let mut textures = Vec::new();
        let (immutable_pool, immutable_sets) = if ingested.draws.is_empty() {
            (None, Vec::new())
        } else {
            let draw_count = ingested.draws.len();
            let pool = DescriptorPool::new(
                &device,
                draw_count as u32,
                &[vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(draw_count as u32)],
            )?;
            let layouts: Vec<&DescriptorSetLayout> =
                vec![&immutable_set_layout; draw_count];
            let sets = pool.allocate_sets(&layouts)?;
            let mut store = PoolTextures {
                device: &device,
                textures: &mut textures,
                sampler: &sampler,
                sets: &sets,
            };
            ingest_textures(&scene, &ingested.draws, &mut store)?;
            (Some(pool), sets)
        };

        let uniform_alignment =
            device.min_uniform_buffer_offset_alignment() as u32;
        tracing::info!(
            "Renderer ready: {} draws, {} frame slots, {}x{}",
            ingested.draws.len(),
            frame_slots.len(),
            extent.width,
            extent.height,
        );

        Ok(Self {
            frame_slots,
            next_image_ready,
            pipeline,
            immutable_sets,
            _immutable_pool: immutable_pool,
            _mutable_pool: mutable_pool,
            framebuffers,
            _depth_targets: depth_targets,
            render_pass,
            _textures: textures,
            static_buffers,
            _sampler: sampler,
            _mutable_set_layout: mutable_set_layout,
            _immutable_set_layout: immutable_set_layout,
            swapchain,
            draws: ingested.draws,
            camera_transform: ingested.camera_transform,
            uniform_alignment,
            device,
        })
    }

    fn create_frame_slots(
        device: &Arc<Device>,
        mutable_set_layout: &DescriptorSetLayout,
        image_count: usize,
    ) -> Result<(Vec<FrameSlot>, DescriptorPool), RendererInitError> {
        let command_buffers =
            device.allocate_raw_primary_command_buffers(image_count as u32)?;
        let mutable_pool = DescriptorPool::new(
            device,
            image_count as u32,
            &[vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(image_count as u32)],
        )?;
        let layouts: Vec<&DescriptorSetLayout> =
            vec![mutable_set_layout; image_count];
        let mutable_sets = mutable_pool.allocate_sets(&layouts)?;

        let mut frame_slots = Vec::with_capacity(image_count);
        for (i, (command_buffer, mutable_set)) in
            command_buffers.into_iter().zip(mutable_sets).enumerate()
        {
            if let Err(e) = device
                .set_object_name(command_buffer, &format!("Frame {i} Command Buffer"))
            {
                tracing::warn!("Failed to name frame {i} command buffer: {e}");
            }
            let uniform = HostVisibleBuffer::new(
                device,
                vk::DeviceSize::from(PER_FRAME_UNIFORM_BYTES),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                &format!("Frame {i} Uniform Buffer"),
            )?;
            // SAFETY: buffer and set live together in the FrameSlot and
            // are destroyed only after the device goes idle.
            unsafe {
                mutable_set.write_dynamic_uniform_buffer(
                    device,
                    0,
                    &uniform,
                    vk::DeviceSize::from(TRANSFORM_FIELD_BYTES),
                )
            };
            let commands_complete =
                Fence::new(device, true, &format!("Frame {i} Commands Complete"))?;
            frame_slots.push(FrameSlot {
                command_buffer,
                commands_complete,
                uniform,
                mutable_set,
            });
        }
        Ok((frame_slots, mutable_pool))
    }

    fn create_pipeline(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        extent: vk::Extent2D,
        mutable_set_layout: &DescriptorSetLayout,
        immutable_set_layout: &DescriptorSetLayout,
    ) -> Result<GraphicsPipeline, RendererInitError> {
        let vertex_spirv = read_shader(VERTEX_SHADER_PATH)?;
        let fragment_spirv = read_shader(FRAGMENT_SHADER_PATH)?;
        let vertex_module =
            ShaderModule::new(device, &vertex_spirv, "Scene Vertex Shader")?;
        let fragment_module =
            ShaderModule::new(device, &fragment_spirv, "Scene Fragment Shader")?;
        let stages = [
            vertex_module.entry_point("vertMain", ShaderStage::Vertex)?,
            fragment_module.entry_point("fragMain", ShaderStage::Fragment)?,
        ];

        let layout = Arc::new(PipelineLayout::new(
            device,
            &[mutable_set_layout, immutable_set_layout],
        )?);
        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        Ok(GraphicsPipeline::new(
            device,
            &GraphicsPipelineDesc {
                stages: &stages,
                vertex_bindings: &bindings,
                vertex_attributes: &attributes,
                render_pass,
                extent,
                layout,
            },
            "Scene Pipeline",
        )?)
    }

    /// Per-frame update hook invoked by the event loop before each
    /// draw. There is no animation state yet.
    pub fn tick(&mut self) {}

    /// Record and submit one frame, then present it.
    ///
    /// Frame pacing comes entirely from fences: acquisition blocks on
    /// the previous acquire's fence, recording blocks on the acquired
    /// slot's submission fence, and presentation happens only after the
    /// acquire fence proves the presentation engine released the image.
    pub fn draw(&mut self) -> Result<(), DrawError> {
        if self.device.get_parent().validation_error_observed() {
            return Err(DrawError::Validation);
        }

        // SAFETY: the fence is signaled (initially, or by the previous
        // frame's acquire) and nothing else holds it.
        unsafe { self.next_image_ready.wait_and_reset(INFINITE) }?;
        // SAFETY: the fence was just reset and is unused until signaled.
        let (image_index, suboptimal) = unsafe {
            self.swapchain
                .acquire_next_image(INFINITE, self.next_image_ready.raw_fence())
        }?;
        // SAFETY: acquire_next_image queued a signal on the fence.
        unsafe { self.next_image_ready.mark_submitted() }?;
        if suboptimal {
            tracing::trace!("Swapchain is suboptimal at acquire");
        }

        let slot = &mut self.frame_slots[image_index as usize];
        // SAFETY: waiting on the slot fence proves the GPU finished the
        // previous frame that used this slot's resources.
        unsafe { slot.commands_complete.wait_and_reset(INFINITE) }?;

        // SAFETY: the wait above guarantees the command buffer is not
        // in flight; begin puts it in the recording state.
        unsafe {
            self.device.reset_raw_command_buffer(slot.command_buffer)?;
            self.device
                .begin_raw_command_buffer(slot.command_buffer, true)?;
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.swapchain.extent(),
        };
        // SAFETY: the command buffer is recording; pass, framebuffer,
        // and pipeline outlive this frame.
        unsafe {
            self.device.cmd_begin_render_pass(
                slot.command_buffer,
                self.render_pass.raw_render_pass(),
                self.framebuffers[image_index as usize].raw_framebuffer(),
                render_area,
                &clear_values,
            );
            self.device
                .cmd_bind_graphics_pipeline(slot.command_buffer, self.pipeline.raw_handle());
        }

        let mut cursor =
            UniformCursor::new(self.uniform_alignment, PER_FRAME_UNIFORM_BYTES);
        {
            let mut uniforms = slot.uniform.map()?;
            for (draw_index, draw) in self.draws.iter().enumerate() {
                // SAFETY: buffers in the static pool stay alive for the
                // renderer's lifetime.
                unsafe {
                    self.device.cmd_bind_vertex_buffer(
                        slot.command_buffer,
                        0,
                        self.static_buffers[draw.vertex_buffer].raw_buffer(),
                        0,
                    );
                    self.device.cmd_bind_index_buffer_u16(
                        slot.command_buffer,
                        self.static_buffers[draw.index_buffer].raw_buffer(),
                        0,
                    );
                }

                let offset = cursor.push(TRANSFORM_FIELD_BYTES)?;
                let transform = self.camera_transform * draw.transform;
                uniforms.write_pod_at(
                    vk::DeviceSize::from(offset),
                    &transform.to_cols_array(),
                )?;

                // SAFETY: both sets were written at load time and their
                // resources outlive the frame.
                unsafe {
                    self.device.cmd_bind_graphics_descriptor_set(
                        slot.command_buffer,
                        self.pipeline.layout().raw_handle(),
                        0,
                        slot.mutable_set.raw_descriptor_set(),
                        &[offset],
                    );
                    self.device.cmd_bind_graphics_descriptor_set(
                        slot.command_buffer,
                        self.pipeline.layout().raw_handle(),
                        1,
                        self.immutable_sets[draw_index].raw_descriptor_set(),
                        &[],
                    );
                    self.device.cmd_draw_indexed(
                        slot.command_buffer,
                        draw.index_count,
                        draw.first_index,
                        draw.vertex_offset,
                    );
                }
            }
        }

        // SAFETY: the command buffer is recording with an open render
        // pass begun above.
        unsafe {
            self.device.cmd_end_render_pass(slot.command_buffer);
            self.device.end_raw_command_buffer(slot.command_buffer)?;
        }

        // The presentation engine owns the image until the acquire
        // fence signals; submitting earlier would race it.
        self.next_image_ready.wait(INFINITE)?;

        // SAFETY: the command buffer is fully recorded and the slot
        // fence was reset above.
        unsafe {
            self.device.queue_submit(
                &[slot.command_buffer],
                Some(slot.commands_complete.raw_fence()),
            )?;
            slot.commands_complete.mark_submitted()?;
        }

        // SAFETY: image_index came from acquire_next_image on this
        // swapchain and its commands were just submitted.
        let suboptimal = unsafe { self.swapchain.present(image_index) }?;
        if suboptimal {
            tracing::trace!("Swapchain is suboptimal at present");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("draws", &self.draws.len())
            .field("frame_slots", &self.frame_slots.len())
            .field("camera_transform", &self.camera_transform)
            .finish_non_exhaustive()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        tracing::debug!("Dropping renderer");
        if let Err(e) = self.device.wait_idle() {
            tracing::error!(
                "Couldn't wait for device idle during renderer teardown: {e}"
            );
        }
    }
}

// ---- Static uploads and ingestion stores ----------------------------

fn read_shader(path: &str) -> Result<Vec<u8>, RendererInitError> {
    std::fs::read(path).map_err(|source| RendererInitError::ReadShader {
        path: PathBuf::from(path),
        source,
    })
}

/// Stage `bytes` into a new device-local buffer appended to `pool`,
/// returning its pool index. Blocks until the copy completes, so the
/// staging buffer can be freed on return.
fn upload_static(
    device: &Arc<Device>,
    pool: &mut Vec<DeviceLocalBuffer>,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<usize, StaticUploadError> {
    let size = bytes.len() as vk::DeviceSize;
    let mut staging = HostVisibleBuffer::new(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        &format!("{name} Staging"),
    )?;
    staging.write_pod(bytes)?;
    let mut destination = DeviceLocalBuffer::new(
        device,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        name,
    )?;

    let mut copy_result = Ok(());
    device.one_time_submit(|command_buffer| {
        // SAFETY: the command buffer is recording and both buffers
        // outlive the submit, which waits for queue idle.
        copy_result =
            unsafe { destination.record_copy_from(command_buffer, &staging) };
    })?;
    copy_result?;

    pool.push(destination);
    Ok(pool.len() - 1)
}

/// Geometry sink backed by the renderer's static buffer pool.
struct PoolGeometry<'a> {
    device: &'a Arc<Device>,
    pool: &'a mut Vec<DeviceLocalBuffer>,
}

impl GeometryStore for PoolGeometry<'_> {
    fn upload_vertices(&mut self, vertices: &[Vertex]) -> Result<usize, IngestError> {
        upload_static(
            self.device,
            self.pool,
            bytemuck::cast_slice(vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "Scene Vertex Buffer",
        )
        .map_err(|e| IngestError::Store(Box::new(e)))
    }

    fn upload_indices(&mut self, data: &[u8]) -> Result<usize, IngestError> {
        upload_static(
            self.device,
            self.pool,
            data,
            vk::BufferUsageFlags::INDEX_BUFFER,
            "Scene Index Buffer",
        )
        .map_err(|e| IngestError::Store(Box::new(e)))
    }
}

/// Texture sink: decodes image files to RGBA8, uploads them, and binds
/// each draw's immutable descriptor set.
struct PoolTextures<'a> {
    device: &'a Arc<Device>,
    textures: &'a mut Vec<DeviceLocalImage>,
    sampler: &'a Sampler,
    sets: &'a [DescriptorSet],
}

impl TextureStore for PoolTextures<'_> {
    fn load_texture(&mut self, path: &Path) -> Result<usize, IngestError> {
        let decoded = image::open(path)
            .map_err(|e| IngestError::Store(Box::new(e)))?
            .into_rgba8();
        let texture = DeviceLocalImage::texture_2d(
            self.device,
            decoded.width(),
            decoded.height(),
            decoded.as_raw(),
            &format!("Texture {}", path.display()),
        )
        .map_err(|e| IngestError::Store(Box::new(e)))?;
        self.textures.push(texture);
        Ok(self.textures.len() - 1)
    }

    fn bind_draw_texture(
        &mut self,
        draw_index: usize,
        texture: usize,
    ) -> Result<(), IngestError> {
        // SAFETY: texture and sampler are owned by the renderer and
        // outlive every frame that binds this set.
        unsafe {
            self.sets[draw_index].write_texture_sampler(
                self.device,
                1,
                &self.textures[texture],
                self.sampler,
            );
        }
        Ok(())
    }
}
