//! Logical device creation and the raw call surface built on top of it.
//!
//! [`Device::create_compatible`] negotiates the physical adapter: it
//! rejects adapters missing the swapchain extension, a
//! graphics+compute+present queue family, the preferred surface format, or
//! mailbox present mode, preferring the first discrete GPU among the
//! qualifiers. The created device owns the single queue and one command
//! pool that every command buffer in the process is allocated from.
//!
//! Memory lives here too: [`Device::allocate_memory_for_requirements`]
//! walks the adapter's memory-type table and takes the first type whose
//! property flags satisfy the request. Every resource gets its own
//! `VkDeviceMemory` block; there is no sub-allocation.
//!
//! Everything `raw_*` or `cmd_*` is a thin unsafe wrapper over the ash
//! call of the same name, so higher-level wrappers (and the renderer's
//! recording loop) never touch `ash::Device` directly.

use std::{
    ffi::CString,
    fmt::Debug,
    sync::Arc,
};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    instance::{FetchPhysicalDeviceError, Instance},
    surface::{Surface, SurfaceQueryError, SurfaceSupportError},
    swapchain,
};

const REQUIRED_DEVICE_EXTENSIONS: [&std::ffi::CStr; 1] =
    [ash::khr::swapchain::NAME];

pub struct Device {
    parent_instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    handle: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    swapchain_device: ash::khr::swapchain::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("physical_device", &self.physical_device)
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        //SAFETY: We are in drop, so the pool's command buffers are no
        //longer referenced and no queue work is outstanding (callers
        //wait_idle before letting the device go)
        unsafe { self.handle.destroy_command_pool(self.command_pool, None) };
        //SAFETY: Last use of this device. All child objects hold an Arc to
        //us so they are already gone
        unsafe { self.handle.destroy_device(None) };
    }
}

// ---------------------------------------------------------------------
// Adapter selection
// ---------------------------------------------------------------------

/// Everything we need to know about one physical adapter to decide
/// whether (and how much) we want it. Gathered impurely, judged purely,
/// so the judging is testable with made-up adapters.
#[derive(Debug, Clone, Copy)]
struct AdapterProfile {
    physical_device: vk::PhysicalDevice,
    device_type: vk::PhysicalDeviceType,
    queue_family_index: Option<u32>,
    has_required_extensions: bool,
    has_surface_format: bool,
    has_present_mode: bool,
}

impl AdapterProfile {
    fn qualifies(&self) -> bool {
        self.queue_family_index.is_some()
            && self.has_required_extensions
            && self.has_surface_format
            && self.has_present_mode
    }
}

/// First discrete GPU among the qualifiers wins, otherwise the first
/// qualifier of any type. `None` when nothing qualifies.
fn pick_adapter(profiles: &[AdapterProfile]) -> Option<usize> {
    profiles
        .iter()
        .position(|profile| {
            profile.qualifies()
                && profile.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
        })
        .or_else(|| profiles.iter().position(AdapterProfile::qualifies))
}

#[derive(Debug, Error)]
pub enum CreateCompatibleDeviceError {
    #[error(
        "No physical device satisfies the renderer's requirements \
         (swapchain extension, graphics+compute+present queue family, \
         preferred surface format, mailbox present mode)"
    )]
    NoSuitableDevice,
    #[error("Couldn't fetch physical devices: {0}")]
    FetchPhysicalDevices(#[from] FetchPhysicalDeviceError),
    #[error("Couldn't query surface support: {0}")]
    SurfaceSupport(#[from] SurfaceSupportError),
    #[error("Couldn't query surface properties: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),
    #[error("Unknown vulkan error: {0}")]
    UnknownVulkan(#[from] vk::Result),
}

impl Device {
    /// Selects a physical adapter compatible with `surf` and creates the
    /// logical device, its single graphics+compute queue, and the command
    /// pool all command buffers come from.
    pub fn create_compatible<T: HasWindowHandle + HasDisplayHandle>(
        instance: Arc<Instance>,
        surf: &Surface<T>,
    ) -> Result<Arc<Self>, CreateCompatibleDeviceError> {
        use CreateCompatibleDeviceError as Error;

        let physical_devices = instance.fetch_raw_physical_devices()?;

        let mut profiles = Vec::with_capacity(physical_devices.len());
        for physical_device in physical_devices.iter().copied() {
            // SAFETY: physical_device came from this instance on the
            // line above.
            let properties = unsafe {
                instance.get_raw_physical_device_properties(physical_device)
            };

            // SAFETY: physical_device came from this instance.
            let available_extensions = unsafe {
                instance
                    .enumerate_raw_device_extension_properties(physical_device)
            }?;
            let has_required_extensions =
                REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
                    available_extensions.iter().any(|avail| {
                        avail.extension_name_as_c_str() == Ok(*required)
                    })
                });

            // SAFETY: physical_device came from this instance.
            let queue_families = unsafe {
                instance.get_raw_physical_device_queue_family_properties(
                    physical_device,
                )
            };
            let mut queue_family_index = None;
            for (index, family) in queue_families.iter().enumerate() {
                let index = index as u32;
                if !family.queue_flags.contains(
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                ) {
                    continue;
                }
                // SAFETY: physical_device and surf share this instance.
                if unsafe {
                    surf.supports_queue_family(physical_device, index)
                }? {
                    queue_family_index = Some(index);
                    break;
                }
            }

            // SAFETY: physical_device and surf share this instance.
            let formats = unsafe { surf.query_formats(physical_device) }?;
            let has_surface_format =
                swapchain::supports_preferred_surface_format(&formats);

            // SAFETY: physical_device and surf share this instance.
            let present_modes =
                unsafe { surf.query_present_modes(physical_device) }?;
            let has_present_mode = present_modes
                .contains(&swapchain::REQUIRED_PRESENT_MODE);

            let profile = AdapterProfile {
                physical_device,
                device_type: properties.device_type,
                queue_family_index,
                has_required_extensions,
                has_surface_format,
                has_present_mode,
            };
            tracing::debug!(
                "Considered adapter {:?} ({:?}): queue family {:?}, \
                 extensions {}, surface format {}, present mode {}",
                properties.device_name_as_c_str().unwrap_or(c"<invalid>"),
                properties.device_type,
                profile.queue_family_index,
                profile.has_required_extensions,
                profile.has_surface_format,
                profile.has_present_mode,
            );
            profiles.push(profile);
        }

        let chosen = pick_adapter(&profiles).ok_or(Error::NoSuitableDevice)?;
        let profile = profiles[chosen];
        let physical_device = profile.physical_device;
        let queue_family_index = profile
            .queue_family_index
            .expect("picked adapter always has a queue family");

        // SAFETY: physical_device came from this instance.
        let properties = unsafe {
            instance.get_raw_physical_device_properties(physical_device)
        };
        // SAFETY: physical_device came from this instance.
        let memory_properties = unsafe {
            instance.get_raw_physical_device_memory_properties(physical_device)
        };
        tracing::info!(
            "Using adapter {:?} ({:?})",
            properties.device_name_as_c_str().unwrap_or(c"<invalid>"),
            properties.device_type,
        );

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);

        let extension_ptrs: Vec<_> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();
        let features = vk::PhysicalDeviceFeatures::default();
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features);

        // SAFETY: physical_device came from this instance and the create
        // info only references locals that live across the call.
        let handle = unsafe {
            instance.create_ash_device(physical_device, &device_create_info)
        }?;

        // SAFETY: the queue family was part of the device create info with
        // one queue requested.
        let queue = unsafe { handle.get_device_queue(queue_family_index, 0) };

        let pool_create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        // SAFETY: handle is alive and the create info is valid.
        let command_pool = match unsafe {
            handle.create_command_pool(&pool_create_info, None)
        } {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: nothing else references the device yet.
                unsafe { handle.destroy_device(None) };
                return Err(e.into());
            }
        };

        let swapchain_device = instance.create_swapchain_loader(&handle);
        let debug_utils_device =
            instance.create_debug_utils_device_loader(&handle);

        Ok(Arc::new(Self {
            parent_instance: instance,
            physical_device,
            handle,
            queue,
            queue_family_index,
            command_pool,
            swapchain_device,
            debug_utils_device,
            memory_properties,
            properties,
        }))
    }

    pub fn get_parent(&self) -> &Arc<Instance> {
        &self.parent_instance
    }

    pub fn raw_physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub(crate) fn ash_swapchain_device(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_device
    }

    pub(crate) fn raw_queue(&self) -> vk::Queue {
        self.queue
    }

    /// The device limit every uniform-ring offset must be a multiple of.
    pub fn min_uniform_buffer_offset_alignment(&self) -> u64 {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    /// Blocks until all queue work on this device has finished.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        //SAFETY: always safe to call on a live device
        unsafe { self.handle.device_wait_idle() }
    }
}

// ---------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------

/// Walks the memory-type table and returns the first type that is both in
/// `supported_type_bits` (from the resource's memory requirements) and
/// carries every flag in `required`.
fn select_memory_type(
    memory_types: &[vk::MemoryType],
    supported_type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_types
        .iter()
        .enumerate()
        .position(|(index, memory_type)| {
            supported_type_bits & (1 << index) != 0
                && memory_type.property_flags.contains(required)
        })
        .map(|index| index as u32)
}

#[derive(Debug, Error)]
pub enum AllocateDeviceMemoryError {
    #[error(
        "No memory type satisfies the resource \
         (supported type bits {supported_type_bits:#b}, \
         required properties {required:?})"
    )]
    NoCompatibleMemoryType {
        supported_type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("Vulkan error allocating device memory: {0}")]
    Vulkan(vk::Result),
}

impl Device {
    /// Allocates one dedicated memory block for a resource with the given
    /// requirements, backed by the first compatible memory type.
    pub fn allocate_memory_for_requirements(
        &self,
        requirements: vk::MemoryRequirements,
        required: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory, AllocateDeviceMemoryError> {
        let memory_type_index = select_memory_type(
            self.memory_properties.memory_types_as_slice(),
            requirements.memory_type_bits,
            required,
        )
        .ok_or(AllocateDeviceMemoryError::NoCompatibleMemoryType {
            supported_type_bits: requirements.memory_type_bits,
            required,
        })?;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        //SAFETY: valid allocate info with a type index inside the table
        unsafe { self.handle.allocate_memory(&allocate_info, None) }
            .map_err(AllocateDeviceMemoryError::Vulkan)
    }

    /// Frees a memory block allocated from this device.
    ///
    /// # Safety
    /// `memory` must come from this device, must not be mapped, and no
    /// resource may still be bound to it from the GPU's point of view.
    pub unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        //SAFETY: provenance and no-longer-in-use guaranteed by caller
        unsafe { self.handle.free_memory(memory, None) };
    }

    /// Maps the whole of a host-visible memory block.
    ///
    /// # Safety
    /// `memory` must come from this device, be host-visible, and not
    /// already be mapped.
    pub unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
    ) -> Result<*mut std::ffi::c_void, vk::Result> {
        //SAFETY: caller guarantees provenance, host visibility and that
        //the block is unmapped
        unsafe {
            self.handle.map_memory(
                memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
    }

    /// # Safety
    /// `memory` must come from this device and currently be mapped.
    pub unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        //SAFETY: caller guarantees memory is mapped and from this device
        unsafe { self.handle.unmap_memory(memory) };
    }
}

// ---------------------------------------------------------------------
// Debug naming
// ---------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Object name contained an interior NUL")]
    InvalidName,
    #[error("Vulkan error naming object: {0}")]
    Vulkan(vk::Result),
}

impl Device {
    /// Attaches a debug-utils name to any Vulkan object owned by this
    /// device. A no-op when debug utils are not loaded.
    pub fn set_object_name<H: vk::Handle + Copy>(
        &self,
        object: H,
        name: &str,
    ) -> Result<(), NameObjectError> {
        let Some(ref debug_utils) = self.debug_utils_device else {
            return Ok(());
        };
        let name_cstring = CString::new(name)
            .map_err(|_| NameObjectError::InvalidName)?;
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&name_cstring);
        //SAFETY: object is owned by this device (caller contract) and the
        //name info only references locals alive across the call
        unsafe { debug_utils.set_debug_utils_object_name(&name_info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Like [`set_object_name`](Self::set_object_name) but the name string
    /// is only built when debug utils are actually loaded.
    pub fn set_object_name_with<H: vk::Handle + Copy>(
        &self,
        object: H,
        name: impl FnOnce() -> String,
    ) -> Result<(), NameObjectError> {
        if self.debug_utils_device.is_none() {
            return Ok(());
        }
        self.set_object_name(object, &name())
    }
}

// ---------------------------------------------------------------------
// Command buffers and queue submission
// ---------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OneTimeSubmitError {
    #[error("Vulkan error allocating one-time command buffer: {0}")]
    Allocate(vk::Result),
    #[error("Vulkan error recording one-time command buffer: {0}")]
    Record(vk::Result),
    #[error("Vulkan error submitting one-time command buffer: {0}")]
    Submit(vk::Result),
    #[error("Vulkan error waiting for the queue after one-time submit: {0}")]
    WaitIdle(vk::Result),
}

impl Device {
    /// Allocates primary command buffers from the device's pool.
    pub fn allocate_raw_primary_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        //SAFETY: the pool belongs to this device and outlives the buffers
        unsafe { self.handle.allocate_command_buffers(&allocate_info) }
    }

    /// Returns command buffers to the device's pool.
    ///
    /// # Safety
    /// The buffers must come from this device's pool and must not be
    /// pending execution.
    pub unsafe fn free_raw_command_buffers(
        &self,
        command_buffers: &[vk::CommandBuffer],
    ) {
        //SAFETY: provenance and not-pending guaranteed by caller
        unsafe {
            self.handle
                .free_command_buffers(self.command_pool, command_buffers)
        };
    }

    /// # Safety
    /// `command_buffer` must come from this device's pool and be in the
    /// initial state.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        one_time: bool,
    ) -> Result<(), vk::Result> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(flags);
        //SAFETY: caller guarantees buffer state
        unsafe {
            self.handle.begin_command_buffer(command_buffer, &begin_info)
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees buffer state
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must come from this device's pool and must not be
    /// pending execution (wait its fence first).
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        //SAFETY: the pool was created RESET_COMMAND_BUFFER; caller
        //guarantees the buffer is not pending
        unsafe {
            self.handle.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )
        }
    }

    /// Submits command buffers to the device's queue, optionally signaling
    /// `fence` on completion. No semaphores are involved; all cross-frame
    /// ordering in this renderer is fence-based.
    ///
    /// # Safety
    /// The buffers must be in the executable state, must not be re-recorded
    /// until completion, and `fence` (if any) must be unsignaled.
    pub unsafe fn queue_submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        fence: Option<vk::Fence>,
    ) -> Result<(), vk::Result> {
        let submit_info =
            vk::SubmitInfo::default().command_buffers(command_buffers);
        //SAFETY: caller guarantees buffer/fence states; the queue is
        //externally synchronized by the crate's single-thread model
        unsafe {
            self.handle.queue_submit(
                self.queue,
                std::slice::from_ref(&submit_info),
                fence.unwrap_or(vk::Fence::null()),
            )
        }
    }

    /// Records with `record`, submits, and blocks until the queue drains.
    ///
    /// Load-time only; must not be called while frames are in flight.
    pub fn one_time_submit(
        &self,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), OneTimeSubmitError> {
        use OneTimeSubmitError as Error;

        let command_buffer = self
            .allocate_raw_primary_command_buffers(1)
            .map_err(Error::Allocate)?[0];

        let record_result = (|| {
            //SAFETY: freshly allocated buffer in the initial state
            unsafe { self.begin_raw_command_buffer(command_buffer, true) }?;
            record(command_buffer);
            //SAFETY: we are recording
            unsafe { self.end_raw_command_buffer(command_buffer) }
        })();
        if let Err(e) = record_result {
            //SAFETY: never submitted
            unsafe { self.free_raw_command_buffers(&[command_buffer]) };
            return Err(Error::Record(e));
        }

        //SAFETY: buffer is executable, not submitted elsewhere
        if let Err(e) =
            unsafe { self.queue_submit(&[command_buffer], None) }
        {
            //SAFETY: submission failed so the buffer is not pending
            unsafe { self.free_raw_command_buffers(&[command_buffer]) };
            return Err(Error::Submit(e));
        }

        //SAFETY: always safe on a live queue
        let wait_result = unsafe { self.handle.queue_wait_idle(self.queue) };
        //SAFETY: the queue is drained (or we're about to bail anyway), so
        //the buffer is no longer pending
        unsafe { self.free_raw_command_buffers(&[command_buffer]) };
        wait_result.map_err(Error::WaitIdle)
    }
}

// ---------------------------------------------------------------------
// Command recording
// ---------------------------------------------------------------------

// All `cmd_*` wrappers share the same contract: `command_buffer` must be
// in the recording state and every referenced handle must come from this
// device.
impl Device {
    /// # Safety
    /// See the module contract above; additionally `render_pass` and
    /// `framebuffer` must be compatible.
    pub unsafe fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_begin_render_pass(
                command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            )
        };
    }

    /// # Safety
    /// Must be inside a render pass begun on `command_buffer`.
    pub unsafe fn cmd_end_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe { self.handle.cmd_end_render_pass(command_buffer) };
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        };
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_bind_vertex_buffers(
                command_buffer,
                binding,
                &[buffer],
                &[offset],
            )
        };
    }

    /// # Safety
    /// See the module contract above. The buffer's contents are read as
    /// 16-bit indices.
    pub unsafe fn cmd_bind_index_buffer_u16(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_bind_index_buffer(
                command_buffer,
                buffer,
                offset,
                vk::IndexType::UINT16,
            )
        };
    }

    /// # Safety
    /// See the module contract above. `dynamic_offsets` must match the
    /// dynamic descriptor count of `set`.
    pub unsafe fn cmd_bind_graphics_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &[set],
                dynamic_offsets,
            )
        };
    }

    /// # Safety
    /// See the module contract above; a pipeline and all its consumed
    /// state must be bound.
    pub unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_draw_indexed(
                command_buffer,
                index_count,
                1,
                first_index,
                vertex_offset,
                0,
            )
        };
    }

    /// # Safety
    /// See the module contract above; regions must lie inside both
    /// buffers.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_copy_buffer(command_buffer, src, dst, regions)
        };
    }

    /// # Safety
    /// See the module contract above; `dst` must be in `dst_layout` when
    /// the copy executes.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                dst_layout,
                regions,
            )
        };
    }

    /// # Safety
    /// See the module contract above; the barriers must describe valid
    /// layout transitions for their images.
    pub unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        //SAFETY: caller upholds the recording contract
        unsafe {
            self.handle.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            )
        };
    }
}

// ---------------------------------------------------------------------
// Raw resource creation/destruction
// ---------------------------------------------------------------------

// Thin pass-throughs so child wrappers never hold an `ash::Device`.
// Destruction wrappers share the contract that the handle comes from this
// device, is the last live use, and no GPU work still references it.
impl Device {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must come from this device.
    pub unsafe fn get_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        //SAFETY: provenance guaranteed by caller
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must come from this device; `memory` must
    /// satisfy the buffer's requirements and not be bound elsewhere.
    pub unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees the binding is valid
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must come from this device.
    pub unsafe fn get_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        //SAFETY: provenance guaranteed by caller
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must come from this device; `memory` must
    /// satisfy the image's requirements and not be bound elsewhere.
    pub unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees the binding is valid
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// # Safety
    /// `create_info` must be valid and reference an image from this
    /// device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_image_view(&self, view: vk::ImageView) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_image_view(view, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_sampler(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_sampler(sampler, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe {
            self.handle.create_descriptor_set_layout(create_info, None)
        }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        //SAFETY: caller upholds the destruction contract
        unsafe {
            self.handle.destroy_descriptor_set_layout(layout, None)
        };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// See the module contract above. Destroying the pool frees every set
    /// allocated from it.
    pub unsafe fn destroy_raw_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must be valid and the pool must have capacity.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        //SAFETY: caller guarantees allocate info validity
        unsafe { self.handle.allocate_descriptor_sets(allocate_info) }
    }

    /// # Safety
    /// Every write must reference live resources from this device, and no
    /// written set may be in use by pending GPU work.
    pub unsafe fn update_raw_descriptor_sets(
        &self,
        writes: &[vk::WriteDescriptorSet<'_>],
    ) {
        //SAFETY: caller upholds the update contract
        unsafe { self.handle.update_descriptor_sets(writes, &[]) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_render_pass(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_render_pass(
        &self,
        render_pass: vk::RenderPass,
    ) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_render_pass(render_pass, None) };
    }

    /// # Safety
    /// `create_info` must be valid and its attachments must outlive the
    /// framebuffer.
    pub unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_framebuffer(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_framebuffer(
        &self,
        framebuffer: vk::Framebuffer,
    ) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_framebuffer(framebuffer, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_pipeline_layout(
        &self,
        layout: vk::PipelineLayout,
    ) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        //SAFETY: caller guarantees create info validity
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_shader_module(
        &self,
        module: vk::ShaderModule,
    ) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_shader_module(module, None) };
    }

    /// Creates a single graphics pipeline.
    ///
    /// # Safety
    /// `create_info` must be valid and every handle it references must
    /// come from this device and stay alive across the call.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        //SAFETY: caller guarantees create info validity
        match unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        } {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((pipelines, e)) => {
                for pipeline in pipelines {
                    if pipeline != vk::Pipeline::null() {
                        //SAFETY: partially created handle nothing else
                        //references
                        unsafe {
                            self.handle.destroy_pipeline(pipeline, None)
                        };
                    }
                }
                Err(e)
            }
        }
    }

    /// # Safety
    /// See the module contract above.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// ---------------------------------------------------------------------
// Fences
// ---------------------------------------------------------------------

impl Device {
    pub(crate) fn create_raw_fence(
        &self,
        signaled: bool,
    ) -> Result<vk::Fence, vk::Result> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        //SAFETY: valid create info
        unsafe { self.handle.create_fence(&create_info, None) }
    }

    /// # Safety
    /// See the destruction contract in the raw-wrapper section.
    pub(crate) unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        //SAFETY: caller upholds the destruction contract
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// Waits for a fence. `Err(vk::Result::TIMEOUT)` when the timeout
    /// elapses first.
    ///
    /// # Safety
    /// `fence` must come from this device.
    pub(crate) unsafe fn wait_for_raw_fence(
        &self,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        //SAFETY: provenance guaranteed by caller
        unsafe { self.handle.wait_for_fences(&[fence], true, timeout_ns) }
    }

    /// # Safety
    /// `fence` must come from this device and must not be associated with
    /// still-pending queue work.
    pub(crate) unsafe fn reset_raw_fence(
        &self,
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        //SAFETY: caller guarantees the fence is not in flight
        unsafe { self.handle.reset_fences(&[fence]) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn profile(
        raw: u64,
        device_type: vk::PhysicalDeviceType,
    ) -> AdapterProfile {
        AdapterProfile {
            physical_device: vk::PhysicalDevice::from_raw(raw),
            device_type,
            queue_family_index: Some(0),
            has_required_extensions: true,
            has_surface_format: true,
            has_present_mode: true,
        }
    }

    #[test]
    fn adapter_selection_prefers_discrete() {
        let profiles = [
            profile(1, vk::PhysicalDeviceType::INTEGRATED_GPU),
            profile(2, vk::PhysicalDeviceType::DISCRETE_GPU),
            profile(3, vk::PhysicalDeviceType::DISCRETE_GPU),
        ];

        assert_eq!(pick_adapter(&profiles), Some(1));
    }

    #[test]
    fn adapter_selection_accepts_first_qualifier_without_discrete() {
        let profiles = [
            profile(1, vk::PhysicalDeviceType::INTEGRATED_GPU),
            profile(2, vk::PhysicalDeviceType::VIRTUAL_GPU),
        ];

        assert_eq!(pick_adapter(&profiles), Some(0));
    }

    #[test]
    fn adapter_selection_skips_discrete_that_fails_requirements() {
        let mut discrete = profile(1, vk::PhysicalDeviceType::DISCRETE_GPU);
        discrete.has_present_mode = false;
        let profiles =
            [discrete, profile(2, vk::PhysicalDeviceType::INTEGRATED_GPU)];

        assert_eq!(pick_adapter(&profiles), Some(1));
    }

    #[test]
    fn adapter_selection_fails_when_no_swapchain_extension() {
        let mut a = profile(1, vk::PhysicalDeviceType::DISCRETE_GPU);
        let mut b = profile(2, vk::PhysicalDeviceType::INTEGRATED_GPU);
        a.has_required_extensions = false;
        b.has_required_extensions = false;

        assert_eq!(pick_adapter(&[a, b]), None);
    }

    #[test]
    fn adapter_selection_fails_without_queue_family() {
        let mut a = profile(1, vk::PhysicalDeviceType::DISCRETE_GPU);
        a.queue_family_index = None;

        assert_eq!(pick_adapter(&[a]), None);
    }

    fn memory_type(flags: vk::MemoryPropertyFlags) -> vk::MemoryType {
        vk::MemoryType {
            property_flags: flags,
            heap_index: 0,
        }
    }

    #[test]
    fn memory_type_selection_takes_first_match() {
        let types = [
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            memory_type(
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
            memory_type(
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
            ),
        ];

        assert_eq!(
            select_memory_type(
                &types,
                0b111,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
            Some(1)
        );
    }

    #[test]
    fn memory_type_selection_respects_supported_type_bits() {
        let types = [
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL),
        ];

        // Type 0 carries the right flags but the resource cannot live
        // there.
        assert_eq!(
            select_memory_type(
                &types,
                0b10,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            Some(1)
        );
    }

    #[test]
    fn memory_type_selection_fails_when_nothing_matches() {
        let types = [memory_type(vk::MemoryPropertyFlags::DEVICE_LOCAL)];

        assert_eq!(
            select_memory_type(
                &types,
                0b1,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
            None
        );
    }
}
