use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::device::Device;
use crate::surface::{Surface, SurfaceQueryError};

/// The surface format the renderer wants: 32-bit BGRA with sRGB
/// presentation. Adapter selection already rejected devices that can't
/// provide it (or the undefined-format wildcard).
pub const PREFERRED_SURFACE_FORMAT: vk::SurfaceFormatKHR =
    vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

/// Triple-buffered low-latency presentation is required, not preferred.
pub(crate) const REQUIRED_PRESENT_MODE: vk::PresentModeKHR =
    vk::PresentModeKHR::MAILBOX;

pub const MIN_SWAPCHAIN_IMAGES: u32 = 3;

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error(
        "Mismatched parameters to Swapchain::new. Device and surface \
         must be derived from the same instance"
    )]
    MismatchedParams,

    #[error("No supported surface formats were reported")]
    NoSurfaceFormats,

    #[error("The surface does not support mailbox presentation")]
    PresentModeUnavailable,

    #[error("Invalid requested swapchain extent ({width}x{height})")]
    InvalidExtent { width: u32, height: u32 },

    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Vulkan error creating swapchain: {0}")]
    VulkanCreate(vk::Result),

    #[error("Vulkan error fetching swapchain images: {0}")]
    VulkanGetImages(vk::Result),

    #[error("Vulkan error creating swapchain image view: {0}")]
    VulkanCreateImageView(vk::Result),
}

/// True when one of `formats` satisfies [`PREFERRED_SURFACE_FORMAT`],
/// counting a `FORMAT_UNDEFINED` entry as "pick whatever you like".
pub(crate) fn supports_preferred_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> bool {
    formats.iter().any(|f| {
        f.format == vk::Format::UNDEFINED
            || (f.format == PREFERRED_SURFACE_FORMAT.format
                && f.color_space == PREFERRED_SURFACE_FORMAT.color_space)
    })
}

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> vk::SurfaceFormatKHR {
    if formats.iter().any(|f| f.format == vk::Format::UNDEFINED) {
        // The wildcard sentinel: the surface takes anything.
        return PREFERRED_SURFACE_FORMAT;
    }

    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == PREFERRED_SURFACE_FORMAT.format
                && f.color_space == PREFERRED_SURFACE_FORMAT.color_space
        })
        .unwrap_or(formats[0])
}

fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
) -> Option<vk::PresentModeKHR> {
    present_modes
        .iter()
        .copied()
        .find(|m| *m == REQUIRED_PRESENT_MODE)
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count =
        capabilities.min_image_count.max(MIN_SWAPCHAIN_IMAGES);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }
    image_count
}

fn choose_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    if capabilities
        .supported_composite_alpha
        .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
    {
        vk::CompositeAlphaFlagsKHR::OPAQUE
    } else if capabilities
        .supported_composite_alpha
        .contains(vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED)
    {
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
    } else if capabilities
        .supported_composite_alpha
        .contains(vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED)
    {
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
    } else {
        vk::CompositeAlphaFlagsKHR::INHERIT
    }
}

fn create_color_image_views<FCreate, FDestroy, FName>(
    images: &[vk::Image],
    format: vk::Format,
    mut create_image_view: FCreate,
    mut destroy_image_view: FDestroy,
    mut name_image_view: FName,
) -> Result<Vec<vk::ImageView>, CreateSwapchainError>
where
    FCreate: FnMut(
        &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result>,
    FDestroy: FnMut(vk::ImageView),
    FName: FnMut(usize, vk::ImageView),
{
    let mut image_views: Vec<vk::ImageView> =
        Vec::with_capacity(images.len());
    for (index, image) in images.iter().copied().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let image_view = match create_image_view(&create_info) {
            Ok(view) => view,
            Err(e) => {
                for created_view in image_views.drain(..) {
                    destroy_image_view(created_view);
                }
                return Err(CreateSwapchainError::VulkanCreateImageView(e));
            }
        };

        name_image_view(index, image_view);
        image_views.push(image_view);
    }

    Ok(image_views)
}

/// The rotating set of presentable images.
///
/// The image count reported by [`image_count`](Self::image_count) is the
/// authoritative frames-in-flight value: depth targets, framebuffers,
/// command buffers, fences and uniform rings are all sized from it.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle> {
    parent_device: Arc<Device>,
    _parent_surface: Arc<Surface<T>>,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    /// Serializes `vkAcquireNextImageKHR`, which the Vulkan spec requires
    /// to be externally synchronized with respect to the swapchain handle.
    acquire_lock: Mutex<()>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug
    for Swapchain<T>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Swapchain<T> {
    /// Create a swapchain for `parent_surface` with at least
    /// [`MIN_SWAPCHAIN_IMAGES`] images.
    ///
    /// There is no recreation path: the extent chosen here (the surface's
    /// current extent when fixed, the clamped `desired_extent` otherwise)
    /// is the extent for the life of the process.
    pub fn new(
        parent_device: &Arc<Device>,
        parent_surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
    ) -> Result<Self, CreateSwapchainError> {
        if desired_extent.width == 0 || desired_extent.height == 0 {
            return Err(CreateSwapchainError::InvalidExtent {
                width: desired_extent.width,
                height: desired_extent.height,
            });
        }

        if !std::sync::Arc::ptr_eq(
            parent_surface.get_parent(),
            parent_device.get_parent(),
        ) {
            return Err(CreateSwapchainError::MismatchedParams);
        }

        let physical_device = parent_device.raw_physical_device();

        // SAFETY: physical_device belongs to parent_device's instance, and
        // parent_surface is derived from the same instance (validated
        // above).
        let capabilities =
            unsafe { parent_surface.query_capabilities(physical_device) }?;
        // SAFETY: same reasoning as above.
        let formats =
            unsafe { parent_surface.query_formats(physical_device) }?;
        // SAFETY: same reasoning as above.
        let present_modes =
            unsafe { parent_surface.query_present_modes(physical_device) }?;

        if formats.is_empty() {
            return Err(CreateSwapchainError::NoSurfaceFormats);
        }

        let surface_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&present_modes)
            .ok_or(CreateSwapchainError::PresentModeUnavailable)?;
        let extent = choose_extent(&capabilities, desired_extent);
        let image_count = choose_image_count(&capabilities);

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(parent_surface.raw_handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(choose_composite_alpha(&capabilities))
            .present_mode(present_mode)
            .clipped(true);

        // SAFETY: create info references valid handles and values selected
        // from queried surface support details.
        let handle = unsafe {
            parent_device
                .ash_swapchain_device()
                .create_swapchain(&swapchain_create_info, None)
        }
        .map_err(CreateSwapchainError::VulkanCreate)?;
        parent_device
            .set_object_name(handle, "Swapchain")
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to name swapchain {:?}: {e}", handle)
            });

        // SAFETY: handle was created by this device's swapchain loader and
        // is valid.
        let images = match unsafe {
            parent_device.ash_swapchain_device().get_swapchain_images(handle)
        } {
            Ok(images) => images,
            Err(e) => {
                // SAFETY: handle was created above and must be destroyed
                // on early exit.
                unsafe {
                    parent_device
                        .ash_swapchain_device()
                        .destroy_swapchain(handle, None)
                };
                return Err(CreateSwapchainError::VulkanGetImages(e));
            }
        };

        for (index, image) in images.iter().copied().enumerate() {
            parent_device
                .set_object_name_with(image, || {
                    format!("Swapchain Image {}", index + 1)
                })
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        "Failed to name swapchain image {:?}: {e}",
                        image
                    )
                });
        }

        let image_views = match create_color_image_views(
            &images,
            surface_format.format,
            |create_info| {
                // SAFETY: create_info references a valid swapchain image
                // from this device, with a standard 2D color subresource
                // range.
                unsafe { parent_device.create_raw_image_view(create_info) }
            },
            |image_view| {
                // SAFETY: image_view was created by parent_device and must
                // be destroyed on early exit.
                unsafe { parent_device.destroy_raw_image_view(image_view) };
            },
            |index, image_view| {
                parent_device
                    .set_object_name_with(image_view, || {
                        format!("Swapchain ImageView {}", index + 1)
                    })
                    .unwrap_or_else(|e| {
                        tracing::warn!(
                            "Failed to name swapchain image view {:?}: {e}",
                            image_view
                        )
                    });
            },
        ) {
            Ok(views) => views,
            Err(e) => {
                // SAFETY: handle was created above and must be destroyed
                // on early exit.
                unsafe {
                    parent_device
                        .ash_swapchain_device()
                        .destroy_swapchain(handle, None)
                };
                return Err(e);
            }
        };

        tracing::info!(
            "Created swapchain: {} images, {:?}, {}x{}",
            images.len(),
            surface_format.format,
            extent.width,
            extent.height,
        );

        Ok(Self {
            parent_device: Arc::clone(parent_device),
            _parent_surface: Arc::clone(parent_surface),
            handle,
            format: surface_format.format,
            extent,
            images,
            image_views,
            acquire_lock: Mutex::new(()),
        })
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Acquire the next presentable image, signaling `fence` when the
    /// presentation engine has truly released it.
    ///
    /// Returns `(image_index, suboptimal)`. When `suboptimal` is `true`
    /// the swapchain is still usable; with a fixed extent we keep
    /// rendering.
    ///
    /// # Safety
    /// `fence` must be a valid unsignaled fence created from this
    /// swapchain's device.
    pub unsafe fn acquire_next_image(
        &self,
        timeout_ns: u64,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        let _guard = self
            .acquire_lock
            .lock()
            .expect("swapchain acquire lock poisoned");
        // SAFETY: caller guarantees fence validity; self.handle is valid
        // for the lifetime of this Swapchain. The frame protocol never
        // passes a semaphore.
        unsafe {
            self.parent_device.ash_swapchain_device().acquire_next_image(
                self.handle,
                timeout_ns,
                vk::Semaphore::null(),
                fence,
            )
        }
    }

    /// Present `image_index` on the device's queue. Returns the
    /// suboptimal flag.
    ///
    /// # Safety
    /// `image_index` must come from a prior acquire on this swapchain,
    /// and all rendering into that image must have been submitted.
    pub unsafe fn present(
        &self,
        image_index: u32,
    ) -> Result<bool, vk::Result> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        // SAFETY: caller guarantees the image was acquired and its
        // commands submitted; the queue is externally synchronized by the
        // crate's single-thread model.
        unsafe {
            self.parent_device
                .ash_swapchain_device()
                .queue_present(self.parent_device.raw_queue(), &present_info)
        }
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Swapchain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        // NOTE: Callers must ensure GPU synchronization before drop (for
        // example, waiting on fences/device idle) so no in-flight work
        // still references these views or the swapchain.
        for image_view in self.image_views.drain(..) {
            // SAFETY: image_view was created by parent_device and is being
            // destroyed during swapchain teardown.
            unsafe { self.parent_device.destroy_raw_image_view(image_view) };
        }
        // SAFETY: swapchain handle was created by parent_device and this
        // is the final destruction path for this wrapper.
        unsafe {
            self.parent_device
                .ash_swapchain_device()
                .destroy_swapchain(self.handle, None)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn surface_format_chooser_prefers_bgra_srgb() {
        let fallback = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen =
            choose_surface_format(&[fallback, PREFERRED_SURFACE_FORMAT]);
        assert_eq!(chosen.format, PREFERRED_SURFACE_FORMAT.format);
        assert_eq!(
            chosen.color_space,
            PREFERRED_SURFACE_FORMAT.color_space
        );
    }

    #[test]
    fn surface_format_chooser_treats_undefined_as_wildcard() {
        let wildcard = vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen = choose_surface_format(&[wildcard]);
        assert_eq!(chosen.format, PREFERRED_SURFACE_FORMAT.format);
        assert!(supports_preferred_surface_format(&[wildcard]));
    }

    #[test]
    fn surface_format_support_rejects_unrelated_formats() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R5G6B5_UNORM_PACK16,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];

        assert!(!supports_preferred_surface_format(&formats));
    }

    #[test]
    fn present_mode_chooser_requires_mailbox() {
        assert_eq!(
            choose_present_mode(&[
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::MAILBOX,
            ]),
            Some(vk::PresentModeKHR::MAILBOX)
        );
        assert_eq!(
            choose_present_mode(&[
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::IMMEDIATE,
            ]),
            None
        );
    }

    #[test]
    fn extent_chooser_uses_current_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1024,
                height: 768,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );

        assert_eq!(chosen.width, 1024);
        assert_eq!(chosen.height, 768);
    }

    #[test]
    fn extent_chooser_clamps_when_variable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 200,
            },
        );

        assert_eq!(chosen.width, 1920);
        assert_eq!(chosen.height, 480);
    }

    #[test]
    fn image_count_chooser_raises_to_triple_buffering() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn image_count_chooser_respects_surface_minimum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 4,
            max_image_count: 0,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&capabilities), 4);
    }

    #[test]
    fn image_view_helper_cleans_up_on_partial_failure() {
        let images = [
            vk::Image::from_raw(1),
            vk::Image::from_raw(2),
            vk::Image::from_raw(3),
        ];
        let created_views =
            [vk::ImageView::from_raw(10), vk::ImageView::from_raw(11)];
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::ImageView>::new());

        let result = create_color_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 => Ok(created_views[0]),
                    _ => Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
                };
                *call += 1;
                ret
            },
            |view| destroyed.borrow_mut().push(view),
            |_index, _view| {},
        );

        assert!(matches!(
            result,
            Err(CreateSwapchainError::VulkanCreateImageView(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        ));
        assert_eq!(destroyed.borrow().as_slice(), &[created_views[0]]);
    }

    #[test]
    fn image_view_helper_returns_all_views_on_success() {
        let images = [vk::Image::from_raw(1), vk::Image::from_raw(2)];
        let views =
            [vk::ImageView::from_raw(100), vk::ImageView::from_raw(101)];
        let create_calls = RefCell::new(0usize);
        let name_calls = RefCell::new(0usize);

        let result = create_color_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |_| {
                let mut call = create_calls.borrow_mut();
                let view = views[*call];
                *call += 1;
                Ok(view)
            },
            |_view| {
                panic!("destroy callback should not be called on success")
            },
            |_index, _view| {
                *name_calls.borrow_mut() += 1;
            },
        )
        .expect("helper should succeed");

        assert_eq!(result, views);
        assert_eq!(*name_calls.borrow(), 2);
    }
}
