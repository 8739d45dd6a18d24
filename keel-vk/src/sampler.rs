//! Sampler wrapper ([`Sampler`]).
//!
//! A sampler encodes texture filtering and addressing state independently
//! of any particular image. The renderer shares one sampler across every
//! base-color texture.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;

/// An owned `VkSampler`.
pub struct Sampler {
    parent: Arc<Device>,
    handle: vk::Sampler,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    /// Create the shared texture sampler: linear magnification and
    /// minification, nearest mip selection, repeat addressing on all
    /// three axes. Anisotropy is disabled. Textures carry a single mip
    /// level, so nearest mip selection always lands on level zero.
    pub fn new(device: &Arc<Device>, name: &str) -> Result<Self, vk::Result> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        // SAFETY: create_info is fully initialised with no borrowed data.
        let handle = unsafe { device.create_raw_sampler(&create_info) }?;

        if let Err(e) = device.set_object_name(handle, name) {
            tracing::warn!("Failed to name sampler {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_sampler(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        tracing::debug!("Dropping sampler {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this
        // wrapper. No GPU work may still reference it.
        unsafe { self.parent.destroy_raw_sampler(self.handle) };
    }
}
