//! Thin RAII wrappers around the Vulkan objects used by the keel viewer,
//! built on [`ash`].
//!
//! > **Personal project.** This crate is not intended for general use
//! > and makes no API stability guarantees.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! │   └── Swapchain<T>
//! └── Device
//!     ├── HostVisibleBuffer / DeviceLocalBuffer
//!     ├── DeviceLocalImage (textures and depth targets)
//!     ├── Sampler
//!     ├── DescriptorSetLayout → DescriptorPool → DescriptorSet
//!     ├── RenderPass → Framebuffer
//!     ├── PipelineLayout (with DescriptorSetLayout refs)
//!     ├── ShaderModule → EntryPoint → GraphicsPipeline
//!     └── Fence
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod pass;
pub mod pipeline;
pub mod sampler;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;
