//! Caching of Vulkan pipelines, pipeline layouts and descriptor sets for an immediate-mode
//! renderer.
//!
//! # Overview
//!
//! Every draw call needs a graphics pipeline and a set of resource bindings matching the shaders,
//! vertex layout, fixed-function state, render pass and resources that are currently bound.
//! Creating those objects per draw is far too slow, so instead the renderer describes the state
//! it wants through a sequence of `bind_*` calls on a [`PipelineStateCache`], and at draw time
//! asks the cache to resolve that description into an object that is created once and reused
//! across draws and frames:
//!
//! - [`bind_pipeline`] resolves a [`PipelineKey`] into a `vk::Pipeline`, creating the
//!   `vk::PipelineLayout` for the current [`PipelineLayoutKey`] along the way.
//! - [`bind_descriptors`] resolves a [`DescriptorKey`] into three descriptor sets, one per
//!   [`BindingClass`]. Slots that have nothing bound are filled with dummy resources, because
//!   core Vulkan doesn't allow null descriptors.
//! - [`bind_scissor`] only records a scissor command if the rectangle changed.
//!
//! # Lifetime of cached objects
//!
//! The cache doesn't wait on fences. Instead it keeps a logical clock that is advanced once per
//! command buffer boundary with [`on_command_buffer`]. Any object that hasn't been used for more
//! than the retention window is considered no longer in use by the device and is destroyed, or
//! in the case of descriptor sets, parked in an arena for reuse. This is only sound if the
//! submission layer never has more command buffers in flight than the retention window.
//!
//! Descriptor sets are allocated from a single pool. When it runs out, a pool twice as big
//! replaces it, and the old pool is kept alive until every descriptor set allocated from it has
//! aged out.
//!
//! [`bind_pipeline`]: PipelineStateCache::bind_pipeline
//! [`bind_descriptors`]: PipelineStateCache::bind_descriptors
//! [`bind_scissor`]: PipelineStateCache::bind_scissor
//! [`on_command_buffer`]: PipelineStateCache::on_command_buffer

pub use crate::{
    cache::{PipelineStateCache, PipelineStateCacheCreateInfo},
    device::{CacheDevice, DummyBuffer, VulkanDevice},
    key::{
        BindingClass, DescriptorKey, InputAttachmentBinding, PipelineKey, PipelineLayoutKey,
        SamplerBinding, SamplerUsage, ShaderProgram, UniformBufferBinding, VertexAttribute,
        VertexBuffer,
    },
    raster::{Blending, DepthBias, DepthStencil, Multisampling, RasterState, Rasterization},
};

pub mod cache;
mod descriptor;
pub mod device;
pub mod key;
mod layout;
mod pipeline;
mod pool;
pub mod raster;
mod tests;

/// Number of uniform buffer slots in the uniform buffer descriptor set.
pub const UNIFORM_BUFFER_BINDING_COUNT: usize = 10;

/// Number of combined image sampler slots in the sampler descriptor set.
///
/// Bounded by [`PipelineLayoutKey`], which spends two bits per sampler slot in a `u64`.
pub const SAMPLER_BINDING_COUNT: usize = 32;

/// Number of input attachment slots in the input attachment descriptor set.
pub const INPUT_ATTACHMENT_BINDING_COUNT: usize = 8;

/// Maximum number of vertex attributes, and of vertex buffer bindings, in a [`PipelineKey`].
pub const VERTEX_ATTRIBUTE_COUNT: usize = 16;

/// Maximum number of color attachments a pipeline can write to.
pub const MAX_COLOR_TARGET_COUNT: usize = 8;

/// Number of shader stages a pipeline can have: vertex and fragment.
pub const SHADER_MODULE_COUNT: usize = 2;

/// Number of descriptor sets bound per draw, one per [`BindingClass`].
pub const DESCRIPTOR_TYPE_COUNT: usize = 3;

/// Default number of command buffer boundaries an unused object survives.
pub const DEFAULT_RETENTION_WINDOW: u64 = 10;

/// Default number of descriptor set bundles the first descriptor pool is planned for.
pub const DEFAULT_DESCRIPTOR_POOL_SIZE: u32 = 500;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
