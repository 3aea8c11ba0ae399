//! The keys that identify cached objects, and the value types they are built from.
//!
//! The cache accumulates three requirement structs from `bind_*` calls, one per key type:
//!
//! - A [`PipelineLayoutKey`] records which shader stages read each sampler binding. It selects
//!   the pipeline layout and its descriptor set layouts.
//! - A [`PipelineKey`] records everything baked into a graphics pipeline.
//! - A [`DescriptorKey`] records the resources bound to every slot of the three descriptor sets.
//!
//! Keys are compared exactly. No normalization takes place, so two requirement structs select the
//! same object only if every field is identical.

use crate::{
    raster::RasterState, INPUT_ATTACHMENT_BINDING_COUNT, SAMPLER_BINDING_COUNT,
    UNIFORM_BUFFER_BINDING_COUNT, VERTEX_ATTRIBUTE_COUNT,
};
use ash::vk;
use vulkano::{
    format::Format, image::ImageLayout, pipeline::graphics::input_assembly::PrimitiveTopology,
    shader::ShaderStages, DeviceSize,
};

/// Which shader stages read each sampler binding of a program.
///
/// Two bits are used per sampler binding: bit `2 * binding` is set if the vertex stage reads the
/// binding, and bit `2 * binding + 1` if the fragment stage does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineLayoutKey(u64);

impl PipelineLayoutKey {
    /// Builds the key from the sampler usage reported by shader reflection.
    ///
    /// Stages other than vertex and fragment are ignored.
    ///
    /// # Panics
    ///
    /// - Panics if a binding is not less than [`SAMPLER_BINDING_COUNT`].
    pub fn from_sampler_usage(sampler_usage: &[SamplerUsage]) -> Self {
        let mut bits = 0;

        for &SamplerUsage { binding, stages } in sampler_usage {
            assert!(
                (binding as usize) < SAMPLER_BINDING_COUNT,
                "sampler binding overflow: binding = {}, capacity = {}",
                binding,
                SAMPLER_BINDING_COUNT,
            );

            if stages.intersects(ShaderStages::VERTEX) {
                bits |= 1 << (binding * 2);
            }

            if stages.intersects(ShaderStages::FRAGMENT) {
                bits |= 1 << (binding * 2 + 1);
            }
        }

        PipelineLayoutKey(bits)
    }

    /// Returns the stages that read the sampler at `binding`. This may be empty.
    #[inline]
    pub fn stages(self, binding: u32) -> ShaderStages {
        debug_assert!((binding as usize) < SAMPLER_BINDING_COUNT);

        let mut stages = ShaderStages::empty();

        if self.0 & (1 << (binding * 2)) != 0 {
            stages |= ShaderStages::VERTEX;
        }

        if self.0 & (1 << (binding * 2 + 1)) != 0 {
            stages |= ShaderStages::FRAGMENT;
        }

        stages
    }

    /// Returns the raw bits of the key.
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// The shader stages that read one sampler binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplerUsage {
    pub binding: u32,
    pub stages: ShaderStages,
}

/// A linked shader program as seen by the cache.
#[derive(Clone, Debug, Default)]
pub struct ShaderProgram {
    /// The vertex shader module. Must be set before a pipeline is bound.
    pub vertex_shader: vk::ShaderModule,

    /// The fragment shader module, or `None` for a depth-only program such as shadow map
    /// generation. Such programs get no color attachments.
    pub fragment_shader: Option<vk::ShaderModule>,

    /// Which stages read each sampler binding.
    pub sampler_usage: Vec<SamplerUsage>,
}

impl ShaderProgram {
    #[inline]
    pub fn layout_key(&self) -> PipelineLayoutKey {
        PipelineLayoutKey::from_sampler_usage(&self.sampler_usage)
    }
}

/// One vertex attribute consumed by the vertex shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

impl VertexAttribute {
    pub(crate) fn to_vk(self) -> vk::VertexInputAttributeDescription {
        let Self {
            location,
            binding,
            format,
            offset,
        } = self;

        vk::VertexInputAttributeDescription {
            location,
            binding,
            format: format.into(),
            offset,
        }
    }
}

/// One vertex buffer binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBuffer {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

impl VertexBuffer {
    pub(crate) fn to_vk(self) -> vk::VertexInputBindingDescription {
        let Self {
            binding,
            stride,
            input_rate,
        } = self;

        vk::VertexInputBindingDescription {
            binding,
            stride,
            input_rate,
        }
    }
}

/// Everything that is baked into a graphics pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub vertex_shader: vk::ShaderModule,
    pub fragment_shader: Option<vk::ShaderModule>,

    /// The vertex attributes. Only the entries before the first `None` are used.
    pub vertex_attributes: [Option<VertexAttribute>; VERTEX_ATTRIBUTE_COUNT],

    /// The vertex buffer bindings. Only the entries before the first `None` are used.
    pub vertex_buffers: [Option<VertexBuffer>; VERTEX_ATTRIBUTE_COUNT],

    pub raster_state: RasterState,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub topology: PrimitiveTopology,
}

impl Default for PipelineKey {
    #[inline]
    fn default() -> Self {
        PipelineKey {
            vertex_shader: vk::ShaderModule::null(),
            fragment_shader: None,
            vertex_attributes: [None; VERTEX_ATTRIBUTE_COUNT],
            vertex_buffers: [None; VERTEX_ATTRIBUTE_COUNT],
            raster_state: RasterState::new(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
            topology: PrimitiveTopology::TriangleList,
        }
    }
}

impl PipelineKey {
    /// Returns the leading populated vertex attributes.
    pub fn active_vertex_attributes(&self) -> impl Iterator<Item = &VertexAttribute> {
        self.vertex_attributes.iter().map_while(Option::as_ref)
    }

    /// Returns the leading populated vertex buffer bindings.
    pub fn active_vertex_buffers(&self) -> impl Iterator<Item = &VertexBuffer> {
        self.vertex_buffers.iter().map_while(Option::as_ref)
    }
}

/// A uniform buffer range bound to one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniformBufferBinding {
    pub buffer: vk::Buffer,
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

impl UniformBufferBinding {
    pub(crate) fn to_vk(self) -> vk::DescriptorBufferInfo {
        let Self {
            buffer,
            offset,
            size,
        } = self;

        vk::DescriptorBufferInfo {
            buffer,
            offset,
            range: size,
        }
    }
}

/// A sampled image bound to one combined image sampler slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerBinding {
    pub sampler: vk::Sampler,
    pub image_view: vk::ImageView,
    pub image_layout: ImageLayout,
}

impl SamplerBinding {
    pub(crate) fn to_vk(self) -> vk::DescriptorImageInfo {
        let Self {
            sampler,
            image_view,
            image_layout,
        } = self;

        vk::DescriptorImageInfo {
            sampler,
            image_view,
            image_layout: image_layout.into(),
        }
    }
}

/// An image bound to one input attachment slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputAttachmentBinding {
    pub image_view: vk::ImageView,
    pub image_layout: ImageLayout,
}

impl InputAttachmentBinding {
    pub(crate) fn to_vk(self) -> vk::DescriptorImageInfo {
        let Self {
            image_view,
            image_layout,
        } = self;

        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view,
            image_layout: image_layout.into(),
        }
    }
}

/// The resources bound to every slot of the three descriptor sets. `None` means the slot is
/// unbound and receives a dummy resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub uniform_buffers: [Option<UniformBufferBinding>; UNIFORM_BUFFER_BINDING_COUNT],
    pub samplers: [Option<SamplerBinding>; SAMPLER_BINDING_COUNT],
    pub input_attachments: [Option<InputAttachmentBinding>; INPUT_ATTACHMENT_BINDING_COUNT],
}

impl Default for DescriptorKey {
    #[inline]
    fn default() -> Self {
        DescriptorKey {
            uniform_buffers: [None; UNIFORM_BUFFER_BINDING_COUNT],
            samplers: [None; SAMPLER_BINDING_COUNT],
            input_attachments: [None; INPUT_ATTACHMENT_BINDING_COUNT],
        }
    }
}

/// The three kinds of resources the cache binds. Each gets its own descriptor set, in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingClass {
    UniformBuffer,
    Sampler,
    InputAttachment,
}

impl BindingClass {
    /// All binding classes, in descriptor set order.
    pub const ALL: [BindingClass; 3] = [
        BindingClass::UniformBuffer,
        BindingClass::Sampler,
        BindingClass::InputAttachment,
    ];

    /// Returns the index of the descriptor set holding this class.
    #[inline]
    pub const fn set_index(self) -> usize {
        self as usize
    }

    /// Returns the number of binding slots in the descriptor set of this class.
    #[inline]
    pub const fn binding_count(self) -> usize {
        match self {
            BindingClass::UniformBuffer => UNIFORM_BUFFER_BINDING_COUNT,
            BindingClass::Sampler => SAMPLER_BINDING_COUNT,
            BindingClass::InputAttachment => INPUT_ATTACHMENT_BINDING_COUNT,
        }
    }

    #[inline]
    pub const fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingClass::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingClass::Sampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingClass::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BindingClass, DescriptorKey, PipelineKey, PipelineLayoutKey, SamplerUsage,
        UniformBufferBinding, VertexAttribute, VertexBuffer,
    };
    use ash::vk::{self, Handle};
    use vulkano::{format::Format, shader::ShaderStages};

    #[test]
    fn layout_key_bits() {
        let key = PipelineLayoutKey::from_sampler_usage(&[
            SamplerUsage {
                binding: 0,
                stages: ShaderStages::VERTEX,
            },
            SamplerUsage {
                binding: 3,
                stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
            },
            SamplerUsage {
                binding: 31,
                stages: ShaderStages::FRAGMENT,
            },
        ]);

        assert_eq!(key.as_raw(), 0b1 | (0b11 << 6) | (0b10 << 62));
        assert_eq!(key.stages(0), ShaderStages::VERTEX);
        assert_eq!(key.stages(1), ShaderStages::empty());
        assert_eq!(key.stages(3), ShaderStages::VERTEX | ShaderStages::FRAGMENT);
        assert_eq!(key.stages(31), ShaderStages::FRAGMENT);
    }

    #[test]
    fn layout_key_ignores_other_stages() {
        let key = PipelineLayoutKey::from_sampler_usage(&[SamplerUsage {
            binding: 2,
            stages: ShaderStages::COMPUTE,
        }]);

        assert_eq!(key, PipelineLayoutKey::default());
    }

    #[test]
    #[should_panic(expected = "sampler binding overflow")]
    fn layout_key_binding_overflow() {
        PipelineLayoutKey::from_sampler_usage(&[SamplerUsage {
            binding: 32,
            stages: ShaderStages::FRAGMENT,
        }]);
    }

    #[test]
    fn leading_vertex_entries() {
        let attribute = VertexAttribute {
            location: 0,
            binding: 0,
            format: Format::R32G32B32_SFLOAT,
            offset: 0,
        };
        let buffer = VertexBuffer {
            binding: 0,
            stride: 12,
            input_rate: vk::VertexInputRate::VERTEX,
        };

        let mut key = PipelineKey::default();
        key.vertex_attributes[0] = Some(attribute);
        key.vertex_attributes[1] = Some(VertexAttribute {
            location: 1,
            ..attribute
        });
        key.vertex_attributes[3] = Some(VertexAttribute {
            location: 3,
            ..attribute
        });
        key.vertex_buffers[0] = Some(buffer);

        assert_eq!(key.active_vertex_attributes().count(), 2);
        assert_eq!(key.active_vertex_buffers().count(), 1);

        // Entries after a gap aren't used, but still take part in the identity of the key.
        let mut other = key;
        other.vertex_attributes[3] = None;
        assert_ne!(key, other);
    }

    #[test]
    fn descriptor_key_compares_every_slot() {
        let binding = UniformBufferBinding {
            buffer: vk::Buffer::from_raw(7),
            offset: 0,
            size: 256,
        };

        let mut a = DescriptorKey::default();
        a.uniform_buffers[4] = Some(binding);
        let mut b = DescriptorKey::default();
        b.uniform_buffers[4] = Some(binding);
        assert_eq!(a, b);

        b.uniform_buffers[4] = Some(UniformBufferBinding {
            offset: 256,
            ..binding
        });
        assert_ne!(a, b);
    }

    #[test]
    fn binding_classes() {
        assert_eq!(
            BindingClass::ALL.map(BindingClass::set_index),
            [0, 1, 2],
        );
        assert_eq!(
            BindingClass::ALL.map(BindingClass::binding_count),
            [10, 32, 8],
        );
    }
}
