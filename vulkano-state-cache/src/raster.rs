//! Fixed-function state baked into a pipeline.
//!
//! A [`RasterState`] bundles the rasterization, blending, depth/stencil and multisample state of
//! a draw. It is part of the [`PipelineKey`](crate::PipelineKey), so two raster states select
//! the same pipeline only if they are bit-identical: floating-point fields are compared by their
//! bit patterns, `0.0` and `-0.0` are different states and a NaN is equal to itself.
//!
//! The engine assumes the same blend state for every color attachment of a draw, so only one
//! [`Blending`] is stored, and it is broadcast to `color_target_count` attachments when the
//! pipeline is created.

use ash::vk;
use std::hash::{Hash, Hasher};
use vulkano::{
    image::SampleCount,
    pipeline::graphics::{
        color_blend::{BlendFactor, BlendOp, ColorComponents},
        depth_stencil::CompareOp,
        rasterization::{CullMode, FrontFace, PolygonMode},
    },
};

/// The fixed-function state of a draw call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub rasterization: Rasterization,

    /// The blend state of every color attachment.
    pub blending: Blending,

    pub depth_stencil: DepthStencil,

    pub multisampling: Multisampling,

    /// The number of color attachments written by the fragment shader.
    ///
    /// Must not exceed [`MAX_COLOR_TARGET_COUNT`](crate::MAX_COLOR_TARGET_COUNT).
    ///
    /// The default value is `1`.
    pub color_target_count: u32,
}

impl Default for RasterState {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RasterState {
    /// Returns the engine-wide default raster state.
    #[inline]
    pub const fn new() -> Self {
        Self {
            rasterization: Rasterization::new(),
            blending: Blending::new(),
            depth_stencil: DepthStencil::new(),
            multisampling: Multisampling::new(),
            color_target_count: 1,
        }
    }
}

/// How primitives are turned into fragments.
#[derive(Clone, Copy, Debug)]
pub struct Rasterization {
    /// The default value is `false`.
    pub depth_clamp_enable: bool,

    /// The default value is `false`.
    pub rasterizer_discard_enable: bool,

    /// The default value is [`PolygonMode::Fill`].
    pub polygon_mode: PolygonMode,

    /// The default value is [`CullMode::None`].
    pub cull_mode: CullMode,

    /// The default value is [`FrontFace::CounterClockwise`].
    pub front_face: FrontFace,

    /// If `None`, depth biasing is disabled.
    ///
    /// The default value is `None`.
    pub depth_bias: Option<DepthBias>,

    /// The default value is `1.0`.
    pub line_width: f32,
}

impl Default for Rasterization {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterization {
    #[inline]
    pub const fn new() -> Self {
        Self {
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            depth_bias: None,
            line_width: 1.0,
        }
    }

    pub(crate) fn to_vk(&self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        let &Self {
            depth_clamp_enable,
            rasterizer_discard_enable,
            polygon_mode,
            cull_mode,
            front_face,
            depth_bias,
            line_width,
        } = self;

        let (
            depth_bias_enable_vk,
            depth_bias_constant_factor_vk,
            depth_bias_clamp_vk,
            depth_bias_slope_factor_vk,
        ) = if let Some(depth_bias) = depth_bias {
            let DepthBias {
                constant_factor,
                clamp,
                slope_factor,
            } = depth_bias;

            (true, constant_factor, clamp, slope_factor)
        } else {
            (false, 0.0, 0.0, 0.0)
        };

        vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(depth_clamp_enable)
            .rasterizer_discard_enable(rasterizer_discard_enable)
            .polygon_mode(polygon_mode.into())
            .cull_mode(cull_mode.into())
            .front_face(front_face.into())
            .depth_bias_enable(depth_bias_enable_vk)
            .depth_bias_constant_factor(depth_bias_constant_factor_vk)
            .depth_bias_clamp(depth_bias_clamp_vk)
            .depth_bias_slope_factor(depth_bias_slope_factor_vk)
            .line_width(line_width)
    }
}

impl PartialEq for Rasterization {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.depth_clamp_enable == other.depth_clamp_enable
            && self.rasterizer_discard_enable == other.rasterizer_discard_enable
            && self.polygon_mode == other.polygon_mode
            && self.cull_mode == other.cull_mode
            && self.front_face == other.front_face
            && self.depth_bias == other.depth_bias
            && self.line_width.to_bits() == other.line_width.to_bits()
    }
}

impl Eq for Rasterization {}

impl Hash for Rasterization {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth_clamp_enable.hash(state);
        self.rasterizer_discard_enable.hash(state);
        self.polygon_mode.hash(state);
        self.cull_mode.hash(state);
        self.front_face.hash(state);
        self.depth_bias.hash(state);
        self.line_width.to_bits().hash(state);
    }
}

/// The parameters of depth biasing.
#[derive(Clone, Copy, Debug)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

impl DepthBias {
    #[inline]
    fn to_bits(self) -> [u32; 3] {
        [
            self.constant_factor.to_bits(),
            self.clamp.to_bits(),
            self.slope_factor.to_bits(),
        ]
    }
}

impl PartialEq for DepthBias {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl Eq for DepthBias {}

impl Hash for DepthBias {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

/// The blend state applied to every color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Blending {
    /// The default value is `false`.
    pub blend_enable: bool,

    /// The default value is [`BlendFactor::One`].
    pub src_color_blend_factor: BlendFactor,

    /// The default value is [`BlendFactor::Zero`].
    pub dst_color_blend_factor: BlendFactor,

    /// The default value is [`BlendOp::Add`].
    pub color_blend_op: BlendOp,

    /// The default value is [`BlendFactor::One`].
    pub src_alpha_blend_factor: BlendFactor,

    /// The default value is [`BlendFactor::Zero`].
    pub dst_alpha_blend_factor: BlendFactor,

    /// The default value is [`BlendOp::Add`].
    pub alpha_blend_op: BlendOp,

    /// The default value is [`ColorComponents::all()`].
    pub color_write_mask: ColorComponents,
}

impl Default for Blending {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Blending {
    #[inline]
    pub const fn new() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            color_write_mask: ColorComponents::all(),
        }
    }

    pub(crate) fn to_vk(&self) -> vk::PipelineColorBlendAttachmentState {
        let &Self {
            blend_enable,
            src_color_blend_factor,
            dst_color_blend_factor,
            color_blend_op,
            src_alpha_blend_factor,
            dst_alpha_blend_factor,
            alpha_blend_op,
            color_write_mask,
        } = self;

        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(blend_enable)
            .src_color_blend_factor(src_color_blend_factor.into())
            .dst_color_blend_factor(dst_color_blend_factor.into())
            .color_blend_op(color_blend_op.into())
            .src_alpha_blend_factor(src_alpha_blend_factor.into())
            .dst_alpha_blend_factor(dst_alpha_blend_factor.into())
            .alpha_blend_op(alpha_blend_op.into())
            .color_write_mask(color_write_mask.into())
    }
}

/// Depth and stencil testing.
///
/// Stencil operations aren't configurable: when stencil testing is enabled, both faces keep the
/// stored value and always pass.
#[derive(Clone, Copy, Debug)]
pub struct DepthStencil {
    /// The default value is `true`.
    pub depth_test_enable: bool,

    /// The default value is `true`.
    pub depth_write_enable: bool,

    /// The default value is [`CompareOp::LessOrEqual`].
    pub depth_compare_op: CompareOp,

    /// The default value is `false`.
    pub depth_bounds_test_enable: bool,

    /// The default value is `false`.
    pub stencil_test_enable: bool,

    /// The default value is `0.0`.
    pub min_depth_bounds: f32,

    /// The default value is `1.0`.
    pub max_depth_bounds: f32,
}

impl Default for DepthStencil {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl DepthStencil {
    #[inline]
    pub const fn new() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: CompareOp::LessOrEqual,
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
        }
    }

    pub(crate) fn to_vk(&self) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        let &Self {
            depth_test_enable,
            depth_write_enable,
            depth_compare_op,
            depth_bounds_test_enable,
            stencil_test_enable,
            min_depth_bounds,
            max_depth_bounds,
        } = self;

        let stencil_op_vk = vk::StencilOpState::default()
            .fail_op(vk::StencilOp::KEEP)
            .pass_op(vk::StencilOp::KEEP)
            .depth_fail_op(vk::StencilOp::KEEP)
            .compare_op(vk::CompareOp::ALWAYS);

        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_test_enable)
            .depth_write_enable(depth_write_enable)
            .depth_compare_op(depth_compare_op.into())
            .depth_bounds_test_enable(depth_bounds_test_enable)
            .stencil_test_enable(stencil_test_enable)
            .front(stencil_op_vk)
            .back(stencil_op_vk)
            .min_depth_bounds(min_depth_bounds)
            .max_depth_bounds(max_depth_bounds)
    }
}

impl PartialEq for DepthStencil {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.depth_test_enable == other.depth_test_enable
            && self.depth_write_enable == other.depth_write_enable
            && self.depth_compare_op == other.depth_compare_op
            && self.depth_bounds_test_enable == other.depth_bounds_test_enable
            && self.stencil_test_enable == other.stencil_test_enable
            && self.min_depth_bounds.to_bits() == other.min_depth_bounds.to_bits()
            && self.max_depth_bounds.to_bits() == other.max_depth_bounds.to_bits()
    }
}

impl Eq for DepthStencil {}

impl Hash for DepthStencil {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth_test_enable.hash(state);
        self.depth_write_enable.hash(state);
        self.depth_compare_op.hash(state);
        self.depth_bounds_test_enable.hash(state);
        self.stencil_test_enable.hash(state);
        self.min_depth_bounds.to_bits().hash(state);
        self.max_depth_bounds.to_bits().hash(state);
    }
}

/// Multisampling.
#[derive(Clone, Copy, Debug)]
pub struct Multisampling {
    /// The default value is [`SampleCount::Sample1`].
    pub rasterization_samples: SampleCount,

    /// The default value is `false`.
    pub sample_shading_enable: bool,

    /// The default value is `0.0`.
    pub min_sample_shading: f32,

    /// The default value is `true`.
    pub alpha_to_coverage_enable: bool,

    /// The default value is `false`.
    pub alpha_to_one_enable: bool,
}

impl Default for Multisampling {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Multisampling {
    #[inline]
    pub const fn new() -> Self {
        Self {
            rasterization_samples: SampleCount::Sample1,
            sample_shading_enable: false,
            min_sample_shading: 0.0,
            alpha_to_coverage_enable: true,
            alpha_to_one_enable: false,
        }
    }

    pub(crate) fn to_vk(&self) -> vk::PipelineMultisampleStateCreateInfo<'static> {
        let &Self {
            rasterization_samples,
            sample_shading_enable,
            min_sample_shading,
            alpha_to_coverage_enable,
            alpha_to_one_enable,
        } = self;

        vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(rasterization_samples.into())
            .sample_shading_enable(sample_shading_enable)
            .min_sample_shading(min_sample_shading)
            .alpha_to_coverage_enable(alpha_to_coverage_enable)
            .alpha_to_one_enable(alpha_to_one_enable)
    }
}

impl PartialEq for Multisampling {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.rasterization_samples == other.rasterization_samples
            && self.sample_shading_enable == other.sample_shading_enable
            && self.min_sample_shading.to_bits() == other.min_sample_shading.to_bits()
            && self.alpha_to_coverage_enable == other.alpha_to_coverage_enable
            && self.alpha_to_one_enable == other.alpha_to_one_enable
    }
}

impl Eq for Multisampling {}

impl Hash for Multisampling {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rasterization_samples.hash(state);
        self.sample_shading_enable.hash(state);
        self.min_sample_shading.to_bits().hash(state);
        self.alpha_to_coverage_enable.hash(state);
        self.alpha_to_one_enable.hash(state);
    }
}
