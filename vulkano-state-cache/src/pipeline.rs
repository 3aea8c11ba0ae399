//! Graphics pipelines, created from a [`PipelineKey`].

use crate::{
    device::CacheDevice, PipelineKey, PipelineLayoutKey, MAX_COLOR_TARGET_COUNT,
    SHADER_MODULE_COUNT,
};
use ash::vk;
use foldhash::HashMap;
use log::{debug, error};
use smallvec::SmallVec;
use std::{collections::hash_map::Entry, iter};
use vulkano::VulkanError;

/// A pipeline is created against one pipeline layout, so the layout key is part of its identity.
pub(crate) type PipelineCacheKey = (PipelineLayoutKey, PipelineKey);

#[derive(Debug)]
pub(crate) struct PipelineEntry {
    pub(crate) handle: vk::Pipeline,
    pub(crate) last_used: u64,
}

/// Creates the graphics pipeline described by `key`.
///
/// Viewport and scissor are dynamic state, so that the same pipeline serves any viewport. A
/// program without a fragment shader gets no color attachments.
///
/// # Panics
///
/// - Panics if `key.vertex_shader` is null.
pub(crate) unsafe fn create_pipeline(
    device: &impl CacheDevice,
    key: &PipelineKey,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline, VulkanError> {
    let &PipelineKey {
        vertex_shader,
        fragment_shader,
        vertex_attributes: _,
        vertex_buffers: _,
        ref raster_state,
        render_pass,
        subpass,
        topology,
    } = key;

    assert!(
        vertex_shader != vk::ShaderModule::null(),
        "no vertex shader is bound",
    );
    debug_assert!(raster_state.color_target_count as usize <= MAX_COLOR_TARGET_COUNT);

    let stages_vk: SmallVec<[_; SHADER_MODULE_COUNT]> =
        iter::once((vk::ShaderStageFlags::VERTEX, vertex_shader))
            .chain(fragment_shader.map(|module| (vk::ShaderStageFlags::FRAGMENT, module)))
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(c"main")
            })
            .collect();

    let vertex_binding_descriptions_vk: SmallVec<[_; 8]> =
        key.active_vertex_buffers().map(|buffer| buffer.to_vk()).collect();
    let vertex_attribute_descriptions_vk: SmallVec<[_; 8]> = key
        .active_vertex_attributes()
        .map(|attribute| attribute.to_vk())
        .collect();
    let vertex_input_state_vk = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&vertex_binding_descriptions_vk)
        .vertex_attribute_descriptions(&vertex_attribute_descriptions_vk);

    let input_assembly_state_vk =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(topology.into());

    let viewport_state_vk = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states_vk = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state_vk =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states_vk);

    let rasterization_state_vk = raster_state.rasterization.to_vk();
    let multisample_state_vk = raster_state.multisampling.to_vk();
    let depth_stencil_state_vk = raster_state.depth_stencil.to_vk();

    let color_target_count = if fragment_shader.is_some() {
        raster_state.color_target_count as usize
    } else {
        0
    };
    let color_blend_attachments_vk: SmallVec<[_; MAX_COLOR_TARGET_COUNT]> =
        iter::repeat(raster_state.blending.to_vk())
            .take(color_target_count)
            .collect();
    let color_blend_state_vk =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments_vk);

    let create_info_vk = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages_vk)
        .vertex_input_state(&vertex_input_state_vk)
        .input_assembly_state(&input_assembly_state_vk)
        .viewport_state(&viewport_state_vk)
        .rasterization_state(&rasterization_state_vk)
        .multisample_state(&multisample_state_vk)
        .depth_stencil_state(&depth_stencil_state_vk)
        .color_blend_state(&color_blend_state_vk)
        .dynamic_state(&dynamic_state_vk)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(subpass);

    unsafe { device.create_graphics_pipeline(&create_info_vk) }
}

/// Maps each pipeline layout and [`PipelineKey`] pair to its pipeline.
#[derive(Debug, Default)]
pub(crate) struct PipelineCache {
    entries: HashMap<PipelineCacheKey, PipelineEntry>,
}

impl PipelineCache {
    /// Returns the entry for `key`, creating the pipeline if it doesn't exist yet. `layout` must
    /// be the pipeline layout of `key.0`. Nothing is inserted if creation fails.
    pub(crate) unsafe fn get_or_create(
        &mut self,
        device: &impl CacheDevice,
        key: &PipelineCacheKey,
        layout: vk::PipelineLayout,
        current_time: u64,
    ) -> Result<&mut PipelineEntry, VulkanError> {
        match self.entries.entry(*key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let key = &key.1;

                let handle = unsafe { create_pipeline(device, key, layout) }.map_err(|err| {
                    error!(
                        "failed to create a graphics pipeline with shaders ({:?}, {:?}): {}",
                        key.vertex_shader, key.fragment_shader, err,
                    );
                    err
                })?;

                debug!(
                    "created graphics pipeline {:?} with shaders ({:?}, {:?})",
                    handle, key.vertex_shader, key.fragment_shader,
                );

                Ok(entry.insert(PipelineEntry {
                    handle,
                    last_used: current_time,
                }))
            }
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, key: &PipelineCacheKey) -> Option<&mut PipelineEntry> {
        self.entries.get_mut(key)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether any pipeline was created with the pipeline layout of `layout_key`.
    pub(crate) fn references_layout(&self, layout_key: &PipelineLayoutKey) -> bool {
        self.entries.keys().any(|(key, _)| key == layout_key)
    }

    /// Destroys every pipeline for which `is_expired` returns `true`.
    pub(crate) unsafe fn evict(
        &mut self,
        device: &impl CacheDevice,
        mut is_expired: impl FnMut(&PipelineEntry) -> bool,
    ) {
        let count = self.entries.len();

        self.entries.retain(|_, entry| {
            if is_expired(entry) {
                unsafe { device.destroy_pipeline(entry.handle) };
                false
            } else {
                true
            }
        });

        let evicted = count - self.entries.len();

        if evicted != 0 {
            debug!("evicted {} graphics pipelines", evicted);
        }
    }

    pub(crate) unsafe fn destroy_all(&mut self, device: &impl CacheDevice) {
        for (_, entry) in self.entries.drain() {
            unsafe { device.destroy_pipeline(entry.handle) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::create_pipeline;
    use crate::{
        tests::MockDevice, Blending, PipelineKey, RasterState, VertexAttribute, VertexBuffer,
    };
    use ash::vk::{self, Handle};
    use vulkano::format::Format;

    fn key_with_shaders(fragment: bool) -> PipelineKey {
        PipelineKey {
            vertex_shader: vk::ShaderModule::from_raw(1),
            fragment_shader: fragment.then(|| vk::ShaderModule::from_raw(2)),
            render_pass: vk::RenderPass::from_raw(3),
            ..PipelineKey::default()
        }
    }

    #[test]
    fn color_attachments_follow_fragment_shader() {
        let device = MockDevice::new();
        let layout = vk::PipelineLayout::from_raw(9);

        let mut key = key_with_shaders(true);
        key.raster_state = RasterState {
            blending: Blending {
                blend_enable: true,
                ..Blending::new()
            },
            color_target_count: 3,
            ..RasterState::new()
        };
        unsafe { create_pipeline(&device, &key, layout) }.unwrap();

        key.fragment_shader = None;
        unsafe { create_pipeline(&device, &key, layout) }.unwrap();

        let pipelines = device.created_pipelines();
        assert_eq!(pipelines.len(), 2);

        assert_eq!(pipelines[0].stage_count, 2);
        assert_eq!(pipelines[0].color_blend_attachments.len(), 3);
        assert!(pipelines[0]
            .color_blend_attachments
            .iter()
            .all(|attachment| attachment.blend_enable == vk::TRUE));
        assert_eq!(
            pipelines[0].dynamic_states,
            [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
        );
        assert_eq!(pipelines[0].layout, layout);

        assert_eq!(pipelines[1].stage_count, 1);
        assert!(pipelines[1].color_blend_attachments.is_empty());
    }

    #[test]
    fn vertex_input_uses_leading_entries() {
        let device = MockDevice::new();

        let attribute = VertexAttribute {
            location: 0,
            binding: 0,
            format: Format::R32G32B32_SFLOAT,
            offset: 0,
        };
        let mut key = key_with_shaders(true);
        key.vertex_attributes[0] = Some(attribute);
        key.vertex_attributes[1] = Some(VertexAttribute {
            location: 1,
            offset: 12,
            ..attribute
        });
        key.vertex_attributes[5] = Some(VertexAttribute {
            location: 5,
            ..attribute
        });
        key.vertex_buffers[0] = Some(VertexBuffer {
            binding: 0,
            stride: 24,
            input_rate: vk::VertexInputRate::VERTEX,
        });

        unsafe { create_pipeline(&device, &key, vk::PipelineLayout::from_raw(9)) }.unwrap();

        let pipelines = device.created_pipelines();
        assert_eq!(pipelines[0].vertex_attribute_count, 2);
        assert_eq!(pipelines[0].vertex_binding_count, 1);
    }

    #[test]
    #[should_panic(expected = "no vertex shader is bound")]
    fn missing_vertex_shader() {
        let device = MockDevice::new();
        let key = PipelineKey::default();

        let _ = unsafe { create_pipeline(&device, &key, vk::PipelineLayout::from_raw(9)) };
    }
}
