//! Writing descriptor sets, and the dummy resources used for slots that have nothing bound.
//!
//! Core Vulkan doesn't allow a descriptor to be left unwritten or written with a null handle
//! (that needs `VK_EXT_robustness2`), so every slot that the [`DescriptorKey`] leaves empty is
//! written with a dummy resource instead.

use crate::{
    device::{CacheDevice, DummyBuffer},
    key::{BindingClass, InputAttachmentBinding, SamplerBinding, UniformBufferBinding},
    layout::{DescriptorSetTriple, PipelineLayoutCache},
    DescriptorKey, PipelineLayoutKey, INPUT_ATTACHMENT_BINDING_COUNT, SAMPLER_BINDING_COUNT,
    UNIFORM_BUFFER_BINDING_COUNT,
};
use ash::vk;
use foldhash::HashMap;
use log::debug;
use smallvec::SmallVec;
use std::{array, mem, slice};
use vulkano::{DeviceSize, VulkanError};

/// The dummy resources written into unbound slots.
#[derive(Debug)]
pub(crate) struct DummyBindings {
    buffer: DummyBuffer,
    sampler: vk::Sampler,
    image_view: vk::ImageView,
}

impl DummyBindings {
    pub(crate) unsafe fn new(
        device: &impl CacheDevice,
        buffer_size: DeviceSize,
        image_view: vk::ImageView,
    ) -> Result<Self, VulkanError> {
        let buffer = unsafe { device.create_dummy_buffer(buffer_size) }?;

        let sampler_create_info_vk = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_anisotropy(1.0)
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(0.0)
            .max_lod(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        let sampler = match unsafe { device.create_sampler(&sampler_create_info_vk) } {
            Ok(sampler) => sampler,
            Err(err) => {
                unsafe { device.destroy_dummy_buffer(buffer) };
                return Err(err);
            }
        };

        debug!(
            "created dummy buffer {:?} ({} bytes) and dummy sampler {:?}",
            buffer.buffer, buffer.size, sampler,
        );

        Ok(DummyBindings {
            buffer,
            sampler,
            image_view,
        })
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    #[cfg(test)]
    pub(crate) fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    #[inline]
    pub(crate) fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    #[inline]
    pub(crate) fn set_image_view(&mut self, image_view: vk::ImageView) {
        self.image_view = image_view;
    }

    fn buffer_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer.buffer,
            offset: 0,
            range: self.buffer.size,
        }
    }

    fn sampler_info(&self) -> vk::DescriptorImageInfo {
        assert!(
            self.image_view != vk::ImageView::null(),
            "a sampler slot is unbound, but no dummy texture has been set",
        );

        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    fn input_attachment_info(&self) -> vk::DescriptorImageInfo {
        assert!(
            self.image_view != vk::ImageView::null(),
            "an input attachment slot is unbound, but no dummy texture has been set",
        );

        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Destroys the dummy buffer and sampler. Calling this again does nothing.
    pub(crate) unsafe fn destroy(&mut self, device: &impl CacheDevice) {
        let sampler = mem::replace(&mut self.sampler, vk::Sampler::null());

        if sampler != vk::Sampler::null() {
            unsafe { device.destroy_sampler(sampler) };
        }

        if self.buffer.buffer != vk::Buffer::null() {
            unsafe { device.destroy_dummy_buffer(self.buffer) };
            self.buffer.buffer = vk::Buffer::null();
            self.buffer.memory = vk::DeviceMemory::null();
        }
    }
}

/// Writes every slot of `sets`: the resource from `key` where one is bound, a dummy resource
/// everywhere else.
///
/// Sets taken from an arena still hold the bindings of the bundle they were reclaimed from, so
/// there is no partial update.
///
/// # Panics
///
/// - Panics if a sampler or input attachment slot is unbound and `dummy` has no image view.
pub(crate) unsafe fn write_descriptor_sets(
    device: &impl CacheDevice,
    sets: DescriptorSetTriple,
    key: &DescriptorKey,
    dummy: &DummyBindings,
) {
    let buffer_infos_vk: [_; UNIFORM_BUFFER_BINDING_COUNT] = array::from_fn(|binding| {
        key.uniform_buffers[binding]
            .map_or_else(|| dummy.buffer_info(), UniformBufferBinding::to_vk)
    });
    let sampler_infos_vk: [_; SAMPLER_BINDING_COUNT] = array::from_fn(|binding| {
        key.samplers[binding].map_or_else(|| dummy.sampler_info(), SamplerBinding::to_vk)
    });
    let input_attachment_infos_vk: [_; INPUT_ATTACHMENT_BINDING_COUNT] =
        array::from_fn(|binding| {
            key.input_attachments[binding]
                .map_or_else(|| dummy.input_attachment_info(), InputAttachmentBinding::to_vk)
        });

    let write = |class: BindingClass, binding: usize| {
        vk::WriteDescriptorSet::default()
            .dst_set(sets.get(class))
            .dst_binding(binding as u32)
            .descriptor_type(class.descriptor_type())
    };

    let buffer_writes_vk = buffer_infos_vk.iter().enumerate().map(|(binding, info)| {
        write(BindingClass::UniformBuffer, binding).buffer_info(slice::from_ref(info))
    });
    let sampler_writes_vk = sampler_infos_vk.iter().enumerate().map(|(binding, info)| {
        write(BindingClass::Sampler, binding).image_info(slice::from_ref(info))
    });
    let input_attachment_writes_vk =
        input_attachment_infos_vk.iter().enumerate().map(|(binding, info)| {
            write(BindingClass::InputAttachment, binding).image_info(slice::from_ref(info))
        });

    let writes_vk: SmallVec<[_; 64]> = buffer_writes_vk
        .chain(sampler_writes_vk)
        .chain(input_attachment_writes_vk)
        .collect();

    unsafe { device.update_descriptor_sets(&writes_vk) };
}

/// A descriptor set bundle is allocated against the set layouts of one pipeline layout, so the
/// layout key is part of its identity. It also tells eviction which arena to return the sets to.
pub(crate) type DescriptorCacheKey = (PipelineLayoutKey, DescriptorKey);

#[derive(Debug)]
pub(crate) struct DescriptorEntry {
    pub(crate) sets: DescriptorSetTriple,
    pub(crate) last_used: u64,
}

/// Maps each pipeline layout and [`DescriptorKey`] pair to its bundle of descriptor sets.
#[derive(Debug, Default)]
pub(crate) struct DescriptorSetCache {
    entries: HashMap<DescriptorCacheKey, DescriptorEntry>,
}

impl DescriptorSetCache {
    #[inline]
    pub(crate) fn get_mut(&mut self, key: &DescriptorCacheKey) -> Option<&mut DescriptorEntry> {
        self.entries.get_mut(key)
    }

    #[inline]
    pub(crate) fn insert(&mut self, key: DescriptorCacheKey, sets: DescriptorSetTriple, now: u64) {
        let previous = self.entries.insert(
            key,
            DescriptorEntry {
                sets,
                last_used: now,
            },
        );
        debug_assert!(previous.is_none());
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the timestamps of every bundle.
    pub(crate) fn timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.values().map(|entry| entry.last_used)
    }

    /// Forgets every bundle without reclaiming its sets.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns whether any bundle was allocated against the pipeline layout of `layout_key`.
    pub(crate) fn references_layout(&self, layout_key: &PipelineLayoutKey) -> bool {
        self.entries.keys().any(|(key, _)| key == layout_key)
    }

    /// Removes every bundle for which `is_expired` returns `true`, and parks its sets in the arena
    /// of its pipeline layout.
    pub(crate) fn evict(
        &mut self,
        layouts: &mut PipelineLayoutCache,
        mut is_expired: impl FnMut(&DescriptorEntry) -> bool,
    ) {
        let count = self.entries.len();

        self.entries.retain(|(layout_key, _), entry| {
            if !is_expired(entry) {
                return true;
            }

            match layouts.get_mut(layout_key) {
                Some(layout) => layout.reclaim_sets(entry.sets),
                None => debug_assert!(
                    false,
                    "descriptor set bundle outlived its pipeline layout {:?}",
                    layout_key,
                ),
            }

            false
        });

        let reclaimed = count - self.entries.len();

        if reclaimed != 0 {
            debug!("reclaimed {} descriptor set bundles", reclaimed);
        }
    }
}
