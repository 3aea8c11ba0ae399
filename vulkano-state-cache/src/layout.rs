//! Pipeline layouts, their descriptor set layouts, and the arena of descriptor sets they keep
//! for reuse.

use crate::{device::CacheDevice, key::BindingClass, PipelineLayoutKey, DESCRIPTOR_TYPE_COUNT};
use ash::vk;
use foldhash::HashMap;
use log::{debug, error};
use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use vulkano::VulkanError;

/// One descriptor set per [`BindingClass`], in set order.
///
/// Descriptor sets are only ever allocated, reclaimed and freed as a whole triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DescriptorSetTriple(pub(crate) [vk::DescriptorSet; DESCRIPTOR_TYPE_COUNT]);

impl DescriptorSetTriple {
    #[inline]
    pub(crate) fn get(self, class: BindingClass) -> vk::DescriptorSet {
        self.0[class.set_index()]
    }
}

#[derive(Debug)]
pub(crate) struct PipelineLayoutEntry {
    pub(crate) handle: vk::PipelineLayout,
    pub(crate) set_layouts: [vk::DescriptorSetLayout; DESCRIPTOR_TYPE_COUNT],
    arena: Vec<DescriptorSetTriple>,
    pub(crate) last_used: u64,
}

impl PipelineLayoutEntry {
    /// Creates the three descriptor set layouts and the pipeline layout for `key`.
    ///
    /// Either everything is created or nothing is: objects created before a failure are
    /// destroyed again.
    unsafe fn new(
        device: &impl CacheDevice,
        key: PipelineLayoutKey,
        current_time: u64,
    ) -> Result<Self, VulkanError> {
        let mut set_layouts = SmallVec::<[_; DESCRIPTOR_TYPE_COUNT]>::new();

        for class in BindingClass::ALL {
            match unsafe { create_set_layout(device, key, class) } {
                Ok(set_layout) => set_layouts.push(set_layout),
                Err(err) => {
                    error!(
                        "failed to create the {:?} descriptor set layout for {:?}: {}",
                        class, key, err,
                    );

                    for set_layout in set_layouts {
                        unsafe { device.destroy_descriptor_set_layout(set_layout) };
                    }

                    return Err(err);
                }
            }
        }

        let create_info_vk = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);

        let handle = match unsafe { device.create_pipeline_layout(&create_info_vk) } {
            Ok(handle) => handle,
            Err(err) => {
                error!("failed to create the pipeline layout for {:?}: {}", key, err);

                for set_layout in set_layouts {
                    unsafe { device.destroy_descriptor_set_layout(set_layout) };
                }

                return Err(err);
            }
        };

        debug!("created pipeline layout {:?} for {:?}", handle, key);

        Ok(PipelineLayoutEntry {
            handle,
            set_layouts: [set_layouts[0], set_layouts[1], set_layouts[2]],
            arena: Vec::new(),
            last_used: current_time,
        })
    }

    /// Takes a triple of descriptor sets that is no longer in use, if there is one.
    #[inline]
    pub(crate) fn take_sets(&mut self) -> Option<DescriptorSetTriple> {
        self.arena.pop()
    }

    /// Parks a triple of descriptor sets for reuse by a later bundle with this layout.
    #[inline]
    pub(crate) fn reclaim_sets(&mut self, sets: DescriptorSetTriple) {
        self.arena.push(sets);
    }

    #[inline]
    pub(crate) fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Destroys the layout. Sets parked in the arena are returned to `pool`, which must be the
    /// pool they were allocated from.
    unsafe fn destroy(self, device: &impl CacheDevice, pool: vk::DescriptorPool) -> usize {
        let freed = self.arena.len();

        if !self.arena.is_empty() {
            let sets: Vec<_> = self.arena.iter().flat_map(|triple| triple.0).collect();

            if let Err(err) = unsafe { device.free_descriptor_sets(pool, &sets) } {
                error!(
                    "failed to free {} descriptor sets of pipeline layout {:?}: {}",
                    sets.len(),
                    self.handle,
                    err,
                );
            }
        }

        unsafe { device.destroy_pipeline_layout(self.handle) };

        for set_layout in self.set_layouts {
            unsafe { device.destroy_descriptor_set_layout(set_layout) };
        }

        freed
    }
}

unsafe fn create_set_layout(
    device: &impl CacheDevice,
    key: PipelineLayoutKey,
    class: BindingClass,
) -> Result<vk::DescriptorSetLayout, VulkanError> {
    let bindings_vk: SmallVec<[_; 32]> = (0..class.binding_count() as u32)
        .map(|binding| {
            let stage_flags = match class {
                BindingClass::UniformBuffer => vk::ShaderStageFlags::ALL_GRAPHICS,
                BindingClass::Sampler => key.stages(binding).into(),
                BindingClass::InputAttachment => vk::ShaderStageFlags::FRAGMENT,
            };

            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(class.descriptor_type())
                .descriptor_count(1)
                .stage_flags(stage_flags)
        })
        .collect();

    let create_info_vk = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings_vk);

    unsafe { device.create_descriptor_set_layout(&create_info_vk) }
}

/// Maps each [`PipelineLayoutKey`] to its pipeline layout.
#[derive(Debug, Default)]
pub(crate) struct PipelineLayoutCache {
    entries: HashMap<PipelineLayoutKey, PipelineLayoutEntry>,
}

impl PipelineLayoutCache {
    /// Returns the entry for `key`, creating it if it doesn't exist yet. The timestamp of the
    /// entry is left untouched.
    pub(crate) unsafe fn get_or_create(
        &mut self,
        device: &impl CacheDevice,
        key: PipelineLayoutKey,
        current_time: u64,
    ) -> Result<&mut PipelineLayoutEntry, VulkanError> {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let layout = unsafe { PipelineLayoutEntry::new(device, key, current_time) }?;

                Ok(entry.insert(layout))
            }
        }
    }

    #[inline]
    pub(crate) fn get(&self, key: &PipelineLayoutKey) -> Option<&PipelineLayoutEntry> {
        self.entries.get(key)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, key: &PipelineLayoutKey) -> Option<&mut PipelineLayoutEntry> {
        self.entries.get_mut(key)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every parked descriptor set without freeing it. Used when the pool the sets belong
    /// to is retired.
    pub(crate) fn clear_arenas(&mut self) {
        for entry in self.entries.values_mut() {
            entry.arena.clear();
        }
    }

    /// Destroys every layout for which `is_expired` returns `true`. Returns the number of
    /// descriptor set triples that were freed back to `pool`.
    pub(crate) unsafe fn evict(
        &mut self,
        device: &impl CacheDevice,
        pool: vk::DescriptorPool,
        mut is_expired: impl FnMut(&PipelineLayoutKey, &PipelineLayoutEntry) -> bool,
    ) -> usize {
        let mut evicted = 0;
        let mut freed = 0;

        // `extract_if` isn't stable yet.
        let keys: SmallVec<[_; 8]> = self
            .entries
            .iter()
            .filter(|&(key, entry)| is_expired(key, entry))
            .map(|(&key, _)| key)
            .collect();

        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                freed += unsafe { entry.destroy(device, pool) };
                evicted += 1;
            }
        }

        if evicted != 0 {
            debug!(
                "evicted {} pipeline layouts, {} descriptor set triples freed",
                evicted, freed,
            );
        }

        freed
    }

    /// Destroys every layout. Parked descriptor sets are not freed, the caller destroys the pool
    /// they came from.
    pub(crate) unsafe fn destroy_all(&mut self, device: &impl CacheDevice) {
        for (_, entry) in self.entries.drain() {
            unsafe { device.destroy_pipeline_layout(entry.handle) };

            for set_layout in entry.set_layouts {
                unsafe { device.destroy_descriptor_set_layout(set_layout) };
            }
        }
    }
}
