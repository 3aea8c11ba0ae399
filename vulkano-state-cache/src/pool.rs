//! The descriptor pool backing every descriptor set of the cache.
//!
//! A descriptor pool can neither shrink nor be compacted, so when it runs out a new pool twice
//! the size replaces it. The old pool can't be destroyed right away, since destroying a pool frees
//! all of its sets and some of them may still be used by command buffers in flight. It becomes
//! *extinct* instead, and the bundles that were allocated from it are remembered only by their
//! timestamps. Once all of those have expired, the extinct pools are destroyed.

use crate::{
    device::CacheDevice, key::BindingClass, layout::DescriptorSetTriple, DESCRIPTOR_TYPE_COUNT,
};
use ash::vk;
use log::{debug, info};
use std::mem;
use vulkano::VulkanError;

#[derive(Debug)]
pub(crate) struct DescriptorPoolManager {
    pool: vk::DescriptorPool,

    /// Number of descriptor set triples the live pool was created for.
    capacity: u32,

    /// Number of triples allocated from the live pool and not freed yet, whether they are in use
    /// or parked in an arena.
    allocated: u32,

    extinct_pools: Vec<vk::DescriptorPool>,

    /// The `last_used` timestamps of the bundles allocated from the extinct pools.
    extinct_bundles: Vec<u64>,
}

impl DescriptorPoolManager {
    pub(crate) unsafe fn new(
        device: &impl CacheDevice,
        capacity: u32,
    ) -> Result<Self, VulkanError> {
        let pool = unsafe { create_pool(device, capacity) }?;

        Ok(DescriptorPoolManager {
            pool,
            capacity,
            allocated: 0,
            extinct_pools: Vec::new(),
            extinct_bundles: Vec::new(),
        })
    }

    #[inline]
    pub(crate) fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns whether the live pool has handed out as many triples as it was planned for.
    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.allocated >= self.capacity
    }

    #[inline]
    pub(crate) fn extinct_pool_count(&self) -> usize {
        self.extinct_pools.len()
    }

    #[inline]
    pub(crate) fn extinct_bundle_count(&self) -> usize {
        self.extinct_bundles.len()
    }

    /// Allocates one descriptor set for each of `set_layouts` from the live pool.
    pub(crate) unsafe fn allocate(
        &mut self,
        device: &impl CacheDevice,
        set_layouts: &[vk::DescriptorSetLayout; DESCRIPTOR_TYPE_COUNT],
    ) -> Result<DescriptorSetTriple, VulkanError> {
        let allocate_info_vk = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(set_layouts);

        let mut sets = [vk::DescriptorSet::null(); DESCRIPTOR_TYPE_COUNT];
        unsafe { device.allocate_descriptor_sets(&allocate_info_vk, &mut sets) }?;
        self.allocated += 1;

        Ok(DescriptorSetTriple(sets))
    }

    /// Records that `count` triples were freed back to the live pool.
    #[inline]
    pub(crate) fn release(&mut self, count: usize) {
        debug_assert!(count <= self.allocated as usize);
        self.allocated = self.allocated.saturating_sub(count as u32);
    }

    /// Replaces the live pool with one twice as big, and makes the old one extinct.
    ///
    /// `live_bundles` are the timestamps of the bundles still in use from the old pool. If the new
    /// pool can't be created, nothing changes.
    pub(crate) unsafe fn grow(
        &mut self,
        device: &impl CacheDevice,
        live_bundles: impl IntoIterator<Item = u64>,
    ) -> Result<(), VulkanError> {
        let capacity = self
            .capacity
            .checked_mul(2)
            .ok_or(VulkanError::OutOfPoolMemory)?;
        let pool = unsafe { create_pool(device, capacity) }?;

        info!(
            "descriptor pool exhausted, growing it from {} to {} descriptor set triples",
            self.capacity, capacity,
        );

        self.extinct_pools.push(self.pool);
        self.extinct_bundles.extend(live_bundles);
        self.pool = pool;
        self.capacity = capacity;
        self.allocated = 0;

        Ok(())
    }

    /// Destroys the extinct pools if every bundle allocated from them has expired.
    pub(crate) unsafe fn purge_extinct(
        &mut self,
        device: &impl CacheDevice,
        mut is_expired: impl FnMut(u64) -> bool,
    ) {
        if !self.extinct_bundles.iter().all(|&last_used| is_expired(last_used)) {
            return;
        }

        if !self.extinct_pools.is_empty() {
            debug!(
                "destroying {} extinct descriptor pools",
                self.extinct_pools.len(),
            );
        }

        for pool in self.extinct_pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool) };
        }

        self.extinct_bundles.clear();
    }

    /// Destroys the live pool and every extinct pool. Calling this again does nothing.
    pub(crate) unsafe fn destroy(&mut self, device: &impl CacheDevice) {
        let pool = mem::replace(&mut self.pool, vk::DescriptorPool::null());

        if pool != vk::DescriptorPool::null() {
            unsafe { device.destroy_descriptor_pool(pool) };
        }

        for pool in self.extinct_pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool) };
        }

        self.extinct_bundles.clear();
        self.allocated = 0;
    }
}

/// Creates a pool for `capacity` triples, with room for every binding of every set.
///
/// Fails with `OutOfPoolMemory` if the descriptor counts don't fit in a `u32`.
unsafe fn create_pool(
    device: &impl CacheDevice,
    capacity: u32,
) -> Result<vk::DescriptorPool, VulkanError> {
    let max_sets = capacity
        .checked_mul(DESCRIPTOR_TYPE_COUNT as u32)
        .ok_or(VulkanError::OutOfPoolMemory)?;

    let mut pool_sizes_vk = [vk::DescriptorPoolSize::default(); DESCRIPTOR_TYPE_COUNT];

    for (pool_size_vk, class) in pool_sizes_vk.iter_mut().zip(BindingClass::ALL) {
        *pool_size_vk = vk::DescriptorPoolSize {
            ty: class.descriptor_type(),
            descriptor_count: max_sets
                .checked_mul(class.binding_count() as u32)
                .ok_or(VulkanError::OutOfPoolMemory)?,
        };
    }

    let create_info_vk = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(max_sets)
        .pool_sizes(&pool_sizes_vk);

    let pool = unsafe { device.create_descriptor_pool(&create_info_vk) }?;

    debug!(
        "created descriptor pool {:?} for {} descriptor set triples",
        pool, capacity,
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::DescriptorPoolManager;
    use crate::tests::MockDevice;
    use ash::vk::{self, Handle};
    use vulkano::VulkanError;

    fn set_layouts() -> [vk::DescriptorSetLayout; 3] {
        [1, 2, 3].map(vk::DescriptorSetLayout::from_raw)
    }

    #[test]
    fn pool_sizes() {
        let device = MockDevice::new();
        let pool = unsafe { DescriptorPoolManager::new(&device, 4) }.unwrap();

        let created = device.created_pools();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].handle, pool.handle());
        assert_eq!(created[0].max_sets, 12);
        assert_eq!(
            created[0].flags,
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        );
        assert_eq!(
            created[0].pool_sizes,
            [
                (vk::DescriptorType::UNIFORM_BUFFER, 120),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 384),
                (vk::DescriptorType::INPUT_ATTACHMENT, 96),
            ],
        );
    }

    #[test]
    fn growth_quarantines_old_pool() {
        let device = MockDevice::new();
        let mut pool = unsafe { DescriptorPoolManager::new(&device, 2) }.unwrap();
        let first = pool.handle();

        unsafe { pool.allocate(&device, &set_layouts()) }.unwrap();
        assert!(!pool.is_full());
        unsafe { pool.allocate(&device, &set_layouts()) }.unwrap();
        assert!(pool.is_full());

        unsafe { pool.grow(&device, [3, 5]) }.unwrap();
        assert_ne!(pool.handle(), first);
        assert_eq!(pool.capacity(), 4);
        assert!(!pool.is_full());
        assert_eq!(pool.extinct_pool_count(), 1);
        assert_eq!(pool.extinct_bundle_count(), 2);

        // The bundle stamped 5 hasn't expired yet.
        unsafe { pool.purge_extinct(&device, |last_used| last_used < 4) };
        assert_eq!(pool.extinct_pool_count(), 1);
        assert!(device.is_live_pool(first));

        unsafe { pool.purge_extinct(&device, |last_used| last_used < 6) };
        assert_eq!(pool.extinct_pool_count(), 0);
        assert_eq!(pool.extinct_bundle_count(), 0);
        assert!(!device.is_live_pool(first));
    }

    #[test]
    fn oversized_pool_is_rejected() {
        let device = MockDevice::new();

        assert_eq!(
            unsafe { DescriptorPoolManager::new(&device, u32::MAX) }.unwrap_err(),
            VulkanError::OutOfPoolMemory,
        );
        assert!(device.created_pools().is_empty());

        // The sampler set has 32 bindings, so this is the largest capacity that fits.
        let capacity = u32::MAX / 96;
        let mut pool = unsafe { DescriptorPoolManager::new(&device, capacity) }.unwrap();
        let first = pool.handle();

        assert_eq!(
            unsafe { pool.grow(&device, [0]) },
            Err(VulkanError::OutOfPoolMemory),
        );
        assert_eq!(pool.handle(), first);
        assert_eq!(pool.capacity(), capacity);
        assert_eq!(pool.extinct_pool_count(), 0);
        assert_eq!(device.created_pools().len(), 1);
    }

    #[test]
    fn failed_growth_keeps_pool() {
        let device = MockDevice::new();
        let mut pool = unsafe { DescriptorPoolManager::new(&device, 1) }.unwrap();
        let first = pool.handle();

        device.fail_next_pool_creation();
        assert!(unsafe { pool.grow(&device, [0]) }.is_err());
        assert_eq!(pool.handle(), first);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.extinct_pool_count(), 0);
    }
}
