//! The Vulkan entry points the cache calls.
//!
//! Every call the cache makes goes through the [`CacheDevice`] trait, which takes raw `ash`
//! create infos and returns raw handles. [`VulkanDevice`] implements it on top of a vulkano
//! [`Device`] by calling the function pointers of its dispatch table directly.

use ash::vk;
use std::{mem::MaybeUninit, ptr, sync::Arc};
use vulkano::{
    device::{Device, DeviceOwned},
    memory::MemoryPropertyFlags,
    DeviceSize, VulkanError, VulkanObject,
};

/// The device-level operations used by a [`PipelineStateCache`](crate::PipelineStateCache).
///
/// # Safety
///
/// - Objects returned by the `create_*` and `allocate_*` methods must be valid objects of the same
///   device, and must stay valid until they are passed to the matching `destroy_*` or `free_*`
///   method.
/// - The `cmd_*` methods must record the command into the given command buffer and nothing else.
pub unsafe trait CacheDevice {
    unsafe fn create_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, VulkanError>;

    unsafe fn destroy_descriptor_set_layout(&self, set_layout: vk::DescriptorSetLayout);

    unsafe fn create_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, VulkanError>;

    unsafe fn destroy_pipeline_layout(&self, pipeline_layout: vk::PipelineLayout);

    unsafe fn create_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, VulkanError>;

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, VulkanError>;

    /// Destroys a descriptor pool, implicitly freeing every descriptor set allocated from it.
    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocates one descriptor set per set layout of `allocate_info` into `output`.
    ///
    /// `output` must have exactly `allocate_info.descriptor_set_count` elements.
    unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
        output: &mut [vk::DescriptorSet],
    ) -> Result<(), VulkanError>;

    /// Returns descriptor sets to a pool created with `FREE_DESCRIPTOR_SET`.
    unsafe fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        descriptor_sets: &[vk::DescriptorSet],
    ) -> Result<(), VulkanError>;

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    unsafe fn create_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, VulkanError>;

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler);

    /// Creates a uniform buffer of `size` bytes backed by its own device memory. Its contents are
    /// never read in a meaningful way, so they are left uninitialized.
    unsafe fn create_dummy_buffer(&self, size: DeviceSize) -> Result<DummyBuffer, VulkanError>;

    unsafe fn destroy_dummy_buffer(&self, buffer: DummyBuffer);

    unsafe fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);

    /// Binds `descriptor_sets` to the graphics bind point, starting at set 0.
    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        descriptor_sets: &[vk::DescriptorSet],
    );

    /// Sets scissor 0.
    unsafe fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &vk::Rect2D);
}

/// A buffer and the memory bound to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DummyBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: DeviceSize,
}

/// A [`CacheDevice`] that calls into a vulkano [`Device`].
#[derive(Debug)]
pub struct VulkanDevice {
    device: Arc<Device>,
}

impl VulkanDevice {
    #[inline]
    pub fn new(device: Arc<Device>) -> Self {
        VulkanDevice { device }
    }

    /// Picks the memory type for the dummy buffer: device-local if possible, otherwise the first
    /// type the buffer accepts.
    fn dummy_memory_type_index(&self, memory_type_bits: u32) -> Option<u32> {
        let memory_types = &self.device.physical_device().memory_properties().memory_types;
        let allowed = || {
            memory_types
                .iter()
                .enumerate()
                .filter(move |&(index, _)| memory_type_bits & (1 << index) != 0)
        };

        allowed()
            .find(|(_, memory_type)| {
                memory_type
                    .property_flags
                    .intersects(MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .or_else(|| allowed().next())
            .map(|(index, _)| index as u32)
    }
}

unsafe impl DeviceOwned for VulkanDevice {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

unsafe impl CacheDevice for VulkanDevice {
    unsafe fn create_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        let fns = self.device.fns();
        let mut output = MaybeUninit::uninit();
        unsafe {
            (fns.v1_0.create_descriptor_set_layout)(
                self.device.handle(),
                create_info,
                ptr::null(),
                output.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::from)?;

        Ok(unsafe { output.assume_init() })
    }

    unsafe fn destroy_descriptor_set_layout(&self, set_layout: vk::DescriptorSetLayout) {
        let fns = self.device.fns();
        unsafe {
            (fns.v1_0.destroy_descriptor_set_layout)(self.device.handle(), set_layout, ptr::null())
        };
    }

    unsafe fn create_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, VulkanError> {
        let fns = self.device.fns();
        let mut output = MaybeUninit::uninit();
        unsafe {
            (fns.v1_0.create_pipeline_layout)(
                self.device.handle(),
                create_info,
                ptr::null(),
                output.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::from)?;

        Ok(unsafe { output.assume_init() })
    }

    unsafe fn destroy_pipeline_layout(&self, pipeline_layout: vk::PipelineLayout) {
        let fns = self.device.fns();
        unsafe {
            (fns.v1_0.destroy_pipeline_layout)(self.device.handle(), pipeline_layout, ptr::null())
        };
    }

    unsafe fn create_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, VulkanError> {
        let fns = self.device.fns();
        let mut output = MaybeUninit::uninit();
        unsafe {
            (fns.v1_0.create_graphics_pipelines)(
                self.device.handle(),
                vk::PipelineCache::null(),
                1,
                create_info,
                ptr::null(),
                output.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::from)?;

        Ok(unsafe { output.assume_init() })
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let fns = self.device.fns();
        unsafe { (fns.v1_0.destroy_pipeline)(self.device.handle(), pipeline, ptr::null()) };
    }

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, VulkanError> {
        let fns = self.device.fns();
        let mut output = MaybeUninit::uninit();
        unsafe {
            (fns.v1_0.create_descriptor_pool)(
                self.device.handle(),
                create_info,
                ptr::null(),
                output.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::from)?;

        Ok(unsafe { output.assume_init() })
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let fns = self.device.fns();
        unsafe { (fns.v1_0.destroy_descriptor_pool)(self.device.handle(), pool, ptr::null()) };
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
        output: &mut [vk::DescriptorSet],
    ) -> Result<(), VulkanError> {
        debug_assert_eq!(output.len(), allocate_info.descriptor_set_count as usize);

        let fns = self.device.fns();
        unsafe {
            (fns.v1_0.allocate_descriptor_sets)(
                self.device.handle(),
                allocate_info,
                output.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::from)
    }

    unsafe fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        descriptor_sets: &[vk::DescriptorSet],
    ) -> Result<(), VulkanError> {
        let fns = self.device.fns();
        unsafe {
            (fns.v1_0.free_descriptor_sets)(
                self.device.handle(),
                pool,
                descriptor_sets.len() as u32,
                descriptor_sets.as_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::from)
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let fns = self.device.fns();
        unsafe {
            (fns.v1_0.update_descriptor_sets)(
                self.device.handle(),
                writes.len() as u32,
                writes.as_ptr(),
                0,
                ptr::null(),
            )
        };
    }

    unsafe fn create_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, VulkanError> {
        let fns = self.device.fns();
        let mut output = MaybeUninit::uninit();
        unsafe {
            (fns.v1_0.create_sampler)(
                self.device.handle(),
                create_info,
                ptr::null(),
                output.as_mut_ptr(),
            )
        }
        .result()
        .map_err(VulkanError::from)?;

        Ok(unsafe { output.assume_init() })
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        let fns = self.device.fns();
        unsafe { (fns.v1_0.destroy_sampler)(self.device.handle(), sampler, ptr::null()) };
    }

    unsafe fn create_dummy_buffer(&self, size: DeviceSize) -> Result<DummyBuffer, VulkanError> {
        let fns = self.device.fns();
        let device_vk = self.device.handle();

        let buffer_create_info_vk = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = {
            let mut output = MaybeUninit::uninit();
            unsafe {
                (fns.v1_0.create_buffer)(
                    device_vk,
                    &buffer_create_info_vk,
                    ptr::null(),
                    output.as_mut_ptr(),
                )
            }
            .result()
            .map_err(VulkanError::from)?;

            unsafe { output.assume_init() }
        };

        let requirements = {
            let mut output = MaybeUninit::uninit();
            unsafe {
                (fns.v1_0.get_buffer_memory_requirements)(device_vk, buffer, output.as_mut_ptr())
            };

            unsafe { output.assume_init() }
        };

        let Some(memory_type_index) = self.dummy_memory_type_index(requirements.memory_type_bits)
        else {
            unsafe { (fns.v1_0.destroy_buffer)(device_vk, buffer, ptr::null()) };
            return Err(VulkanError::OutOfDeviceMemory);
        };

        let allocate_info_vk = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = {
            let mut output = MaybeUninit::uninit();
            let result = unsafe {
                (fns.v1_0.allocate_memory)(
                    device_vk,
                    &allocate_info_vk,
                    ptr::null(),
                    output.as_mut_ptr(),
                )
            };

            if let Err(err) = result.result() {
                unsafe { (fns.v1_0.destroy_buffer)(device_vk, buffer, ptr::null()) };
                return Err(VulkanError::from(err));
            }

            unsafe { output.assume_init() }
        };

        let result = unsafe { (fns.v1_0.bind_buffer_memory)(device_vk, buffer, memory, 0) };

        if let Err(err) = result.result() {
            unsafe { (fns.v1_0.destroy_buffer)(device_vk, buffer, ptr::null()) };
            unsafe { (fns.v1_0.free_memory)(device_vk, memory, ptr::null()) };
            return Err(VulkanError::from(err));
        }

        Ok(DummyBuffer {
            buffer,
            memory,
            size,
        })
    }

    unsafe fn destroy_dummy_buffer(&self, buffer: DummyBuffer) {
        let fns = self.device.fns();
        let device_vk = self.device.handle();
        unsafe { (fns.v1_0.destroy_buffer)(device_vk, buffer.buffer, ptr::null()) };
        unsafe { (fns.v1_0.free_memory)(device_vk, buffer.memory, ptr::null()) };
    }

    unsafe fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        let fns = self.device.fns();
        unsafe {
            (fns.v1_0.cmd_bind_pipeline)(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        };
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        let fns = self.device.fns();
        unsafe {
            (fns.v1_0.cmd_bind_descriptor_sets)(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                descriptor_sets.len() as u32,
                descriptor_sets.as_ptr(),
                0,
                ptr::null(),
            )
        };
    }

    unsafe fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &vk::Rect2D) {
        let fns = self.device.fns();
        unsafe { (fns.v1_0.cmd_set_scissor)(command_buffer, 0, 1, scissor) };
    }
}
