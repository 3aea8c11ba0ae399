#![cfg(test)]

//! An in-memory [`CacheDevice`] for the unit tests.
//!
//! `MockDevice` hands out unique synthetic handles, keeps track of which objects are alive, reads
//! back the create infos it is given, emulates the capacity of descriptor pools and can be told to
//! fail specific calls. Clones share the same state, so a test can keep a clone to inspect the
//! device after handing it to a cache.

use crate::device::{CacheDevice, DummyBuffer};
use ash::vk::{self, Handle};
use foldhash::{HashMap, HashSet};
use std::{cell::RefCell, collections::VecDeque, rc::Rc, slice};
use vulkano::{DeviceSize, VulkanError};

#[derive(Clone, Debug, Default)]
pub(crate) struct MockDevice {
    state: Rc<RefCell<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    live: HashSet<u64>,

    set_layouts: Vec<SetLayoutRecord>,
    pipeline_layouts: Vec<PipelineLayoutRecord>,
    pipelines: Vec<PipelineRecord>,
    pools: Vec<PoolRecord>,
    pool_usage: HashMap<vk::DescriptorPool, PoolUsage>,
    descriptor_writes: Vec<WriteRecord>,
    commands: Vec<Command>,
    allocation_count: usize,
    freed_set_count: usize,

    /// Number of successful set layout creations before the next one fails.
    fail_set_layout_after: Option<usize>,
    fail_next_pipeline_layout: bool,
    fail_next_pipeline: bool,
    fail_next_pool: bool,
    /// Errors returned by the next allocations, one per call.
    allocation_failures: VecDeque<VulkanError>,
}

#[derive(Clone, Copy, Debug)]
struct PoolUsage {
    max_sets: u32,
    allocated: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct SetLayoutRecord {
    pub(crate) handle: vk::DescriptorSetLayout,
    /// `(binding, descriptor type, descriptor count, stages)` of every binding.
    pub(crate) bindings: Vec<(u32, vk::DescriptorType, u32, vk::ShaderStageFlags)>,
}

#[derive(Clone, Debug)]
pub(crate) struct PipelineLayoutRecord {
    pub(crate) handle: vk::PipelineLayout,
    pub(crate) set_layouts: Vec<vk::DescriptorSetLayout>,
}

#[derive(Clone, Debug)]
pub(crate) struct PipelineRecord {
    pub(crate) handle: vk::Pipeline,
    pub(crate) stage_count: u32,
    pub(crate) modules: Vec<vk::ShaderModule>,
    pub(crate) vertex_attribute_count: u32,
    pub(crate) vertex_binding_count: u32,
    pub(crate) color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub(crate) dynamic_states: Vec<vk::DynamicState>,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) topology: vk::PrimitiveTopology,
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) subpass: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct PoolRecord {
    pub(crate) handle: vk::DescriptorPool,
    pub(crate) flags: vk::DescriptorPoolCreateFlags,
    pub(crate) max_sets: u32,
    pub(crate) pool_sizes: Vec<(vk::DescriptorType, u32)>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct WriteRecord {
    pub(crate) dst_set: vk::DescriptorSet,
    pub(crate) dst_binding: u32,
    pub(crate) descriptor_type: vk::DescriptorType,
    pub(crate) buffer: Option<vk::DescriptorBufferInfo>,
    pub(crate) image: Option<vk::DescriptorImageInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    BindPipeline(vk::CommandBuffer, vk::Pipeline),
    BindDescriptorSets(vk::CommandBuffer, vk::PipelineLayout, Vec<vk::DescriptorSet>),
    /// `(x, y, width, height)`
    SetScissor(vk::CommandBuffer, (i32, i32, u32, u32)),
}

/// Turns a Vulkan array into a slice. A zero count may come with a null pointer.
unsafe fn raw_slice<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if count == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(ptr, count as usize) }
    }
}

unsafe fn raw_ref<'a, T>(ptr: *const T) -> Option<&'a T> {
    unsafe { ptr.as_ref() }
}

impl MockState {
    fn create<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        let raw = 0x1000 + self.next_handle;
        self.live.insert(raw);

        T::from_raw(raw)
    }

    fn destroy(&mut self, handle: impl Handle) {
        let raw = handle.as_raw();
        assert!(self.live.remove(&raw), "destroyed a dead object {:#x}", raw);
    }
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        MockDevice::default()
    }

    /// Returns the number of objects created and not destroyed yet. Descriptor sets are owned by
    /// their pool and aren't counted.
    pub(crate) fn live_object_count(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub(crate) fn is_live_pool(&self, pool: vk::DescriptorPool) -> bool {
        self.state.borrow().live.contains(&pool.as_raw())
    }

    pub(crate) fn created_set_layouts(&self) -> Vec<SetLayoutRecord> {
        self.state.borrow().set_layouts.clone()
    }

    pub(crate) fn created_pipeline_layouts(&self) -> Vec<PipelineLayoutRecord> {
        self.state.borrow().pipeline_layouts.clone()
    }

    pub(crate) fn created_pipelines(&self) -> Vec<PipelineRecord> {
        self.state.borrow().pipelines.clone()
    }

    pub(crate) fn created_pools(&self) -> Vec<PoolRecord> {
        self.state.borrow().pools.clone()
    }

    pub(crate) fn descriptor_writes(&self) -> Vec<WriteRecord> {
        self.state.borrow().descriptor_writes.clone()
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.state.borrow_mut().commands)
    }

    /// Returns the number of successful descriptor set allocation calls.
    pub(crate) fn allocation_count(&self) -> usize {
        self.state.borrow().allocation_count
    }

    /// Returns the number of descriptor sets freed back to their pool.
    pub(crate) fn freed_set_count(&self) -> usize {
        self.state.borrow().freed_set_count
    }

    /// Makes the set layout creation after the next `successes` ones fail.
    pub(crate) fn fail_set_layout_creation_after(&self, successes: usize) {
        self.state.borrow_mut().fail_set_layout_after = Some(successes);
    }

    pub(crate) fn fail_next_pipeline_layout_creation(&self) {
        self.state.borrow_mut().fail_next_pipeline_layout = true;
    }

    pub(crate) fn fail_next_pipeline_creation(&self) {
        self.state.borrow_mut().fail_next_pipeline = true;
    }

    pub(crate) fn fail_next_pool_creation(&self) {
        self.state.borrow_mut().fail_next_pool = true;
    }

    /// Makes the next allocation fail with `err`. Calling this again queues another failure
    /// after it.
    pub(crate) fn fail_next_allocation(&self, err: VulkanError) {
        self.state.borrow_mut().allocation_failures.push_back(err);
    }
}

unsafe impl CacheDevice for MockDevice {
    unsafe fn create_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        let mut state = self.state.borrow_mut();

        if let Some(successes) = state.fail_set_layout_after {
            if successes == 0 {
                state.fail_set_layout_after = None;
                return Err(VulkanError::OutOfDeviceMemory);
            }

            state.fail_set_layout_after = Some(successes - 1);
        }

        let bindings = unsafe { raw_slice(create_info.p_bindings, create_info.binding_count) }
            .iter()
            .map(|binding| {
                (
                    binding.binding,
                    binding.descriptor_type,
                    binding.descriptor_count,
                    binding.stage_flags,
                )
            })
            .collect();

        let handle = state.create();
        state.set_layouts.push(SetLayoutRecord { handle, bindings });

        Ok(handle)
    }

    unsafe fn destroy_descriptor_set_layout(&self, set_layout: vk::DescriptorSetLayout) {
        self.state.borrow_mut().destroy(set_layout);
    }

    unsafe fn create_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, VulkanError> {
        let mut state = self.state.borrow_mut();

        if state.fail_next_pipeline_layout {
            state.fail_next_pipeline_layout = false;
            return Err(VulkanError::OutOfHostMemory);
        }

        let set_layouts =
            unsafe { raw_slice(create_info.p_set_layouts, create_info.set_layout_count) }.to_vec();

        let handle = state.create();
        state.pipeline_layouts.push(PipelineLayoutRecord {
            handle,
            set_layouts,
        });

        Ok(handle)
    }

    unsafe fn destroy_pipeline_layout(&self, pipeline_layout: vk::PipelineLayout) {
        self.state.borrow_mut().destroy(pipeline_layout);
    }

    unsafe fn create_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, VulkanError> {
        let mut state = self.state.borrow_mut();

        if state.fail_next_pipeline {
            state.fail_next_pipeline = false;
            return Err(VulkanError::Unknown);
        }

        let modules = unsafe { raw_slice(create_info.p_stages, create_info.stage_count) }
            .iter()
            .map(|stage| stage.module)
            .collect();
        let vertex_input = unsafe { raw_ref(create_info.p_vertex_input_state) };
        let input_assembly = unsafe { raw_ref(create_info.p_input_assembly_state) };
        let color_blend = unsafe { raw_ref(create_info.p_color_blend_state) };
        let dynamic_state = unsafe { raw_ref(create_info.p_dynamic_state) };

        let handle = state.create();
        state.pipelines.push(PipelineRecord {
            handle,
            stage_count: create_info.stage_count,
            modules,
            vertex_attribute_count: vertex_input
                .map_or(0, |info| info.vertex_attribute_description_count),
            vertex_binding_count: vertex_input
                .map_or(0, |info| info.vertex_binding_description_count),
            color_blend_attachments: color_blend.map_or_else(Vec::new, |info| {
                unsafe { raw_slice(info.p_attachments, info.attachment_count) }.to_vec()
            }),
            dynamic_states: dynamic_state.map_or_else(Vec::new, |info| {
                unsafe { raw_slice(info.p_dynamic_states, info.dynamic_state_count) }.to_vec()
            }),
            topology: input_assembly
                .map_or(vk::PrimitiveTopology::default(), |info| info.topology),
            layout: create_info.layout,
            render_pass: create_info.render_pass,
            subpass: create_info.subpass,
        });

        Ok(handle)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.borrow_mut().destroy(pipeline);
    }

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, VulkanError> {
        let mut state = self.state.borrow_mut();

        if state.fail_next_pool {
            state.fail_next_pool = false;
            return Err(VulkanError::OutOfDeviceMemory);
        }

        let pool_sizes =
            unsafe { raw_slice(create_info.p_pool_sizes, create_info.pool_size_count) }
                .iter()
                .map(|size| (size.ty, size.descriptor_count))
                .collect();

        let handle = state.create();
        state.pools.push(PoolRecord {
            handle,
            flags: create_info.flags,
            max_sets: create_info.max_sets,
            pool_sizes,
        });
        state.pool_usage.insert(
            handle,
            PoolUsage {
                max_sets: create_info.max_sets,
                allocated: 0,
            },
        );

        Ok(handle)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.borrow_mut();
        state.destroy(pool);
        state.pool_usage.remove(&pool);
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
        output: &mut [vk::DescriptorSet],
    ) -> Result<(), VulkanError> {
        let mut state = self.state.borrow_mut();
        let count = allocate_info.descriptor_set_count;
        assert_eq!(output.len(), count as usize);

        if let Some(err) = state.allocation_failures.pop_front() {
            return Err(err);
        }

        let usage = state
            .pool_usage
            .get_mut(&allocate_info.descriptor_pool)
            .expect("allocated from a dead descriptor pool");

        if usage.allocated + count > usage.max_sets {
            return Err(VulkanError::OutOfPoolMemory);
        }

        usage.allocated += count;

        for set in output {
            state.next_handle += 1;
            *set = vk::DescriptorSet::from_raw(0x10_0000 + state.next_handle);
        }

        state.allocation_count += 1;

        Ok(())
    }

    unsafe fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        descriptor_sets: &[vk::DescriptorSet],
    ) -> Result<(), VulkanError> {
        let mut state = self.state.borrow_mut();
        let usage = state
            .pool_usage
            .get_mut(&pool)
            .expect("freed descriptor sets of a dead descriptor pool");

        usage.allocated -= descriptor_sets.len() as u32;
        state.freed_set_count += descriptor_sets.len();

        Ok(())
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.borrow_mut();

        for write in writes {
            assert_eq!(write.descriptor_count, 1);

            state.descriptor_writes.push(WriteRecord {
                dst_set: write.dst_set,
                dst_binding: write.dst_binding,
                descriptor_type: write.descriptor_type,
                buffer: unsafe { raw_ref(write.p_buffer_info) }.copied(),
                image: unsafe { raw_ref(write.p_image_info) }.copied(),
            });
        }
    }

    unsafe fn create_sampler(
        &self,
        _create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, VulkanError> {
        Ok(self.state.borrow_mut().create())
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.borrow_mut().destroy(sampler);
    }

    unsafe fn create_dummy_buffer(&self, size: DeviceSize) -> Result<DummyBuffer, VulkanError> {
        let mut state = self.state.borrow_mut();

        Ok(DummyBuffer {
            buffer: state.create(),
            memory: vk::DeviceMemory::from_raw(0xdead),
            size,
        })
    }

    unsafe fn destroy_dummy_buffer(&self, buffer: DummyBuffer) {
        self.state.borrow_mut().destroy(buffer.buffer);
    }

    unsafe fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state
            .borrow_mut()
            .commands
            .push(Command::BindPipeline(command_buffer, pipeline));
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        self.state
            .borrow_mut()
            .commands
            .push(Command::BindDescriptorSets(
                command_buffer,
                pipeline_layout,
                descriptor_sets.to_vec(),
            ));
    }

    unsafe fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &vk::Rect2D) {
        let rect = (
            scissor.offset.x,
            scissor.offset.y,
            scissor.extent.width,
            scissor.extent.height,
        );

        self.state
            .borrow_mut()
            .commands
            .push(Command::SetScissor(command_buffer, rect));
    }
}
