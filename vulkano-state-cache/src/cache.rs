//! The cache itself: requirement accumulation, resolve-and-bind, and the epoch clock.

use crate::{
    descriptor::{write_descriptor_sets, DescriptorCacheKey, DescriptorSetCache, DummyBindings},
    device::{CacheDevice, VulkanDevice},
    layout::{DescriptorSetTriple, PipelineLayoutCache},
    pipeline::{PipelineCache, PipelineCacheKey},
    pool::DescriptorPoolManager,
    DescriptorKey, InputAttachmentBinding, NonExhaustive, PipelineKey, PipelineLayoutKey,
    RasterState, SamplerBinding, ShaderProgram, UniformBufferBinding, VertexAttribute,
    VertexBuffer, DEFAULT_DESCRIPTOR_POOL_SIZE, DEFAULT_RETENTION_WINDOW, DESCRIPTOR_TYPE_COUNT,
    INPUT_ATTACHMENT_BINDING_COUNT, MAX_COLOR_TARGET_COUNT, SAMPLER_BINDING_COUNT,
    UNIFORM_BUFFER_BINDING_COUNT, VERTEX_ATTRIBUTE_COUNT,
};
use ash::vk;
use log::{debug, error, warn};
use vulkano::{pipeline::graphics::input_assembly::PrimitiveTopology, DeviceSize, VulkanError};

/// Caches the pipelines, pipeline layouts and descriptor sets used by draw calls.
///
/// The cache is a recording context: the `bind_*` setters overwrite the requirements of the next
/// draw without touching the device, and the `unsafe` resolve-and-bind methods turn the current
/// requirements into cached objects and record the commands that bind them. Within a draw,
/// [`bind_pipeline`] must be called before [`bind_descriptors`].
///
/// Cached objects are released once they haven't been used for more than the retention window,
/// counted in calls to [`on_command_buffer`].
///
/// [`bind_pipeline`]: Self::bind_pipeline
/// [`bind_descriptors`]: Self::bind_descriptors
/// [`on_command_buffer`]: Self::on_command_buffer
#[derive(Debug)]
pub struct PipelineStateCache<D: CacheDevice = VulkanDevice> {
    device: D,
    retention_window: u64,
    current_time: u64,

    pipeline_requirements: PipelineKey,
    layout_requirements: PipelineLayoutKey,
    descriptor_requirements: DescriptorKey,

    bound_pipeline: Option<PipelineCacheKey>,
    bound_descriptor: Option<DescriptorCacheKey>,
    current_scissor: Option<vk::Rect2D>,

    pipeline_layouts: PipelineLayoutCache,
    pipelines: PipelineCache,
    descriptor_sets: DescriptorSetCache,
    descriptor_pool: DescriptorPoolManager,
    dummy: DummyBindings,
}

impl<D: CacheDevice> PipelineStateCache<D> {
    /// Creates the descriptor pool and the dummy resources, and returns an empty cache.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.initial_descriptor_pool_size` is zero.
    /// - Panics if `create_info.dummy_buffer_size` is zero.
    pub fn new(device: D, create_info: PipelineStateCacheCreateInfo) -> Result<Self, VulkanError> {
        let PipelineStateCacheCreateInfo {
            initial_descriptor_pool_size,
            retention_window,
            dummy_buffer_size,
            dummy_image_view,
            _ne: _,
        } = create_info;

        assert!(initial_descriptor_pool_size != 0);
        assert!(dummy_buffer_size != 0);

        let mut descriptor_pool =
            unsafe { DescriptorPoolManager::new(&device, initial_descriptor_pool_size) }?;

        let dummy =
            match unsafe { DummyBindings::new(&device, dummy_buffer_size, dummy_image_view) } {
                Ok(dummy) => dummy,
                Err(err) => {
                    error!("failed to create the dummy descriptor resources: {}", err);
                    unsafe { descriptor_pool.destroy(&device) };
                    return Err(err);
                }
            };

        Ok(PipelineStateCache {
            device,
            retention_window,
            current_time: 0,
            pipeline_requirements: PipelineKey::default(),
            layout_requirements: PipelineLayoutKey::default(),
            descriptor_requirements: DescriptorKey::default(),
            bound_pipeline: None,
            bound_descriptor: None,
            current_scissor: None,
            pipeline_layouts: PipelineLayoutCache::default(),
            pipelines: PipelineCache::default(),
            descriptor_sets: DescriptorSetCache::default(),
            descriptor_pool,
            dummy,
        })
    }

    /// Returns the device the cache creates its objects with.
    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Returns the raster state of the engine, which a new cache starts out with.
    #[inline]
    pub const fn default_raster_state() -> RasterState {
        RasterState::new()
    }

    /// Sets the image view written into unbound sampler and input attachment slots. The view
    /// must be in the `ShaderReadOnlyOptimal` layout whenever it is read.
    ///
    /// Only descriptor sets written afterwards are affected.
    #[inline]
    pub fn set_dummy_texture(&mut self, image_view: vk::ImageView) {
        self.dummy.set_image_view(image_view);
    }

    /// Returns the image view written into unbound sampler and input attachment slots.
    #[inline]
    pub fn dummy_texture(&self) -> vk::ImageView {
        self.dummy.image_view()
    }

    /// Binds the shaders of `program`, and selects the pipeline layout matching its sampler
    /// usage.
    pub fn bind_program(&mut self, program: &ShaderProgram) {
        self.pipeline_requirements.vertex_shader = program.vertex_shader;
        self.pipeline_requirements.fragment_shader = program
            .fragment_shader
            .filter(|&module| module != vk::ShaderModule::null());
        self.layout_requirements = program.layout_key();
    }

    /// # Panics
    ///
    /// - Panics if `raster_state.color_target_count` exceeds [`MAX_COLOR_TARGET_COUNT`].
    pub fn bind_raster_state(&mut self, raster_state: RasterState) {
        assert!(
            raster_state.color_target_count as usize <= MAX_COLOR_TARGET_COUNT,
            "color target overflow: count = {}, capacity = {}",
            raster_state.color_target_count,
            MAX_COLOR_TARGET_COUNT,
        );

        self.pipeline_requirements.raster_state = raster_state;
    }

    #[inline]
    pub fn bind_render_pass(&mut self, render_pass: vk::RenderPass, subpass: u32) {
        self.pipeline_requirements.render_pass = render_pass;
        self.pipeline_requirements.subpass = subpass;
    }

    #[inline]
    pub fn bind_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.pipeline_requirements.topology = topology;
    }

    /// Replaces the vertex attributes and vertex buffer bindings.
    ///
    /// # Panics
    ///
    /// - Panics if either slice is longer than [`VERTEX_ATTRIBUTE_COUNT`].
    pub fn bind_vertex_array(&mut self, attributes: &[VertexAttribute], buffers: &[VertexBuffer]) {
        assert!(
            attributes.len() <= VERTEX_ATTRIBUTE_COUNT,
            "vertex attribute overflow: count = {}, capacity = {}",
            attributes.len(),
            VERTEX_ATTRIBUTE_COUNT,
        );
        assert!(
            buffers.len() <= VERTEX_ATTRIBUTE_COUNT,
            "vertex buffer overflow: count = {}, capacity = {}",
            buffers.len(),
            VERTEX_ATTRIBUTE_COUNT,
        );

        let requirements = &mut self.pipeline_requirements;
        requirements.vertex_attributes = [None; VERTEX_ATTRIBUTE_COUNT];
        requirements.vertex_buffers = [None; VERTEX_ATTRIBUTE_COUNT];

        for (slot, &attribute) in requirements.vertex_attributes.iter_mut().zip(attributes) {
            *slot = Some(attribute);
        }

        for (slot, &buffer) in requirements.vertex_buffers.iter_mut().zip(buffers) {
            *slot = Some(buffer);
        }
    }

    /// Binds a range of `buffer` to uniform buffer slot `index`. A null buffer unbinds the slot.
    ///
    /// # Panics
    ///
    /// - Panics if `index` is not less than [`UNIFORM_BUFFER_BINDING_COUNT`].
    pub fn bind_uniform_buffer(
        &mut self,
        index: u32,
        buffer: vk::Buffer,
        offset: DeviceSize,
        size: DeviceSize,
    ) {
        assert!(
            (index as usize) < UNIFORM_BUFFER_BINDING_COUNT,
            "uniform buffer binding overflow: index = {}, capacity = {}",
            index,
            UNIFORM_BUFFER_BINDING_COUNT,
        );

        self.descriptor_requirements.uniform_buffers[index as usize] =
            (buffer != vk::Buffer::null()).then_some(UniformBufferBinding {
                buffer,
                offset,
                size,
            });
    }

    /// Replaces every sampler slot. Slot `i` takes `samplers[i]`, slots past the end of
    /// `samplers` are unbound, and so are entries with a null sampler.
    ///
    /// # Panics
    ///
    /// - Panics if `samplers` is longer than [`SAMPLER_BINDING_COUNT`].
    pub fn bind_samplers(&mut self, samplers: &[Option<SamplerBinding>]) {
        assert!(
            samplers.len() <= SAMPLER_BINDING_COUNT,
            "sampler binding overflow: count = {}, capacity = {}",
            samplers.len(),
            SAMPLER_BINDING_COUNT,
        );

        let slots = &mut self.descriptor_requirements.samplers;
        *slots = [None; SAMPLER_BINDING_COUNT];

        for (slot, &sampler) in slots.iter_mut().zip(samplers) {
            *slot = sampler.filter(|sampler| sampler.sampler != vk::Sampler::null());
        }
    }

    /// Binds an image to input attachment slot `index`. A null image view unbinds the slot.
    ///
    /// # Panics
    ///
    /// - Panics if `index` is not less than [`INPUT_ATTACHMENT_BINDING_COUNT`].
    pub fn bind_input_attachment(&mut self, index: u32, attachment: InputAttachmentBinding) {
        assert!(
            (index as usize) < INPUT_ATTACHMENT_BINDING_COUNT,
            "input attachment binding overflow: index = {}, capacity = {}",
            index,
            INPUT_ATTACHMENT_BINDING_COUNT,
        );

        self.descriptor_requirements.input_attachments[index as usize] =
            (attachment.image_view != vk::ImageView::null()).then_some(attachment);
    }

    /// Unbinds every uniform buffer slot that refers to `buffer`. Call this before destroying a
    /// buffer that may still be bound.
    pub fn unbind_uniform_buffer(&mut self, buffer: vk::Buffer) {
        for slot in &mut self.descriptor_requirements.uniform_buffers {
            if slot.is_some_and(|binding| binding.buffer == buffer) {
                *slot = None;
            }
        }
    }

    /// Unbinds every sampler and input attachment slot that refers to `image_view`. Call this
    /// before destroying an image view that may still be bound.
    pub fn unbind_image_view(&mut self, image_view: vk::ImageView) {
        for slot in &mut self.descriptor_requirements.samplers {
            if slot.is_some_and(|binding| binding.image_view == image_view) {
                *slot = None;
            }
        }

        for slot in &mut self.descriptor_requirements.input_attachments {
            if slot.is_some_and(|binding| binding.image_view == image_view) {
                *slot = None;
            }
        }
    }

    /// Returns what is currently bound to uniform buffer slot `index`.
    #[inline]
    pub fn uniform_buffer_binding(&self, index: u32) -> Option<UniformBufferBinding> {
        self.descriptor_requirements
            .uniform_buffers
            .get(index as usize)
            .copied()
            .flatten()
    }

    /// Binds the pipeline matching the current requirements, creating it and its pipeline layout
    /// if needed.
    ///
    /// Nothing is recorded if the same pipeline is already bound since the last
    /// [`on_command_buffer`](Self::on_command_buffer). If creation fails, the error is returned
    /// and the caller may skip the draw.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be in the recording state and belong to the device of the cache.
    ///
    /// # Panics
    ///
    /// - Panics if no vertex shader is bound.
    pub unsafe fn bind_pipeline(
        &mut self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError> {
        let current_time = self.current_time;
        let layout_key = self.layout_requirements;
        let key = (layout_key, self.pipeline_requirements);

        if self.bound_pipeline == Some(key) {
            let entry = self.pipelines.get_mut(&key);
            debug_assert!(entry.is_some());

            if let Some(entry) = entry {
                entry.last_used = current_time;
            }

            return Ok(());
        }

        let layout = unsafe {
            self.pipeline_layouts
                .get_or_create(&self.device, layout_key, current_time)
        }?;
        layout.last_used = current_time;
        let layout_handle = layout.handle;

        let pipeline = unsafe {
            self.pipelines
                .get_or_create(&self.device, &key, layout_handle, current_time)
        }?;
        pipeline.last_used = current_time;
        let pipeline_handle = pipeline.handle;

        self.bound_pipeline = Some(key);

        unsafe { self.device.cmd_bind_pipeline(command_buffer, pipeline_handle) };

        Ok(())
    }

    /// Binds the descriptor sets matching the current resource bindings, creating them if
    /// needed. Unbound slots are filled with dummy resources.
    ///
    /// Nothing is recorded if the same descriptor sets are already bound since the last
    /// [`on_command_buffer`](Self::on_command_buffer). If the sets can't be allocated even after
    /// growing the descriptor pool, the error is returned.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be in the recording state and belong to the device of the cache.
    ///
    /// # Panics
    ///
    /// - Panics if a sampler or input attachment slot is unbound and no dummy texture is set.
    pub unsafe fn bind_descriptors(
        &mut self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError> {
        let current_time = self.current_time;
        let layout_key = self.layout_requirements;
        let key = (layout_key, self.descriptor_requirements);

        let layout = unsafe {
            self.pipeline_layouts
                .get_or_create(&self.device, layout_key, current_time)
        }?;
        layout.last_used = current_time;
        let layout_handle = layout.handle;

        if self.bound_descriptor == Some(key) {
            let entry = self.descriptor_sets.get_mut(&key);
            debug_assert!(entry.is_some());

            if let Some(entry) = entry {
                entry.last_used = current_time;
            }

            return Ok(());
        }

        let sets = match self.descriptor_sets.get_mut(&key) {
            Some(entry) => {
                entry.last_used = current_time;
                entry.sets
            }
            None => unsafe { self.create_descriptor_sets(&key) }?,
        };

        self.bound_descriptor = Some(key);

        unsafe {
            self.device
                .cmd_bind_descriptor_sets(command_buffer, layout_handle, &sets.0)
        };

        Ok(())
    }

    /// Sets the scissor, unless it is already set to `scissor`.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be in the recording state and belong to the device of the cache.
    pub unsafe fn bind_scissor(&mut self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        if self
            .current_scissor
            .is_some_and(|current| rect_eq(&current, &scissor))
        {
            return;
        }

        self.current_scissor = Some(scissor);

        unsafe { self.device.cmd_set_scissor(command_buffer, &scissor) };
    }

    /// Advances the clock by one, forgets what is bound, and releases every object that hasn't
    /// been used for more than the retention window.
    ///
    /// Call this whenever a new command buffer starts recording.
    ///
    /// # Safety
    ///
    /// - No more command buffers than the retention window may be pending execution on the
    ///   device, counting the one that starts recording.
    pub unsafe fn on_command_buffer(&mut self) {
        self.current_time += 1;

        // Nothing is bound in a command buffer that starts recording.
        self.bound_pipeline = None;
        self.bound_descriptor = None;
        self.current_scissor = None;

        let current_time = self.current_time;
        let retention_window = self.retention_window;
        let is_expired =
            move |last_used: u64| last_used.saturating_add(retention_window) < current_time;

        self.descriptor_sets
            .evict(&mut self.pipeline_layouts, |entry| is_expired(entry.last_used));

        unsafe {
            self.pipelines
                .evict(&self.device, |entry| is_expired(entry.last_used))
        };

        let descriptor_sets = &self.descriptor_sets;
        let pipelines = &self.pipelines;
        let freed = unsafe {
            self.pipeline_layouts.evict(
                &self.device,
                self.descriptor_pool.handle(),
                |layout_key, entry| {
                    let expired = is_expired(entry.last_used);
                    debug_assert!(
                        !expired || !descriptor_sets.references_layout(layout_key),
                        "pipeline layout {:?} is still used by a descriptor set bundle",
                        layout_key,
                    );
                    debug_assert!(
                        !expired || !pipelines.references_layout(layout_key),
                        "pipeline layout {:?} is still used by a pipeline",
                        layout_key,
                    );

                    expired
                },
            )
        };
        self.descriptor_pool.release(freed);

        unsafe { self.descriptor_pool.purge_extinct(&self.device, is_expired) };
    }

    /// Destroys every object the cache created.
    ///
    /// Dropping the cache does the same.
    ///
    /// # Safety
    ///
    /// - The device must not be executing any command buffer that uses objects of the cache.
    pub unsafe fn destroy_cache(mut self) {
        unsafe { self.destroy_objects() };
    }

    unsafe fn destroy_objects(&mut self) {
        debug!(
            "destroying {} descriptor set bundles, {} pipeline layouts and {} pipelines",
            self.descriptor_sets.len(),
            self.pipeline_layouts.len(),
            self.pipelines.len(),
        );

        self.descriptor_sets.clear();
        unsafe { self.pipeline_layouts.destroy_all(&self.device) };
        unsafe { self.pipelines.destroy_all(&self.device) };

        // Destroying the pools frees every descriptor set.
        unsafe { self.descriptor_pool.destroy(&self.device) };
        unsafe { self.dummy.destroy(&self.device) };

        self.bound_pipeline = None;
        self.bound_descriptor = None;
        self.current_scissor = None;
    }

    /// Allocates or reclaims a bundle for `key`, writes it and inserts it into the cache.
    unsafe fn create_descriptor_sets(
        &mut self,
        key: &DescriptorCacheKey,
    ) -> Result<DescriptorSetTriple, VulkanError> {
        let current_time = self.current_time;
        let (layout_key, ref descriptor_key) = *key;

        let layout = unsafe {
            self.pipeline_layouts
                .get_or_create(&self.device, layout_key, current_time)
        }?;
        let set_layouts = layout.set_layouts;

        let sets = match layout.take_sets() {
            Some(sets) => sets,
            None => unsafe { self.allocate_descriptor_sets(&set_layouts) }?,
        };

        unsafe { write_descriptor_sets(&self.device, sets, descriptor_key, &self.dummy) };

        self.descriptor_sets.insert(*key, sets, current_time);

        Ok(sets)
    }

    unsafe fn allocate_descriptor_sets(
        &mut self,
        set_layouts: &[vk::DescriptorSetLayout; DESCRIPTOR_TYPE_COUNT],
    ) -> Result<DescriptorSetTriple, VulkanError> {
        if self.descriptor_pool.is_full() {
            unsafe { self.grow_descriptor_pool() }?;
        }

        match unsafe { self.descriptor_pool.allocate(&self.device, set_layouts) } {
            Ok(sets) => Ok(sets),
            Err(VulkanError::OutOfPoolMemory | VulkanError::FragmentedPool) => {
                warn!(
                    "descriptor pool with capacity {} ran out early, growing it and retrying",
                    self.descriptor_pool.capacity(),
                );

                unsafe { self.grow_descriptor_pool() }?;

                unsafe { self.descriptor_pool.allocate(&self.device, set_layouts) }.map_err(
                    |err| {
                        error!("failed to allocate descriptor sets: {}", err);
                        err
                    },
                )
            }
            Err(err) => {
                error!("failed to allocate descriptor sets: {}", err);
                Err(err)
            }
        }
    }

    /// Moves to a new descriptor pool. Every bundle of the old pool becomes extinct, and the sets
    /// parked in arenas are dropped, since they belong to the old pool.
    unsafe fn grow_descriptor_pool(&mut self) -> Result<(), VulkanError> {
        unsafe {
            self.descriptor_pool
                .grow(&self.device, self.descriptor_sets.timestamps())
        }
        .map_err(|err| {
            error!("failed to grow the descriptor pool: {}", err);
            err
        })?;

        self.descriptor_sets.clear();
        self.pipeline_layouts.clear_arenas();
        self.bound_descriptor = None;

        Ok(())
    }

    /// Returns the number of calls to [`on_command_buffer`](Self::on_command_buffer) so far.
    #[inline]
    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    #[inline]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    #[inline]
    pub fn pipeline_layout_count(&self) -> usize {
        self.pipeline_layouts.len()
    }

    /// Returns the number of descriptor set bundles in use, not counting those parked in arenas
    /// or allocated from extinct pools.
    #[inline]
    pub fn descriptor_bundle_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    /// Returns the number of descriptor set bundles the live descriptor pool was created for.
    #[inline]
    pub fn descriptor_pool_capacity(&self) -> u32 {
        self.descriptor_pool.capacity()
    }

    #[inline]
    pub fn extinct_pool_count(&self) -> usize {
        self.descriptor_pool.extinct_pool_count()
    }

    #[inline]
    pub fn extinct_bundle_count(&self) -> usize {
        self.descriptor_pool.extinct_bundle_count()
    }

    /// Returns the number of descriptor set bundles parked in the arena of the pipeline layout
    /// for `layout_key`.
    #[inline]
    pub fn arena_len(&self, layout_key: PipelineLayoutKey) -> usize {
        self.pipeline_layouts
            .get(&layout_key)
            .map_or(0, |layout| layout.arena_len())
    }
}

impl<D: CacheDevice> Drop for PipelineStateCache<D> {
    fn drop(&mut self) {
        unsafe { self.destroy_objects() };
    }
}

/// Parameters to create a new `PipelineStateCache`.
#[derive(Clone, Debug)]
pub struct PipelineStateCacheCreateInfo {
    /// The number of descriptor set bundles the first descriptor pool has room for. The pool
    /// doubles in size every time it runs out.
    ///
    /// The default value is [`DEFAULT_DESCRIPTOR_POOL_SIZE`].
    pub initial_descriptor_pool_size: u32,

    /// The number of calls to `on_command_buffer` an unused object survives. This must be at
    /// least the number of command buffers that can be in flight.
    ///
    /// The default value is [`DEFAULT_RETENTION_WINDOW`].
    pub retention_window: u64,

    /// The size of the buffer written into unbound uniform buffer slots.
    ///
    /// The default value is `16`.
    pub dummy_buffer_size: DeviceSize,

    /// The image view written into unbound sampler and input attachment slots. If this is null,
    /// it must be set with `set_dummy_texture` before such a slot is written.
    ///
    /// The default value is null.
    pub dummy_image_view: vk::ImageView,

    pub _ne: NonExhaustive,
}

impl Default for PipelineStateCacheCreateInfo {
    #[inline]
    fn default() -> Self {
        PipelineStateCacheCreateInfo {
            initial_descriptor_pool_size: DEFAULT_DESCRIPTOR_POOL_SIZE,
            retention_window: DEFAULT_RETENTION_WINDOW,
            dummy_buffer_size: 16,
            dummy_image_view: vk::ImageView::null(),
            _ne: NonExhaustive(()),
        }
    }
}

fn rect_eq(a: &vk::Rect2D, b: &vk::Rect2D) -> bool {
    a.offset.x == b.offset.x
        && a.offset.y == b.offset.y
        && a.extent.width == b.extent.width
        && a.extent.height == b.extent.height
}
