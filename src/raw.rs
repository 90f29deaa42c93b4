//! The native Vulkan calls the device core is built on.

use std::ffi::c_void;

use ash::prelude::VkResult;
use ash::vk;

/// Abstract logical device the core allocates from and submits to.
///
/// Every native call the core makes goes through this trait, so the allocator and the
/// frame recycling logic stay independent of how the entry points are loaded.
/// [`AshDevice`](crate::AshDevice) is the `ash` backed implementation.
pub trait RawDevice: Send + Sync {
    /// Memory types and heaps of the physical device.
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// Limits of the physical device.
    fn limits(&self) -> vk::PhysicalDeviceLimits;

    /// Queue family of the graphics queue that command pools are created for.
    fn graphics_queue_family_index(&self) -> u32;

    /// Allocates a new native memory object.
    ///
    /// This is expensive and the number of live objects is limited by the platform,
    /// which is the reason blocks are sub-allocated.
    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory>;

    /// Frees a native memory object. Implicitly unmaps it.
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Maps the whole memory object persistently.
    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<*mut c_void>;

    /// Creates an exclusive buffer.
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer>;

    /// Memory requirements of a buffer.
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    /// Binds a buffer to a range of a memory object.
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    /// Destroys a buffer.
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Creates a descriptor pool that allows freeing individual sets.
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;

    /// Destroys a descriptor pool and all sets allocated from it.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocates one descriptor set of the given layout.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;

    /// Returns a descriptor set to its pool.
    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> VkResult<()>;

    /// Creates a command pool whose buffers can be reset individually.
    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;

    /// Destroys a command pool and all buffers allocated from it.
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocates one primary command buffer.
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;

    /// Returns a command buffer to its pool.
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);

    /// Begins recording with simultaneous use and one time submit semantics.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Ends recording.
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Resets a command buffer to the initial state.
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Creates an unsignaled fence.
    fn create_fence(&self) -> VkResult<vk::Fence>;

    /// Destroys a fence.
    fn destroy_fence(&self, fence: vk::Fence);

    /// Returns true if the fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// Blocks until all fences are signaled.
    fn wait_for_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    /// Sets fences back to the unsignaled state.
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    /// Creates a binary semaphore.
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;

    /// Destroys a semaphore.
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Submits one command buffer to the graphics queue.
    fn queue_submit(
        &self,
        command_buffer: vk::CommandBuffer,
        signal_semaphore: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> VkResult<()>;

    /// Creates a pipeline cache seeded with opaque driver data.
    fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache>;

    /// Reads the opaque driver data of a pipeline cache.
    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>>;

    /// Destroys a pipeline cache.
    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);

    /// Attaches a debug name to an object. Does nothing without debug utils.
    fn set_object_name(&self, _object_type: vk::ObjectType, _handle: u64, _name: &str) {}
}
