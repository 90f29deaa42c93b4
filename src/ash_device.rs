//! `ash` implementation of the native device calls.

use std::ffi::{c_void, CString};

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;

use crate::RawDevice;

/// A logical device loaded through `ash` together with its graphics queue.
///
/// Does not own the `ash::Device`. The caller destroys it after the
/// [`Device`](crate::Device) built on top of it has been dropped.
pub struct AshDevice {
    device: ash::Device,
    graphics_queue: Mutex<vk::Queue>,
    graphics_queue_family_index: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl AshDevice {
    /// Wraps a logical device. Queries the memory properties and limits once.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        logical_device: &ash::Device,
        graphics_queue_family_index: u32,
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let graphics_queue =
            unsafe { logical_device.get_device_queue(graphics_queue_family_index, 0) };

        Self {
            device: logical_device.clone(),
            graphics_queue: Mutex::new(graphics_queue),
            graphics_queue_family_index,
            memory_properties,
            limits: properties.limits,
            debug_utils: None,
        }
    }

    /// Enables debug names for created objects. Requires `VK_EXT_debug_utils`.
    pub fn with_debug_utils(mut self, instance: &ash::Instance) -> Self {
        self.debug_utils = Some(ash::ext::debug_utils::Device::new(instance, &self.device));
        self
    }

    /// The wrapped `ash::Device`.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The graphics queue submissions go to.
    pub fn graphics_queue(&self) -> vk::Queue {
        *self.graphics_queue.lock()
    }
}

impl RawDevice for AshDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn limits(&self) -> vk::PhysicalDeviceLimits {
        self.limits
    }

    fn graphics_queue_family_index(&self) -> u32 {
        self.graphics_queue_family_index
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<*mut c_void> {
        unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
        }
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> VkResult<()> {
        unsafe { self.device.free_descriptor_sets(pool, &[set]) }
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(
            vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
                | vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        );
        unsafe { self.device.begin_command_buffer(command_buffer, &info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, u64::MAX) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn queue_submit(
        &self,
        command_buffer: vk::CommandBuffer,
        signal_semaphore: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let command_buffers = [command_buffer];
        let signal_semaphores: Vec<vk::Semaphore> = signal_semaphore.into_iter().collect();
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let queue = self.graphics_queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache> {
        let info = vk::PipelineCacheCreateInfo::default().initial_data(initial_data);
        unsafe { self.device.create_pipeline_cache(&info, None) }
    }

    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>> {
        unsafe { self.device.get_pipeline_cache_data(cache) }
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) }
    }

    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let debug_utils = match &self.debug_utils {
            Some(debug_utils) => debug_utils,
            None => return,
        };
        let name = match CString::new(name) {
            Ok(name) => name,
            Err(_) => return,
        };

        let info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: handle,
            ..Default::default()
        }
        .object_name(&name);

        // Naming is diagnostics only.
        let _ = unsafe { debug_utils.set_debug_utils_object_name(&info) };
    }
}
