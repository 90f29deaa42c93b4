use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};

use vk_frame_alloc::{Device, DeviceDescriptor, RawDevice};

#[cfg(feature = "tracing")]
pub fn initialize_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;

        let filter =
            EnvFilter::from_default_env().add_directive("lib::fixture=WARN".parse().unwrap());
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

pub const DEVICE_HEAP_SIZE: u64 = 256 * 1024 * 1024;
pub const HOST_HEAP_SIZE: u64 = 1024 * 1024 * 1024;
pub const BUFFER_ALIGNMENT: u64 = 256;
pub const MOCK_CACHE_DATA: &[u8] = b"MOCKCACHE";

/// Memory type 0: device local.
pub const DEVICE_LOCAL_TYPE: u32 = 0;
/// Memory type 1: host visible and coherent.
pub const HOST_VISIBLE_TYPE: u32 = 1;
/// Memory type 2: device local, host visible and coherent.
pub const DEVICE_HOST_TYPE: u32 = 2;

struct MockMemory {
    size: u64,
    memory_type_index: u32,
    // Stands in for the mapped device memory.
    backing: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub signal_semaphore: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Default)]
struct MockState {
    memory: HashMap<u64, MockMemory>,
    allocation_sizes: Vec<u64>,
    buffers: HashMap<u64, u64>,
    descriptor_pools: HashMap<u64, Vec<vk::DescriptorPoolSize>>,
    descriptor_sets: HashSet<u64>,
    command_pools: HashMap<u64, HashSet<u64>>,
    command_buffers: HashSet<u64>,
    recording: HashSet<u64>,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    pipeline_caches: HashMap<u64, Vec<u8>>,
    submissions: Vec<Submission>,
    object_names: HashMap<u64, String>,
    fail_next_allocation: Option<vk::Result>,
    fail_next_map: bool,
}

#[derive(Default)]
struct GateState {
    entered: bool,
    open: bool,
}

/// Holds a fence wait until the test opens it.
#[derive(Default)]
pub struct WaitGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl WaitGate {
    fn pass(&self) {
        let mut state = self.state.lock();
        state.entered = true;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
    }

    /// Blocks until a fence wait arrived at the gate.
    pub fn wait_entered(&self) {
        let mut state = self.state.lock();
        while !state.entered {
            self.changed.wait(&mut state);
        }
    }

    /// Lets the held fence wait continue.
    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }
}

/// A device without a GPU. Tracks every object and completes submissions on demand.
pub struct MockDevice {
    next_handle: AtomicU64,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
    state: Mutex<MockState>,
    wait_gate: Mutex<Option<Arc<WaitGate>>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        #[cfg(feature = "tracing")]
        initialize_logging();

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: DEVICE_HEAP_SIZE,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: HOST_HEAP_SIZE,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory_properties.memory_types[DEVICE_LOCAL_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[HOST_VISIBLE_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        memory_properties.memory_types[DEVICE_HOST_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };

        let limits = vk::PhysicalDeviceLimits {
            max_descriptor_set_uniform_buffers: 72,
            max_descriptor_set_sampled_images: 1_000_000,
            max_descriptor_set_samplers: 1_000_000,
            max_descriptor_set_storage_buffers: 1_000_000,
            ..Default::default()
        };

        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            memory_properties,
            limits,
            state: Mutex::new(MockState::default()),
            wait_gate: Mutex::new(None),
        })
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// The next native allocation fails with `result`.
    pub fn fail_next_allocation(&self, result: vk::Result) {
        self.state.lock().fail_next_allocation = Some(result);
    }

    /// The next map call fails.
    pub fn fail_next_map(&self) {
        self.state.lock().fail_next_map = true;
    }

    /// The next fence wait blocks until the returned gate is opened.
    pub fn gate_next_fence_wait(&self) -> Arc<WaitGate> {
        let gate = Arc::new(WaitGate::default());
        *self.wait_gate.lock() = Some(gate.clone());
        gate
    }

    /// Signals the fences of every submission, as if the GPU caught up.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        let fences: Vec<vk::Fence> = state.submissions.iter().map(|s| s.fence).collect();
        for fence in fences {
            if let Some(signaled) = state.fences.get_mut(&fence.as_raw()) {
                *signaled = true;
            }
        }
    }

    pub fn live_memory_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Sizes of all native allocations ever made, in order.
    pub fn allocation_sizes(&self) -> Vec<u64> {
        self.state.lock().allocation_sizes.clone()
    }

    pub fn memory_type_of(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.state
            .lock()
            .memory
            .get(&memory.as_raw())
            .map(|memory| memory.memory_type_index)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn is_buffer_alive(&self, buffer: vk::Buffer) -> bool {
        self.state.lock().buffers.contains_key(&buffer.as_raw())
    }

    pub fn live_descriptor_set_count(&self) -> usize {
        self.state.lock().descriptor_sets.len()
    }

    pub fn descriptor_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.state
            .lock()
            .descriptor_pools
            .values()
            .next()
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_descriptor_pool_count(&self) -> usize {
        self.state.lock().descriptor_pools.len()
    }

    pub fn live_command_pool_count(&self) -> usize {
        self.state.lock().command_pools.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn is_recording(&self, command_buffer: vk::CommandBuffer) -> bool {
        self.state.lock().recording.contains(&command_buffer.as_raw())
    }

    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false)
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_pipeline_cache_count(&self) -> usize {
        self.state.lock().pipeline_caches.len()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn object_name(&self, handle: u64) -> Option<String> {
        self.state.lock().object_names.get(&handle).cloned()
    }
}

impl RawDevice for MockDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn limits(&self) -> vk::PhysicalDeviceLimits {
        self.limits
    }

    fn graphics_queue_family_index(&self) -> u32 {
        0
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_allocation.take() {
            return Err(result);
        }

        let handle = self.handle();
        state.memory.insert(
            handle,
            MockMemory {
                size,
                memory_type_index,
                backing: Vec::new(),
            },
        );
        state.allocation_sizes.push(size);
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let removed = self.state.lock().memory.remove(&memory.as_raw());
        assert!(removed.is_some(), "freed unknown memory {:?}", memory);
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<*mut c_void> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_map) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let memory_types = self.memory_properties.memory_types;
        let memory = state
            .memory
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if !memory_types[memory.memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        assert_eq!(memory.size, size);

        memory.backing = vec![0; size as usize];
        Ok(memory.backing.as_mut_ptr() as *mut c_void)
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let handle = self.handle();
        self.state.lock().buffers.insert(handle, size);
        Ok(vk::Buffer::from_raw(handle))
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: (size + BUFFER_ALIGNMENT - 1) / BUFFER_ALIGNMENT * BUFFER_ALIGNMENT,
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: 0b111,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.as_raw()).copied();
        let memory = state.memory.get(&memory.as_raw());
        match (size, memory) {
            (Some(size), Some(memory)) if offset + size <= memory.size => Ok(()),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let removed = self.state.lock().buffers.remove(&buffer.as_raw());
        assert!(removed.is_some(), "destroyed unknown buffer {:?}", buffer);
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let handle = self.handle();
        self.state
            .lock()
            .descriptor_pools
            .insert(handle, pool_sizes.to_vec());
        Ok(vk::DescriptorPool::from_raw(handle))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().descriptor_pools.remove(&pool.as_raw());
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        if !state.descriptor_pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let handle = self.handle();
        state.descriptor_sets.insert(handle);
        Ok(vk::DescriptorSet::from_raw(handle))
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.descriptor_pools.contains_key(&pool.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if state.descriptor_sets.remove(&set.as_raw()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let handle = self.handle();
        self.state
            .lock()
            .command_pools
            .insert(handle, HashSet::new());
        Ok(vk::CommandPool::from_raw(handle))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if let Some(buffers) = state.command_pools.remove(&pool.as_raw()) {
            for buffer in buffers {
                state.command_buffers.remove(&buffer);
                state.recording.remove(&buffer);
            }
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let handle = self.handle();
        let mut state = self.state.lock();
        state
            .command_pools
            .get_mut(&pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?
            .insert(handle);
        state.command_buffers.insert(handle);
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        if let Some(buffers) = state.command_pools.get_mut(&pool.as_raw()) {
            buffers.remove(&command_buffer.as_raw());
        }
        state.command_buffers.remove(&command_buffer.as_raw());
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.recording.insert(command_buffer.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        if self.state.lock().recording.remove(&command_buffer.as_raw()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.state.lock().recording.remove(&command_buffer.as_raw());
        Ok(())
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let handle = self.handle();
        self.state.lock().fences.insert(handle, false);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn wait_for_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let gate = self.wait_gate.lock().take();
        if let Some(gate) = gate {
            gate.pass();
        }

        let mut state = self.state.lock();
        for fence in fences {
            let signaled = state
                .fences
                .get_mut(&fence.as_raw())
                .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
            *signaled = true;
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            if let Some(signaled) = state.fences.get_mut(&fence.as_raw()) {
                *signaled = false;
            }
        }
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let handle = self.handle();
        self.state.lock().semaphores.insert(handle);
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn queue_submit(
        &self,
        command_buffer: vk::CommandBuffer,
        signal_semaphore: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.recording.contains(&command_buffer.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if let Some(signaled) = state.fences.get_mut(&fence.as_raw()) {
            if *signaled {
                return Err(vk::Result::ERROR_UNKNOWN);
            }
        }
        state.submissions.push(Submission {
            command_buffer,
            signal_semaphore,
            fence,
        });
        Ok(())
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache> {
        let data = if initial_data.is_empty() {
            MOCK_CACHE_DATA.to_vec()
        } else if initial_data.starts_with(b"MOCK") {
            initial_data.to_vec()
        } else {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        };

        let handle = self.handle();
        self.state.lock().pipeline_caches.insert(handle, data);
        Ok(vk::PipelineCache::from_raw(handle))
    }

    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>> {
        self.state
            .lock()
            .pipeline_caches
            .get(&cache.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.state.lock().pipeline_caches.remove(&cache.as_raw());
    }

    fn set_object_name(&self, _object_type: vk::ObjectType, handle: u64, name: &str) {
        self.state
            .lock()
            .object_names
            .insert(handle, name.to_owned());
    }
}

/// A device on a fresh mock with the pipeline cache file inside `dir`.
pub fn device(mock: &Arc<MockDevice>, dir: &tempfile::TempDir) -> Device {
    device_with(mock, dir, DeviceDescriptor::default())
}

pub fn device_with(
    mock: &Arc<MockDevice>,
    dir: &tempfile::TempDir,
    descriptor: DeviceDescriptor,
) -> Device {
    let raw: Arc<dyn RawDevice> = mock.clone();
    Device::new(
        raw,
        &DeviceDescriptor {
            pipeline_cache_path: dir.path().join("pcache"),
            ..descriptor
        },
    )
    .unwrap()
}
