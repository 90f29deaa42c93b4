//! Buffers and descriptor sets handed out to the renderer.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::error;

use crate::{
    Allocation, AllocationDescriptor, AllocationInfo, DeviceError, MemoryAllocator, RawDevice,
    Result,
};

/// A buffer bound to a sub-allocation of the [`MemoryAllocator`].
///
/// Destroys the buffer and frees its memory on drop.
pub struct Buffer {
    memory: Arc<MemoryAllocator>,
    name: String,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
}

impl Buffer {
    /// Creates a buffer of `size` bytes and binds it to new memory with the given properties.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn new(
        memory: &Arc<MemoryAllocator>,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let device = memory.device();
        let buffer = device.create_buffer(size, usage)?;

        let requirements = device.buffer_memory_requirements(buffer);
        let allocation = match memory.allocate_memory(&AllocationDescriptor {
            requirements,
            properties,
            tag: name,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err);
            }
        };

        if let Err(result) =
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        {
            device.destroy_buffer(buffer);
            memory.free_memory(allocation)?;
            return Err(DeviceError::Vulkan(result));
        }

        device.set_object_name(vk::ObjectType::BUFFER, buffer.as_raw(), name);

        Ok(Self {
            memory: memory.clone(),
            name: name.to_owned(),
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            properties,
        })
    }

    /// The Vulkan buffer.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The usage flags the buffer was created with.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// The memory properties the buffer memory was requested with.
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    /// The memory backing the buffer.
    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Returns a pointer to the start of the buffer if its memory is host visible.
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
    }

    /// True if the buffer can serve a request with these flags and size.
    pub(crate) fn satisfies(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> bool {
        self.usage.contains(usage) && self.properties.contains(properties) && self.size >= size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.memory.device().destroy_buffer(self.buffer);
        if let Some(allocation) = self.allocation.take() {
            if let Err(_err) = self.memory.free_memory(allocation) {
                #[cfg(feature = "tracing")]
                error!("Failed to free the memory of buffer '{}': {}", self.name, _err);
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("properties", &self.properties)
            .finish()
    }
}

/// The descriptor pool temporary descriptor sets are allocated from.
pub(crate) struct DescriptorPool {
    device: Arc<dyn RawDevice>,
    pool: Mutex<vk::DescriptorPool>,
    set_count: AtomicU32,
}

impl DescriptorPool {
    /// Creates the pool with up to `max_per_type` descriptors of the common types, clamped to
    /// the per-set device limits.
    pub(crate) fn new(device: Arc<dyn RawDevice>, max_sets: u32, max_per_type: u32) -> Result<Self> {
        let limits = device.limits();
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_per_type.min(limits.max_descriptor_set_uniform_buffers),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_per_type.min(limits.max_descriptor_set_sampled_images),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: max_per_type.min(limits.max_descriptor_set_sampled_images),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: max_per_type.min(limits.max_descriptor_set_samplers),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_per_type.min(limits.max_descriptor_set_storage_buffers),
            },
        ];

        let pool = device.create_descriptor_pool(max_sets, &pool_sizes)?;

        Ok(Self {
            device,
            pool: Mutex::new(pool),
            set_count: AtomicU32::new(0),
        })
    }

    pub(crate) fn handle(&self) -> vk::DescriptorPool {
        *self.pool.lock()
    }

    /// Number of live descriptor sets.
    pub(crate) fn set_count(&self) -> u32 {
        self.set_count.load(Ordering::Relaxed)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(*self.pool.get_mut());
    }
}

/// A descriptor set of the device descriptor pool. Returned to the pool on drop.
pub struct DescriptorSet {
    pool: Arc<DescriptorPool>,
    name: String,
    set: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSet {
    pub(crate) fn new(
        pool: &Arc<DescriptorPool>,
        name: &str,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        let set = {
            let handle = pool.pool.lock();
            pool.device.allocate_descriptor_set(*handle, layout)?
        };
        pool.set_count.fetch_add(1, Ordering::Relaxed);
        pool.device
            .set_object_name(vk::ObjectType::DESCRIPTOR_SET, set.as_raw(), name);

        Ok(Self {
            pool: pool.clone(),
            name: name.to_owned(),
            set,
            layout,
        })
    }

    /// The Vulkan descriptor set.
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// The layout the set was allocated with.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        let handle = self.pool.pool.lock();
        if let Err(_result) = self.pool.device.free_descriptor_set(*handle, self.set) {
            #[cfg(feature = "tracing")]
            error!("Failed to free descriptor set '{}': {}", self.name, _result);
        }
        self.pool.set_count.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("name", &self.name)
            .field("set", &self.set)
            .field("layout", &self.layout)
            .finish()
    }
}
