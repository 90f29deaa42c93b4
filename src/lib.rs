//! Device memory and transient resource management for Vulkan.
//!
//! * [`MemoryAllocator`] sub-allocates big native memory blocks with a best fit strategy.
//! * [`Device`] ties the allocator together with a ring of per-frame contexts that recycle
//!   temporary buffers and descriptor sets, and with per-thread command pools whose command
//!   buffers are reused once their fences signal.
//!
//! All native calls go through [`RawDevice`]. [`AshDevice`] implements it with `ash`.
#![warn(missing_docs)]
use std::ffi::c_void;
use std::ptr::NonNull;

use ash::vk;
#[cfg(feature = "tracing")]
use tracing::debug;

pub use allocator::{MemoryAllocator, MemoryReport};
pub use ash_device::AshDevice;
pub use command::{CommandBuffer, Fence, Semaphore};
pub use device::{Device, DeviceDescriptor};
pub use error::{fatal, DeviceError, OrFatal};
pub use pipeline::{
    BlendMode, PipelineInstanceCache, PipelineInstanceKey, VertexAttribute, VertexBinding,
    VertexInput,
};
pub use raw::RawDevice;
pub use resource::{Buffer, DescriptorSet};

use block::ChunkKey;
use heap::BlockKey;

type Result<T> = std::result::Result<T, DeviceError>;

mod allocator;
mod ash_device;
mod block;
mod command;
mod device;
mod error;
mod frame;
mod heap;
mod pipeline;
mod raw;
mod resource;

/// The end of every sub-allocation is rounded up to this many bytes.
pub const BLOCK_GRANULARITY: u64 = 4 * 1024;

/// For statistic about the memory usage.
pub trait AllocatorStatistic {
    /// Number of live sub-allocations.
    fn allocation_count(&self) -> usize;
    /// Number of free ranges inside all memory blocks.
    fn unused_range_count(&self) -> usize;
    /// Bytes reserved by live sub-allocations.
    fn used_bytes(&self) -> u64;
    /// Free bytes inside all memory blocks.
    fn unused_bytes(&self) -> u64;
    /// Number of native memory blocks.
    fn block_count(&self) -> usize;
}

/// Information about a memory allocation.
pub trait AllocationInfo {
    /// The `vk::DeviceMemory` of the allocation. Managed by the allocator.
    fn memory(&self) -> vk::DeviceMemory;

    /// The offset inside the `vk::DeviceMemory`.
    fn offset(&self) -> u64;

    /// The size of the allocation.
    fn size(&self) -> u64;

    /// Returns a pointer into the mapped memory if it is host visible, otherwise returns None.
    fn mapped_ptr(&self) -> Option<NonNull<c_void>>;
}

/// The descriptor for an allocation on the allocator.
#[derive(Debug, Clone, Copy)]
pub struct AllocationDescriptor<'a> {
    /// Vulkan memory requirements for an allocation.
    pub requirements: vk::MemoryRequirements,
    /// Property flags the memory type must contain.
    pub properties: vk::MemoryPropertyFlags,
    /// Label of the allocation, reported when it leaks.
    pub tag: &'a str,
}

/// A sub-allocation of the [`MemoryAllocator`].
///
/// Exclusively owned by the resource bound to it. Has to be handed back with
/// [`MemoryAllocator::free_memory`] once the GPU no longer uses the memory.
#[derive(Debug)]
pub struct Allocation {
    memory_type_index: u32,
    block_key: BlockKey,
    chunk_key: ChunkKey,
    device_memory: vk::DeviceMemory,
    offset: u64,
    size: u64,
    mapped_ptr: Option<NonNull<c_void>>,
    tag: String,
}

// The mapped pointer points into persistently mapped device memory owned by the allocator.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// The index of the memory type the allocation lives in.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// The label given at allocation time.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl AllocationInfo for Allocation {
    fn memory(&self) -> vk::DeviceMemory {
        self.device_memory
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.mapped_ptr
    }
}

#[inline]
pub(crate) fn align_up(offset: u64, alignment: u64) -> u64 {
    (offset + (alignment - 1)) & !(alignment - 1)
}

/// Returns the first memory type allowed by `memory_type_bits` that has all `properties`.
pub(crate) fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    memory_type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            ((1 << index) & memory_type_bits) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(index, _)| index as u32)
        .ok_or(DeviceError::NoSuitableMemoryType {
            memory_type_bits,
            properties,
        })
}

#[cfg(feature = "tracing")]
pub(crate) fn debug_memory_types(memory_properties: &vk::PhysicalDeviceMemoryProperties) {
    debug!("Memory heaps:");
    for i in 0..memory_properties.memory_heap_count as usize {
        let heap = memory_properties.memory_heaps[i];
        if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            debug!(
                "HEAP[{}] device local [y] size: {} MiB",
                i,
                heap.size / (1024 * 1024)
            );
        } else {
            debug!(
                "HEAP[{}] device local [n] size: {} MiB",
                i,
                heap.size / (1024 * 1024)
            );
        }
    }
    debug!("Memory types:");
    for (i, memory_type) in memory_properties.memory_types
        [..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
    {
        debug!(
            "Memory type[{}] on HEAP[{}] property flags: {:?}",
            i, memory_type.heap_index, memory_type.property_flags
        );
    }
}
