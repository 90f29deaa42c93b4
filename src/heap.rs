//! The heap table: memory blocks per memory type.

use std::ptr::NonNull;

use ash::vk;
use slotmap::{new_key_type, SlotMap};
#[cfg(feature = "tracing")]
use tracing::{debug, trace};

use crate::block::MemoryBlock;
use crate::{
    align_up, find_memory_type_index, Allocation, AllocationDescriptor, AllocatorStatistic,
    DeviceError, RawDevice, Result, BLOCK_GRANULARITY,
};

new_key_type! {
    pub(crate) struct BlockKey;
}

/// The blocks of one memory type.
struct MemoryPool {
    is_mappable: bool,
    is_device_local: bool,
    blocks: SlotMap<BlockKey, MemoryBlock>,
}

/// Decides when to sub-allocate and when to grow or shrink the native block count.
///
/// Not synchronized. [`MemoryAllocator`](crate::MemoryAllocator) guards it with a mutex.
pub(crate) struct HeapManager {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    pools: Vec<MemoryPool>,
    min_block_size: u64,
    native_allocation_count: u32,
    device_local_usage: u64,
}

impl HeapManager {
    pub(crate) fn new(memory_properties: vk::PhysicalDeviceMemoryProperties, min_block_size: u64) -> Self {
        let memory_types =
            &memory_properties.memory_types[..memory_properties.memory_type_count as usize];

        let pools = memory_types
            .iter()
            .map(|memory_type| MemoryPool {
                is_mappable: memory_type
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                is_device_local: memory_type
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL),
                blocks: SlotMap::with_key(),
            })
            .collect();

        Self {
            memory_properties,
            pools,
            min_block_size,
            native_allocation_count: 0,
            device_local_usage: 0,
        }
    }

    pub(crate) fn allocate(
        &mut self,
        device: &dyn RawDevice,
        descriptor: &AllocationDescriptor,
    ) -> Result<Allocation> {
        let size = descriptor.requirements.size;
        let alignment = descriptor.requirements.alignment;

        if size == 0 || !alignment.is_power_of_two() {
            return Err(DeviceError::InvalidAlignment);
        }

        let memory_type_index = find_memory_type_index(
            &self.memory_properties,
            descriptor.requirements.memory_type_bits,
            descriptor.properties,
        )?;

        let pool = &mut self.pools[memory_type_index as usize];
        for (block_key, block) in pool.blocks.iter_mut() {
            if let Some(placement) = block.sub_allocate(size, alignment, descriptor.tag) {
                #[cfg(feature = "tracing")]
                trace!(
                    "Sub-allocated {} bytes at offset {} of memory type[{}] for '{}'",
                    placement.size,
                    placement.offset,
                    memory_type_index,
                    descriptor.tag
                );

                return Ok(Allocation {
                    memory_type_index,
                    block_key,
                    chunk_key: placement.chunk_key,
                    device_memory: block.device_memory,
                    offset: placement.offset,
                    size: placement.size,
                    mapped_ptr: placement.mapped_ptr,
                    tag: descriptor.tag.to_owned(),
                });
            }
        }

        let block_key = self.allocate_new_block(device, memory_type_index, size)?;
        let block = &mut self.pools[memory_type_index as usize].blocks[block_key];
        let placement = block
            .sub_allocate(size, alignment, descriptor.tag)
            .ok_or_else(|| {
                DeviceError::Internal(format!(
                    "fresh memory block of {} bytes can't hold {} bytes",
                    block.size, size
                ))
            })?;

        Ok(Allocation {
            memory_type_index,
            block_key,
            chunk_key: placement.chunk_key,
            device_memory: block.device_memory,
            offset: placement.offset,
            size: placement.size,
            mapped_ptr: placement.mapped_ptr,
            tag: descriptor.tag.to_owned(),
        })
    }

    fn allocate_new_block(
        &mut self,
        device: &dyn RawDevice,
        memory_type_index: u32,
        size: u64,
    ) -> Result<BlockKey> {
        let block_size = self.min_block_size.max(align_up(size, BLOCK_GRANULARITY));
        let capacity = self.device_local_capacity();

        let pool = &mut self.pools[memory_type_index as usize];
        let device_memory = device
            .allocate_memory(block_size, memory_type_index)
            .map_err(|result| {
                DeviceError::from_allocation_result(
                    result,
                    block_size,
                    self.device_local_usage,
                    capacity,
                    self.native_allocation_count,
                )
            })?;

        let mapped_ptr = if pool.is_mappable {
            match device.map_memory(device_memory, block_size) {
                Ok(ptr) => NonNull::new(ptr),
                Err(_) => {
                    device.free_memory(device_memory);
                    return Err(DeviceError::FailedToMap);
                }
            }
        } else {
            None
        };

        self.native_allocation_count += 1;
        if pool.is_device_local {
            self.device_local_usage += block_size;
        }

        #[cfg(feature = "tracing")]
        debug!(
            "Allocated memory block of {} bytes on memory type[{}] ({} blocks live)",
            block_size, memory_type_index, self.native_allocation_count
        );

        Ok(pool
            .blocks
            .insert(MemoryBlock::new(device_memory, block_size, mapped_ptr)))
    }

    pub(crate) fn free(&mut self, device: &dyn RawDevice, allocation: Allocation) -> Result<()> {
        let pool = self
            .pools
            .get_mut(allocation.memory_type_index as usize)
            .ok_or(DeviceError::UnknownMemoryBlock)?;
        let block = pool
            .blocks
            .get_mut(allocation.block_key)
            .ok_or(DeviceError::UnknownMemoryBlock)?;
        if block.device_memory != allocation.device_memory {
            return Err(DeviceError::UnknownMemoryBlock);
        }

        block.deallocate(allocation.chunk_key, allocation.offset)?;

        if block.is_empty() {
            if let Some(mut block) = pool.blocks.remove(allocation.block_key) {
                block.destroy(device);

                self.native_allocation_count -= 1;
                if pool.is_device_local {
                    self.device_local_usage -= block.size;
                }

                #[cfg(feature = "tracing")]
                debug!(
                    "Released memory block of {} bytes on memory type[{}] ({} blocks live)",
                    block.size, allocation.memory_type_index, self.native_allocation_count
                );
            }
        }

        Ok(())
    }

    /// Frees every block, live sub-allocations or not. Returns the tags of the leaked ones.
    pub(crate) fn free_all(&mut self, device: &dyn RawDevice) -> Vec<String> {
        let mut leaked = Vec::new();
        for pool in self.pools.iter_mut() {
            for (_, mut block) in pool.blocks.drain() {
                leaked.extend(block.tags().map(str::to_owned));
                block.destroy(device);
            }
        }
        self.native_allocation_count = 0;
        self.device_local_usage = 0;
        leaked
    }

    pub(crate) fn leaked_tags(&self) -> Vec<String> {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.values())
            .flat_map(|block| block.tags().map(str::to_owned))
            .collect()
    }

    pub(crate) fn native_allocation_count(&self) -> u32 {
        self.native_allocation_count
    }

    pub(crate) fn device_local_usage(&self) -> u64 {
        self.device_local_usage
    }

    /// Bytes of all native blocks.
    pub(crate) fn block_bytes(&self) -> u64 {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.values())
            .map(|block| block.size)
            .sum()
    }

    /// Alignment padding in front of live sub-allocations.
    pub(crate) fn padding_bytes(&self) -> u64 {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.values())
            .map(|block| block.padding_bytes())
            .sum()
    }

    /// Sum of all memory heaps.
    pub(crate) fn heap_capacity(&self) -> u64 {
        self.memory_properties.memory_heaps[..self.memory_properties.memory_heap_count as usize]
            .iter()
            .map(|heap| heap.size)
            .sum()
    }

    fn device_local_capacity(&self) -> u64 {
        self.memory_properties.memory_heaps[..self.memory_properties.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    pub(crate) fn block_free_ranges(&self, memory_type_index: u32) -> Vec<Vec<(u64, u64)>> {
        self.pools
            .get(memory_type_index as usize)
            .map(|pool| {
                pool.blocks
                    .values()
                    .map(|block| {
                        block
                            .free_ranges()
                            .iter()
                            .map(|range| (range.offset, range.size))
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AllocatorStatistic for HeapManager {
    fn allocation_count(&self) -> usize {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.values())
            .map(|block| block.allocation_count())
            .sum()
    }

    fn unused_range_count(&self) -> usize {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.values())
            .map(|block| block.free_ranges().len())
            .sum()
    }

    fn used_bytes(&self) -> u64 {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.values())
            .map(|block| block.used_bytes())
            .sum()
    }

    fn unused_bytes(&self) -> u64 {
        self.pools
            .iter()
            .flat_map(|pool| pool.blocks.values())
            .map(|block| block.free_bytes())
            .sum()
    }

    fn block_count(&self) -> usize {
        self.pools.iter().map(|pool| pool.blocks.len()).sum()
    }
}
