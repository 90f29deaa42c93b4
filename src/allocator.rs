//! Implements the device memory facade.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::warn;

#[cfg(feature = "tracing")]
use crate::debug_memory_types;
use crate::heap::HeapManager;
use crate::{Allocation, AllocationDescriptor, AllocatorStatistic, RawDevice, Result};

/// The device memory allocator. Sub-allocates big native memory blocks with a best fit strategy.
///
/// Selects the memory type for the user. Every heap table mutation is serialized by one mutex,
/// allocation is not expected to be a hot path compared to the reuse of temporary resources.
pub struct MemoryAllocator {
    device: Arc<dyn RawDevice>,
    heap: Mutex<HeapManager>,
}

impl MemoryAllocator {
    /// Creates a new allocator. `min_block_size` is the smallest native allocation in bytes.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn new(device: Arc<dyn RawDevice>, min_block_size: u64) -> Self {
        let memory_properties = device.memory_properties();

        #[cfg(feature = "tracing")]
        debug_memory_types(&memory_properties);

        Self {
            heap: Mutex::new(HeapManager::new(memory_properties, min_block_size)),
            device,
        }
    }

    /// Allocates memory. Tries every block of the selected memory type before a new native block
    /// is allocated. Blocks of host visible memory types are persistently mapped.
    ///
    /// Every error returned is fatal, see [`DeviceError::is_fatal`](crate::DeviceError::is_fatal).
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn allocate_memory(&self, descriptor: &AllocationDescriptor) -> Result<Allocation> {
        self.heap.lock().allocate(self.device.as_ref(), descriptor)
    }

    /// Frees the allocation. Releases its native block once it is empty.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn free_memory(&self, allocation: Allocation) -> Result<()> {
        self.heap.lock().free(self.device.as_ref(), allocation)
    }

    /// The native device calls go through.
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Number of live native memory blocks.
    pub fn native_allocation_count(&self) -> u32 {
        self.heap.lock().native_allocation_count()
    }

    /// Bytes of native blocks allocated on device local memory types.
    pub fn device_local_usage(&self) -> u64 {
        self.heap.lock().device_local_usage()
    }

    /// Bytes lost to alignment padding inside live sub-allocations.
    pub fn padding_bytes(&self) -> u64 {
        self.heap.lock().padding_bytes()
    }

    /// The free `(offset, size)` ranges of every block of a memory type.
    pub fn free_ranges(&self, memory_type_index: u32) -> Vec<Vec<(u64, u64)>> {
        self.heap.lock().block_free_ranges(memory_type_index)
    }

    /// Tags of all allocations that haven't been freed yet.
    pub fn live_allocation_tags(&self) -> Vec<String> {
        self.heap.lock().leaked_tags()
    }

    /// A snapshot of the memory usage that prints as a human readable report.
    pub fn report(&self) -> MemoryReport {
        let heap = self.heap.lock();
        MemoryReport {
            block_bytes: heap.block_bytes(),
            unused_bytes: heap.unused_bytes(),
            heap_capacity: heap.heap_capacity(),
        }
    }
}

impl AllocatorStatistic for MemoryAllocator {
    fn allocation_count(&self) -> usize {
        self.heap.lock().allocation_count()
    }

    fn unused_range_count(&self) -> usize {
        self.heap.lock().unused_range_count()
    }

    fn used_bytes(&self) -> u64 {
        self.heap.lock().used_bytes()
    }

    fn unused_bytes(&self) -> u64 {
        self.heap.lock().unused_bytes()
    }

    fn block_count(&self) -> usize {
        self.heap.lock().block_count()
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        let leaked = self.heap.get_mut().free_all(self.device.as_ref());

        #[cfg(feature = "tracing")]
        for tag in &leaked {
            warn!("Device memory leak detected. Tag: {}", tag);
        }

        if !std::thread::panicking() {
            debug_assert!(
                leaked.is_empty(),
                "{} device memory allocations leaked: {:?}",
                leaked.len(),
                leaked
            );
        }
    }
}

/// Memory usage of a [`MemoryAllocator`] at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    /// Bytes of all native blocks.
    pub block_bytes: vk::DeviceSize,
    /// Free bytes inside the native blocks.
    pub unused_bytes: vk::DeviceSize,
    /// Size of all memory heaps together.
    pub heap_capacity: vk::DeviceSize,
}

impl MemoryReport {
    /// Share of all heaps taken by native blocks in percent.
    pub fn percent_of_capacity(&self) -> f64 {
        if self.heap_capacity == 0 {
            return 0.0;
        }
        100.0 * self.block_bytes as f64 / self.heap_capacity as f64
    }

    /// Share of the native blocks that is not sub-allocated in percent.
    pub fn percent_wasted(&self) -> f64 {
        if self.block_bytes == 0 {
            return 0.0;
        }
        100.0 * self.unused_bytes as f64 / self.block_bytes as f64
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let used = self.block_bytes;
        if used == 0 {
            return write!(f, "Using 0 B");
        }

        let (total, wasted) = (self.percent_of_capacity(), self.percent_wasted());
        if used < 1024 {
            write!(f, "Using {} B ({:.1}%) - {:.1}% wasted", used, total, wasted)
        } else if used < 1024 * 1024 {
            write!(
                f,
                "Using {:.3} KiB ({:.1}%) - {:.1}% wasted",
                used as f64 / 1024.0,
                total,
                wasted
            )
        } else {
            write!(
                f,
                "Using {:.3} MiB ({:.1}%) - {:.1}% wasted",
                used as f64 / (1024.0 * 1024.0),
                total,
                wasted
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_formats_units() {
        let report = MemoryReport {
            block_bytes: 4 * 1024 * 1024,
            unused_bytes: 3 * 1024 * 1024,
            heap_capacity: 256 * 1024 * 1024,
        };
        assert_eq!(report.to_string(), "Using 4.000 MiB (1.6%) - 75.0% wasted");

        let report = MemoryReport {
            block_bytes: 2048,
            unused_bytes: 0,
            heap_capacity: 1024 * 1024,
        };
        assert_eq!(report.to_string(), "Using 2.000 KiB (0.2%) - 0.0% wasted");
    }

    #[test]
    fn empty_report() {
        let report = MemoryReport {
            block_bytes: 0,
            unused_bytes: 0,
            heap_capacity: 1024,
        };
        assert_eq!(report.to_string(), "Using 0 B");
        assert_eq!(report.percent_wasted(), 0.0);
    }
}
