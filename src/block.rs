//! Implements the best fit region allocator of a single memory block.

use std::ffi::c_void;
use std::ptr::NonNull;

use ash::vk;
use slotmap::{new_key_type, SlotMap};

use crate::{align_up, DeviceError, RawDevice, Result, BLOCK_GRANULARITY};

new_key_type! {
    pub(crate) struct ChunkKey;
}

/// A free byte range inside a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreeRange {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl FreeRange {
    #[inline]
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A sub-allocation issued by a block.
///
/// `range_offset..range_offset + range_size` is the span taken out of the free list,
/// including the alignment padding in front of `offset`.
#[derive(Clone, Debug)]
struct SubAllocation {
    range_offset: u64,
    range_size: u64,
    offset: u64,
    tag: String,
}

/// Where a successful sub-allocation landed.
#[derive(Debug)]
pub(crate) struct Placement {
    pub(crate) chunk_key: ChunkKey,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) mapped_ptr: Option<NonNull<c_void>>,
}

struct BestFitCandidate {
    free_list_index: usize,
    range_size: u64,
    offset: u64,
    end: u64,
}

/// A single native memory object carved into sub-allocations.
///
/// Free ranges are kept sorted by offset, never overlap and are never adjacent.
pub(crate) struct MemoryBlock {
    pub(crate) device_memory: vk::DeviceMemory,
    pub(crate) size: u64,
    mapped_ptr: Option<NonNull<c_void>>,
    free_ranges: Vec<FreeRange>,
    sub_allocations: SlotMap<ChunkKey, SubAllocation>,
}

// The mapped pointer is only handed out, never dereferenced by the block.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub(crate) fn new(
        device_memory: vk::DeviceMemory,
        size: u64,
        mapped_ptr: Option<NonNull<c_void>>,
    ) -> Self {
        Self {
            device_memory,
            size,
            mapped_ptr,
            free_ranges: vec![FreeRange { offset: 0, size }],
            sub_allocations: SlotMap::with_key(),
        }
    }

    /// Carves `size` bytes aligned to `alignment` out of the smallest fitting free range.
    ///
    /// The end of the allocation is rounded up to [`BLOCK_GRANULARITY`]. Returns `None` if
    /// no free range can hold the request.
    pub(crate) fn sub_allocate(&mut self, size: u64, alignment: u64, tag: &str) -> Option<Placement> {
        let mut best_fit_candidate: Option<BestFitCandidate> = None;

        for (index, range) in self.free_ranges.iter().enumerate() {
            let offset = align_up(range.offset, alignment);
            let end = align_up(offset + size, BLOCK_GRANULARITY);
            if end > range.end() {
                continue;
            }

            let is_better = match &best_fit_candidate {
                Some(best_fit) => range.size < best_fit.range_size,
                None => true,
            };
            if is_better {
                best_fit_candidate = Some(BestFitCandidate {
                    free_list_index: index,
                    range_size: range.size,
                    offset,
                    end,
                });
            }
        }

        let candidate = best_fit_candidate?;

        let range = &mut self.free_ranges[candidate.free_list_index];
        let range_offset = range.offset;
        let range_size = candidate.end - range_offset;
        if range.size > range_size {
            range.offset += range_size;
            range.size -= range_size;
        } else {
            self.free_ranges.remove(candidate.free_list_index);
        }

        let chunk_key = self.sub_allocations.insert(SubAllocation {
            range_offset,
            range_size,
            offset: candidate.offset,
            tag: tag.to_owned(),
        });

        let mapped_ptr = self
            .mapped_ptr
            .and_then(|ptr| NonNull::new(unsafe { ptr.as_ptr().add(candidate.offset as usize) }));

        Some(Placement {
            chunk_key,
            offset: candidate.offset,
            size: candidate.end - candidate.offset,
            mapped_ptr,
        })
    }

    /// Returns the range of a sub-allocation to the free list, merging it with its neighbours.
    pub(crate) fn deallocate(&mut self, chunk_key: ChunkKey, offset: u64) -> Result<()> {
        match self.sub_allocations.get(chunk_key) {
            Some(sub_allocation) if sub_allocation.offset == offset => {}
            _ => {
                return Err(DeviceError::Internal(format!(
                    "no live sub-allocation at offset {} of the memory block",
                    offset
                )));
            }
        }
        let sub_allocation = self
            .sub_allocations
            .remove(chunk_key)
            .ok_or_else(|| DeviceError::Internal("chunk key vanished from the block".to_owned()))?;

        let start = sub_allocation.range_offset;
        let end = start + sub_allocation.range_size;

        let mut predecessor = None;
        let mut successor = None;
        for (index, range) in self.free_ranges.iter().enumerate() {
            if range.offset < end && start < range.end() {
                return Err(DeviceError::Internal(format!(
                    "freed range {}..{} overlaps free range {}..{}",
                    start,
                    end,
                    range.offset,
                    range.end()
                )));
            }
            if range.offset == end {
                successor = Some(index);
            }
            if range.end() == start {
                predecessor = Some(index);
            }
        }

        match (predecessor, successor) {
            (Some(predecessor), Some(successor)) if predecessor == successor => {
                Err(DeviceError::Internal(format!(
                    "free range {} is both predecessor and successor of {}..{}",
                    predecessor, start, end
                )))
            }
            (None, None) => {
                let index = self.free_ranges.partition_point(|range| range.offset < start);
                self.free_ranges.insert(
                    index,
                    FreeRange {
                        offset: start,
                        size: end - start,
                    },
                );
                Ok(())
            }
            (None, Some(successor)) => {
                let range = &mut self.free_ranges[successor];
                range.offset = start;
                range.size += end - start;
                Ok(())
            }
            (Some(predecessor), None) => {
                self.free_ranges[predecessor].size += end - start;
                Ok(())
            }
            (Some(predecessor), Some(successor)) => {
                let successor_size = self.free_ranges[successor].size;
                self.free_ranges[predecessor].size += (end - start) + successor_size;
                self.free_ranges.remove(successor);
                Ok(())
            }
        }
    }

    /// True once the free list spans the whole block again.
    pub(crate) fn is_empty(&self) -> bool {
        self.free_ranges.len() == 1 && self.free_ranges[0].size == self.size
    }

    pub(crate) fn free_ranges(&self) -> &[FreeRange] {
        &self.free_ranges
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.free_ranges.iter().map(|range| range.size).sum()
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.sub_allocations.len()
    }

    /// Bytes reserved for live sub-allocations, including alignment padding.
    pub(crate) fn used_bytes(&self) -> u64 {
        self.sub_allocations
            .values()
            .map(|sub_allocation| sub_allocation.range_size)
            .sum()
    }

    /// Alignment padding in front of live sub-allocations.
    pub(crate) fn padding_bytes(&self) -> u64 {
        self.sub_allocations
            .values()
            .map(|sub_allocation| sub_allocation.offset - sub_allocation.range_offset)
            .sum()
    }

    /// Tags of all live sub-allocations.
    pub(crate) fn tags(&self) -> impl Iterator<Item = &str> {
        self.sub_allocations
            .values()
            .map(|sub_allocation| sub_allocation.tag.as_str())
    }

    pub(crate) fn destroy(&mut self, device: &dyn RawDevice) {
        device.free_memory(self.device_memory);
        self.mapped_ptr = None;
    }
}
