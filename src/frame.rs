//! The ring of frame contexts that recycles temporary resources.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::trace;

use crate::command::{Fence, Semaphore};
use crate::resource::DescriptorPool;
use crate::{Buffer, DescriptorSet, MemoryAllocator, RawDevice, Result};

/// A pooled resource with the number of resets it survives unused.
struct Pooled<T> {
    resource: Arc<T>,
    frames_left: u32,
}

impl<T> Pooled<T> {
    fn new(resource: Arc<T>, lifetime: u32) -> Self {
        Self {
            resource,
            frames_left: lifetime,
        }
    }

    /// Counts down one reset. Returns false once the countdown reaches zero.
    fn age(&mut self) -> bool {
        self.frames_left = self.frames_left.saturating_sub(1);
        self.frames_left > 0
    }
}

#[derive(Default)]
struct FrameSync {
    fences: Vec<Arc<Fence>>,
    semaphores: Vec<Arc<Semaphore>>,
}

#[derive(Default)]
struct TempBufferPool {
    available: Vec<Pooled<Buffer>>,
    in_use: Vec<Arc<Buffer>>,
}

#[derive(Default)]
struct TempDescriptorSetPool {
    available: HashMap<vk::DescriptorSetLayout, VecDeque<Pooled<DescriptorSet>>>,
    in_use: Vec<Arc<DescriptorSet>>,
}

/// The state of one frame in flight.
///
/// Temporary resources handed out stay in the in-use lists until the next [`reset`](Self::reset)
/// of this context, so no other request of the same frame can get them.
#[derive(Default)]
pub(crate) struct FrameContext {
    sync: Mutex<FrameSync>,
    buffers: Mutex<TempBufferPool>,
    descriptor_sets: Mutex<TempDescriptorSetPool>,
}

impl FrameContext {
    /// Registers the fence and semaphore of a submission the next reset has to wait for.
    pub(crate) fn register(&self, fence: Arc<Fence>, semaphore: Option<Arc<Semaphore>>) {
        let mut sync = self.sync.lock();
        sync.fences.push(fence);
        sync.semaphores.extend(semaphore);
    }

    /// The semaphores of the submissions registered since the last reset.
    pub(crate) fn semaphores(&self) -> Vec<vk::Semaphore> {
        self.sync
            .lock()
            .semaphores
            .iter()
            .map(|semaphore| semaphore.handle())
            .collect()
    }

    /// Waits for the registered submissions, then recycles the resources of the last use.
    ///
    /// Pooled resources that went unused for `lifetime` resets are destroyed.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn reset(&self, device: &dyn RawDevice, lifetime: u32) -> Result<()> {
        let (fences, semaphores) = {
            let mut sync = self.sync.lock();
            (
                mem::take(&mut sync.fences),
                mem::take(&mut sync.semaphores),
            )
        };

        if !fences.is_empty() {
            #[cfg(feature = "profiling")]
            profiling::scope!("wait for frame fences");
            let handles: Vec<vk::Fence> = fences.iter().map(|fence| fence.handle()).collect();
            if let Err(result) = device.wait_for_fences(&handles) {
                let mut sync = self.sync.lock();
                sync.fences.extend(fences);
                sync.semaphores.extend(semaphores);
                return Err(result.into());
            }
        }
        drop(semaphores);

        {
            let mut buffers = self.buffers.lock();
            let pool = &mut *buffers;
            let before = pool.available.len();
            pool.available.retain_mut(Pooled::age);
            let _evicted = before - pool.available.len();

            #[cfg(feature = "tracing")]
            if _evicted > 0 {
                trace!("Evicted {} temporary buffers", _evicted);
            }

            pool.available.extend(
                pool.in_use
                    .drain(..)
                    .map(|buffer| Pooled::new(buffer, lifetime)),
            );
        }

        {
            let mut descriptor_sets = self.descriptor_sets.lock();
            let pool = &mut *descriptor_sets;
            for sets in pool.available.values_mut() {
                sets.retain_mut(Pooled::age);
            }
            pool.available.retain(|_, sets| !sets.is_empty());

            for set in pool.in_use.drain(..) {
                pool.available
                    .entry(set.layout())
                    .or_default()
                    .push_back(Pooled::new(set, lifetime));
            }
        }

        Ok(())
    }

    /// Returns a buffer that is not used by any other request of this frame.
    ///
    /// Prefers the smallest pooled buffer whose usage and memory properties contain the
    /// requested ones, an exact size match is taken right away. Creates a new buffer otherwise.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn temp_buffer(
        &self,
        memory: &Arc<MemoryAllocator>,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Arc<Buffer>> {
        let mut buffers = self.buffers.lock();

        let mut best: Option<(usize, u64)> = None;
        for (index, pooled) in buffers.available.iter().enumerate() {
            if !pooled.resource.satisfies(size, usage, properties) {
                continue;
            }
            let candidate_size = pooled.resource.size();
            if candidate_size == size {
                best = Some((index, candidate_size));
                break;
            }
            if best.map_or(true, |(_, best_size)| candidate_size < best_size) {
                best = Some((index, candidate_size));
            }
        }

        let buffer = match best {
            Some((index, _)) => buffers.available.swap_remove(index).resource,
            None => Arc::new(Buffer::new(memory, name, size, usage, properties)?),
        };
        buffers.in_use.push(buffer.clone());

        Ok(buffer)
    }

    /// Returns a descriptor set of `layout` that is not used by any other request of this frame.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn temp_descriptor_set(
        &self,
        pool: &Arc<DescriptorPool>,
        name: &str,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Arc<DescriptorSet>> {
        let mut descriptor_sets = self.descriptor_sets.lock();

        let pooled = descriptor_sets
            .available
            .get_mut(&layout)
            .and_then(VecDeque::pop_front);
        let set = match pooled {
            Some(pooled) => pooled.resource,
            None => Arc::new(DescriptorSet::new(pool, name, layout)?),
        };
        descriptor_sets.in_use.push(set.clone());

        Ok(set)
    }

    /// Drops every pooled and in-use resource and the registered primitives.
    pub(crate) fn clear(&self) {
        *self.sync.lock() = FrameSync::default();
        *self.buffers.lock() = TempBufferPool::default();
        *self.descriptor_sets.lock() = TempDescriptorSetPool::default();
    }
}

/// A fixed number of frame contexts used round robin.
///
/// The next context is reset before it becomes current, so requests of other threads never
/// reach a context that is still being recycled.
pub(crate) struct FrameRing {
    contexts: Vec<FrameContext>,
    index: AtomicUsize,
    // Serializes advancing and flushing.
    resetting: Mutex<()>,
    lifetime: u32,
}

impl FrameRing {
    pub(crate) fn new(frames_in_flight: usize, lifetime: u32) -> Self {
        Self {
            contexts: (0..frames_in_flight.max(1))
                .map(|_| FrameContext::default())
                .collect(),
            index: AtomicUsize::new(0),
            resetting: Mutex::new(()),
            lifetime,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn current(&self) -> &FrameContext {
        &self.contexts[self.index()]
    }

    /// Resets the next context, then makes it current. Returns the new index.
    ///
    /// The current index stays unchanged if the reset fails.
    pub(crate) fn advance(&self, device: &dyn RawDevice) -> Result<usize> {
        let _resetting = self.resetting.lock();

        let index = (self.index() + 1) % self.contexts.len();
        self.contexts[index].reset(device, self.lifetime)?;
        self.index.store(index, Ordering::Release);

        Ok(index)
    }

    /// Resets every context.
    pub(crate) fn reset_all(&self, device: &dyn RawDevice) -> Result<()> {
        let _resetting = self.resetting.lock();
        for context in &self.contexts {
            context.reset(device, self.lifetime)?;
        }
        Ok(())
    }

    pub(crate) fn clear(&self) {
        for context in &self.contexts {
            context.clear();
        }
    }
}
