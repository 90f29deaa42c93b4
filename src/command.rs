//! Command buffers from per-thread command pools and their synchronization primitives.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use ash::vk::{self, Handle};
use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::{debug, trace};

use crate::frame::FrameContext;
use crate::{RawDevice, Result};

/// A fence. Destroyed on drop.
pub struct Fence {
    device: Arc<dyn RawDevice>,
    fence: vk::Fence,
}

impl Fence {
    pub(crate) fn new(device: &Arc<dyn RawDevice>) -> Result<Self> {
        let fence = device.create_fence()?;
        Ok(Self {
            device: device.clone(),
            fence,
        })
    }

    /// The Vulkan fence.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Returns true once the work the fence was submitted with completed.
    pub fn is_signaled(&self) -> Result<bool> {
        Ok(self.device.fence_status(self.fence)?)
    }

    /// Blocks until the fence is signaled.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn wait(&self) -> Result<()> {
        Ok(self.device.wait_for_fences(&[self.fence])?)
    }

    pub(crate) fn reset(&self) -> Result<()> {
        Ok(self.device.reset_fences(&[self.fence])?)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.fence).finish()
    }
}

/// A binary semaphore. Destroyed on drop.
pub struct Semaphore {
    device: Arc<dyn RawDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    pub(crate) fn new(device: &Arc<dyn RawDevice>, name: &str) -> Result<Self> {
        let semaphore = device.create_semaphore()?;
        device.set_object_name(vk::ObjectType::SEMAPHORE, semaphore.as_raw(), name);
        Ok(Self {
            device: device.clone(),
            semaphore,
        })
    }

    /// The Vulkan semaphore.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

/// A primary command buffer in the recording state.
///
/// Allocated from the command pool of the thread that requested it. Freed once the last
/// reference is dropped and the pool no longer keeps it for reuse.
pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    command_buffer: vk::CommandBuffer,
    thread: ThreadId,
    name: Mutex<String>,
    fence: Arc<Fence>,
    semaphore: Mutex<Option<Arc<Semaphore>>>,
}

impl CommandBuffer {
    /// The Vulkan command buffer.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// The name of the current use.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// The fence signaled once the last submission of this buffer completed.
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// The completion semaphore. Only exists once the buffer was attached to a frame context.
    pub fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.semaphore.lock().clone()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let pool = self.pool.raw.lock();
        self.pool
            .device
            .free_command_buffer(*pool, self.command_buffer);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("command_buffer", &self.command_buffer)
            .field("thread", &self.thread)
            .field("name", &*self.name.lock())
            .finish()
    }
}

/// A command pool with the buffers submitted from it, oldest first.
///
/// Lock order: `pending` before `raw`. Command buffers are never dropped while `raw` is held.
struct CommandPool {
    device: Arc<dyn RawDevice>,
    raw: Mutex<vk::CommandPool>,
    pending: Mutex<VecDeque<Arc<CommandBuffer>>>,
}

impl CommandPool {
    /// Takes the oldest submitted buffer if the GPU is done with it and nobody else holds it
    /// or its fence.
    fn take_reusable(
        pending: &mut VecDeque<Arc<CommandBuffer>>,
    ) -> Result<Option<Arc<CommandBuffer>>> {
        let reusable = match pending.front() {
            Some(front) => {
                Arc::strong_count(front) == 1
                    && Arc::strong_count(&front.fence) == 1
                    && front.fence.is_signaled()?
            }
            None => false,
        };

        Ok(if reusable { pending.pop_front() } else { None })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(*self.raw.get_mut());
    }
}

/// One command pool per thread. Created lazily on the first request of a thread.
pub(crate) struct CommandPools {
    device: Arc<dyn RawDevice>,
    queue_family_index: u32,
    pools: Mutex<HashMap<ThreadId, Arc<CommandPool>>>,
}

impl CommandPools {
    pub(crate) fn new(device: Arc<dyn RawDevice>) -> Self {
        Self {
            queue_family_index: device.graphics_queue_family_index(),
            device,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool_of(&self, thread: ThreadId) -> Result<Arc<CommandPool>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&thread) {
            return Ok(pool.clone());
        }

        let raw = self.device.create_command_pool(self.queue_family_index)?;
        self.device.set_object_name(
            vk::ObjectType::COMMAND_POOL,
            raw.as_raw(),
            &format!("{:?} command pool", thread),
        );

        #[cfg(feature = "tracing")]
        debug!("Created command pool for thread {:?}", thread);

        let pool = Arc::new(CommandPool {
            device: self.device.clone(),
            raw: Mutex::new(raw),
            pending: Mutex::new(VecDeque::new()),
        });
        pools.insert(thread, pool.clone());
        Ok(pool)
    }

    /// Returns a command buffer of the calling thread's pool in the recording state.
    pub(crate) fn command_buffer(&self, name: &str) -> Result<Arc<CommandBuffer>> {
        let thread = thread::current().id();
        let pool = self.pool_of(thread)?;
        let mut pending = pool.pending.lock();

        let command_buffer = match CommandPool::take_reusable(&mut pending)? {
            Some(command_buffer) => {
                // Returned to the queue if the reset fails, so it is not dropped under `raw`.
                let reset = {
                    let _raw = pool.raw.lock();
                    self.device
                        .reset_command_buffer(command_buffer.command_buffer)
                };
                if let Err(result) = reset {
                    pending.push_front(command_buffer);
                    return Err(result.into());
                }
                command_buffer.fence.reset()?;
                *command_buffer.name.lock() = name.to_owned();

                #[cfg(feature = "tracing")]
                trace!("Reusing command buffer for '{}'", name);

                command_buffer
            }
            None => {
                let fence = Arc::new(Fence::new(&self.device)?);
                let handle = {
                    let raw = pool.raw.lock();
                    self.device.allocate_command_buffer(*raw)?
                };
                Arc::new(CommandBuffer {
                    pool: pool.clone(),
                    command_buffer: handle,
                    thread,
                    name: Mutex::new(name.to_owned()),
                    fence,
                    semaphore: Mutex::new(None),
                })
            }
        };
        drop(pending);

        self.device.set_object_name(
            vk::ObjectType::COMMAND_BUFFER,
            command_buffer.command_buffer.as_raw(),
            name,
        );
        {
            let _raw = pool.raw.lock();
            self.device
                .begin_command_buffer(command_buffer.command_buffer)?;
        }

        Ok(command_buffer)
    }

    /// Ends recording and submits the buffer. Registers its fence and semaphore with `frame`
    /// if given.
    pub(crate) fn execute(
        &self,
        command_buffer: Arc<CommandBuffer>,
        frame: Option<&FrameContext>,
    ) -> Result<Arc<Fence>> {
        let pool = command_buffer.pool.clone();
        let mut pending = pool.pending.lock();

        {
            let _raw = pool.raw.lock();
            self.device
                .end_command_buffer(command_buffer.command_buffer)?;
        }

        let semaphore = match frame {
            Some(_) => {
                let mut semaphore = command_buffer.semaphore.lock();
                if semaphore.is_none() {
                    let name = format!("{} semaphore", command_buffer.name.lock());
                    *semaphore = Some(Arc::new(Semaphore::new(&self.device, &name)?));
                }
                semaphore.clone()
            }
            None => None,
        };

        self.device.queue_submit(
            command_buffer.command_buffer,
            semaphore.as_ref().map(|semaphore| semaphore.handle()),
            command_buffer.fence.handle(),
        )?;

        if let Some(frame) = frame {
            frame.register(command_buffer.fence.clone(), semaphore);
        }

        let fence = command_buffer.fence.clone();
        pending.push_back(command_buffer);

        Ok(fence)
    }

    /// Waits for every submitted buffer in submission order.
    ///
    /// Buffers nobody else holds are freed. The others are freed when their last reference
    /// is dropped.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn flush(&self) -> Result<()> {
        let pools: Vec<_> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            let mut pending = pool.pending.lock();
            while let Some(command_buffer) = pending.front() {
                command_buffer.fence.wait()?;
                pending.pop_front();
            }
        }
        Ok(())
    }

    /// Number of thread command pools.
    pub(crate) fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}

impl Drop for CommandPools {
    fn drop(&mut self) {
        // The native pool is destroyed once the last buffer allocated from it is gone.
        for (_, pool) in self.pools.get_mut().drain() {
            let pending = mem::take(&mut *pool.pending.lock());
            drop(pending);
        }
    }
}
