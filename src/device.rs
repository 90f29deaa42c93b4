//! The device context: memory, frame contexts, command pools and the pipeline cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
#[cfg(feature = "tracing")]
use tracing::{debug, error, warn};

use crate::command::CommandPools;
use crate::frame::FrameRing;
use crate::resource::DescriptorPool;
use crate::{
    Allocation, AllocationDescriptor, Buffer, CommandBuffer, DescriptorSet, DeviceError, Fence,
    MemoryAllocator, MemoryReport, RawDevice, Result,
};

/// Describes the configuration of a [`Device`].
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Number of frame contexts. Default: 3
    pub max_frames_in_flight: usize,
    /// The smallest native memory block. Needs to be a power of 2 in bytes. Default: 4 MiB.
    /// Calculate: x = log2(Size in bytes). 22 = log2(4194304)
    pub min_block_size: u8,
    /// Number of frame context resets an unused temporary resource is kept for. Default: 8
    pub temp_resource_lifetime: u32,
    /// Maximum number of descriptor sets alive at once. Default: 8192
    pub descriptor_pool_max_sets: u32,
    /// Descriptors per descriptor type, clamped to the device limits. Default: 4096
    pub descriptor_pool_max_per_type: u32,
    /// File the pipeline cache is loaded from and stored to. Default: ./pcache
    pub pipeline_cache_path: PathBuf,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 3,
            min_block_size: 22,
            temp_resource_lifetime: 8,
            descriptor_pool_max_sets: 8192,
            descriptor_pool_max_per_type: 4096,
            pipeline_cache_path: PathBuf::from("./pcache"),
        }
    }
}

/// The device context every subsystem of the renderer allocates and submits through.
///
/// `Device` is `Send + Sync`. Memory, temporary buffers, temporary descriptor sets, the
/// descriptor pool and the command pools are guarded by independent mutexes.
pub struct Device {
    frames: FrameRing,
    commands: CommandPools,
    descriptor_pool: Arc<DescriptorPool>,
    memory: Arc<MemoryAllocator>,
    pipeline_cache: vk::PipelineCache,
    pipeline_cache_path: PathBuf,
    raw: Arc<dyn RawDevice>,
}

impl Device {
    /// Creates the device context. Loads the pipeline cache file if it exists.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn new(raw: Arc<dyn RawDevice>, descriptor: &DeviceDescriptor) -> Result<Self> {
        let memory = Arc::new(MemoryAllocator::new(
            raw.clone(),
            1u64 << descriptor.min_block_size,
        ));

        let descriptor_pool = Arc::new(DescriptorPool::new(
            raw.clone(),
            descriptor.descriptor_pool_max_sets,
            descriptor.descriptor_pool_max_per_type,
        )?);
        raw.set_object_name(
            vk::ObjectType::DESCRIPTOR_POOL,
            vk::Handle::as_raw(descriptor_pool.handle()),
            "Device descriptor pool",
        );

        let pipeline_cache = create_pipeline_cache(raw.as_ref(), &descriptor.pipeline_cache_path)?;

        #[cfg(feature = "tracing")]
        debug!(
            "Created device with {} frames in flight",
            descriptor.max_frames_in_flight
        );

        Ok(Self {
            frames: FrameRing::new(
                descriptor.max_frames_in_flight,
                descriptor.temp_resource_lifetime,
            ),
            commands: CommandPools::new(raw.clone()),
            descriptor_pool,
            memory,
            pipeline_cache,
            pipeline_cache_path: descriptor.pipeline_cache_path.clone(),
            raw,
        })
    }

    /// Allocates device memory. See [`MemoryAllocator::allocate_memory`].
    pub fn allocate_memory(&self, descriptor: &AllocationDescriptor) -> Result<Allocation> {
        self.memory.allocate_memory(descriptor)
    }

    /// Frees device memory. See [`MemoryAllocator::free_memory`].
    pub fn free_memory(&self, allocation: Allocation) -> Result<()> {
        self.memory.free_memory(allocation)
    }

    /// Returns a buffer of the current frame context.
    ///
    /// The buffer may be handed out again after the next reset of the current frame context,
    /// so it must not be used by the GPU past that point.
    pub fn temp_buffer(
        &self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Arc<Buffer>> {
        self.frames
            .current()
            .temp_buffer(&self.memory, name, size, usage, properties)
    }

    /// Returns a descriptor set of the current frame context. Same lifetime as [`temp_buffer`](Self::temp_buffer).
    pub fn temp_descriptor_set(
        &self,
        name: &str,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Arc<DescriptorSet>> {
        self.frames
            .current()
            .temp_descriptor_set(&self.descriptor_pool, name, layout)
    }

    /// Returns a command buffer of the calling thread in the recording state.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn command_buffer(&self, name: &str) -> Result<Arc<CommandBuffer>> {
        self.commands.command_buffer(name)
    }

    /// Submits the command buffer to the graphics queue.
    ///
    /// With `attach_to_frame_context` the current frame context waits for the submission on its
    /// next reset, and the completion semaphore is listed in [`frame_semaphores`](Self::frame_semaphores).
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn execute(
        &self,
        command_buffer: Arc<CommandBuffer>,
        attach_to_frame_context: bool,
    ) -> Result<Arc<Fence>> {
        let frame = attach_to_frame_context.then(|| self.frames.current());
        self.commands.execute(command_buffer, frame)
    }

    /// Waits for every submitted command buffer, then resets every frame context.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn flush(&self) -> Result<()> {
        self.commands.flush()?;
        self.frames.reset_all(self.raw.as_ref())
    }

    /// Moves on to the next frame context and resets it. Blocks until the GPU finished the
    /// submissions of the context's previous use. Returns the new frame context index.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn advance_frame(&self) -> Result<usize> {
        self.frames.advance(self.raw.as_ref())
    }

    /// Index of the current frame context.
    pub fn frame_context_index(&self) -> usize {
        self.frames.index()
    }

    /// Semaphores of the submissions attached to the current frame context.
    pub fn frame_semaphores(&self) -> Vec<vk::Semaphore> {
        self.frames.current().semaphores()
    }

    /// The memory allocator.
    pub fn memory(&self) -> &Arc<MemoryAllocator> {
        &self.memory
    }

    /// A snapshot of the memory usage.
    pub fn memory_report(&self) -> MemoryReport {
        self.memory.report()
    }

    /// Number of live descriptor sets.
    pub fn descriptor_set_count(&self) -> u32 {
        self.descriptor_pool.set_count()
    }

    /// Number of per-thread command pools.
    pub fn command_pool_count(&self) -> usize {
        self.commands.pool_count()
    }

    /// The pipeline cache to create pipelines with.
    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// The native device.
    pub fn raw(&self) -> &Arc<dyn RawDevice> {
        &self.raw
    }

    /// Writes the pipeline cache data to the pipeline cache file.
    pub fn store_pipeline_cache(&self) -> Result<()> {
        let data = self.raw.pipeline_cache_data(self.pipeline_cache)?;
        std::fs::write(&self.pipeline_cache_path, &data).map_err(|err| {
            DeviceError::PipelineCache(format!(
                "can't write {}: {}",
                self.pipeline_cache_path.display(),
                err
            ))
        })?;

        #[cfg(feature = "tracing")]
        debug!(
            "Stored {} bytes of pipeline cache data to {}",
            data.len(),
            self.pipeline_cache_path.display()
        );

        Ok(())
    }
}

/// Creates the pipeline cache, seeded with the file contents if the file exists.
fn create_pipeline_cache(device: &dyn RawDevice, path: &Path) -> Result<vk::PipelineCache> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(_err) => {
            #[cfg(feature = "tracing")]
            warn!("Can't read pipeline cache {}: {}", path.display(), _err);
            Vec::new()
        }
    };

    if data.is_empty() {
        return Ok(device.create_pipeline_cache(&[])?);
    }

    match device.create_pipeline_cache(&data) {
        Ok(cache) => {
            #[cfg(feature = "tracing")]
            debug!(
                "Loaded {} bytes of pipeline cache data from {}",
                data.len(),
                path.display()
            );
            Ok(cache)
        }
        Err(_result) => {
            #[cfg(feature = "tracing")]
            warn!(
                "Discarding pipeline cache {}: {}",
                path.display(),
                _result
            );
            Ok(device.create_pipeline_cache(&[])?)
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(_err) = self.flush() {
            #[cfg(feature = "tracing")]
            error!("Failed to flush the device: {}", _err);
        }

        if let Err(_err) = self.store_pipeline_cache() {
            #[cfg(feature = "tracing")]
            warn!("{}", _err);
        }
        self.raw.destroy_pipeline_cache(self.pipeline_cache);

        self.frames.clear();
    }
}
