//! Crate errors.

use ash::vk;
#[cfg(feature = "tracing")]
use tracing::error;

/// Errors that the device core can throw.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceError {
    /// No memory type matches both the type bits and the requested property flags.
    NoSuitableMemoryType {
        /// Memory type bits of the requirements.
        memory_type_bits: u32,
        /// Requested memory property flags.
        properties: vk::MemoryPropertyFlags,
    },
    /// The host ran out of memory while allocating device memory.
    OutOfHostMemory,
    /// The device ran out of memory.
    OutOfDeviceMemory {
        /// Size of the failed native allocation.
        requested: u64,
        /// Device local memory in use before the failed allocation.
        usage: u64,
        /// Total size of all device local heaps.
        capacity: u64,
    },
    /// The platform limit of native memory objects was reached.
    TooManyObjects {
        /// Number of live native allocations.
        allocation_count: u32,
    },
    /// An external memory handle was invalid.
    InvalidExternalHandle,
    /// Failed to map the memory.
    FailedToMap,
    /// Size is zero or alignment is not a power of 2.
    InvalidAlignment,
    /// Can't find the memory block of an allocation.
    UnknownMemoryBlock,
    /// Reading or writing the pipeline cache file failed.
    PipelineCache(String),
    /// Any other failed Vulkan call.
    Vulkan(vk::Result),
    /// An allocator consistency violation.
    Internal(String),
}

impl DeviceError {
    /// Maps a failed `vkAllocateMemory` result to its error kind.
    pub(crate) fn from_allocation_result(
        result: vk::Result,
        requested: u64,
        usage: u64,
        capacity: u64,
        allocation_count: u32,
    ) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => DeviceError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfDeviceMemory {
                requested,
                usage,
                capacity,
            },
            vk::Result::ERROR_TOO_MANY_OBJECTS => DeviceError::TooManyObjects { allocation_count },
            vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => DeviceError::InvalidExternalHandle,
            other => DeviceError::Vulkan(other),
        }
    }

    /// Returns true if the process can't continue after this error.
    ///
    /// | Kind                                   | Fatal |
    /// |----------------------------------------|-------|
    /// | memory allocation failures (all kinds) | yes   |
    /// | no suitable memory type                | yes   |
    /// | mapping / alignment / unknown block    | yes   |
    /// | internal consistency violation         | yes   |
    /// | pipeline cache IO                      | no    |
    /// | `Vulkan(TIMEOUT \| NOT_READY)`          | no    |
    /// | any other `Vulkan` result              | yes   |
    pub fn is_fatal(&self) -> bool {
        match self {
            DeviceError::NoSuitableMemoryType { .. }
            | DeviceError::OutOfHostMemory
            | DeviceError::OutOfDeviceMemory { .. }
            | DeviceError::TooManyObjects { .. }
            | DeviceError::InvalidExternalHandle
            | DeviceError::FailedToMap
            | DeviceError::InvalidAlignment
            | DeviceError::UnknownMemoryBlock
            | DeviceError::Internal(_) => true,
            DeviceError::PipelineCache(_) => false,
            DeviceError::Vulkan(result) => {
                !matches!(*result, vk::Result::TIMEOUT | vk::Result::NOT_READY)
            }
        }
    }
}

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        DeviceError::Vulkan(result)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceError::NoSuitableMemoryType {
                memory_type_bits,
                properties,
            } => {
                write!(
                    f,
                    "no suitable memory type for type bits {:#b} and properties {:?}",
                    memory_type_bits, properties
                )
            }
            DeviceError::OutOfHostMemory => {
                write!(f, "vkAllocateMemory failed: out of host memory")
            }
            DeviceError::OutOfDeviceMemory {
                requested,
                usage,
                capacity,
            } => {
                write!(
                    f,
                    "vkAllocateMemory failed: out of device memory ({:.3} / {:.3} MiB)",
                    (usage + requested) as f64 / (1024.0 * 1024.0),
                    *capacity as f64 / (1024.0 * 1024.0)
                )
            }
            DeviceError::TooManyObjects { allocation_count } => {
                write!(
                    f,
                    "vkAllocateMemory failed: too many objects ({} live allocations)",
                    allocation_count
                )
            }
            DeviceError::InvalidExternalHandle => {
                write!(f, "vkAllocateMemory failed: invalid external handle")
            }
            DeviceError::FailedToMap => {
                write!(f, "failed to map memory")
            }
            DeviceError::InvalidAlignment => {
                write!(f, "size is zero or alignment is not a power of 2")
            }
            DeviceError::UnknownMemoryBlock => {
                write!(f, "can't find the memory block")
            }
            DeviceError::PipelineCache(message) => {
                write!(f, "pipeline cache: {}", message)
            }
            DeviceError::Vulkan(result) => {
                write!(f, "vulkan call failed: {}", result)
            }
            DeviceError::Internal(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// Terminates the current operation with the diagnostic of a fatal error.
#[cold]
#[track_caller]
pub fn fatal(error: DeviceError) -> ! {
    #[cfg(feature = "tracing")]
    error!("fatal device error: {}", error);

    panic!("fatal device error: {}", error)
}

/// Routes fatal errors to [`fatal`] and hands recoverable ones back to the caller.
pub trait OrFatal<T> {
    /// Aborts on fatal errors, otherwise returns the result unchanged.
    fn or_fatal(self) -> Result<T, DeviceError>;
}

impl<T> OrFatal<T> for Result<T, DeviceError> {
    #[track_caller]
    fn or_fatal(self) -> Result<T, DeviceError> {
        match self {
            Err(error) if error.is_fatal() => fatal(error),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_results_map_to_kinds() {
        let error = |result| DeviceError::from_allocation_result(result, 64, 128, 1024, 7);

        assert_eq!(
            error(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            DeviceError::OutOfHostMemory
        );
        assert_eq!(
            error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            DeviceError::OutOfDeviceMemory {
                requested: 64,
                usage: 128,
                capacity: 1024,
            }
        );
        assert_eq!(
            error(vk::Result::ERROR_TOO_MANY_OBJECTS),
            DeviceError::TooManyObjects {
                allocation_count: 7
            }
        );
        assert_eq!(
            error(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE),
            DeviceError::InvalidExternalHandle
        );
        assert_eq!(
            error(vk::Result::ERROR_UNKNOWN),
            DeviceError::Vulkan(vk::Result::ERROR_UNKNOWN)
        );
    }

    #[test]
    fn only_timeouts_and_cache_io_are_recoverable() {
        assert!(DeviceError::OutOfHostMemory.is_fatal());
        assert!(DeviceError::Internal("broken free list".to_owned()).is_fatal());
        assert!(DeviceError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_fatal());

        assert!(!DeviceError::Vulkan(vk::Result::TIMEOUT).is_fatal());
        assert!(!DeviceError::Vulkan(vk::Result::NOT_READY).is_fatal());
        assert!(!DeviceError::PipelineCache("read only".to_owned()).is_fatal());
    }
}
