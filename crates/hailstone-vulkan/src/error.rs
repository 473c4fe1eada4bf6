//! Error types for the Vulkan backend.

use ash::vk;
use hailstone_core::IoKind;
use thiserror::Error;

/// Result type for Vulkan operations.
pub type Result<T> = std::result::Result<T, VulkanError>;

/// Errors that can occur while building or driving the device.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// The Vulkan loader could not be found or opened.
    #[error("Vulkan loader unavailable: {0}")]
    Loader(#[from] ash::LoadingError),

    /// A Vulkan call returned an error code.
    #[error("Vulkan call failed: {0}")]
    Vk(#[from] vk::Result),

    /// No physical device offers a compute queue.
    #[error("no Vulkan device with a compute queue")]
    NoDevice,

    /// Requested device index does not exist.
    #[error("Vulkan device {0} not found")]
    DeviceNotFound(usize),

    /// Device API version is too old.
    #[error("device supports Vulkan {major}.{minor}, 1.1 is required")]
    UnsupportedVersion { major: u32, minor: u32 },

    /// No memory type accepts the slot buffers.
    #[error("no {what} memory type in mask 0b{bits:b}")]
    NoMemoryType { what: &'static str, bits: u32 },

    /// Buffer requirements do not fit the planned layout.
    #[error("buffer needs {size} B aligned to {alignment}, plan reserves {reserved} B aligned to {planned}")]
    PlanMismatch {
        size: u64,
        alignment: u64,
        reserved: u64,
        planned: u64,
    },

    /// Mapping host-visible memory failed.
    #[error("memory mapping {kind}: {message}")]
    Mapping { kind: IoKind, message: String },

    /// Shader translation or loading failed.
    #[error("shader error: {0}")]
    Shader(String),

    /// Planning or another core failure.
    #[error(transparent)]
    Core(#[from] hailstone_core::Error),
}

impl VulkanError {
    /// Check if this error indicates the GPU is unusable.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            VulkanError::Loader(_)
                | VulkanError::NoDevice
                | VulkanError::DeviceNotFound(_)
                | VulkanError::UnsupportedVersion { .. }
                | VulkanError::Vk(vk::Result::ERROR_DEVICE_LOST)
                | VulkanError::Vk(vk::Result::ERROR_INITIALIZATION_FAILED)
        )
    }

    /// Check if this error is an allocation failure.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            VulkanError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
                | VulkanError::Vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
                | VulkanError::Mapping {
                    kind: IoKind::OutOfMemory,
                    ..
                }
        )
    }
}

impl From<VulkanError> for hailstone_core::Error {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::Core(inner) => inner,
            VulkanError::Shader(message) => hailstone_core::Error::Shader(message),
            VulkanError::Mapping { kind, message } => hailstone_core::Error::io(kind, message),
            VulkanError::Vk(result) if result == vk::Result::ERROR_MEMORY_MAP_FAILED => {
                hailstone_core::Error::io(IoKind::BadAddress, result.to_string())
            }
            other => hailstone_core::Error::device(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_device_error() {
        assert!(VulkanError::Vk(vk::Result::ERROR_DEVICE_LOST).is_device_error());
        assert!(!VulkanError::Shader("bad".into()).is_device_error());
    }

    #[test]
    fn test_conversion_keeps_core_errors() {
        let core = hailstone_core::Error::InsufficientSlots { available: 1 };
        let converted: hailstone_core::Error = VulkanError::Core(core).into();
        assert!(converted.is_planning());

        let oom: hailstone_core::Error = VulkanError::Mapping {
            kind: IoKind::OutOfMemory,
            message: "map".into(),
        }
        .into();
        assert_eq!(oom.io_kind(), Some(IoKind::OutOfMemory));
    }
}
