//! Error types for HLX compute operations
//!
//! Every fallible operation returns a [`ComputeError`]. The context also
//! records the rendered message in its diagnostics, so callers that only
//! keep the handle around can still ask what went wrong last.

use std::path::PathBuf;
use thiserror::Error;

/// Enumeration of all compute-layer errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// Null/empty inputs, non-positive sizes, out-of-range writes
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Kernel source failed to translate; carries the compiler log verbatim
    #[error("Shader compilation failed:\n{0}")]
    Compilation(String),

    /// SPIR-V could not be turned into a runnable pipeline
    #[error("Program link failed: {0}")]
    Link(String),

    /// Reading a shader from storage failed
    #[error("Failed to {action} shader file {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither glslc nor glslangValidator could be found
    #[error("No GLSL compiler found (tried {0})")]
    CompilerNotFound(String),

    /// Failed to initialize Vulkan (loader, instance, device, etc.)
    #[error("Vulkan initialization failed: {0}")]
    InitializationFailed(String),

    /// No GPU with a compute queue at the requested API version
    #[error("No suitable GPU found with compute queue support for Vulkan {0}.{1}")]
    NoSuitableDevice(u32, u32),

    /// Vulkan API returned an error
    #[error("Vulkan API error: {0:?}")]
    VulkanApi(ash::vk::Result),

    /// Allocation or mapping failed at the device level
    #[error("Device allocation failed: {0}")]
    OutOfMemory(String),

    /// Fence wait timed out or failed
    #[error("Synchronization failed: {0}")]
    Synchronization(String),

    /// Valid arguments, wrong call order (no program, timer not started, ...)
    #[error("Misuse: {0}")]
    Misuse(String),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Convert ash::vk::Result to ComputeError
impl From<ash::vk::Result> for ComputeError {
    fn from(result: ash::vk::Result) -> Self {
        match result {
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | ash::vk::Result::ERROR_MEMORY_MAP_FAILED => {
                ComputeError::OutOfMemory(format!("{:?}", result))
            }
            other => ComputeError::VulkanApi(other),
        }
    }
}
