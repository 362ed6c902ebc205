//! HLX Compute
//!
//! Resource and execution management for GPU compute kernels on Vulkan.
//!
//! # Architecture
//!
//! This crate provides a thin Rust layer over Vulkan (via ash) that:
//! 1. Initializes a Vulkan instance, device and compute queue
//! 2. Compiles GLSL compute kernels to SPIR-V with content-addressed caching
//! 3. Manages storage buffers and images bound to numbered slots
//! 4. Records dispatches and barriers, and reads results back blocking or
//!    through fenced asynchronous reads
//!
//! Kernels address buffer slot `N` as `layout(set = 0, binding = N)` and
//! image slot `N` as `layout(set = 1, binding = N)`. Uniforms are the
//! members of a single `layout(push_constant)` block.
//!
//! # Example
//!
//! ```rust,no_run
//! use hlx_compute::{BufferUsage, ComputeContext};
//!
//! # fn main() -> hlx_compute::Result<()> {
//! let mut ctx = ComputeContext::init(1, 2)?;
//! let program = ctx.compile(r#"
//!     #version 450
//!     layout(local_size_x = 64) in;
//!     layout(set = 0, binding = 0) buffer Data { uint data[]; };
//!     void main() { data[gl_GlobalInvocationID.x] = gl_GlobalInvocationID.x; }
//! "#)?;
//! ctx.set_program(program)?;
//!
//! let buffer = ctx.create_buffer(256 * 4, None, BufferUsage::Dynamic)?;
//! ctx.bind_buffer(&buffer, 0)?;
//! ctx.dispatch_1d(4)?;
//!
//! let values: Vec<u32> = ctx.read_buffer_as(&buffer, 256)?;
//! assert_eq!(values[255], 255);
//! # Ok(())
//! # }
//! ```

mod buffer;
mod command;
mod config;
mod context;
mod device;
mod diagnostics;
mod dispatch;
mod error;
mod image;
mod program;
pub mod reflect;
pub mod shader;

pub use buffer::{Buffer, BufferMapping, BufferUsage, MapAccess};
pub use command::{barrier_masks, BarrierFlags, BarrierMasks};
pub use config::{ContextConfig, COMPILER_ENV, DEBUG_ENV};
pub use context::{ComputeContext, ComputeLimits};
pub use device::version_at_least;
pub use diagnostics::{Diagnostics, TRACE_TARGET};
pub use dispatch::{elapsed_ms, PendingRead};
pub use error::{ComputeError, Result};
pub use image::{Image, ImageDim, ImageFormat};
pub use program::{Program, BUFFER_SET, IMAGE_SET};
pub use shader::{inject_defines, GlslTool};
