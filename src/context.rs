//! Compute context: device ownership, programs and resources
//!
//! A [`ComputeContext`] is the single entry point of the crate. It owns the
//! Vulkan device and compute queue, the current [`Program`], the slot
//! tables that feed the next dispatch, the current uniform values and its
//! own [`Diagnostics`]. Dispatch, barriers, timing and readback live in
//! [`crate::dispatch`].
//!
//! Every public method that can fail stores the error message in the
//! context's diagnostics before returning it.

use ash::vk;
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{Buffer, BufferAlloc, BufferMapping, BufferUsage, MapAccess};
use crate::command::CommandRecorder;
use crate::config::ContextConfig;
use crate::device::{version_at_least, Gpu};
use crate::diagnostics::Diagnostics;
use crate::dispatch::TimestampQueries;
use crate::error::{ComputeError, Result};
use crate::image::{self, Image, ImageAlloc, ImageDim, ImageFormat};
use crate::program::{Program, ProgramObjects};
use crate::reflect::reflect;
use crate::shader::{inject_defines, ShaderCompiler};

/// Device limits relevant to dispatch sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeLimits {
    /// Maximum work groups per dispatch, per axis
    pub max_group_count: [u32; 3],
    /// Maximum `local_size` per axis
    pub max_group_size: [u32; 3],
    /// Maximum `local_size_x * local_size_y * local_size_z`
    pub max_invocations_per_group: u32,
}

impl From<&vk::PhysicalDeviceLimits> for ComputeLimits {
    fn from(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_group_count: limits.max_compute_work_group_count,
            max_group_size: limits.max_compute_work_group_size,
            max_invocations_per_group: limits.max_compute_work_group_invocations,
        }
    }
}

const BUFFER_USAGE_FLAGS: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// GPU compute context
///
/// Fields drop in declaration order: the recorder waits for the device to go
/// idle before any program, slot or the device itself is released.
pub struct ComputeContext {
    pub(crate) recorder: CommandRecorder,
    pub(crate) timer: Option<TimestampQueries>,
    pub(crate) program: Option<Program>,
    pub(crate) uniforms: Vec<u8>,
    pub(crate) buffer_slots: BTreeMap<u32, Arc<BufferAlloc>>,
    pub(crate) image_slots: BTreeMap<u32, Arc<ImageAlloc>>,
    pub(crate) auto_barrier: bool,
    pub(crate) async_timeout: Duration,
    pub(crate) diagnostics: Diagnostics,
    compiler: ShaderCompiler,
    pub(crate) gpu: Arc<Gpu>,
}

impl ComputeContext {
    /// Create a context on a device supporting at least Vulkan
    /// `major.minor`, configured from the environment.
    pub fn init(major: u32, minor: u32) -> Result<Self> {
        Self::init_with_config(major, minor, ContextConfig::from_env())
    }

    pub fn init_with_config(major: u32, minor: u32, config: ContextConfig) -> Result<Self> {
        Self::create(major, minor, config).map_err(|e| {
            log::error!("Failed to initialize compute context: {}", e);
            e
        })
    }

    fn create(major: u32, minor: u32, config: ContextConfig) -> Result<Self> {
        let gpu = Arc::new(Gpu::new(&config.app_name, major, minor)?);

        // Every dispatch takes one set for buffers and one for images
        let recorder = CommandRecorder::new(gpu.clone(), config.max_descriptor_sets.saturating_mul(2))?;

        let target_minor = if major > 1 { u32::MAX } else { minor };
        let compiler = ShaderCompiler::new(config.compiler.clone(), target_minor);

        let diagnostics = Diagnostics::new(config.debug);
        diagnostics.trace(format_args!(
            "Context ready on '{}' (requested Vulkan {}.{})",
            gpu.name(),
            major,
            minor
        ));

        log::info!("Compute context initialized on '{}'", gpu.name());

        Ok(Self {
            recorder,
            timer: None,
            program: None,
            uniforms: Vec::new(),
            buffer_slots: BTreeMap::new(),
            image_slots: BTreeMap::new(),
            auto_barrier: config.auto_barrier,
            async_timeout: config.async_timeout,
            diagnostics,
            compiler,
            gpu,
        })
    }

    /// Wait for the device, then release the program, slots and device.
    pub fn destroy(self) {}

    /// Record a failure into the diagnostics on its way out.
    pub(crate) fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.diagnostics.record(e))
    }

    /// Handles created by another context refer to another device.
    pub(crate) fn check_owner(&self, owner: &Arc<Gpu>, what: &str) -> Result<()> {
        if Arc::ptr_eq(owner, &self.gpu) {
            Ok(())
        } else {
            Err(ComputeError::InvalidArgument(format!(
                "{} was created by a different context",
                what
            )))
        }
    }

    // ------------------------------------------------------------------
    // Capabilities and diagnostics
    // ------------------------------------------------------------------

    pub fn limits(&self) -> ComputeLimits {
        ComputeLimits::from(self.gpu.limits())
    }

    /// True iff the device's Vulkan version is at least `major.minor`
    pub fn check_version(&self, major: u32, minor: u32) -> bool {
        version_at_least(self.gpu.api_version(), (major, minor))
    }

    pub fn device_name(&self) -> String {
        self.gpu.name()
    }

    /// Device API version as (major, minor)
    pub fn api_version(&self) -> (u32, u32) {
        self.gpu.api_version()
    }

    /// Message of the most recent failed call on this context
    pub fn last_error(&self) -> Option<&str> {
        self.diagnostics.last_error()
    }

    pub fn set_debug(&mut self, enable: bool) {
        self.diagnostics.set_debug(enable);
    }

    pub fn debug_enabled(&self) -> bool {
        self.diagnostics.debug_enabled()
    }

    // ------------------------------------------------------------------
    // Programs
    // ------------------------------------------------------------------

    /// Compile and link a compute kernel.
    pub fn compile(&mut self, source: &str) -> Result<Program> {
        let result = self.build_program(source);
        self.check(result)
    }

    /// Compile after inserting `#define <entry>` lines after `#version`.
    pub fn compile_with_defines<S: AsRef<str>>(&mut self, source: &str, defines: &[S]) -> Result<Program> {
        let source = inject_defines(source, defines);
        self.diagnostics
            .trace(format_args!("Injected {} defines", defines.len()));
        self.compile(&source)
    }

    /// Read a kernel from `path` and compile it.
    pub fn compile_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Program> {
        let result = read_source(path.as_ref()).and_then(|source| self.build_program(&source));
        self.check(result)
    }

    fn build_program(&mut self, source: &str) -> Result<Program> {
        self.diagnostics
            .trace(format_args!("Compiling program ({} bytes of source)", source.len()));

        let words = self.compiler.compile(source)?;
        let interface = reflect(&words)?;
        let objects = ProgramObjects::new(self.gpu.clone(), &words, interface)?;
        let program = Program::new(objects);

        self.diagnostics
            .trace(format_args!("Program compiled: {:?}", program));
        Ok(program)
    }

    /// Make `program` current for later dispatches, returning the previous
    /// one. Uniform values are reset to zero.
    pub fn set_program(&mut self, program: Program) -> Result<Option<Program>> {
        let result = self.check_owner(&program.inner.gpu, "Program");
        self.check(result)?;

        self.uniforms = vec![0; program.interface().push_constant_size as usize];
        self.recorder.reset_bound_pipeline();
        self.diagnostics
            .trace(format_args!("Program set: {}", program.entry_point()));
        Ok(self.program.replace(program))
    }

    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    /// Recompile `path` and make it current. On failure the current program
    /// is kept.
    pub fn reload<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let result = read_source(path).and_then(|source| self.build_program(&source));
        let program = self.check(result)?;

        if self.set_program(program)?.is_some() {
            log::info!("Reloaded program from {}", path.display());
        }
        Ok(())
    }

    /// Number of distinct sources whose SPIR-V is cached
    pub fn cached_programs(&self) -> usize {
        self.compiler.cached_count()
    }

    // ------------------------------------------------------------------
    // Uniforms (push-constant block members)
    // ------------------------------------------------------------------

    fn set_uniform_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let Some(program) = &self.program else {
            return Err(ComputeError::Misuse(format!(
                "Cannot set uniform '{}': no program set",
                name
            )));
        };

        let Some(member) = program.interface().push_member(name) else {
            self.diagnostics
                .trace(format_args!("Uniform '{}' not found, ignored", name));
            return Ok(());
        };

        if member.size as usize != bytes.len() {
            return Err(ComputeError::InvalidArgument(format!(
                "Uniform '{}' is {} bytes, value is {} bytes",
                name,
                member.size,
                bytes.len()
            )));
        }

        let start = member.offset as usize;
        let slot = self
            .uniforms
            .get_mut(start..start + bytes.len())
            .ok_or_else(|| {
                ComputeError::InvalidArgument(format!(
                    "Uniform '{}' lies outside the push-constant block",
                    name
                ))
            })?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    fn set_uniform<T: Pod>(&mut self, name: &str, value: &T) -> Result<()> {
        let result = self.set_uniform_bytes(name, bytemuck::bytes_of(value));
        self.check(result)
    }

    pub fn set_uniform_int(&mut self, name: &str, value: i32) -> Result<()> {
        self.set_uniform(name, &value)
    }

    pub fn set_uniform_uint(&mut self, name: &str, value: u32) -> Result<()> {
        self.set_uniform(name, &value)
    }

    pub fn set_uniform_float(&mut self, name: &str, value: f32) -> Result<()> {
        self.set_uniform(name, &value)
    }

    pub fn set_uniform_vec2(&mut self, name: &str, value: [f32; 2]) -> Result<()> {
        self.set_uniform(name, &value)
    }

    pub fn set_uniform_vec3(&mut self, name: &str, value: [f32; 3]) -> Result<()> {
        self.set_uniform(name, &value)
    }

    pub fn set_uniform_vec4(&mut self, name: &str, value: [f32; 4]) -> Result<()> {
        self.set_uniform(name, &value)
    }

    /// Column-major 4x4 matrix
    pub fn set_uniform_mat4(&mut self, name: &str, value: [[f32; 4]; 4]) -> Result<()> {
        self.set_uniform(name, &value)
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Create a buffer of `size` bytes, filled from `initial` or zeroed.
    pub fn create_buffer(&mut self, size: u64, initial: Option<&[u8]>, usage: BufferUsage) -> Result<Buffer> {
        let result = BufferAlloc::new(self.gpu.clone(), size, usage, BUFFER_USAGE_FLAGS, initial);
        let alloc = self.check(result)?;
        self.diagnostics
            .trace(format_args!("Created buffer: {} bytes, {:?}", size, usage));
        Ok(Buffer {
            alloc: Arc::new(alloc),
        })
    }

    pub fn create_buffer_zeroed(&mut self, size: u64) -> Result<Buffer> {
        self.create_buffer(size, None, BufferUsage::default())
    }

    /// Create a buffer holding exactly `data`.
    pub fn create_buffer_from<T: Pod>(&mut self, data: &[T], usage: BufferUsage) -> Result<Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.create_buffer(bytes.len() as u64, Some(bytes), usage)
    }

    /// Overwrite `data.len()` bytes at `offset`. Out-of-range requests fail
    /// without writing anything.
    pub fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let result = self.write_buffer_inner(buffer, offset, data);
        self.check(result)
    }

    fn write_buffer_inner(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.check_owner(&buffer.alloc.gpu, "Buffer")?;
        buffer.alloc.check_range(offset, data.len() as u64)?;
        if buffer.is_mapped() {
            return Err(ComputeError::Misuse(
                "Cannot write a buffer while it is mapped".to_string(),
            ));
        }

        // Earlier dispatches may still read or write this memory
        if self.recorder.is_busy() {
            self.recorder.sync()?;
        }

        buffer.alloc.write_bytes(offset, data);
        self.diagnostics.trace(format_args!(
            "Wrote {} bytes at offset {}",
            data.len(),
            offset
        ));
        Ok(())
    }

    /// Attach `buffer` to `slot` (`set = 0, binding = slot`) for later
    /// dispatches. A later bind to the same slot replaces this one.
    pub fn bind_buffer(&mut self, buffer: &Buffer, slot: u32) -> Result<()> {
        let result = self.check_owner(&buffer.alloc.gpu, "Buffer");
        self.check(result)?;

        self.buffer_slots.insert(slot, buffer.alloc.clone());
        self.diagnostics
            .trace(format_args!("Bound buffer ({} bytes) to slot {}", buffer.size(), slot));
        Ok(())
    }

    /// Detach whatever buffer is bound to `slot`.
    pub fn unbind_buffer(&mut self, slot: u32) {
        self.buffer_slots.remove(&slot);
    }

    /// Map `buffer` for direct host access after all device work on it has
    /// finished.
    pub fn map_buffer<'a>(&mut self, buffer: &'a Buffer, access: MapAccess) -> Result<BufferMapping<'a>> {
        let result = self
            .check_owner(&buffer.alloc.gpu, "Buffer")
            .and_then(|_| self.recorder.sync())
            .and_then(|_| BufferMapping::new(&buffer.alloc, access));
        let mapping = self.check(result)?;
        self.diagnostics
            .trace(format_args!("Mapped buffer ({:?})", access));
        Ok(mapping)
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    pub fn create_image_2d(
        &mut self,
        width: u32,
        height: u32,
        format: ImageFormat,
        initial: Option<&[u8]>,
    ) -> Result<Image> {
        let extent = vk::Extent3D {
            width,
            height,
            depth: 1,
        };
        let result = self.create_image(ImageDim::D2, extent, format, initial);
        self.check(result)
    }

    pub fn create_image_3d(
        &mut self,
        width: u32,
        height: u32,
        depth: u32,
        format: ImageFormat,
        initial: Option<&[u8]>,
    ) -> Result<Image> {
        let extent = vk::Extent3D {
            width,
            height,
            depth,
        };
        let result = self.create_image(ImageDim::D3, extent, format, initial);
        self.check(result)
    }

    fn create_image(
        &mut self,
        dim: ImageDim,
        extent: vk::Extent3D,
        format: ImageFormat,
        initial: Option<&[u8]>,
    ) -> Result<Image> {
        let alloc = Arc::new(ImageAlloc::new(self.gpu.clone(), dim, extent, format)?);

        let staging = match initial {
            Some(data) => {
                check_image_data(alloc.byte_len(), data)?;
                Some(image::staging_buffer(&self.gpu, alloc.byte_len(), Some(data))?)
            }
            None => None,
        };

        image::record_initialize(&mut self.recorder, &alloc, staging)?;

        self.diagnostics.trace(format_args!(
            "Created {:?} image {}x{}x{} ({})",
            dim, extent.width, extent.height, extent.depth, format
        ));
        Ok(Image { alloc })
    }

    /// Attach `image` to image slot `slot` (`set = 1, binding = slot`).
    /// `format` must be the image's own format.
    pub fn bind_image(&mut self, image: &Image, slot: u32, format: ImageFormat) -> Result<()> {
        let result = self.check_owner(&image.alloc.gpu, "Image");
        self.check(result)?;
        if image.format() != format {
            let err = ComputeError::InvalidArgument(format!(
                "Image format is {}, bind requested {}",
                image.format(),
                format
            ));
            return Err(self.diagnostics.record(err));
        }
        self.image_slots.insert(slot, image.alloc.clone());
        self.diagnostics
            .trace(format_args!("Bound image ({}) to slot {}", format, slot));
        Ok(())
    }

    pub fn unbind_image(&mut self, slot: u32) {
        self.image_slots.remove(&slot);
    }

    /// Replace the whole image contents. Enqueued like a dispatch.
    pub fn write_image(&mut self, image: &Image, data: &[u8]) -> Result<()> {
        let result = self
            .check_owner(&image.alloc.gpu, "Image")
            .and_then(|_| check_image_data(image.byte_len(), data))
            .and_then(|_| image::staging_buffer(&self.gpu, image.byte_len(), Some(data)))
            .and_then(|staging| image::record_upload(&mut self.recorder, &image.alloc, staging));
        self.check(result)
    }

    /// Copy the whole image to the host, waiting for earlier work.
    pub fn read_image(&mut self, image: &Image) -> Result<Vec<u8>> {
        let result = self.read_image_inner(image);
        self.check(result)
    }

    fn read_image_inner(&mut self, image: &Image) -> Result<Vec<u8>> {
        self.check_owner(&image.alloc.gpu, "Image")?;
        let len = image.byte_len();
        let staging = image::staging_buffer(&self.gpu, len, None)?;
        image::record_download(&mut self.recorder, &image.alloc, &staging)?;
        self.recorder.sync()?;

        let mut data = vec![0u8; len as usize];
        staging.read_bytes(0, &mut data);
        Ok(data)
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        log::debug!("Destroying compute context");
        if let Err(e) = self.recorder.sync() {
            log::warn!("Outstanding work failed during shutdown: {}", e);
        }
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("device", &self.gpu.name())
            .field("program", &self.program)
            .field("buffer_slots", &self.buffer_slots.keys().collect::<Vec<_>>())
            .field("image_slots", &self.image_slots.keys().collect::<Vec<_>>())
            .field("auto_barrier", &self.auto_barrier)
            .finish()
    }
}

fn check_image_data(expected: u64, data: &[u8]) -> Result<()> {
    if data.len() as u64 != expected {
        return Err(ComputeError::InvalidArgument(format!(
            "Image data is {} bytes, image holds {} bytes",
            data.len(),
            expected
        )));
    }
    Ok(())
}

/// Read a whole kernel file; opening and reading fail with distinct errors.
fn read_source(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|source| ComputeError::Io {
        action: "open",
        path: path.to_path_buf(),
        source,
    })?;

    let mut source = String::new();
    file.read_to_string(&mut source)
        .map_err(|err| ComputeError::Io {
            action: "read",
            path: path.to_path_buf(),
            source: err,
        })?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_limits_from_device_limits() {
        let device_limits = vk::PhysicalDeviceLimits {
            max_compute_work_group_count: [65535, 65535, 65535],
            max_compute_work_group_size: [1024, 1024, 64],
            max_compute_work_group_invocations: 1024,
            ..Default::default()
        };
        let limits = ComputeLimits::from(&device_limits);
        assert_eq!(limits.max_group_count, [65535; 3]);
        assert_eq!(limits.max_group_size, [1024, 1024, 64]);
        assert_eq!(limits.max_invocations_per_group, 1024);
    }

    #[test]
    fn test_limits_serialize() {
        let limits = ComputeLimits {
            max_group_count: [1, 2, 3],
            max_group_size: [4, 5, 6],
            max_invocations_per_group: 7,
        };
        let json = serde_json::to_value(limits).unwrap();
        assert_eq!(json["max_group_count"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["max_invocations_per_group"], 7);
    }

    #[test]
    fn test_read_source_missing_file_is_open_error() {
        let err = read_source(Path::new("/nonexistent/kernel.comp")).unwrap_err();
        match err {
            ComputeError::Io { action, .. } => assert_eq!(action, "open"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_read_source_directory_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_source(dir.path()).unwrap_err();
        match err {
            ComputeError::Io { action, .. } => assert_eq!(action, "read"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_read_source_reads_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#version 450\nvoid main() {}\n").unwrap();
        let source = read_source(file.path()).unwrap();
        assert!(source.starts_with("#version 450"));
        assert!(source.ends_with("{}\n"));
    }

    #[test]
    fn test_image_data_length_checked() {
        assert!(check_image_data(16, &[0u8; 16]).is_ok());
        assert!(matches!(
            check_image_data(16, &[0u8; 8]),
            Err(ComputeError::InvalidArgument(_))
        ));
    }
}
