//! Dispatch, barriers, GPU timing and readback
//!
//! Dispatches only enqueue work. Results reach the host at the suspension
//! points: blocking reads, `end_timing` and `wait_async`.

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use crate::buffer::{Buffer, BufferAlloc, BufferUsage};
use crate::command::{BarrierFlags, CommandRecorder, Retained};
use crate::context::ComputeContext;
use crate::device::Gpu;
use crate::error::{ComputeError, Result};
use crate::image::ImageAlloc;
use crate::program::{BUFFER_SET, IMAGE_SET};
use crate::reflect::BindingKind;

/// One outstanding asynchronous readback.
///
/// The requested range is copied on the device into a private staging
/// buffer when the read is queued, so later writes to the source do not
/// reach `dest`. Holds the destination borrowed until
/// [`ComputeContext::wait_async`] consumes the token. Several may be in
/// flight at once.
#[must_use = "the destination is only filled by wait_async"]
pub struct PendingRead<'a> {
    serial: u64,
    staging: Arc<BufferAlloc>,
    offset: u64,
    dest: &'a mut [u8],
}

impl PendingRead<'_> {
    pub fn len(&self) -> usize {
        self.dest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dest.is_empty()
    }
}

impl std::fmt::Debug for PendingRead<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRead")
            .field("serial", &self.serial)
            .field("offset", &self.offset)
            .field("len", &self.dest.len())
            .finish()
    }
}

/// Two-entry timestamp query pool for `begin_timing`/`end_timing`
pub(crate) struct TimestampQueries {
    pool: vk::QueryPool,
    begun: bool,
    gpu: Arc<Gpu>,
}

impl TimestampQueries {
    fn new(gpu: Arc<Gpu>) -> Result<Self> {
        let pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2);
        let pool = unsafe { gpu.device.create_query_pool(&pool_info, None) }?;
        log::debug!("Created timestamp query pool");
        Ok(Self {
            pool,
            begun: false,
            gpu,
        })
    }
}

impl Drop for TimestampQueries {
    fn drop(&mut self) {
        unsafe { self.gpu.device.destroy_query_pool(self.pool, None) };
    }
}

/// Convert a timestamp pair to milliseconds, honouring the counter width.
pub fn elapsed_ms(start: u64, end: u64, valid_bits: u32, period_ns: f32) -> f64 {
    let mask = if valid_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    };
    let ticks = (end & mask).wrapping_sub(start & mask) & mask;
    ticks as f64 * period_ns as f64 / 1_000_000.0
}

/// Descriptor range for a buffer of `size` bytes, limited to what the
/// device can address through one descriptor of type `ty`.
pub(crate) fn descriptor_range(ty: vk::DescriptorType, size: u64, limits: &vk::PhysicalDeviceLimits) -> u64 {
    let max = if ty == vk::DescriptorType::UNIFORM_BUFFER {
        limits.max_uniform_buffer_range
    } else {
        limits.max_storage_buffer_range
    };
    size.min(u64::from(max))
}

/// Group counts must be positive and within the device limit per axis.
pub(crate) fn check_group_counts(groups: [u32; 3], max: [u32; 3]) -> Result<()> {
    for (axis, (&n, &limit)) in groups.iter().zip(max.iter()).enumerate() {
        if n == 0 || n > limit {
            return Err(ComputeError::InvalidArgument(format!(
                "Group count {} on axis {} outside 1..={}",
                n,
                ["x", "y", "z"][axis],
                limit
            )));
        }
    }
    Ok(())
}

impl ComputeContext {
    /// Run the current program over `gx * gy * gz` work groups.
    pub fn dispatch(&mut self, gx: u32, gy: u32, gz: u32) -> Result<()> {
        let result = self.dispatch_inner([gx, gy, gz]);
        self.check(result)
    }

    pub fn dispatch_1d(&mut self, n: u32) -> Result<()> {
        self.dispatch(n, 1, 1)
    }

    pub fn dispatch_2d(&mut self, nx: u32, ny: u32) -> Result<()> {
        self.dispatch(nx, ny, 1)
    }

    fn dispatch_inner(&mut self, groups: [u32; 3]) -> Result<()> {
        let program = self
            .program
            .clone()
            .ok_or_else(|| ComputeError::Misuse("Dispatch with no program set".to_string()))?;

        check_group_counts(groups, self.gpu.limits().max_compute_work_group_count)?;

        let interface = program.interface();

        let mut buffers: Vec<(u32, vk::DescriptorType, Arc<BufferAlloc>)> = Vec::new();
        for binding in interface.bindings_in_set(BUFFER_SET) {
            let alloc = self.buffer_slots.get(&binding.binding).ok_or_else(|| {
                ComputeError::Misuse(format!("No buffer bound to slot {}", binding.binding))
            })?;
            if alloc.is_mapped() {
                return Err(ComputeError::Misuse(format!(
                    "Buffer in slot {} is mapped",
                    binding.binding
                )));
            }
            let ty = match binding.kind {
                BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
                _ => vk::DescriptorType::STORAGE_BUFFER,
            };
            buffers.push((binding.binding, ty, alloc.clone()));
        }

        let mut images: Vec<(u32, Arc<ImageAlloc>)> = Vec::new();
        for binding in interface.bindings_in_set(IMAGE_SET) {
            let alloc = self.image_slots.get(&binding.binding).ok_or_else(|| {
                ComputeError::Misuse(format!("No image bound to slot {}", binding.binding))
            })?;
            if let BindingKind::StorageImage { dim, format } = binding.kind {
                if dim != alloc.dim {
                    return Err(ComputeError::Misuse(format!(
                        "Image slot {} expects {:?}, bound image is {:?}",
                        binding.binding, dim, alloc.dim
                    )));
                }
                if let Some(format) = format {
                    if format != alloc.format {
                        return Err(ComputeError::Misuse(format!(
                            "Image slot {} expects {}, bound image is {}",
                            binding.binding, format, alloc.format
                        )));
                    }
                }
            }
            images.push((binding.binding, alloc.clone()));
        }

        let sets = self
            .recorder
            .allocate_descriptor_sets(&program.inner.set_layouts)?;

        let limits = self.gpu.limits();
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|(_, ty, alloc)| {
                vk::DescriptorBufferInfo::default()
                    .buffer(alloc.buffer)
                    .offset(0)
                    .range(descriptor_range(*ty, alloc.size, limits))
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = images
            .iter()
            .map(|(_, alloc)| {
                vk::DescriptorImageInfo::default()
                    .image_view(alloc.view)
                    .image_layout(vk::ImageLayout::GENERAL)
            })
            .collect();

        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::new();
        for (idx, (binding, ty, _)) in buffers.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(sets[BUFFER_SET as usize])
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(&buffer_infos[idx])),
            );
        }
        for (idx, (binding, _)) in images.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(sets[IMAGE_SET as usize])
                    .dst_binding(*binding)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&image_infos[idx])),
            );
        }

        let device = self.gpu.clone();
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };

        let cmd = self.recorder.bind_pipeline(program.pipeline())?;
        let layout = program.inner.layout;
        unsafe {
            device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &sets,
                &[],
            );
            if !self.uniforms.is_empty() {
                device.device.cmd_push_constants(
                    cmd,
                    layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    &self.uniforms,
                );
            }
            device.device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
        }

        self.recorder.retain(Retained::Program(program.inner.clone()));
        for (_, _, alloc) in buffers {
            self.recorder.retain(Retained::Buffer(alloc));
        }
        for (_, alloc) in images {
            self.recorder.retain(Retained::Image(alloc));
        }

        if self.auto_barrier {
            self.recorder.record_barrier(BarrierFlags::ALL)?;
        }

        self.diagnostics.trace(format_args!(
            "Dispatched {}x{}x{} groups",
            groups[0], groups[1], groups[2]
        ));
        Ok(())
    }

    /// Enable or disable the full barrier recorded after each dispatch.
    pub fn set_auto_barrier(&mut self, enable: bool) {
        self.auto_barrier = enable;
    }

    pub fn auto_barrier(&self) -> bool {
        self.auto_barrier
    }

    /// Make earlier device writes visible to the access kinds in `flags`.
    pub fn barrier(&mut self, flags: BarrierFlags) -> Result<()> {
        let result = self.recorder.record_barrier(flags);
        self.check(result)?;
        self.diagnostics
            .trace(format_args!("Barrier {:?}", flags));
        Ok(())
    }

    pub fn barrier_all(&mut self) -> Result<()> {
        self.barrier(BarrierFlags::ALL)
    }

    // ------------------------------------------------------------------
    // Timing
    // ------------------------------------------------------------------

    /// Start timing the device work recorded from now on.
    pub fn begin_timing(&mut self) -> Result<()> {
        let result = self.begin_timing_inner();
        self.check(result)
    }

    fn begin_timing_inner(&mut self) -> Result<()> {
        if self.gpu.timestamp_valid_bits == 0 || self.gpu.limits().timestamp_period <= 0.0 {
            return Err(ComputeError::VulkanApi(vk::Result::ERROR_FEATURE_NOT_PRESENT));
        }

        if self.timer.is_none() {
            self.timer = Some(TimestampQueries::new(self.gpu.clone())?);
        }

        let cmd = self.recorder.command_buffer()?;
        if let Some(timer) = &mut self.timer {
            unsafe {
                self.gpu.device.cmd_reset_query_pool(cmd, timer.pool, 0, 2);
                self.gpu.device.cmd_write_timestamp(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    timer.pool,
                    0,
                );
            }
            timer.begun = true;
        }
        Ok(())
    }

    /// Stop timing, wait for the device and return elapsed milliseconds.
    pub fn end_timing(&mut self) -> Result<f64> {
        let result = self.end_timing_inner();
        self.check(result)
    }

    fn end_timing_inner(&mut self) -> Result<f64> {
        let pool = match &mut self.timer {
            Some(timer) if timer.begun => {
                timer.begun = false;
                timer.pool
            }
            _ => {
                return Err(ComputeError::Misuse(
                    "end_timing called without begin_timing".to_string(),
                ))
            }
        };

        let cmd = self.recorder.command_buffer()?;
        unsafe {
            self.gpu.device.cmd_write_timestamp(
                cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                pool,
                1,
            );
        }
        self.recorder.sync()?;

        let mut stamps = [0u64; 2];
        unsafe {
            self.gpu.device.get_query_pool_results(
                pool,
                0,
                &mut stamps,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }?;

        let ms = elapsed_ms(
            stamps[0],
            stamps[1],
            self.gpu.timestamp_valid_bits,
            self.gpu.limits().timestamp_period,
        );
        self.diagnostics
            .trace(format_args!("Timed region: {:.3} ms", ms));
        Ok(ms)
    }

    // ------------------------------------------------------------------
    // Readback
    // ------------------------------------------------------------------

    /// Read the first `len` bytes after all earlier work has finished.
    pub fn read_buffer(&mut self, buffer: &Buffer, len: u64) -> Result<Vec<u8>> {
        if len > buffer.size() {
            let err = ComputeError::InvalidArgument(format!(
                "Read of {} bytes exceeds buffer size {}",
                len,
                buffer.size()
            ));
            return Err(self.diagnostics.record(err));
        }
        let mut data = vec![0u8; len as usize];
        self.read_buffer_into(buffer, &mut data)?;
        Ok(data)
    }

    /// Fill `dest` from the start of `buffer`.
    pub fn read_buffer_into(&mut self, buffer: &Buffer, dest: &mut [u8]) -> Result<()> {
        let result = self.read_blocking(buffer, dest);
        self.check(result)
    }

    /// Read `count` elements of `T` from the start of `buffer`.
    pub fn read_buffer_as<T: Pod>(&mut self, buffer: &Buffer, count: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        self.read_buffer_into(buffer, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    fn read_blocking(&mut self, buffer: &Buffer, dest: &mut [u8]) -> Result<()> {
        self.check_owner(&buffer.alloc.gpu, "Buffer")?;
        check_readable(&buffer.alloc, 0, dest.len())?;
        self.recorder.sync()?;
        buffer.alloc.read_bytes(0, dest);
        self.diagnostics
            .trace(format_args!("Read {} bytes", dest.len()));
        Ok(())
    }

    /// Copy `dest.len()` bytes at `offset` into a staging buffer behind all
    /// earlier work, submit, and return a token for collecting them.
    pub fn read_buffer_async<'a>(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        dest: &'a mut [u8],
    ) -> Result<PendingRead<'a>> {
        let result = self.queue_snapshot(buffer, offset, dest.len() as u64);
        let (serial, staging) = self.check(result)?;

        self.diagnostics.trace(format_args!(
            "Async read of {} bytes queued (batch {})",
            dest.len(),
            serial
        ));
        Ok(PendingRead {
            serial,
            staging,
            offset,
            dest,
        })
    }

    fn queue_snapshot(&mut self, buffer: &Buffer, offset: u64, len: u64) -> Result<(u64, Arc<BufferAlloc>)> {
        self.check_owner(&buffer.alloc.gpu, "Buffer")?;
        check_readable(&buffer.alloc, offset, len as usize)?;
        let staging = Arc::new(BufferAlloc::new(
            self.gpu.clone(),
            len,
            BufferUsage::Stream,
            vk::BufferUsageFlags::TRANSFER_DST,
            None,
        )?);
        record_snapshot(&mut self.recorder, &buffer.alloc, &staging, offset)?;
        let serial = self.recorder.submit()?;
        Ok((serial, staging))
    }

    /// Wait (up to the configured timeout) for `pending` and copy its data.
    pub fn wait_async(&mut self, pending: PendingRead<'_>) -> Result<()> {
        let result = self.wait_async_inner(pending);
        self.check(result)
    }

    fn wait_async_inner(&mut self, pending: PendingRead<'_>) -> Result<()> {
        let PendingRead {
            serial,
            staging,
            offset,
            dest,
        } = pending;

        self.recorder.wait(serial, Some(self.async_timeout))?;

        staging.read_bytes(0, dest);
        log::debug!("Async read at offset {} collected from staging", offset);
        self.diagnostics
            .trace(format_args!("Async read of batch {} complete", serial));
        Ok(())
    }
}

/// Record a copy of `staging.size` bytes at `offset` of `source` into
/// `staging`, ordered after earlier shader and transfer writes.
fn record_snapshot(
    recorder: &mut CommandRecorder,
    source: &Arc<BufferAlloc>,
    staging: &Arc<BufferAlloc>,
    offset: u64,
) -> Result<()> {
    let device = recorder.device().clone();
    let cmd = recorder.command_buffer()?;

    let before = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ);
    let region = vk::BufferCopy::default()
        .src_offset(offset)
        .dst_offset(0)
        .size(staging.size);

    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[before],
            &[],
            &[],
        );
        device
            .device
            .cmd_copy_buffer(cmd, source.buffer, staging.buffer, &[region]);
    }

    recorder.retain(Retained::Buffer(source.clone()));
    recorder.retain(Retained::Buffer(staging.clone()));
    Ok(())
}

fn check_readable(alloc: &BufferAlloc, offset: u64, len: usize) -> Result<()> {
    alloc.check_range(offset, len as u64)?;
    if alloc.is_mapped() {
        return Err(ComputeError::Misuse(
            "Cannot read a buffer while it is mapped".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_ms_scales_by_period() {
        // 1_000_000 ticks of 1 ns = 1 ms
        assert!((elapsed_ms(0, 1_000_000, 64, 1.0) - 1.0).abs() < 1e-9);
        assert!((elapsed_ms(500, 1_500, 64, 2.5) - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn test_elapsed_ms_handles_wraparound() {
        // 36-bit counter wrapping between the two samples
        let max = (1u64 << 36) - 1;
        let ms = elapsed_ms(max - 9, 10, 36, 1_000_000.0);
        assert!((ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_elapsed_ms_ignores_invalid_high_bits() {
        let garbage = 0xFFFF_0000_0000_0000u64;
        let ms = elapsed_ms(garbage | 100, garbage | 200, 48, 1_000_000.0);
        assert!((ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_descriptor_range_clamped_to_limits() {
        let limits = vk::PhysicalDeviceLimits {
            max_uniform_buffer_range: 65536,
            max_storage_buffer_range: 1 << 27,
            ..Default::default()
        };
        let uniform = vk::DescriptorType::UNIFORM_BUFFER;
        let storage = vk::DescriptorType::STORAGE_BUFFER;

        assert_eq!(descriptor_range(uniform, 256, &limits), 256);
        assert_eq!(descriptor_range(uniform, 1 << 20, &limits), 65536);
        assert_eq!(descriptor_range(storage, 1 << 20, &limits), 1 << 20);
        assert_eq!(descriptor_range(storage, 1 << 30, &limits), 1 << 27);
    }

    #[test]
    fn test_group_counts_checked_per_axis() {
        let max = [65535, 65535, 64];
        assert!(check_group_counts([1, 1, 1], max).is_ok());
        assert!(check_group_counts([65535, 1, 64], max).is_ok());
        assert!(check_group_counts([0, 1, 1], max).is_err());
        assert!(check_group_counts([1, 1, 65], max).is_err());
    }
}
