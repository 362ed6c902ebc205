//! Command recording, submission and fence tracking
//!
//! Work is recorded into a *batch*: one primary command buffer plus the
//! descriptor sets it uses and `Arc`s to every resource it touches. A batch
//! is submitted at suspension points (reads, timing, host writes) and gets a
//! monotonically increasing serial; its resources are released only once
//! its fence has signalled.

use ash::vk;
use bitflags::bitflags;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferAlloc;
use crate::device::Gpu;
use crate::error::{ComputeError, Result};
use crate::image::ImageAlloc;
use crate::program::ProgramObjects;

bitflags! {
    /// Which kinds of memory access a barrier makes visible
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BarrierFlags: u32 {
        /// Storage buffer reads/writes by later dispatches
        const STORAGE = 1 << 0;
        /// Storage image loads/stores by later dispatches
        const IMAGE = 1 << 1;
        /// Uniform reads by later dispatches
        const UNIFORM = 1 << 2;
        /// Copies between buffers and images
        const TRANSFER = 1 << 3;
        /// Host reads of mapped memory
        const HOST = 1 << 4;
        const ALL = Self::STORAGE.bits()
            | Self::IMAGE.bits()
            | Self::UNIFORM.bits()
            | Self::TRANSFER.bits()
            | Self::HOST.bits();
    }
}

/// Stage and access masks for a global memory barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Translate barrier flags into Vulkan masks. Storage buffers and storage
/// images share the same shader access bits. Empty flags give `None`.
pub fn barrier_masks(flags: BarrierFlags) -> Option<BarrierMasks> {
    if flags.is_empty() {
        return None;
    }

    let mut masks = BarrierMasks {
        src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        dst_stage: vk::PipelineStageFlags::empty(),
        src_access: vk::AccessFlags::SHADER_WRITE,
        dst_access: vk::AccessFlags::empty(),
    };

    if flags.intersects(BarrierFlags::STORAGE | BarrierFlags::IMAGE) {
        masks.dst_stage |= vk::PipelineStageFlags::COMPUTE_SHADER;
        masks.dst_access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if flags.contains(BarrierFlags::UNIFORM) {
        masks.dst_stage |= vk::PipelineStageFlags::COMPUTE_SHADER;
        masks.dst_access |= vk::AccessFlags::UNIFORM_READ;
    }
    if flags.contains(BarrierFlags::TRANSFER) {
        masks.src_stage |= vk::PipelineStageFlags::TRANSFER;
        masks.src_access |= vk::AccessFlags::TRANSFER_WRITE;
        masks.dst_stage |= vk::PipelineStageFlags::TRANSFER;
        masks.dst_access |= vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE;
    }
    if flags.contains(BarrierFlags::HOST) {
        masks.dst_stage |= vk::PipelineStageFlags::HOST;
        masks.dst_access |= vk::AccessFlags::HOST_READ;
    }

    Some(masks)
}

/// Resource kept alive until the batch that uses it completes
pub(crate) enum Retained {
    Buffer(Arc<BufferAlloc>),
    Image(Arc<ImageAlloc>),
    Program(Arc<ProgramObjects>),
}

struct Batch {
    cmd: vk::CommandBuffer,
    descriptor_sets: Vec<vk::DescriptorSet>,
    retained: Vec<Retained>,
    bound_pipeline: vk::Pipeline,
}

struct InFlight {
    serial: u64,
    fence: vk::Fence,
    batch: Option<Batch>,
}

pub(crate) struct CommandRecorder {
    gpu: Arc<Gpu>,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    free_commands: Vec<vk::CommandBuffer>,
    free_fences: Vec<vk::Fence>,
    current: Option<Batch>,
    in_flight: VecDeque<InFlight>,
    next_serial: u64,
}

impl CommandRecorder {
    /// `max_sets` bounds the descriptor sets alive at once across all
    /// unfinished batches; running out forces a flush.
    pub fn new(gpu: Arc<Gpu>, max_sets: u32) -> Result<Self> {
        let device = &gpu.device;
        let max_sets = max_sets.max(2);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(gpu.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
            ComputeError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
        })?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets * 8,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets * 8,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: max_sets * 8,
            },
        ];

        let descriptor_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);

        let descriptor_pool = match unsafe { device.create_descriptor_pool(&descriptor_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(ComputeError::InitializationFailed(format!(
                    "Failed to create descriptor pool: {:?}",
                    e
                )));
            }
        };

        log::info!(
            "Created CommandRecorder: queue_family={}, max_descriptor_sets={}",
            gpu.queue_family,
            max_sets
        );

        Ok(Self {
            queue: gpu.queue(),
            gpu,
            command_pool,
            descriptor_pool,
            free_commands: Vec::new(),
            free_fences: Vec::new(),
            current: None,
            in_flight: VecDeque::new(),
            next_serial: 1,
        })
    }

    pub fn device(&self) -> &Arc<Gpu> {
        &self.gpu
    }

    /// Whether any submitted batch has not been seen to complete
    pub fn is_busy(&self) -> bool {
        self.current.is_some() || !self.in_flight.is_empty()
    }

    /// Command buffer of the open batch, beginning one if needed.
    pub fn command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        if let Some(batch) = &self.current {
            return Ok(batch.cmd);
        }

        let cmd = match self.free_commands.pop() {
            Some(cmd) => cmd,
            None => {
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let buffers = unsafe { self.gpu.device.allocate_command_buffers(&alloc_info) }?;
                buffers.into_iter().next().ok_or(ComputeError::VulkanApi(
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                ))?
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = unsafe { self.gpu.device.begin_command_buffer(cmd, &begin_info) } {
            self.free_commands.push(cmd);
            return Err(e.into());
        }

        log::debug!("Command buffer recording started");
        self.current = Some(Batch {
            cmd,
            descriptor_sets: Vec::new(),
            retained: Vec::new(),
            bound_pipeline: vk::Pipeline::null(),
        });
        Ok(cmd)
    }

    /// Keep `resource` alive until the open batch completes.
    pub fn retain(&mut self, resource: Retained) {
        if let Some(batch) = &mut self.current {
            batch.retained.push(resource);
        }
    }

    /// Bind `pipeline` unless the open batch already has it bound.
    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) -> Result<vk::CommandBuffer> {
        let cmd = self.command_buffer()?;
        if let Some(batch) = &mut self.current {
            if batch.bound_pipeline != pipeline {
                unsafe {
                    self.gpu
                        .device
                        .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline)
                };
                batch.bound_pipeline = pipeline;
            }
        }
        Ok(cmd)
    }

    /// Forget the cached pipeline binding (after a program change).
    pub fn reset_bound_pipeline(&mut self) {
        if let Some(batch) = &mut self.current {
            batch.bound_pipeline = vk::Pipeline::null();
        }
    }

    /// Allocate descriptor sets for the open batch. When the pool is
    /// exhausted, outstanding work is flushed and the allocation retried.
    pub fn allocate_descriptor_sets(
        &mut self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }

        let sets = match self.try_allocate_sets(layouts) {
            Ok(sets) => sets,
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                log::debug!("Descriptor pool exhausted, flushing outstanding work");
                self.sync()?;
                self.try_allocate_sets(layouts)?
            }
            Err(e) => return Err(e.into()),
        };

        self.command_buffer()?;
        if let Some(batch) = &mut self.current {
            batch.descriptor_sets.extend_from_slice(&sets);
        }
        Ok(sets)
    }

    fn try_allocate_sets(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> std::result::Result<Vec<vk::DescriptorSet>, vk::Result> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(layouts);
        unsafe { self.gpu.device.allocate_descriptor_sets(&alloc_info) }
    }

    /// Record a global memory barrier into the open batch.
    pub fn record_barrier(&mut self, flags: BarrierFlags) -> Result<()> {
        let Some(masks) = barrier_masks(flags) else {
            return Ok(());
        };
        let cmd = self.command_buffer()?;
        self.record_masks(cmd, masks);
        log::debug!("Recorded memory barrier {:?}", flags);
        Ok(())
    }

    fn record_masks(&self, cmd: vk::CommandBuffer, masks: BarrierMasks) {
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        unsafe {
            self.gpu.device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        }
    }

    fn take_fence(&mut self) -> Result<vk::Fence> {
        if let Some(fence) = self.free_fences.pop() {
            return Ok(fence);
        }
        let fence_info = vk::FenceCreateInfo::default();
        Ok(unsafe { self.gpu.device.create_fence(&fence_info, None) }?)
    }

    /// Close and submit the open batch (an empty submission when nothing is
    /// recorded). Returns the serial to wait on.
    pub fn submit(&mut self) -> Result<u64> {
        let fence = self.take_fence()?;
        let batch = self.current.take();

        if let Some(batch) = &batch {
            // Everything recorded becomes visible to the host on completion
            let final_masks = BarrierMasks {
                src_stage: vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::HOST,
                src_access: vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::HOST_READ,
            };
            self.record_masks(batch.cmd, final_masks);
        }

        let submitted = unsafe {
            match &batch {
                Some(batch) => self.gpu.device.end_command_buffer(batch.cmd).and_then(|_| {
                    let submit_info = vk::SubmitInfo::default()
                        .command_buffers(std::slice::from_ref(&batch.cmd));
                    self.gpu.device.queue_submit(self.queue, &[submit_info], fence)
                }),
                None => self.gpu.device.queue_submit(self.queue, &[], fence),
            }
        };

        if let Err(e) = submitted {
            self.free_fences.push(fence);
            if let Some(batch) = batch {
                self.release(batch);
            }
            return Err(ComputeError::Synchronization(format!(
                "Failed to submit command buffer: {:?}",
                e
            )));
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        log::debug!(
            "Submitted batch {} ({} resources retained)",
            serial,
            batch.as_ref().map_or(0, |b| b.retained.len())
        );
        self.in_flight.push_back(InFlight { serial, fence, batch });
        Ok(serial)
    }

    /// Block until batch `serial` has completed. `None` waits forever.
    /// A serial that is no longer tracked has already completed.
    pub fn wait(&mut self, serial: u64, timeout: Option<Duration>) -> Result<()> {
        let fence = self
            .in_flight
            .iter()
            .find(|f| f.serial == serial)
            .map(|f| f.fence);

        if let Some(fence) = fence {
            let timeout_ns = timeout
                .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
                .unwrap_or(u64::MAX);
            match unsafe { self.gpu.device.wait_for_fences(&[fence], true, timeout_ns) } {
                Ok(()) => {}
                Err(vk::Result::TIMEOUT) => {
                    return Err(ComputeError::Synchronization(
                        "Async operation timeout".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(ComputeError::Synchronization(format!(
                        "Async wait failed: {:?}",
                        e
                    )))
                }
            }
        }

        self.reap()
    }

    /// Submit pending commands and wait for all device work.
    pub fn sync(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.submit()?;
        }
        if self.in_flight.is_empty() {
            return Ok(());
        }

        let fences: Vec<vk::Fence> = self.in_flight.iter().map(|f| f.fence).collect();
        unsafe { self.gpu.device.wait_for_fences(&fences, true, u64::MAX) }.map_err(|e| {
            ComputeError::Synchronization(format!("Failed to wait for device: {:?}", e))
        })?;

        self.reap()
    }

    /// Recycle every batch whose fence has signalled.
    pub fn reap(&mut self) -> Result<()> {
        let mut still_running = VecDeque::with_capacity(self.in_flight.len());
        while let Some(entry) = self.in_flight.pop_front() {
            let done = unsafe { self.gpu.device.get_fence_status(entry.fence) };
            match done {
                Ok(true) => {
                    if let Err(e) = unsafe { self.gpu.device.reset_fences(&[entry.fence]) } {
                        // Keep the remaining entries tracked before bailing out
                        still_running.push_back(entry);
                        still_running.extend(self.in_flight.drain(..));
                        self.in_flight = still_running;
                        return Err(e.into());
                    }
                    self.free_fences.push(entry.fence);
                    if let Some(batch) = entry.batch {
                        self.release(batch);
                    }
                    log::debug!("Batch {} completed", entry.serial);
                }
                Ok(false) => still_running.push_back(entry),
                Err(e) => {
                    still_running.push_back(entry);
                    still_running.extend(self.in_flight.drain(..));
                    self.in_flight = still_running;
                    return Err(e.into());
                }
            }
        }
        self.in_flight = still_running;
        Ok(())
    }

    fn release(&mut self, batch: Batch) {
        unsafe {
            if !batch.descriptor_sets.is_empty() {
                self.gpu
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &batch.descriptor_sets)
                    .ok();
            }
            if self
                .gpu
                .device
                .reset_command_buffer(batch.cmd, vk::CommandBufferResetFlags::empty())
                .is_ok()
            {
                self.free_commands.push(batch.cmd);
            }
        }
        // Retained resources drop here
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        log::debug!("Dropping CommandRecorder");
        unsafe {
            self.gpu.device.device_wait_idle().ok();
        }

        // Resources referenced by batches go before the pools they came from
        self.current = None;
        let fences: Vec<vk::Fence> = self
            .in_flight
            .drain(..)
            .map(|f| f.fence)
            .chain(self.free_fences.drain(..))
            .collect();

        unsafe {
            for fence in fences {
                self.gpu.device.destroy_fence(fence, None);
            }
            self.gpu.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.gpu.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_contains_every_flag() {
        assert!(BarrierFlags::ALL.contains(BarrierFlags::STORAGE));
        assert!(BarrierFlags::ALL.contains(BarrierFlags::IMAGE));
        assert!(BarrierFlags::ALL.contains(BarrierFlags::UNIFORM));
        assert!(BarrierFlags::ALL.contains(BarrierFlags::TRANSFER));
        assert!(BarrierFlags::ALL.contains(BarrierFlags::HOST));
        assert_eq!(BarrierFlags::ALL, BarrierFlags::all());
    }

    #[test]
    fn test_empty_flags_record_nothing() {
        assert!(barrier_masks(BarrierFlags::empty()).is_none());
    }

    #[test]
    fn test_storage_and_image_share_masks() {
        assert_eq!(
            barrier_masks(BarrierFlags::STORAGE),
            barrier_masks(BarrierFlags::IMAGE)
        );
    }

    #[test]
    fn test_storage_barrier_is_compute_to_compute() {
        let masks = barrier_masks(BarrierFlags::STORAGE).unwrap();
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(masks.src_access, vk::AccessFlags::SHADER_WRITE);
        assert!(masks.dst_access.contains(vk::AccessFlags::SHADER_READ));
    }

    #[test]
    fn test_host_barrier_targets_host_reads() {
        let masks = barrier_masks(BarrierFlags::HOST).unwrap();
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::HOST);
        assert_eq!(masks.dst_access, vk::AccessFlags::HOST_READ);
    }

    #[test]
    fn test_all_covers_every_stage() {
        let masks = barrier_masks(BarrierFlags::ALL).unwrap();
        assert!(masks.src_stage.contains(vk::PipelineStageFlags::TRANSFER));
        assert!(masks.dst_stage.contains(
            vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::HOST
        ));
        assert!(masks.dst_access.contains(
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::HOST_READ
        ));
    }
}
