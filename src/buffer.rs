//! Storage buffer management
//!
//! Buffers live in host-visible, host-coherent memory that stays mapped for
//! the buffer's whole lifetime. The usage hint only picks which additional
//! memory properties to prefer; every buffer is readable and writable from
//! the host no matter which hint it was created with.

use ash::vk;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::device::Gpu;
use crate::error::{ComputeError, Result};

/// How often the caller expects to update a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferUsage {
    /// Written once, read by many dispatches
    Static,
    /// Updated occasionally
    #[default]
    Dynamic,
    /// Rewritten for every dispatch
    Stream,
}

impl BufferUsage {
    /// Memory properties tried first; HOST_VISIBLE | HOST_COHERENT is the fallback.
    pub fn preferred_memory(self) -> vk::MemoryPropertyFlags {
        let base = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        match self {
            BufferUsage::Static => base | vk::MemoryPropertyFlags::DEVICE_LOCAL,
            BufferUsage::Dynamic => base | vk::MemoryPropertyFlags::HOST_CACHED,
            BufferUsage::Stream => base,
        }
    }
}

/// Access requested when mapping a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    Write,
    ReadWrite,
}

impl MapAccess {
    fn readable(self) -> bool {
        matches!(self, MapAccess::Read | MapAccess::ReadWrite)
    }

    fn writable(self) -> bool {
        matches!(self, MapAccess::Write | MapAccess::ReadWrite)
    }
}

/// VkBuffer, its memory and the persistent host mapping
pub(crate) struct BufferAlloc {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: BufferUsage,
    mapped: NonNull<u8>,
    map_outstanding: Cell<bool>,
    pub gpu: Arc<Gpu>,
}

impl BufferAlloc {
    /// Allocate, bind and map a buffer. `initial` must be `size` bytes; without
    /// it the contents are zeroed.
    pub fn new(
        gpu: Arc<Gpu>,
        size: vk::DeviceSize,
        usage: BufferUsage,
        vk_usage: vk::BufferUsageFlags,
        initial: Option<&[u8]>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ComputeError::InvalidArgument(
                "Buffer size must be positive".to_string(),
            ));
        }
        if let Some(data) = initial {
            if data.len() as u64 != size {
                return Err(ComputeError::InvalidArgument(format!(
                    "Initial data is {} bytes, buffer is {} bytes",
                    data.len(),
                    size
                )));
            }
        }

        let device = &gpu.device;

        let buffer_create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_create_info, None) }.map_err(|e| {
            ComputeError::OutOfMemory(format!("Failed to create VkBuffer: {:?}", e))
        })?;

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let Some(memory_type_index) = choose_memory_type(
            &gpu.memory_properties,
            mem_requirements.memory_type_bits,
            usage.preferred_memory(),
            required,
        ) else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(ComputeError::OutOfMemory(
                "No host-visible memory type found for buffer".to_string(),
            ));
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(ComputeError::OutOfMemory(format!(
                    "Failed to allocate VkDeviceMemory: {:?}",
                    e
                )));
            }
        };

        let mapped = unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|_| device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()))
        };

        let mapped = match mapped.map(|p| NonNull::new(p as *mut u8)) {
            Ok(Some(ptr)) => ptr,
            failed => {
                unsafe {
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                }
                return Err(ComputeError::OutOfMemory(format!(
                    "Failed to bind or map buffer memory: {:?}",
                    failed.err()
                )));
            }
        };

        // SAFETY: `mapped` covers `size` bytes of host-coherent memory
        unsafe {
            match initial {
                Some(data) => {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr(), data.len())
                }
                None => std::ptr::write_bytes(mapped.as_ptr(), 0, size as usize),
            }
        }

        log::debug!(
            "Created buffer: size={} bytes, usage={:?}, memory_type_index={}",
            size,
            usage,
            memory_type_index
        );

        Ok(Self {
            buffer,
            memory,
            size,
            usage,
            mapped,
            map_outstanding: Cell::new(false),
            gpu,
        })
    }

    /// Error unless `[offset, offset + len)` lies inside the buffer.
    pub fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        check_range(self.size, offset, len)
    }

    pub fn is_mapped(&self) -> bool {
        self.map_outstanding.get()
    }

    /// Copy host bytes into the buffer. Caller has checked the range and
    /// made sure no device work touches the buffer.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        debug_assert!(self.check_range(offset, data.len() as u64).is_ok());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.as_ptr().add(offset as usize),
                data.len(),
            );
        }
    }

    /// Copy buffer bytes to the host. Same preconditions as `write_bytes`.
    pub fn read_bytes(&self, offset: u64, dest: &mut [u8]) {
        debug_assert!(self.check_range(offset, dest.len() as u64).is_ok());
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapped.as_ptr().add(offset as usize),
                dest.as_mut_ptr(),
                dest.len(),
            );
        }
    }
}

impl Drop for BufferAlloc {
    fn drop(&mut self) {
        log::debug!("Destroying buffer (size={})", self.size);
        unsafe {
            self.gpu.device.unmap_memory(self.memory);
            self.gpu.device.destroy_buffer(self.buffer, None);
            self.gpu.device.free_memory(self.memory, None);
        }
    }
}

/// Caller-owned storage buffer.
///
/// Dropping (or [`destroy`](Self::destroy)-ing) the handle releases the
/// caller's reference. Slots it is still bound to, and batches still in
/// flight, keep the storage alive until they let go of it.
pub struct Buffer {
    pub(crate) alloc: Arc<BufferAlloc>,
}

impl Buffer {
    /// Size in bytes, fixed at creation
    pub fn size(&self) -> u64 {
        self.alloc.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.alloc.usage
    }

    /// Raw handle for interop with other Vulkan code
    pub fn handle(&self) -> vk::Buffer {
        self.alloc.buffer
    }

    pub fn is_mapped(&self) -> bool {
        self.alloc.is_mapped()
    }

    pub fn destroy(self) {}
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.alloc.size)
            .field("usage", &self.alloc.usage)
            .finish()
    }
}

/// Scoped host view of a buffer; unmapped on drop.
///
/// Only one mapping per buffer may exist at a time. While it exists, reads,
/// writes and dispatches that touch the buffer are refused.
pub struct BufferMapping<'a> {
    alloc: &'a BufferAlloc,
    access: MapAccess,
}

impl<'a> BufferMapping<'a> {
    pub(crate) fn new(alloc: &'a BufferAlloc, access: MapAccess) -> Result<Self> {
        if alloc.map_outstanding.replace(true) {
            return Err(ComputeError::Misuse("Buffer is already mapped".to_string()));
        }
        Ok(Self { alloc, access })
    }

    pub fn access(&self) -> MapAccess {
        self.access
    }

    pub fn len(&self) -> usize {
        self.alloc.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.alloc.size == 0
    }

    pub fn as_slice(&self) -> Result<&[u8]> {
        if !self.access.readable() {
            return Err(ComputeError::Misuse("Mapping is write-only".to_string()));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.alloc.mapped.as_ptr(), self.len()) })
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.access.writable() {
            return Err(ComputeError::Misuse("Mapping is read-only".to_string()));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.alloc.mapped.as_ptr(), self.len()) })
    }

    pub fn unmap(self) {}
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        self.alloc.map_outstanding.set(false);
        log::debug!("Buffer unmapped");
    }
}

/// `offset + len <= size`, without overflow, and `len > 0`
pub fn check_range(size: u64, offset: u64, len: u64) -> Result<()> {
    if len == 0 {
        return Err(ComputeError::InvalidArgument(
            "Transfer size must be positive".to_string(),
        ));
    }
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ComputeError::InvalidArgument(format!(
            "Range {}..{} exceeds buffer size {}",
            offset,
            offset.saturating_add(len),
            size
        ))),
    }
}

/// Find suitable memory type for an allocation.
///
/// Returns the first type supported by `type_filter` that has all
/// `properties`, or `None`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// `preferred` if any type offers it, else `required`.
pub fn choose_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    preferred: vk::MemoryPropertyFlags,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    find_memory_type(memory_properties, type_filter, preferred)
        .or_else(|| find_memory_type(memory_properties, type_filter, required))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_coherent() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn test_find_memory_type() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags = host_coherent();

        assert_eq!(find_memory_type(&props, 0b11, host_coherent()), Some(1));
    }

    #[test]
    fn test_find_memory_type_no_match() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 1;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        assert_eq!(
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn test_find_memory_type_respects_filter() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = host_coherent();
        props.memory_types[1].property_flags = host_coherent();

        assert_eq!(find_memory_type(&props, 0b10, host_coherent()), Some(1));
    }

    #[test]
    fn test_usage_hint_falls_back() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags = host_coherent();

        for usage in [BufferUsage::Static, BufferUsage::Dynamic, BufferUsage::Stream] {
            let index = choose_memory_type(&props, 0b11, usage.preferred_memory(), host_coherent());
            assert_eq!(index, Some(1), "{:?} must land on host-visible memory", usage);
        }
    }

    #[test]
    fn test_usage_hint_prefers_device_local_for_static() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = host_coherent();
        props.memory_types[1].property_flags =
            host_coherent() | vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let static_index = choose_memory_type(
            &props,
            0b11,
            BufferUsage::Static.preferred_memory(),
            host_coherent(),
        );
        let stream_index = choose_memory_type(
            &props,
            0b11,
            BufferUsage::Stream.preferred_memory(),
            host_coherent(),
        );
        assert_eq!(static_index, Some(1));
        assert_eq!(stream_index, Some(0));
    }

    #[test]
    fn test_default_usage_is_dynamic() {
        assert_eq!(BufferUsage::default(), BufferUsage::Dynamic);
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(16, 0, 16).is_ok());
        assert!(check_range(16, 12, 4).is_ok());
        assert!(check_range(16, 12, 5).is_err());
        assert!(check_range(16, 0, 0).is_err());
        assert!(check_range(16, u64::MAX, 2).is_err());
    }

    #[test]
    fn test_map_access() {
        assert!(MapAccess::Read.readable() && !MapAccess::Read.writable());
        assert!(!MapAccess::Write.readable() && MapAccess::Write.writable());
        assert!(MapAccess::ReadWrite.readable() && MapAccess::ReadWrite.writable());
    }
}
