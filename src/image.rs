//! Storage images (2D/3D)
//!
//! Images are device-local with optimal tiling and sit in `GENERAL` layout
//! from the end of their creation batch onwards, so kernels can read and
//! write them through `imageLoad`/`imageStore` and transfers can copy in
//! and out without further transitions. Host data always moves through a
//! short-lived staging buffer.

use ash::vk;
use std::sync::Arc;

use crate::buffer::BufferAlloc;
use crate::buffer::BufferUsage;
use crate::command::{CommandRecorder, Retained};
use crate::device::Gpu;
use crate::error::{ComputeError, Result};

/// Image element format: 32-bit float, signed or unsigned integer with
/// 1, 2 or 4 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R32F,
    Rg32F,
    Rgba32F,
    R32I,
    Rg32I,
    Rgba32I,
    R32UI,
    Rg32UI,
    Rgba32UI,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 9] = [
        ImageFormat::R32F,
        ImageFormat::Rg32F,
        ImageFormat::Rgba32F,
        ImageFormat::R32I,
        ImageFormat::Rg32I,
        ImageFormat::Rgba32I,
        ImageFormat::R32UI,
        ImageFormat::Rg32UI,
        ImageFormat::Rgba32UI,
    ];

    pub fn channels(self) -> u32 {
        match self {
            ImageFormat::R32F | ImageFormat::R32I | ImageFormat::R32UI => 1,
            ImageFormat::Rg32F | ImageFormat::Rg32I | ImageFormat::Rg32UI => 2,
            ImageFormat::Rgba32F | ImageFormat::Rgba32I | ImageFormat::Rgba32UI => 4,
        }
    }

    /// Bytes per texel
    pub fn texel_size(self) -> u32 {
        self.channels() * 4
    }

    pub fn vk_format(self) -> vk::Format {
        match self {
            ImageFormat::R32F => vk::Format::R32_SFLOAT,
            ImageFormat::Rg32F => vk::Format::R32G32_SFLOAT,
            ImageFormat::Rgba32F => vk::Format::R32G32B32A32_SFLOAT,
            ImageFormat::R32I => vk::Format::R32_SINT,
            ImageFormat::Rg32I => vk::Format::R32G32_SINT,
            ImageFormat::Rgba32I => vk::Format::R32G32B32A32_SINT,
            ImageFormat::R32UI => vk::Format::R32_UINT,
            ImageFormat::Rg32UI => vk::Format::R32G32_UINT,
            ImageFormat::Rgba32UI => vk::Format::R32G32B32A32_UINT,
        }
    }

    /// GLSL layout qualifier for this format
    pub fn glsl_name(self) -> &'static str {
        match self {
            ImageFormat::R32F => "r32f",
            ImageFormat::Rg32F => "rg32f",
            ImageFormat::Rgba32F => "rgba32f",
            ImageFormat::R32I => "r32i",
            ImageFormat::Rg32I => "rg32i",
            ImageFormat::Rgba32I => "rgba32i",
            ImageFormat::R32UI => "r32ui",
            ImageFormat::Rg32UI => "rg32ui",
            ImageFormat::Rgba32UI => "rgba32ui",
        }
    }

    /// Map a SPIR-V `ImageFormat` operand; `None` for Unknown or formats
    /// this crate does not create.
    pub fn from_spirv(value: u32) -> Option<Self> {
        match value {
            1 => Some(ImageFormat::Rgba32F),
            3 => Some(ImageFormat::R32F),
            6 => Some(ImageFormat::Rg32F),
            21 => Some(ImageFormat::Rgba32I),
            24 => Some(ImageFormat::R32I),
            25 => Some(ImageFormat::Rg32I),
            30 => Some(ImageFormat::Rgba32UI),
            33 => Some(ImageFormat::R32UI),
            35 => Some(ImageFormat::Rg32UI),
            _ => None,
        }
    }

    /// Format for a GLSL layout qualifier such as `rgba32f`
    pub fn from_glsl_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.glsl_name() == name)
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.glsl_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDim {
    D2,
    D3,
}

/// Bytes needed to fill a `width x height x depth` image of `format`.
pub fn image_byte_len(extent: vk::Extent3D, format: ImageFormat) -> u64 {
    extent.width as u64 * extent.height as u64 * extent.depth as u64 * format.texel_size() as u64
}

const STORAGE_SUBRESOURCE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub(crate) struct ImageAlloc {
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: ImageFormat,
    pub dim: ImageDim,
    pub extent: vk::Extent3D,
    pub gpu: Arc<Gpu>,
}

impl ImageAlloc {
    pub fn new(gpu: Arc<Gpu>, dim: ImageDim, extent: vk::Extent3D, format: ImageFormat) -> Result<Self> {
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(ComputeError::InvalidArgument(
                "Invalid image dimensions".to_string(),
            ));
        }

        let features = gpu.format_properties(format.vk_format()).optimal_tiling_features;
        if !features.contains(vk::FormatFeatureFlags::STORAGE_IMAGE) {
            return Err(ComputeError::OutOfMemory(format!(
                "Format {} does not support storage images on this device",
                format
            )));
        }

        let limits = gpu.limits();
        let max = match dim {
            ImageDim::D2 => [limits.max_image_dimension2_d; 3],
            ImageDim::D3 => [limits.max_image_dimension3_d; 3],
        };
        if extent.width > max[0] || extent.height > max[1] || extent.depth > max[2] {
            return Err(ComputeError::InvalidArgument(format!(
                "Image {}x{}x{} exceeds device limit {}",
                extent.width, extent.height, extent.depth, max[0]
            )));
        }

        let (image_type, view_type) = match dim {
            ImageDim::D2 => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D),
            ImageDim::D3 => (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D),
        };

        let device = &gpu.device;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(format.vk_format())
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }.map_err(|e| {
            ComputeError::OutOfMemory(format!("Failed to create VkImage: {:?}", e))
        })?;

        // Null handles below are skipped by Drop's destroy calls
        let mut alloc = Self {
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            format,
            dim,
            extent,
            gpu: gpu.clone(),
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = crate::buffer::find_memory_type(
            &gpu.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .or_else(|| {
            crate::buffer::find_memory_type(
                &gpu.memory_properties,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::empty(),
            )
        })
        .ok_or_else(|| ComputeError::OutOfMemory("No memory type found for image".to_string()))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        alloc.memory = unsafe { device.allocate_memory(&alloc_info, None) }.map_err(|e| {
            ComputeError::OutOfMemory(format!("Failed to allocate image memory: {:?}", e))
        })?;

        unsafe { device.bind_image_memory(image, alloc.memory, 0) }?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format.vk_format())
            .subresource_range(STORAGE_SUBRESOURCE);

        alloc.view = unsafe { device.create_image_view(&view_info, None) }?;

        log::debug!(
            "Created {:?} image {}x{}x{} format={}",
            dim,
            extent.width,
            extent.height,
            extent.depth,
            format
        );

        Ok(alloc)
    }

    pub fn byte_len(&self) -> u64 {
        image_byte_len(self.extent, self.format)
    }

    fn copy_region(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D::default())
            .image_extent(self.extent)
    }
}

impl Drop for ImageAlloc {
    fn drop(&mut self) {
        log::debug!("Destroying image ({}x{}x{})", self.extent.width, self.extent.height, self.extent.depth);
        unsafe {
            self.gpu.device.destroy_image_view(self.view, None);
            self.gpu.device.destroy_image(self.image, None);
            self.gpu.device.free_memory(self.memory, None);
        }
    }
}

/// Host-visible staging buffer for image transfers
pub(crate) fn staging_buffer(gpu: &Arc<Gpu>, size: u64, data: Option<&[u8]>) -> Result<Arc<BufferAlloc>> {
    BufferAlloc::new(
        gpu.clone(),
        size,
        BufferUsage::Stream,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        data,
    )
    .map(Arc::new)
}

fn layout_barrier<'a>(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'a> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(STORAGE_SUBRESOURCE)
}

/// Record the initial transition to `GENERAL`, filling the image from
/// `staging` or clearing it to zero.
pub(crate) fn record_initialize(
    recorder: &mut CommandRecorder,
    image: &Arc<ImageAlloc>,
    staging: Option<Arc<BufferAlloc>>,
) -> Result<()> {
    let device = recorder.device().clone();
    let cmd = recorder.command_buffer()?;

    let to_transfer = layout_barrier(
        image.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::AccessFlags::empty(),
        vk::AccessFlags::TRANSFER_WRITE,
    );
    let to_general = layout_barrier(
        image.image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::GENERAL,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::AccessFlags::SHADER_READ
            | vk::AccessFlags::SHADER_WRITE
            | vk::AccessFlags::TRANSFER_READ
            | vk::AccessFlags::TRANSFER_WRITE,
    );

    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );

        match &staging {
            Some(staging) => device.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[image.copy_region()],
            ),
            None => device.device.cmd_clear_color_image(
                cmd,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { uint32: [0; 4] },
                &[STORAGE_SUBRESOURCE],
            ),
        }

        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_general],
        );
    }

    recorder.retain(Retained::Image(image.clone()));
    if let Some(staging) = staging {
        recorder.retain(Retained::Buffer(staging));
    }
    Ok(())
}

/// Record a full-image upload from `staging` (image stays in `GENERAL`).
pub(crate) fn record_upload(
    recorder: &mut CommandRecorder,
    image: &Arc<ImageAlloc>,
    staging: Arc<BufferAlloc>,
) -> Result<()> {
    let device = recorder.device().clone();
    let cmd = recorder.command_buffer()?;

    let before = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);
    let after = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);

    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[before],
            &[],
            &[],
        );
        device.device.cmd_copy_buffer_to_image(
            cmd,
            staging.buffer,
            image.image,
            vk::ImageLayout::GENERAL,
            &[image.copy_region()],
        );
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[after],
            &[],
            &[],
        );
    }

    recorder.retain(Retained::Image(image.clone()));
    recorder.retain(Retained::Buffer(staging));
    Ok(())
}

/// Record a full-image copy into `staging`.
pub(crate) fn record_download(
    recorder: &mut CommandRecorder,
    image: &Arc<ImageAlloc>,
    staging: &Arc<BufferAlloc>,
) -> Result<()> {
    let device = recorder.device().clone();
    let cmd = recorder.command_buffer()?;

    let before = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ);

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
        device.device.cmd_copy_image_to_buffer(
            cmd,
            image.image,
            vk::ImageLayout::GENERAL,
            staging.buffer,
            &[image.copy_region()],
        );
    }

    recorder.retain(Retained::Image(image.clone()));
    recorder.retain(Retained::Buffer(staging.clone()));
    Ok(())
}

/// Caller-owned 2D or 3D storage image
pub struct Image {
    pub(crate) alloc: Arc<ImageAlloc>,
}

impl Image {
    pub fn format(&self) -> ImageFormat {
        self.alloc.format
    }

    pub fn dim(&self) -> ImageDim {
        self.alloc.dim
    }

    pub fn width(&self) -> u32 {
        self.alloc.extent.width
    }

    pub fn height(&self) -> u32 {
        self.alloc.extent.height
    }

    /// 1 for 2D images
    pub fn depth(&self) -> u32 {
        self.alloc.extent.depth
    }

    /// Size of a full-image transfer in bytes
    pub fn byte_len(&self) -> u64 {
        self.alloc.byte_len()
    }

    pub fn handle(&self) -> vk::Image {
        self.alloc.image
    }

    pub fn destroy(self) {}
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("dim", &self.alloc.dim)
            .field("extent", &(self.width(), self.height(), self.depth()))
            .field("format", &self.alloc.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texel_sizes() {
        assert_eq!(ImageFormat::R32F.texel_size(), 4);
        assert_eq!(ImageFormat::Rg32I.texel_size(), 8);
        assert_eq!(ImageFormat::Rgba32UI.texel_size(), 16);
    }

    #[test]
    fn test_vk_formats_distinct() {
        let mut formats: Vec<i32> = ImageFormat::ALL.iter().map(|f| f.vk_format().as_raw()).collect();
        formats.sort();
        formats.dedup();
        assert_eq!(formats.len(), ImageFormat::ALL.len());
    }

    #[test]
    fn test_spirv_format_mapping() {
        assert_eq!(ImageFormat::from_spirv(1), Some(ImageFormat::Rgba32F));
        assert_eq!(ImageFormat::from_spirv(33), Some(ImageFormat::R32UI));
        assert_eq!(ImageFormat::from_spirv(0), None);
        // Rgba8 is a valid SPIR-V format this crate never creates
        assert_eq!(ImageFormat::from_spirv(4), None);
    }

    #[test]
    fn test_glsl_names_round_trip() {
        for format in ImageFormat::ALL {
            assert_eq!(ImageFormat::from_glsl_name(format.glsl_name()), Some(format));
        }
        assert_eq!(ImageFormat::from_glsl_name("rgba8"), None);
    }

    #[test]
    fn test_image_byte_len() {
        let extent = vk::Extent3D { width: 4, height: 3, depth: 2 };
        assert_eq!(image_byte_len(extent, ImageFormat::Rgba32F), 4 * 3 * 2 * 16);
    }
}
