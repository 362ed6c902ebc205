//! Compute programs: pipeline objects created from reflected SPIR-V
//!
//! Buffers live in descriptor set 0 and images in set 1, with the binding
//! number equal to the slot. Uniforms are the members of the single
//! push-constant block.

use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

use crate::device::Gpu;
use crate::error::{ComputeError, Result};
use crate::reflect::{BindingKind, ProgramInterface};

/// Descriptor set holding buffer slots
pub const BUFFER_SET: u32 = 0;

/// Descriptor set holding image slots
pub const IMAGE_SET: u32 = 1;

/// Pipeline, layouts and interface of one compiled program
pub(crate) struct ProgramObjects {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layouts: [vk::DescriptorSetLayout; 2],
    pub interface: ProgramInterface,
    pub gpu: Arc<Gpu>,
}

impl ProgramObjects {
    /// Create a pipeline for `words`, whose interface has already been
    /// reflected. Partially created objects are released on failure.
    pub fn new(gpu: Arc<Gpu>, words: &[u32], interface: ProgramInterface) -> Result<Self> {
        validate_interface(&interface, gpu.limits())?;

        log::info!(
            "Creating compute pipeline: entry={}, local_size={:?}, bindings={}, push_constants={} bytes",
            interface.entry_point,
            interface.local_size,
            interface.bindings.len(),
            interface.push_constant_size
        );

        // Null handles are skipped by Drop, so early returns clean up
        let mut objects = Self {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            set_layouts: [vk::DescriptorSetLayout::null(); 2],
            interface,
            gpu,
        };

        for set in [BUFFER_SET, IMAGE_SET] {
            let bindings = layout_bindings(&objects.interface, set);
            objects.set_layouts[set as usize] =
                create_descriptor_set_layout(&objects.gpu, &bindings)?;
        }

        objects.layout = create_pipeline_layout(
            &objects.gpu,
            &objects.set_layouts,
            objects.interface.push_constant_size,
        )?;

        objects.pipeline = create_compute_pipeline(
            &objects.gpu,
            words,
            &objects.interface.entry_point,
            objects.layout,
        )?;

        log::info!("Compute pipeline created");
        Ok(objects)
    }
}

impl Drop for ProgramObjects {
    fn drop(&mut self) {
        log::debug!("Dropping compute pipeline '{}'", self.interface.entry_point);
        unsafe {
            let device = &self.gpu.device;
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            for layout in self.set_layouts {
                device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

/// Reject interfaces the device or the slot conventions cannot support.
pub(crate) fn validate_interface(
    interface: &ProgramInterface,
    limits: &vk::PhysicalDeviceLimits,
) -> Result<()> {
    let size = interface.local_size;
    if size.iter().any(|&n| n == 0) {
        return Err(ComputeError::Link(format!(
            "Invalid local size {:?}",
            size
        )));
    }
    for axis in 0..3 {
        if size[axis] > limits.max_compute_work_group_size[axis] {
            return Err(ComputeError::Link(format!(
                "Local size {:?} exceeds device limit {:?}",
                size, limits.max_compute_work_group_size
            )));
        }
    }
    let invocations = size.iter().map(|&n| n as u64).product::<u64>();
    if invocations > limits.max_compute_work_group_invocations as u64 {
        return Err(ComputeError::Link(format!(
            "Local size {:?} has {} invocations, device allows {}",
            size, invocations, limits.max_compute_work_group_invocations
        )));
    }

    if interface.push_constant_size > limits.max_push_constants_size {
        return Err(ComputeError::Link(format!(
            "Push-constant block is {} bytes, device allows {}",
            interface.push_constant_size, limits.max_push_constants_size
        )));
    }

    for binding in &interface.bindings {
        let expected_set = match binding.kind {
            BindingKind::StorageBuffer | BindingKind::UniformBuffer => BUFFER_SET,
            BindingKind::StorageImage { .. } => IMAGE_SET,
        };
        if binding.set != expected_set {
            return Err(ComputeError::Link(format!(
                "{:?} at set {} binding {} must be declared in set {}",
                binding.kind, binding.set, binding.binding, expected_set
            )));
        }
    }

    Ok(())
}

fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub(crate) fn layout_bindings(
    interface: &ProgramInterface,
    set: u32,
) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    interface
        .bindings_in_set(set)
        .map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.binding)
                .descriptor_type(descriptor_type(b.kind))
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        })
        .collect()
}

fn create_descriptor_set_layout(
    gpu: &Gpu,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<vk::DescriptorSetLayout> {
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

    let layout = unsafe { gpu.device.create_descriptor_set_layout(&layout_info, None) }
        .map_err(|e| {
            ComputeError::Link(format!("Failed to create descriptor set layout: {:?}", e))
        })?;

    log::debug!("Created descriptor set layout with {} bindings", bindings.len());
    Ok(layout)
}

fn create_pipeline_layout(
    gpu: &Gpu,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
) -> Result<vk::PipelineLayout> {
    let push_constant_ranges = if push_constant_size > 0 {
        vec![vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size)]
    } else {
        vec![]
    };

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(&push_constant_ranges);

    let layout = unsafe { gpu.device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| ComputeError::Link(format!("Failed to create pipeline layout: {:?}", e)))?;

    log::debug!(
        "Created pipeline layout: {} descriptor sets, {} push constant bytes",
        set_layouts.len(),
        push_constant_size
    );
    Ok(layout)
}

fn create_compute_pipeline(
    gpu: &Gpu,
    words: &[u32],
    entry_point: &str,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let entry_point = CString::new(entry_point)
        .map_err(|e| ComputeError::Link(format!("Invalid entry point name: {}", e)))?;

    let module_info = vk::ShaderModuleCreateInfo::default().code(words);
    let module = unsafe { gpu.device.create_shader_module(&module_info, None) }
        .map_err(|e| ComputeError::Link(format!("Failed to create shader module: {:?}", e)))?;

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry_point);

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout);

    let created = unsafe {
        gpu.device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    // The pipeline keeps its own copy of the code
    unsafe { gpu.device.destroy_shader_module(module, None) };

    let pipelines = created.map_err(|(_, e)| {
        ComputeError::Link(format!("Failed to create compute pipeline: {:?}", e))
    })?;

    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| ComputeError::Link("Driver returned no pipeline".to_string()))
}

/// A compiled, linked compute program. Immutable once created.
///
/// Cloning is cheap and shares the pipeline; the objects are destroyed when
/// the last clone and the last batch using them are gone.
#[derive(Clone)]
pub struct Program {
    pub(crate) inner: Arc<ProgramObjects>,
}

impl Program {
    pub(crate) fn new(objects: ProgramObjects) -> Self {
        Self {
            inner: Arc::new(objects),
        }
    }

    /// Reflected bindings, local size and uniforms
    pub fn interface(&self) -> &ProgramInterface {
        &self.inner.interface
    }

    /// Workgroup size declared by `layout(local_size_x = ..)`
    pub fn local_size(&self) -> [u32; 3] {
        self.inner.interface.local_size
    }

    pub fn entry_point(&self) -> &str {
        &self.inner.interface.entry_point
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.inner.pipeline
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("entry_point", &self.inner.interface.entry_point)
            .field("local_size", &self.inner.interface.local_size)
            .field("bindings", &self.inner.interface.bindings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageDim, ImageFormat};
    use crate::reflect::{PushMember, ReflectedBinding};

    fn limits() -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            max_compute_work_group_size: [1024, 1024, 64],
            max_compute_work_group_invocations: 1024,
            max_push_constants_size: 128,
            ..Default::default()
        }
    }

    fn interface(local_size: [u32; 3]) -> ProgramInterface {
        ProgramInterface {
            entry_point: "main".to_string(),
            local_size,
            bindings: vec![
                ReflectedBinding {
                    set: 0,
                    binding: 0,
                    kind: BindingKind::StorageBuffer,
                },
                ReflectedBinding {
                    set: 0,
                    binding: 2,
                    kind: BindingKind::UniformBuffer,
                },
                ReflectedBinding {
                    set: 1,
                    binding: 0,
                    kind: BindingKind::StorageImage {
                        dim: ImageDim::D2,
                        format: Some(ImageFormat::Rgba32F),
                    },
                },
            ],
            push_constants: vec![PushMember {
                name: "scale".to_string(),
                offset: 0,
                size: 4,
            }],
            push_constant_size: 4,
        }
    }

    #[test]
    fn test_valid_interface_accepted() {
        assert!(validate_interface(&interface([256, 1, 1]), &limits()).is_ok());
    }

    #[test]
    fn test_local_size_beyond_limits_is_link_error() {
        let err = validate_interface(&interface([2048, 1, 1]), &limits()).unwrap_err();
        assert!(matches!(err, ComputeError::Link(_)));

        // Each axis fits, the product does not
        let err = validate_interface(&interface([64, 64, 1]), &limits()).unwrap_err();
        assert!(matches!(err, ComputeError::Link(_)));
    }

    #[test]
    fn test_push_constants_beyond_limits_is_link_error() {
        let mut iface = interface([64, 1, 1]);
        iface.push_constant_size = 256;
        assert!(matches!(
            validate_interface(&iface, &limits()),
            Err(ComputeError::Link(_))
        ));
    }

    #[test]
    fn test_buffer_outside_set_zero_rejected() {
        let mut iface = interface([64, 1, 1]);
        iface.bindings[0].set = 1;
        assert!(matches!(
            validate_interface(&iface, &limits()),
            Err(ComputeError::Link(_))
        ));
    }

    #[test]
    fn test_layout_bindings_per_set() {
        let iface = interface([64, 1, 1]);

        let buffers = layout_bindings(&iface, BUFFER_SET);
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(buffers[1].binding, 2);
        assert_eq!(buffers[1].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);

        let images = layout_bindings(&iface, IMAGE_SET);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(images[0].stage_flags, vk::ShaderStageFlags::COMPUTE);
    }
}
