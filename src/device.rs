//! Vulkan instance and logical device ownership
//!
//! The loader is loaded once per process and never unloaded. Everything
//! below it (instance, device) lives in [`Gpu`], which every resource holds
//! through an `Arc`: the device is torn down only after the context and all
//! caller-owned buffers, images and programs are gone.

use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use std::sync::OnceLock;

use crate::error::{ComputeError, Result};

static ENTRY: OnceLock<std::result::Result<Entry, String>> = OnceLock::new();

/// Process-wide Vulkan loader. A failed load is remembered.
pub fn entry() -> Result<&'static Entry> {
    let loaded = ENTRY.get_or_init(|| {
        let result = unsafe { Entry::load() }.map_err(|e| format!("Failed to load Vulkan: {}", e));
        match &result {
            Ok(_) => log::info!("Vulkan loader initialized"),
            Err(msg) => log::error!("{}", msg),
        }
        result
    });

    match loaded {
        Ok(entry) => Ok(entry),
        Err(msg) => Err(ComputeError::InitializationFailed(msg.clone())),
    }
}

/// `actual >= required`, compared as (major, minor)
pub fn version_at_least(actual: (u32, u32), required: (u32, u32)) -> bool {
    actual >= required
}

/// Instance, device and the physical-device facts the rest of the crate needs
pub struct Gpu {
    pub instance: Instance,
    pub device: Device,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_family: u32,
    pub timestamp_valid_bits: u32,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    queue_family: u32,
    timestamp_valid_bits: u32,
}

impl Gpu {
    /// Create an instance and a device with one compute queue supporting at
    /// least Vulkan `major.minor`.
    pub fn new(app_name: &str, major: u32, minor: u32) -> Result<Self> {
        if major == 0 {
            return Err(ComputeError::InvalidArgument(format!(
                "Invalid API version {}.{}",
                major, minor
            )));
        }

        let entry = entry()?;

        let instance_version = unsafe { entry.try_enumerate_instance_version() }
            .map_err(ComputeError::from)?
            .unwrap_or(vk::API_VERSION_1_0);
        let available = (
            vk::api_version_major(instance_version),
            vk::api_version_minor(instance_version),
        );
        if !version_at_least(available, (major, minor)) {
            return Err(ComputeError::InitializationFailed(format!(
                "Vulkan instance version {}.{} is below requested {}.{}",
                available.0, available.1, major, minor
            )));
        }

        let app_name = CString::new(app_name).map_err(|e| {
            ComputeError::InvalidArgument(format!("Invalid application name: {}", e))
        })?;
        let engine_name = c"hlx-compute";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, major, minor, 0));

        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            ComputeError::InitializationFailed(format!("Failed to create instance: {:?}", e))
        })?;

        match Self::open_device(&instance, major, minor) {
            Ok((candidate, device, memory_properties)) => {
                let name = device_name(&candidate.properties);
                log::info!(
                    "Opened GPU '{}' (Vulkan {}.{}), compute queue family {}",
                    name,
                    vk::api_version_major(candidate.properties.api_version),
                    vk::api_version_minor(candidate.properties.api_version),
                    candidate.queue_family
                );
                Ok(Self {
                    instance,
                    device,
                    physical_device: candidate.physical_device,
                    properties: candidate.properties,
                    memory_properties,
                    queue_family: candidate.queue_family,
                    timestamp_valid_bits: candidate.timestamp_valid_bits,
                })
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn open_device(
        instance: &Instance,
        major: u32,
        minor: u32,
    ) -> Result<(Candidate, Device, vk::PhysicalDeviceMemoryProperties)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
            ComputeError::InitializationFailed(format!("Failed to enumerate devices: {:?}", e))
        })?;

        let mut candidates: Vec<Candidate> = physical_devices
            .into_iter()
            .filter_map(|pd| Self::inspect(instance, pd, major, minor))
            .collect();

        // Discrete GPUs first, then anything else that qualifies
        candidates.sort_by_key(|c| c.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU);

        let candidate = candidates
            .into_iter()
            .next()
            .ok_or(ComputeError::NoSuitableDevice(major, minor))?;

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(candidate.queue_family)
            .queue_priorities(&queue_priorities);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe {
            instance.create_device(candidate.physical_device, &device_create_info, None)
        }
        .map_err(|e| ComputeError::InitializationFailed(format!("Failed to create device: {:?}", e)))?;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(candidate.physical_device) };

        Ok((candidate, device, memory_properties))
    }

    fn inspect(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        major: u32,
        minor: u32,
    ) -> Option<Candidate> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let supported = (
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
        );
        if !version_at_least(supported, (major, minor)) {
            log::debug!(
                "Skipping '{}': Vulkan {}.{} < {}.{}",
                device_name(&properties),
                supported.0,
                supported.1,
                major,
                minor
            );
            return None;
        }

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        // Prefer a compute family that can also write timestamps
        let (queue_family, family) = families
            .iter()
            .enumerate()
            .filter(|(_, f)| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .max_by_key(|(_, f)| f.timestamp_valid_bits > 0)?;

        Some(Candidate {
            physical_device,
            properties,
            queue_family: queue_family as u32,
            timestamp_valid_bits: family.timestamp_valid_bits,
        })
    }

    pub fn api_version(&self) -> (u32, u32) {
        (
            vk::api_version_major(self.properties.api_version),
            vk::api_version_minor(self.properties.api_version),
        )
    }

    pub fn name(&self) -> String {
        device_name(&self.properties)
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn queue(&self) -> vk::Queue {
        unsafe { self.device.get_device_queue(self.queue_family, 0) }
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    properties
        .device_name_as_c_str()
        .map(CStr::to_string_lossy)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| "<unnamed>".to_string())
}

impl Drop for Gpu {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan device and instance");
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
