//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::backend::DeviceCapabilities;
use crate::error::GraphicsError;
use crate::types::{Extent2d, SampleCountFlags};

use super::instance::REQUIRED_API_VERSION;

/// Select the best physical device for offscreen rendering.
///
/// Devices without Vulkan 1.3, timeline semaphores, synchronization2 or
/// dynamic rendering are skipped. Prefers discrete GPUs over integrated GPUs.
pub fn select_physical_device(
    instance: &ash::Instance,
) -> Result<vk::PhysicalDevice, GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best_device = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {:?}: Vulkan 1.3 not supported", device_name);
            continue;
        }
        if !supports_required_features(instance, device) {
            log::info!("Skipping GPU {:?}: missing required features", device_name);
            continue;
        }

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device
        .ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

fn supports_required_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut features_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features_13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features_12)
        .push_next(&mut features_13);
    unsafe { instance.get_physical_device_features2(device, &mut features) };

    features_12.timeline_semaphore == vk::TRUE
        && features_13.synchronization2 == vk::TRUE
        && features_13.dynamic_rendering == vk::TRUE
}

/// Find a queue family that supports graphics operations.
pub fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32, GraphicsError> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
        .ok_or_else(|| {
            GraphicsError::InitializationFailed("No graphics queue family found".to_string())
        })
}

/// Create a logical device with a single graphics queue.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&queue_priorities)];

    let mut vulkan_12_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .push_next(&mut vulkan_12_features)
        .push_next(&mut vulkan_13_features);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

/// Limits the surfaces rely on.
pub fn query_capabilities(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> DeviceCapabilities {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let granularity = families
        .get(queue_family_index as usize)
        .map(|family| family.min_image_transfer_granularity)
        .unwrap_or(vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        });

    // Attachments must be renderable at the count, and resolvable.
    let counts = properties.limits.framebuffer_color_sample_counts;
    let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    DeviceCapabilities {
        device_name,
        sample_counts: SampleCountFlags::from_bits_truncate(counts.as_raw())
            | SampleCountFlags::X1,
        transfer_granularity: Extent2d::new(granularity.width, granularity.height),
        queue_family_index,
        max_image_dimension: properties.limits.max_image_dimension2_d,
    }
}
