//! GPU memory through gpu-allocator.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;

use crate::error::GraphicsError;

/// Create a memory allocator for the Vulkan device.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> Result<Allocator, GraphicsError> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })
}

/// Allocate and bind memory for a buffer.
pub fn bind_buffer(
    device: &ash::Device,
    allocator: &Mutex<Allocator>,
    buffer: vk::Buffer,
    name: &str,
    location: MemoryLocation,
) -> Result<Allocation, GraphicsError> {
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let allocation = allocator
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to allocate memory for {name}: {e}"
            ))
        })?;

    let bound = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) };
    if let Err(e) = bound {
        free(allocator, allocation);
        return Err(GraphicsError::ResourceCreationFailed(format!(
            "Failed to bind memory for {name}: {e:?}"
        )));
    }
    Ok(allocation)
}

/// Allocate and bind device-local memory for an image.
pub fn bind_image(
    device: &ash::Device,
    allocator: &Mutex<Allocator>,
    image: vk::Image,
    name: &str,
) -> Result<Allocation, GraphicsError> {
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let allocation = allocator
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to allocate memory for {name}: {e}"
            ))
        })?;

    let bound = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) };
    if let Err(e) = bound {
        free(allocator, allocation);
        return Err(GraphicsError::ResourceCreationFailed(format!(
            "Failed to bind memory for {name}: {e:?}"
        )));
    }
    Ok(allocation)
}

/// Return an allocation, logging instead of failing.
pub fn free(allocator: &Mutex<Allocator>, allocation: Allocation) {
    if let Err(e) = allocator.lock().free(allocation) {
        log::error!("Failed to free allocation: {}", e);
    }
}
