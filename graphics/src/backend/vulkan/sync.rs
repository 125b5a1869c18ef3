//! Vulkan semaphores and fences.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::backend::SemaphoreKind;
use crate::error::GraphicsError;

use super::deferred::{DeferredDestructor, DeferredResource};

/// A binary or timeline semaphore.
pub struct VulkanSemaphore {
    pub semaphore: vk::Semaphore,
    pub kind: SemaphoreKind,
    deferred: Arc<DeferredDestructor>,
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        self.deferred.queue(DeferredResource::Semaphore(self.semaphore));
    }
}

/// A fence signaled when a submission batch completed.
pub struct VulkanFence {
    pub fence: vk::Fence,
    deferred: Arc<DeferredDestructor>,
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        self.deferred.queue(DeferredResource::Fence(self.fence));
    }
}

/// Create a semaphore. Timeline semaphores start at zero.
pub fn create_semaphore(
    device: &ash::Device,
    kind: SemaphoreKind,
    deferred: &Arc<DeferredDestructor>,
) -> Result<VulkanSemaphore, GraphicsError> {
    Ok(VulkanSemaphore {
        semaphore: create_raw_semaphore(device, kind)?,
        kind,
        deferred: Arc::clone(deferred),
    })
}

/// Create an unmanaged semaphore; the caller destroys it.
pub fn create_raw_semaphore(
    device: &ash::Device,
    kind: SemaphoreKind,
) -> Result<vk::Semaphore, GraphicsError> {
    let semaphore_type = match kind {
        SemaphoreKind::Timeline => vk::SemaphoreType::TIMELINE,
        SemaphoreKind::Binary => vk::SemaphoreType::BINARY,
    };
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(semaphore_type)
        .initial_value(0);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

    unsafe { device.create_semaphore(&create_info, None) }.map_err(|e| {
        GraphicsError::ResourceCreationFailed(format!("Failed to create semaphore: {:?}", e))
    })
}

pub fn create_fence(
    device: &ash::Device,
    signaled: bool,
    deferred: &Arc<DeferredDestructor>,
) -> Result<VulkanFence, GraphicsError> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
        .map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create fence: {:?}", e))
        })?;

    Ok(VulkanFence {
        fence,
        deferred: Arc::clone(deferred),
    })
}

/// Vulkan timeouts are in nanoseconds; `None` waits forever.
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

/// Map a failed wait: timeouts are not errors.
pub fn wait_result(result: Result<(), vk::Result>, what: &str) -> Result<bool, GraphicsError> {
    match result {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(vk::Result::ERROR_DEVICE_LOST) => Err(GraphicsError::DeviceLost),
        Err(e) => Err(GraphicsError::Internal(format!("{what} failed: {:?}", e))),
    }
}

/// Block until a timeline semaphore reaches `value`.
pub fn wait_timeline(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
    timeout: Option<Duration>,
) -> Result<bool, GraphicsError> {
    let semaphores = [semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);
    let result = unsafe { device.wait_semaphores(&wait_info, timeout_ns(timeout)) };
    wait_result(result, "semaphore wait")
}

pub fn timeline_value(device: &ash::Device, semaphore: vk::Semaphore) -> Result<u64, GraphicsError> {
    unsafe { device.get_semaphore_counter_value(semaphore) }.map_err(|e| match e {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        e => GraphicsError::Internal(format!("semaphore query failed: {:?}", e)),
    })
}
