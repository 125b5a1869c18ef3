//! Deferred destruction of Vulkan resources.
//!
//! Handles are dropped on the CPU while submitted work may still reference
//! them. Every submission signals the backend's retire timeline with a new
//! serial; a dropped resource is tagged with the last submitted serial and
//! destroyed once the timeline has passed it.
//!
//! ```text
//! drop(handle) ──► queue(resource, tag = submitted)
//!                          │
//! retire(completed) ──► destroy every resource with tag <= completed
//! ```

use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

use super::allocator;

/// A Vulkan resource pending destruction.
pub enum DeferredResource {
    Buffer {
        buffer: vk::Buffer,
        allocation: Option<Allocation>,
    },
    Image {
        image: vk::Image,
        views: Vec<vk::ImageView>,
        allocation: Option<Allocation>,
    },
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    CommandBuffer {
        pool: vk::CommandPool,
        buffer: vk::CommandBuffer,
    },
}

impl DeferredResource {
    /// Destroy the resource immediately.
    ///
    /// Allocations are returned to `allocator` if it is still alive.
    ///
    /// # Safety
    ///
    /// The GPU must no longer use the resource, and `pool` must not be in use
    /// by another thread when a command buffer is freed.
    unsafe fn destroy(self, device: &ash::Device, allocator: Option<&Mutex<Allocator>>) {
        let release = |allocation: Option<Allocation>| {
            if let (Some(allocation), Some(allocator)) = (allocation, allocator) {
                allocator::free(allocator, allocation);
            }
        };
        match self {
            DeferredResource::Buffer { buffer, allocation } => {
                release(allocation);
                unsafe { device.destroy_buffer(buffer, None) };
            }
            DeferredResource::Image {
                image,
                views,
                allocation,
            } => {
                release(allocation);
                for view in views {
                    unsafe { device.destroy_image_view(view, None) };
                }
                unsafe { device.destroy_image(image, None) };
            }
            DeferredResource::Fence(fence) => unsafe { device.destroy_fence(fence, None) },
            DeferredResource::Semaphore(semaphore) => unsafe {
                device.destroy_semaphore(semaphore, None)
            },
            DeferredResource::CommandBuffer { pool, buffer } => unsafe {
                device.free_command_buffers(pool, &[buffer])
            },
        }
    }
}

/// Holds dropped resources until the submissions that may use them completed.
pub struct DeferredDestructor {
    device: ash::Device,
    allocator: Weak<Mutex<Allocator>>,
    /// Command buffers are freed under the pool lock.
    command_pool: Weak<Mutex<vk::CommandPool>>,
    pending: Mutex<Vec<(u64, DeferredResource)>>,
    submitted: AtomicU64,
}

// SAFETY: the queued handles are plain Vulkan handles, and destruction is
// serialized through the `pending` lock.
unsafe impl Send for DeferredDestructor {}
unsafe impl Sync for DeferredDestructor {}

impl std::fmt::Debug for DeferredDestructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDestructor")
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

impl DeferredDestructor {
    pub fn new(
        device: ash::Device,
        allocator: Weak<Mutex<Allocator>>,
        command_pool: Weak<Mutex<vk::CommandPool>>,
    ) -> Self {
        Self {
            device,
            allocator,
            command_pool,
            pending: Mutex::new(Vec::new()),
            submitted: AtomicU64::new(0),
        }
    }

    /// Claim the serial the next submission signals.
    pub fn next_serial(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue a resource behind every submission made so far.
    pub fn queue(&self, resource: DeferredResource) {
        let tag = self.submitted.load(Ordering::SeqCst);
        self.pending.lock().push((tag, resource));
    }

    /// Destroy every resource whose submissions have all completed.
    ///
    /// # Safety
    ///
    /// `completed` must not exceed the serial the GPU actually reached.
    pub unsafe fn retire(&self, completed: u64) {
        let ready: Vec<DeferredResource> = {
            let mut pending = self.pending.lock();
            let (ready, kept): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(tag, _)| *tag <= completed);
            *pending = kept;
            ready.into_iter().map(|(_, resource)| resource).collect()
        };
        if ready.is_empty() {
            return;
        }
        log::trace!("VulkanBackend: retiring {} resources at serial {completed}", ready.len());

        let allocator = self.allocator.upgrade();
        let pool = self.command_pool.upgrade();
        let _pool_guard = pool.as_ref().map(|pool| pool.lock());
        for resource in ready {
            if matches!(resource, DeferredResource::CommandBuffer { .. }) && pool.is_none() {
                // Freed with the pool.
                continue;
            }
            // SAFETY: the caller guarantees the GPU is past these resources
            unsafe { resource.destroy(&self.device, allocator.as_deref()) };
        }
    }

    /// Destroy everything that is still queued.
    ///
    /// # Safety
    ///
    /// The device must be idle.
    pub unsafe fn flush_all(&self) {
        unsafe { self.retire(u64::MAX) };
    }

    /// Number of resources currently pending destruction.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
