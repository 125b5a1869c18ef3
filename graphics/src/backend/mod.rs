//! GPU backend abstraction layer.
//!
//! This module provides a trait-based abstraction for GPU backends, so the
//! surface machinery is written once against [`GpuBackend`].
//!
//! # Available Backends
//!
//! - `software` (always compiled): executes command lists on the CPU. Used for
//!   tests, headless tooling and as the fallback when no GPU is available.
//! - `vulkan-backend`: native Vulkan backend using ash
//!
//! # Architecture
//!
//! Each backend implements the [`GpuBackend`] trait, which provides:
//! - Image, buffer and command buffer creation
//! - Compilation of a [`CommandList`] into a command buffer
//! - Queue submission with semaphore waits/signals and an optional fence
//! - Semaphore, fence and descriptor set management

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub mod software;

use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandList;
use crate::error::GraphicsError;
use crate::instance::{BackendType, InstanceParameters};
use crate::scheduler::SubmitInfo;
use crate::scheduler::sync::{BinarySemaphore, Fence, TimelineSemaphore};
use crate::types::{BufferDescriptor, Extent2d, ImageDescriptor, SampleCountFlags};

/// Limits and properties of the device behind a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Human-readable device name.
    pub device_name: String,
    /// Sample counts supported for color attachments.
    pub sample_counts: SampleCountFlags,
    /// Minimum image transfer granularity of the submission queue.
    ///
    /// Copies whose extent is not a multiple of this must be replaced by blits.
    pub transfer_granularity: Extent2d,
    /// Queue family the submission queue belongs to.
    pub queue_family_index: u32,
    /// Largest supported 2D image dimension.
    pub max_image_dimension: u32,
}

/// Kind of semaphore to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreKind {
    /// Counter semaphore, waited on by value.
    Timeline,
    /// One-shot handoff semaphore.
    Binary,
}

/// Shader resource layout a descriptor set is allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorLayout {
    /// Frame data uniform plus the texture/sampler of a draw call.
    Draw,
    /// Source image of a blur pass.
    Blur,
}

/// Handle to a GPU image.
#[allow(clippy::large_enum_variant)]
pub enum GpuImage {
    /// Software backend image (CPU memory)
    Software(software::SoftwareImage),
    /// Vulkan backend image
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanImage),
}

impl GpuImage {
    /// The descriptor the image was created with.
    pub fn descriptor(&self) -> &ImageDescriptor {
        match self {
            Self::Software(image) => image.descriptor(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(image) => &image.descriptor,
        }
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(image) => f
                .debug_struct("GpuImage::Software")
                .field("label", &image.descriptor().label)
                .field("size", &image.descriptor().size)
                .finish_non_exhaustive(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(image) => f
                .debug_struct("GpuImage::Vulkan")
                .field("image", &image.image)
                .field("size", &image.descriptor.size)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU buffer.
#[allow(clippy::large_enum_variant)]
pub enum GpuBuffer {
    /// Software backend buffer (CPU memory)
    Software(software::SoftwareBuffer),
    /// Vulkan backend buffer
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanBuffer),
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(buffer) => f
                .debug_struct("GpuBuffer::Software")
                .field("size", &buffer.size())
                .finish_non_exhaustive(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(buffer) => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", &buffer.buffer)
                .field("size", &buffer.size)
                .finish_non_exhaustive(),
        }
    }
}

/// Software semaphore payload.
#[derive(Debug, Clone)]
pub enum SoftwareSemaphore {
    Timeline(TimelineSemaphore),
    Binary(BinarySemaphore),
}

/// Handle to a GPU semaphore for GPU-GPU synchronization.
pub enum GpuSemaphore {
    /// Software backend semaphore
    Software(SoftwareSemaphore),
    /// Vulkan backend semaphore
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanSemaphore),
}

impl GpuSemaphore {
    /// Kind of this semaphore.
    pub fn kind(&self) -> SemaphoreKind {
        match self {
            Self::Software(SoftwareSemaphore::Timeline(_)) => SemaphoreKind::Timeline,
            Self::Software(SoftwareSemaphore::Binary(_)) => SemaphoreKind::Binary,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(semaphore) => semaphore.kind,
        }
    }
}

impl std::fmt::Debug for GpuSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(SoftwareSemaphore::Timeline(sem)) => f
                .debug_struct("GpuSemaphore::Software")
                .field("timeline_value", &sem.value())
                .finish(),
            Self::Software(SoftwareSemaphore::Binary(sem)) => f
                .debug_struct("GpuSemaphore::Software")
                .field("binary_signaled", &sem.is_signaled())
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(semaphore) => f
                .debug_struct("GpuSemaphore::Vulkan")
                .field("semaphore", &semaphore.semaphore)
                .field("kind", &semaphore.kind)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU fence for CPU-GPU synchronization.
pub enum GpuFence {
    /// Software backend fence
    Software(Fence),
    /// Vulkan backend fence
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanFence),
}

impl std::fmt::Debug for GpuFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(fence) => f
                .debug_struct("GpuFence::Software")
                .field("status", &fence.status())
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(fence) => f
                .debug_struct("GpuFence::Vulkan")
                .field("fence", &fence.fence)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a command buffer.
pub enum GpuCommandBuffer {
    /// Software backend command buffer (a compiled command list)
    Software(software::SoftwareCommandBuffer),
    /// Vulkan backend command buffer
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanCommandBuffer),
}

impl std::fmt::Debug for GpuCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(buffer) => f
                .debug_struct("GpuCommandBuffer::Software")
                .field("label", &buffer.label())
                .finish_non_exhaustive(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(buffer) => f
                .debug_struct("GpuCommandBuffer::Vulkan")
                .field("buffer", &buffer.buffer)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a descriptor set.
///
/// Sets are plain handles: ownership is tracked by whoever allocated them, and
/// they must be returned through the same pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GpuDescriptorSet {
    /// Software backend set
    Software { id: u64, layout: DescriptorLayout },
    /// Vulkan backend set
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        set: ash::vk::DescriptorSet,
        layout: DescriptorLayout,
    },
}

impl GpuDescriptorSet {
    /// Layout the set was allocated for.
    pub fn layout(&self) -> DescriptorLayout {
        match self {
            Self::Software { layout, .. } => *layout,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { layout, .. } => *layout,
        }
    }
}

/// GPU backend trait for abstracting different GPU APIs.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Limits and properties of the device.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Create an RGBA8 image.
    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<GpuImage, GraphicsError>;

    /// Upload tightly packed RGBA8 pixels into mip 0 of a single-sample image.
    ///
    /// The upload has completed when this returns, and the image is left ready
    /// for sampling.
    fn write_image(&self, image: &GpuImage, pixels: &[u8]) -> Result<(), GraphicsError>;

    /// Read back a mip level as tightly packed RGBA8 pixels.
    ///
    /// Work writing the image must have completed. Backends that can read
    /// multisampled images resolve them on read.
    fn read_image(&self, image: &GpuImage, mip_level: u32) -> Result<Vec<u8>, GraphicsError>;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError>;

    /// Create a semaphore. Timeline semaphores start at zero.
    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<GpuSemaphore, GraphicsError>;

    /// Create a fence for CPU-GPU synchronization.
    fn create_fence(&self, signaled: bool) -> Result<GpuFence, GraphicsError>;

    /// Create an empty command buffer.
    fn create_command_buffer(&self, label: &str) -> Result<GpuCommandBuffer, GraphicsError>;

    /// Compile a command list into a command buffer, replacing its previous contents.
    fn record(
        &self,
        command_buffer: &GpuCommandBuffer,
        commands: &CommandList,
    ) -> Result<(), GraphicsError>;

    /// Submit work to the queue.
    ///
    /// Callers serialize submissions through [`Queue`](crate::scheduler::Queue).
    fn submit(&self, submits: &[SubmitInfo], fence: Option<&GpuFence>)
    -> Result<(), GraphicsError>;

    /// Current counter value of a timeline semaphore.
    fn semaphore_value(&self, semaphore: &GpuSemaphore) -> Result<u64, GraphicsError>;

    /// Block until a timeline semaphore reaches `value`.
    ///
    /// Returns `Ok(false)` if the timeout elapsed. `None` waits indefinitely.
    fn wait_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, GraphicsError>;

    /// Block until a fence is signaled.
    ///
    /// Returns `Ok(false)` if the timeout elapsed. `None` waits indefinitely.
    fn wait_fence(&self, fence: &GpuFence, timeout: Option<Duration>)
    -> Result<bool, GraphicsError>;

    /// Check if a fence is signaled (non-blocking).
    fn is_fence_signaled(&self, fence: &GpuFence) -> Result<bool, GraphicsError>;

    /// Allocate a descriptor set.
    fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayout,
    ) -> Result<GpuDescriptorSet, GraphicsError>;

    /// Return a descriptor set to the backend.
    fn free_descriptor_set(&self, set: GpuDescriptorSet);

    /// Execute submissions the backend has queued but not yet run.
    ///
    /// Backends that execute on their own timeline return `Ok(0)`.
    fn process_pending(&self) -> Result<usize, GraphicsError> {
        Ok(0)
    }

    /// Block until all submitted work has completed.
    fn wait_idle(&self) -> Result<(), GraphicsError>;
}

/// Selects and creates the backend requested by the instance parameters.
pub fn create_backend(
    params: &InstanceParameters,
) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    match params.backend {
        BackendType::Software => {
            log::info!("Using software backend");
            Ok(Arc::new(software::SoftwareBackend::new(&params.software)))
        }
        BackendType::Vulkan => create_vulkan_backend(params),
        BackendType::Auto => {
            // Try Vulkan backend first if available (native Vulkan via ash)
            #[cfg(feature = "vulkan-backend")]
            {
                match vulkan::VulkanBackend::new(params) {
                    Ok(backend) => {
                        log::info!("Using Vulkan backend (ash)");
                        return Ok(Arc::new(backend));
                    }
                    Err(e) => {
                        log::warn!("Failed to create Vulkan backend: {}", e);
                    }
                }
            }

            log::info!("Using software backend");
            Ok(Arc::new(software::SoftwareBackend::new(&params.software)))
        }
    }
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan_backend(
    params: &InstanceParameters,
) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    let backend = vulkan::VulkanBackend::new(params)?;
    log::info!("Using Vulkan backend (ash)");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan_backend(
    _params: &InstanceParameters,
) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    Err(GraphicsError::FeatureNotSupported(
        "Vulkan backend requires the `vulkan-backend` feature".to_string(),
    ))
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "vulkan-backend")
}
