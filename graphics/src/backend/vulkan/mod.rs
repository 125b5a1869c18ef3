//! Vulkan backend (ash).
//!
//! Requires Vulkan 1.3: timeline semaphores carry surface completion,
//! synchronization2 expresses the finalize barriers, and dynamic rendering
//! replaces render pass objects. Command lists are translated into native
//! command buffers at [`GpuBackend::record`] time.
//!
//! Dropped handles are destroyed through a [`deferred::DeferredDestructor`]
//! once every submission made before the drop has completed.

mod allocator;
mod command;
mod conversion;
mod debug;
mod deferred;
mod device;
mod instance;
mod pipeline;
mod sync;

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

use crate::backend::{
    DescriptorLayout, DeviceCapabilities, GpuBackend, GpuBuffer, GpuCommandBuffer,
    GpuDescriptorSet, GpuFence, GpuImage, GpuSemaphore, SemaphoreKind,
};
use crate::command::{CommandList, ImageLayout};
use crate::error::GraphicsError;
use crate::instance::InstanceParameters;
use crate::scheduler::SubmitInfo;
use crate::types::{BufferDescriptor, BufferUsage, ImageDescriptor, TextureUsage};

use self::command::Encoder;
use self::conversion::{
    COLOR_FORMAT, color_layers, color_range, convert_buffer_usage, convert_pipeline_stage,
    convert_sample_count, convert_texture_usage, image_barrier,
};
use self::deferred::{DeferredDestructor, DeferredResource};
use self::pipeline::PipelineManager;

pub use self::sync::{VulkanFence, VulkanSemaphore};

/// A 2D RGBA8 image.
pub struct VulkanImage {
    pub descriptor: ImageDescriptor,
    pub image: vk::Image,
    /// Every mip level; null unless the image is sampled.
    pub sampled_view: vk::ImageView,
    /// Mip 0; null unless the image is a render attachment.
    pub attachment_view: vk::ImageView,
    allocation: Option<Allocation>,
    deferred: Arc<DeferredDestructor>,
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        let views = [self.sampled_view, self.attachment_view]
            .into_iter()
            .filter(|view| *view != vk::ImageView::null())
            .collect();
        self.deferred.queue(DeferredResource::Image {
            image: self.image,
            views,
            allocation: self.allocation.take(),
        });
    }
}

/// A buffer with its memory.
pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    allocation: Option<Allocation>,
    deferred: Arc<DeferredDestructor>,
}

impl VulkanBuffer {
    /// Copy `data` into host-visible memory at offset 0.
    fn write(&mut self, data: &[u8]) -> Result<(), GraphicsError> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| GraphicsError::Internal("buffer is not host visible".to_string()))?;
        let target = mapped
            .get_mut(..data.len())
            .ok_or_else(|| GraphicsError::InvalidParameter("write exceeds buffer".to_string()))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn read(&self, len: usize) -> Result<Vec<u8>, GraphicsError> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .and_then(|mapped| mapped.get(..len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| GraphicsError::Internal("buffer is not host visible".to_string()))
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        self.deferred.queue(DeferredResource::Buffer {
            buffer: self.buffer,
            allocation: self.allocation.take(),
        });
    }
}

/// What a recorded command buffer references.
struct RecordedCommands {
    /// Keeps every image and buffer of the list alive while it may execute.
    _list: CommandList,
    _vertices: Option<VulkanBuffer>,
}

/// A primary command buffer, re-recorded for every frame.
pub struct VulkanCommandBuffer {
    pub buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
    label: String,
    recorded: Mutex<Option<RecordedCommands>>,
    deferred: Arc<DeferredDestructor>,
}

impl Drop for VulkanCommandBuffer {
    fn drop(&mut self) {
        self.recorded.get_mut().take();
        self.deferred.queue(DeferredResource::CommandBuffer {
            pool: self.pool,
            buffer: self.buffer,
        });
    }
}

pub(crate) fn vulkan_image(image: &GpuImage) -> Result<&VulkanImage, GraphicsError> {
    match image {
        GpuImage::Vulkan(image) => Ok(image),
        #[allow(unreachable_patterns)]
        _ => Err(foreign("image")),
    }
}

pub(crate) fn vulkan_buffer(buffer: &GpuBuffer) -> Result<&VulkanBuffer, GraphicsError> {
    match buffer {
        GpuBuffer::Vulkan(buffer) => Ok(buffer),
        #[allow(unreachable_patterns)]
        _ => Err(foreign("buffer")),
    }
}

pub(crate) fn vulkan_set(set: &GpuDescriptorSet) -> Result<vk::DescriptorSet, GraphicsError> {
    match set {
        GpuDescriptorSet::Vulkan { set, .. } => Ok(*set),
        #[allow(unreachable_patterns)]
        _ => Err(foreign("descriptor set")),
    }
}

fn vulkan_semaphore(semaphore: &GpuSemaphore) -> Result<&VulkanSemaphore, GraphicsError> {
    match semaphore {
        GpuSemaphore::Vulkan(semaphore) => Ok(semaphore),
        #[allow(unreachable_patterns)]
        _ => Err(foreign("semaphore")),
    }
}

fn vulkan_fence(fence: &GpuFence) -> Result<&VulkanFence, GraphicsError> {
    match fence {
        GpuFence::Vulkan(fence) => Ok(fence),
        #[allow(unreachable_patterns)]
        _ => Err(foreign("fence")),
    }
}

fn vulkan_command_buffer(
    buffer: &GpuCommandBuffer,
) -> Result<&VulkanCommandBuffer, GraphicsError> {
    match buffer {
        GpuCommandBuffer::Vulkan(buffer) => Ok(buffer),
        #[allow(unreachable_patterns)]
        _ => Err(foreign("command buffer")),
    }
}

fn foreign(what: &str) -> GraphicsError {
    GraphicsError::InvalidParameter(format!("{what} was not created by the Vulkan backend"))
}

fn submit_error(e: vk::Result) -> GraphicsError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        e => GraphicsError::SubmissionFailed(format!("{:?}", e)),
    }
}

/// Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    /// Dropped before the device is destroyed.
    allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    command_pool: Arc<Mutex<vk::CommandPool>>,
    deferred: Arc<DeferredDestructor>,
    /// Signaled with a new serial by every submission.
    retire: vk::Semaphore,
    pipelines: PipelineManager,
    capabilities: DeviceCapabilities,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("device", &self.capabilities.device_name)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

impl VulkanBackend {
    /// Create the backend on the best available device.
    pub fn new(params: &InstanceParameters) -> Result<Self, GraphicsError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let bundle = instance::create_instance(&entry, params.validation)?;
        let instance = bundle.instance;
        let physical_device = device::select_physical_device(&instance)?;
        let queue_family = device::find_graphics_queue_family(&instance, physical_device)?;
        let device = device::create_logical_device(&instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let allocator = Arc::new(Mutex::new(allocator::create_allocator(
            &instance,
            physical_device,
            device.clone(),
        )?));
        let command_pool = Arc::new(Mutex::new(command::create_command_pool(
            &device,
            queue_family,
        )?));
        let deferred = Arc::new(DeferredDestructor::new(
            device.clone(),
            Arc::downgrade(&allocator),
            Arc::downgrade(&command_pool),
        ));
        let retire = sync::create_raw_semaphore(&device, SemaphoreKind::Timeline)?;
        let pipelines = PipelineManager::new(device.clone())?;
        let capabilities = device::query_capabilities(&instance, physical_device, queue_family);

        log::info!(
            "VulkanBackend: {} (queue family {}, samples {:?})",
            capabilities.device_name,
            queue_family,
            capabilities.sample_counts
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils: bundle.debug_utils,
            debug_messenger: bundle.debug_messenger,
            device,
            queue: Mutex::new(queue),
            allocator: ManuallyDrop::new(allocator),
            command_pool,
            deferred,
            retire,
            pipelines,
            capabilities,
        })
    }

    fn create_raw_buffer(
        &self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<VulkanBuffer, GraphicsError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create {name}: {:?}", e))
        })?;

        let allocation =
            match allocator::bind_buffer(&self.device, &self.allocator, buffer, name, location) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            };

        Ok(VulkanBuffer {
            buffer,
            size,
            allocation: Some(allocation),
            deferred: Arc::clone(&self.deferred),
        })
    }

    fn create_view(
        &self,
        image: vk::Image,
        mip_count: u32,
    ) -> Result<vk::ImageView, GraphicsError> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(COLOR_FORMAT)
            .subresource_range(color_range(0, mip_count));
        unsafe { self.device.create_image_view(&view_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create image view: {:?}", e))
        })
    }

    /// Submit a batch that carries the next retire serial.
    fn submit_batches(
        &self,
        batches: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), GraphicsError> {
        let queue = self.queue.lock();
        let serial = self.deferred.next_serial();
        let retire = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.retire)
            .value(serial)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];

        let mut all = batches.to_vec();
        all.push(vk::SubmitInfo2::default().signal_semaphore_infos(&retire));
        unsafe { self.device.queue_submit2(*queue, &all, fence) }.map_err(submit_error)?;
        drop(queue);

        self.retire_completed();
        Ok(())
    }

    fn retire_completed(&self) {
        match sync::timeline_value(&self.device, self.retire) {
            // SAFETY: the retire timeline only advances when the GPU completed the work
            Ok(completed) => unsafe { self.deferred.retire(completed) },
            Err(e) => log::warn!("VulkanBackend: cannot query retire timeline: {e}"),
        }
    }

    /// Record `encode` into a transient command buffer, submit it and wait.
    fn immediate(
        &self,
        what: &str,
        encode: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), GraphicsError> {
        crate::profile_scope!("vulkan_immediate");
        let failed = |e: vk::Result| {
            GraphicsError::CommandRecordingFailed(format!("{what}: {:?}", e))
        };

        let cmd = {
            let pool = self.command_pool.lock();
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(*pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
                .map_err(failed)?
                .into_iter()
                .next()
                .ok_or_else(|| GraphicsError::Internal("no command buffer returned".to_string()))?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let recorded = unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
                .map(|()| encode(cmd))
                .and_then(|()| unsafe { self.device.end_command_buffer(cmd) });
            if let Err(e) = recorded {
                unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
                return Err(failed(e));
            }
            cmd
        };
        let transient = VulkanCommandBuffer {
            buffer: cmd,
            pool: *self.command_pool.lock(),
            label: what.to_string(),
            recorded: Mutex::new(None),
            deferred: Arc::clone(&self.deferred),
        };

        let fence = sync::create_fence(&self.device, false, &self.deferred)?;
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let batch = [vk::SubmitInfo2::default().command_buffer_infos(&command_buffers)];
        self.submit_batches(&batch, fence.fence)?;

        let result = unsafe { self.device.wait_for_fences(&[fence.fence], true, u64::MAX) };
        sync::wait_result(result, what)?;
        drop(transient);
        self.retire_completed();
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.deferred.flush_all();
            self.pipelines.destroy();
            self.device.destroy_semaphore(self.retire, None);
            self.device
                .destroy_command_pool(*self.command_pool.lock(), None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<GpuImage, GraphicsError> {
        let size = descriptor.size;
        if size.is_empty()
            || size.width > self.capabilities.max_image_dimension
            || size.height > self.capabilities.max_image_dimension
            || descriptor.mip_level_count == 0
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "{:?}: unsupported image size {}x{} with {} mips",
                descriptor.label, size.width, size.height, descriptor.mip_level_count
            )));
        }
        if !self.capabilities.sample_counts.supports(descriptor.samples) {
            return Err(GraphicsError::FeatureNotSupported(format!(
                "{:?} samples",
                descriptor.samples
            )));
        }
        let name = descriptor.label.as_deref().unwrap_or("image");
        let usage = convert_texture_usage(descriptor.usage, descriptor.samples);

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(COLOR_FORMAT)
            .extent(vk::Extent3D {
                width: size.width,
                height: size.height,
                depth: 1,
            })
            .mip_levels(descriptor.mip_level_count)
            .array_layers(1)
            .samples(convert_sample_count(descriptor.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { self.device.create_image(&image_info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create {name}: {:?}", e))
        })?;

        let allocation = match allocator::bind_image(&self.device, &self.allocator, raw, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(raw, None) };
                return Err(e);
            }
        };
        // From here on the handle owns every object and cleans up on error.
        let mut image = VulkanImage {
            descriptor: descriptor.clone(),
            image: raw,
            sampled_view: vk::ImageView::null(),
            attachment_view: vk::ImageView::null(),
            allocation: Some(allocation),
            deferred: Arc::clone(&self.deferred),
        };
        let sampled = usage.contains(vk::ImageUsageFlags::SAMPLED);
        if sampled {
            image.sampled_view = self.create_view(raw, descriptor.mip_level_count)?;
        }
        if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
            image.attachment_view = self.create_view(raw, 1)?;
        }

        // Sampleable images rest in shader-read layout, zero-filled when clearable.
        let mips = descriptor.mip_level_count;
        let clearable = usage.contains(vk::ImageUsageFlags::TRANSFER_DST);
        if sampled || clearable {
            self.immediate("initialize image", |cmd| unsafe {
                let mut layout = ImageLayout::Undefined;
                if clearable {
                    let barriers = [image_barrier(raw, 0, mips, layout, ImageLayout::TransferDst)];
                    self.device.cmd_pipeline_barrier2(
                        cmd,
                        &vk::DependencyInfo::default().image_memory_barriers(&barriers),
                    );
                    self.device.cmd_clear_color_image(
                        cmd,
                        raw,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk::ClearColorValue::default(),
                        &[color_range(0, mips)],
                    );
                    layout = ImageLayout::TransferDst;
                }
                if sampled {
                    let barriers =
                        [image_barrier(raw, 0, mips, layout, ImageLayout::ShaderReadOnly)];
                    self.device.cmd_pipeline_barrier2(
                        cmd,
                        &vk::DependencyInfo::default().image_memory_barriers(&barriers),
                    );
                }
            })?;
        }

        log::trace!(
            "VulkanBackend: created image {name} ({}x{}, {} mips, {:?})",
            size.width,
            size.height,
            mips,
            descriptor.samples
        );
        Ok(GpuImage::Vulkan(image))
    }

    fn write_image(&self, image: &GpuImage, pixels: &[u8]) -> Result<(), GraphicsError> {
        let image = vulkan_image(image)?;
        let size = image.descriptor.size;
        if image.descriptor.samples.is_multisampled() {
            return Err(GraphicsError::InvalidParameter(
                "cannot upload into a multisampled image".to_string(),
            ));
        }
        if pixels.len() != size.area() * 4 {
            return Err(GraphicsError::InvalidParameter(format!(
                "expected {} bytes of RGBA8 data, got {}",
                size.area() * 4,
                pixels.len()
            )));
        }

        let mut staging = self.create_raw_buffer(
            "upload staging",
            pixels.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        staging.write(pixels)?;

        let raw = image.image;
        let region = vk::BufferImageCopy::default()
            .image_subresource(color_layers(0))
            .image_extent(vk::Extent3D {
                width: size.width,
                height: size.height,
                depth: 1,
            });
        self.immediate("write image", |cmd| unsafe {
            let to_transfer = [image_barrier(raw, 0, 1, ImageLayout::Undefined, ImageLayout::TransferDst)];
            self.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&to_transfer),
            );
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            let to_shader = [image_barrier(
                raw,
                0,
                1,
                ImageLayout::TransferDst,
                ImageLayout::ShaderReadOnly,
            )];
            self.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&to_shader),
            );
        })
    }

    /// Reads from images resting in shader-read layout.
    ///
    /// Multisampled images are never sampleable on this backend and are rejected.
    fn read_image(&self, image: &GpuImage, mip_level: u32) -> Result<Vec<u8>, GraphicsError> {
        let image = vulkan_image(image)?;
        if image.descriptor.samples.is_multisampled() {
            return Err(GraphicsError::FeatureNotSupported(
                "reading back multisampled images".to_string(),
            ));
        }
        if !image.descriptor.usage.contains(TextureUsage::COPY_SRC)
            || !image.descriptor.usage.contains(TextureUsage::TEXTURE_BINDING)
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "{:?} cannot be read back",
                image.descriptor.label
            )));
        }
        let extent = crate::types::mip_extents(image.descriptor.size)
            .get(mip_level as usize)
            .copied()
            .filter(|_| mip_level < image.descriptor.mip_level_count)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("mip level {mip_level} out of range"))
            })?;

        let len = extent.area() * 4;
        let readback = self.create_raw_buffer(
            "readback staging",
            len as u64,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let raw = image.image;
        let region = vk::BufferImageCopy::default()
            .image_subresource(color_layers(mip_level))
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        self.immediate("read image", |cmd| unsafe {
            let to_transfer = [image_barrier(
                raw,
                mip_level,
                1,
                ImageLayout::ShaderReadOnly,
                ImageLayout::TransferSrc,
            )];
            self.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&to_transfer),
            );
            self.device.cmd_copy_image_to_buffer(
                cmd,
                raw,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback.buffer,
                &[region],
            );
            let to_shader = [image_barrier(
                raw,
                mip_level,
                1,
                ImageLayout::TransferSrc,
                ImageLayout::ShaderReadOnly,
            )];
            self.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&to_shader),
            );
        })?;

        readback.read(len)
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        // Uniforms are written on the GPU timeline; everything else is host visible.
        let location = if descriptor.usage.contains(BufferUsage::UNIFORM) {
            MemoryLocation::GpuOnly
        } else {
            MemoryLocation::CpuToGpu
        };
        let buffer = self.create_raw_buffer(
            descriptor.label.as_deref().unwrap_or("buffer"),
            descriptor.size,
            convert_buffer_usage(descriptor.usage),
            location,
        )?;
        Ok(GpuBuffer::Vulkan(buffer))
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<GpuSemaphore, GraphicsError> {
        sync::create_semaphore(&self.device, kind, &self.deferred).map(GpuSemaphore::Vulkan)
    }

    fn create_fence(&self, signaled: bool) -> Result<GpuFence, GraphicsError> {
        sync::create_fence(&self.device, signaled, &self.deferred).map(GpuFence::Vulkan)
    }

    fn create_command_buffer(&self, label: &str) -> Result<GpuCommandBuffer, GraphicsError> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "Failed to allocate command buffer {label}: {:?}",
                    e
                ))
            })?
            .into_iter()
            .next()
            .ok_or_else(|| GraphicsError::Internal("no command buffer returned".to_string()))?;

        Ok(GpuCommandBuffer::Vulkan(VulkanCommandBuffer {
            buffer,
            pool: *pool,
            label: label.to_string(),
            recorded: Mutex::new(None),
            deferred: Arc::clone(&self.deferred),
        }))
    }

    fn record(
        &self,
        command_buffer: &GpuCommandBuffer,
        commands: &CommandList,
    ) -> Result<(), GraphicsError> {
        crate::profile_scope!("vulkan_record");
        let target = vulkan_command_buffer(command_buffer)?;
        let failed = |e: vk::Result| {
            GraphicsError::CommandRecordingFailed(format!("{}: {:?}", target.label, e))
        };

        let vertices = command::gather_vertices(commands);
        let vertex_buffer = if vertices.is_empty() {
            None
        } else {
            let bytes: &[u8] = bytemuck::cast_slice(&vertices);
            let mut buffer = self.create_raw_buffer(
                "draw vertices",
                bytes.len() as u64,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                MemoryLocation::CpuToGpu,
            )?;
            buffer.write(bytes)?;
            Some(buffer)
        };

        let mut recorded = target.recorded.lock();
        // The previous contents go to deferred destruction.
        recorded.take();

        let _pool = self.command_pool.lock();
        let cmd = target.buffer;
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(failed)?;
            self.device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .map_err(failed)?;
        }

        let encoder = Encoder {
            device: &self.device,
            pipelines: &self.pipelines,
            command_buffer: cmd,
            vertex_buffer: vertex_buffer
                .as_ref()
                .map_or(vk::Buffer::null(), |buffer| buffer.buffer),
        };
        let encoded = encoder.encode(commands);
        let ended = unsafe { self.device.end_command_buffer(cmd) }.map_err(failed);
        encoded?;
        ended?;

        *recorded = Some(RecordedCommands {
            _list: commands.clone(),
            _vertices: vertex_buffer,
        });
        log::trace!(
            "VulkanBackend: recorded {} ({} commands, {} vertices)",
            target.label,
            commands.len(),
            vertices.len()
        );
        Ok(())
    }

    fn submit(&self, submits: &[SubmitInfo], fence: Option<&GpuFence>) -> Result<(), GraphicsError> {
        crate::profile_scope!("vulkan_submit");
        struct Batch {
            command_buffers: Vec<vk::CommandBufferSubmitInfo<'static>>,
            waits: Vec<vk::SemaphoreSubmitInfo<'static>>,
            signals: Vec<vk::SemaphoreSubmitInfo<'static>>,
        }

        let mut batches = Vec::with_capacity(submits.len());
        for submit in submits {
            let command_buffers = submit
                .command_buffers
                .iter()
                .map(|buffer| {
                    vulkan_command_buffer(buffer).map(|buffer| {
                        vk::CommandBufferSubmitInfo::default().command_buffer(buffer.buffer)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let waits = submit
                .waits
                .iter()
                .map(|wait| {
                    vulkan_semaphore(&wait.semaphore).map(|semaphore| {
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(semaphore.semaphore)
                            .value(wait.value)
                            .stage_mask(convert_pipeline_stage(wait.stage))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let signals = submit
                .signals
                .iter()
                .map(|signal| {
                    vulkan_semaphore(&signal.semaphore).map(|semaphore| {
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(semaphore.semaphore)
                            .value(signal.value)
                            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            batches.push(Batch {
                command_buffers,
                waits,
                signals,
            });
        }

        let infos: Vec<vk::SubmitInfo2<'_>> = batches
            .iter()
            .map(|batch| {
                vk::SubmitInfo2::default()
                    .command_buffer_infos(&batch.command_buffers)
                    .wait_semaphore_infos(&batch.waits)
                    .signal_semaphore_infos(&batch.signals)
            })
            .collect();

        let fence = match fence {
            Some(fence) => {
                let fence = vulkan_fence(fence)?.fence;
                unsafe { self.device.reset_fences(&[fence]) }.map_err(submit_error)?;
                fence
            }
            None => vk::Fence::null(),
        };

        log::trace!("VulkanBackend: submitting {} batches", infos.len());
        self.submit_batches(&infos, fence)
    }

    fn semaphore_value(&self, semaphore: &GpuSemaphore) -> Result<u64, GraphicsError> {
        let semaphore = vulkan_semaphore(semaphore)?;
        if semaphore.kind != SemaphoreKind::Timeline {
            return Err(GraphicsError::InvalidParameter(
                "binary semaphores have no counter".to_string(),
            ));
        }
        sync::timeline_value(&self.device, semaphore.semaphore)
    }

    fn wait_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, GraphicsError> {
        let semaphore = vulkan_semaphore(semaphore)?;
        if semaphore.kind != SemaphoreKind::Timeline {
            return Err(GraphicsError::InvalidParameter(
                "only timeline semaphores can be waited on the host".to_string(),
            ));
        }
        let reached = sync::wait_timeline(&self.device, semaphore.semaphore, value, timeout)?;
        if reached {
            self.retire_completed();
        }
        Ok(reached)
    }

    fn wait_fence(&self, fence: &GpuFence, timeout: Option<Duration>) -> Result<bool, GraphicsError> {
        let fence = vulkan_fence(fence)?.fence;
        let result =
            unsafe { self.device.wait_for_fences(&[fence], true, sync::timeout_ns(timeout)) };
        let signaled = sync::wait_result(result, "fence wait")?;
        if signaled {
            self.retire_completed();
        }
        Ok(signaled)
    }

    fn is_fence_signaled(&self, fence: &GpuFence) -> Result<bool, GraphicsError> {
        let fence = vulkan_fence(fence)?.fence;
        unsafe { self.device.get_fence_status(fence) }.map_err(submit_error)
    }

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayout,
    ) -> Result<GpuDescriptorSet, GraphicsError> {
        let set = self.pipelines.allocate_descriptor_set(layout)?;
        Ok(GpuDescriptorSet::Vulkan { set, layout })
    }

    fn free_descriptor_set(&self, set: GpuDescriptorSet) {
        match vulkan_set(&set) {
            Ok(set) => self.pipelines.free_descriptor_set(set),
            Err(e) => log::warn!("VulkanBackend: {e}"),
        }
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        let queue = self.queue.lock();
        unsafe { self.device.queue_wait_idle(*queue) }.map_err(submit_error)?;
        drop(queue);
        self.retire_completed();
        Ok(())
    }
}
