//! One buffered generation of a render surface.

use std::sync::Arc;

use crate::backend::{
    DescriptorLayout, GpuBackend, GpuBuffer, GpuCommandBuffer, GpuDescriptorSet, GpuImage,
    GpuSemaphore, SemaphoreKind,
};
use crate::command::{CommandList, PipelineStage};
use crate::descriptor::DescriptorPool;
use crate::error::GraphicsError;
use crate::scheduler::{SemaphoreSignal, SemaphoreWait, SubmitInfo};
use crate::types::{
    BufferDescriptor, BufferUsage, Extent2d, FrameData, ImageDescriptor, SampleCount,
    TextureUsage, mip_level_count,
};

use super::commit::Submission;
use super::dependency::DependencyReference;
use super::draw::BindCache;
use super::finalize::FinalizeVariant;

/// A descriptor set together with the pool it must be returned to.
pub(crate) type PooledSet = (Arc<dyn DescriptorPool>, GpuDescriptorSet);

/// The images of one slot. Recreated on resize.
pub(crate) struct SlotImages {
    pub size: Extent2d,
    pub attachment: Arc<GpuImage>,
    pub scratch_a: Option<Arc<GpuImage>>,
    pub scratch_b: Option<Arc<GpuImage>>,
    pub output: Arc<GpuImage>,
    /// One set per blur pass, allocated for blur variants only.
    pub blur_descriptors: Vec<PooledSet>,
}

impl SlotImages {
    pub fn new(
        backend: &dyn GpuBackend,
        pool: &Arc<dyn DescriptorPool>,
        label: &str,
        slot: usize,
        size: Extent2d,
        samples: SampleCount,
        variant: FinalizeVariant,
    ) -> Result<Self, GraphicsError> {
        let create = |name: &str, descriptor: ImageDescriptor| {
            backend
                .create_image(&descriptor.with_label(format!("{label}[{slot}].{name}")))
                .map(Arc::new)
                .map_err(|e| {
                    GraphicsError::ResourceCreationFailed(format!(
                        "{label}[{slot}].{name}: {e}"
                    ))
                })
        };
        let single = |usage| ImageDescriptor::new_2d(size.width, size.height, usage);

        let attachment_usage = match variant {
            FinalizeVariant::Blur => {
                TextureUsage::RENDER_ATTACHMENT
                    | TextureUsage::TEXTURE_BINDING
                    | TextureUsage::COPY_SRC
                    | TextureUsage::COPY_DST
            }
            _ => TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
        };
        let attachment = create("attachment", single(attachment_usage).with_samples(samples))?;

        let scratch_usage = TextureUsage::RENDER_ATTACHMENT
            | TextureUsage::TEXTURE_BINDING
            | TextureUsage::COPY_SRC
            | TextureUsage::COPY_DST;
        let scratch_a = match variant.scratch_count() {
            0 => None,
            _ => Some(create("scratch_a", single(scratch_usage))?),
        };
        let scratch_b = match variant.scratch_count() {
            2 => Some(create("scratch_b", single(scratch_usage))?),
            _ => None,
        };

        let output = create(
            "output",
            single(TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC | TextureUsage::COPY_DST)
                .with_mip_levels(mip_level_count(size)),
        )?;

        let mut blur_descriptors = Vec::new();
        if variant.blurs() {
            for _ in 0..2 {
                let set = pool.allocate(DescriptorLayout::Blur).map_err(|e| {
                    GraphicsError::ResourceCreationFailed(format!(
                        "{label}[{slot}] blur descriptor: {e}"
                    ))
                });
                match set {
                    Ok(set) => blur_descriptors.push((Arc::clone(pool), set)),
                    Err(e) => {
                        free_sets(&mut blur_descriptors);
                        return Err(e);
                    }
                }
            }
        }

        Ok(Self {
            size,
            attachment,
            scratch_a,
            scratch_b,
            output,
            blur_descriptors,
        })
    }
}

impl Drop for SlotImages {
    fn drop(&mut self) {
        free_sets(&mut self.blur_descriptors);
    }
}

/// Return every set to its pool.
pub(crate) fn free_sets(sets: &mut Vec<PooledSet>) {
    for (pool, set) in sets.drain(..) {
        pool.free(set);
    }
}

/// One buffered generation of a surface.
///
/// Lifecycle: idle → recording (`commands` is set) → recorded (`recorded`,
/// target raised) → submitted (`has_been_submitted`) → ready (`ready`).
pub(crate) struct FrameSwapState {
    pub index: usize,
    pub images: SlotImages,
    pub frame_data_buffer: Arc<GpuBuffer>,
    pub frame_data: FrameData,
    pub upload_commands: Arc<GpuCommandBuffer>,
    pub render_commands: Arc<GpuCommandBuffer>,
    /// Upload → render handoff.
    pub handoff: Arc<GpuSemaphore>,
    /// Timeline raised to `target` when the slot's render work completes.
    pub completion: Arc<GpuSemaphore>,
    pub target: u64,

    /// Command list while recording.
    pub commands: Option<CommandList>,
    pub binds: BindCache,
    /// Draw descriptor sets of the current generation.
    pub descriptors: Vec<PooledSet>,

    pub dependencies: Vec<DependencyReference>,
    /// Waits of the render submission: the handoff first, then every dependency.
    pub render_waits: Vec<SemaphoreWait>,
    pub request_count: u32,
    pub recorded: bool,
    pub has_been_submitted: bool,
    pub ready: bool,
}

impl FrameSwapState {
    pub fn new(
        backend: &dyn GpuBackend,
        images: SlotImages,
        label: &str,
        index: usize,
    ) -> Result<Self, GraphicsError> {
        let failed = |what: &str, e: GraphicsError| {
            GraphicsError::ResourceCreationFailed(format!("{label}[{index}] {what}: {e}"))
        };

        let frame_data_buffer = backend
            .create_buffer(
                &BufferDescriptor::new(
                    std::mem::size_of::<FrameData>() as u64,
                    BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                )
                .with_label(format!("{label}[{index}].frame_data")),
            )
            .map_err(|e| failed("frame data buffer", e))?;
        let upload_commands = backend
            .create_command_buffer(&format!("{label}[{index}].upload"))
            .map_err(|e| failed("upload command buffer", e))?;
        let render_commands = backend
            .create_command_buffer(&format!("{label}[{index}].render"))
            .map_err(|e| failed("render command buffer", e))?;
        let handoff = backend
            .create_semaphore(SemaphoreKind::Binary)
            .map_err(|e| failed("handoff semaphore", e))?;
        let completion = backend
            .create_semaphore(SemaphoreKind::Timeline)
            .map_err(|e| failed("completion semaphore", e))?;

        Ok(Self {
            index,
            images,
            frame_data_buffer: Arc::new(frame_data_buffer),
            frame_data: FrameData::default(),
            upload_commands: Arc::new(upload_commands),
            render_commands: Arc::new(render_commands),
            handoff: Arc::new(handoff),
            completion: Arc::new(completion),
            target: 0,
            commands: None,
            binds: BindCache::default(),
            descriptors: Vec::new(),
            dependencies: Vec::new(),
            render_waits: Vec::new(),
            request_count: 0,
            recorded: false,
            has_been_submitted: false,
            ready: true,
        })
    }

    /// Returns true while a command list is being recorded.
    pub fn is_recording(&self) -> bool {
        self.commands.is_some()
    }

    /// Clear everything captured by the previous generation.
    pub fn reset(&mut self) {
        self.request_count = 0;
        self.dependencies.clear();
        self.render_waits.clear();
        self.recorded = false;
        self.has_been_submitted = false;
        self.ready = false;
        self.binds = BindCache::default();
        free_sets(&mut self.descriptors);
    }

    /// The wait that orders the render submission after the upload.
    pub fn handoff_wait(&self) -> SemaphoreWait {
        SemaphoreWait {
            semaphore: Arc::clone(&self.handoff),
            value: 0,
            stage: PipelineStage::VERTEX_SHADER,
        }
    }

    /// The wait a dependent adds to depend on this slot.
    pub fn completion_wait(&self) -> SemaphoreWait {
        SemaphoreWait {
            semaphore: Arc::clone(&self.completion),
            value: self.target,
            stage: PipelineStage::ALL_COMMANDS,
        }
    }

    /// The (upload, render) pair of the recorded generation.
    pub fn submission(&self, surface_id: u64, label: &str) -> Submission {
        Submission {
            surface_id,
            slot: self.index,
            label: label.to_string(),
            upload: SubmitInfo {
                command_buffers: vec![Arc::clone(&self.upload_commands)],
                waits: Vec::new(),
                signals: vec![SemaphoreSignal {
                    semaphore: Arc::clone(&self.handoff),
                    value: 0,
                }],
            },
            render: SubmitInfo {
                command_buffers: vec![Arc::clone(&self.render_commands)],
                waits: self.render_waits.clone(),
                signals: vec![SemaphoreSignal {
                    semaphore: Arc::clone(&self.completion),
                    value: self.target,
                }],
            },
        }
    }
}
