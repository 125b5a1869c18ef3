//! Render-to-texture surfaces.
//!
//! A [`RenderSurface`] is double buffered: every `begin_render` swaps to the
//! other slot, so the previous frame's output stays sampleable while the next
//! one is recorded. Each slot owns a timeline completion semaphore whose
//! `target` grows by one per recorded generation. Dependents wait on that
//! value instead of on the CPU.
//!
//! # Lifecycle
//!
//! ```text
//! begin_render ──► draw_* ──► end_render ──► commit_render ──► submit ──► confirm_submission
//!                                                 │                             │
//!                                                 └── abort_render (on failure) ▼
//!                                                                       confirm_finished
//! ```
//!
//! Recording happens on one thread. Commits, confirmations and readiness
//! queries may come from any thread; each takes one slot lock at a time.

mod commit;
mod dependency;
mod draw;
mod finalize;
mod swap;

pub use commit::{Submission, SubmissionCollector};
pub use dependency::{DependencyInfo, DependencyReference, TextureRef};
pub use finalize::{BlurSettings, FinalizeVariant, record_finalize, record_mip_chain};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::{GpuImage, GpuSemaphore};
use crate::command::{CommandList, GpuCommand, ImageLayout};
use crate::error::GraphicsError;
use crate::instance::GraphicsInstance;
use crate::report::ReportSeverity;
use crate::types::{
    BlurAmount, BlurType, Color, CoordinateSpace, Extent2d, FrameData, Rect, SampleCount,
    SurfaceDescriptor, mip_level_count,
};

use swap::{FrameSwapState, SlotImages, free_sets};

/// A double-buffered render target whose output can be sampled by other surfaces.
pub struct RenderSurface {
    id: u64,
    label: String,
    instance: Arc<GraphicsInstance>,
    samples: SampleCount,
    enable_blur: bool,
    variant: FinalizeVariant,
    coordinate_space: CoordinateSpace,
    clear_color: Color,
    active: AtomicUsize,
    poisoned: AtomicBool,
    slots: [Mutex<FrameSwapState>; 2],
}

impl RenderSurface {
    pub(crate) fn new(
        instance: Arc<GraphicsInstance>,
        descriptor: &SurfaceDescriptor,
    ) -> Result<Self, GraphicsError> {
        let size = descriptor.size;
        if size.is_empty() {
            return Err(GraphicsError::InvalidParameter(format!(
                "surface size {}x{} is empty",
                size.width, size.height
            )));
        }

        let id = instance.next_id();
        let label = descriptor
            .label
            .clone()
            .unwrap_or_else(|| format!("surface-{id}"));
        let samples = clamp_samples(&instance, &label, descriptor.samples);
        let variant = FinalizeVariant::select(samples, descriptor.enable_blur);

        let create_slot = |index: usize| -> Result<FrameSwapState, GraphicsError> {
            let backend = instance.backend().as_ref();
            let images = SlotImages::new(
                backend,
                &instance.descriptor_pool(),
                &label,
                index,
                size,
                samples,
                variant,
            )?;
            FrameSwapState::new(backend, images, &label, index)
        };
        let slots = match create_slot(0).and_then(|a| Ok([a, create_slot(1)?])) {
            Ok([a, b]) => [Mutex::new(a), Mutex::new(b)],
            Err(e) => {
                instance.reporter().report_error(&e, "create_surface");
                return Err(e);
            }
        };

        log::debug!(
            "Created surface '{label}' ({}x{}, {samples:?}, {variant:?})",
            size.width,
            size.height
        );

        Ok(Self {
            id,
            label,
            samples,
            enable_blur: descriptor.enable_blur,
            variant,
            coordinate_space: descriptor.coordinate_space,
            clear_color: descriptor.clear_color,
            // The first begin_render swaps to slot 0.
            active: AtomicUsize::new(1),
            poisoned: AtomicBool::new(false),
            slots,
            instance,
        })
    }

    /// Unique id within the instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The instance the surface was created from.
    pub fn instance(&self) -> &Arc<GraphicsInstance> {
        &self.instance
    }

    /// Current size in texels.
    pub fn size(&self) -> Extent2d {
        self.active_state().images.size
    }

    /// Always 1: surfaces are single-layer.
    pub fn layer_count(&self) -> u32 {
        1
    }

    /// Mip levels of the sampleable output.
    pub fn mip_level_count(&self) -> u32 {
        mip_level_count(self.size())
    }

    /// Samples per texel after clamping to the device limits.
    pub fn sample_count(&self) -> SampleCount {
        self.samples
    }

    pub fn coordinate_space(&self) -> CoordinateSpace {
        self.coordinate_space
    }

    pub fn is_blur_enabled(&self) -> bool {
        self.enable_blur
    }

    /// Finalize variant selected at creation.
    pub fn finalize_variant(&self) -> FinalizeVariant {
        self.variant
    }

    /// Returns true after a device loss or failed recording.
    ///
    /// A poisoned surface rejects every further frame.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Returns true between `begin_render` and `end_render`.
    pub fn is_recording(&self) -> bool {
        self.active_state().is_recording()
    }

    /// The generation a commit of the latest frame refers to.
    pub fn active_dependency_info(&self) -> DependencyInfo {
        DependencyInfo {
            slot: self.active_slot(),
        }
    }

    /// Output image of a generation. Valid to sample once it is ready.
    pub fn sampleable_image(&self, info: DependencyInfo) -> Arc<GpuImage> {
        Arc::clone(&self.slot(info.slot).images.output)
    }

    /// Completion semaphore of a generation.
    pub fn completion_semaphore(&self, info: DependencyInfo) -> Arc<GpuSemaphore> {
        Arc::clone(&self.slot(info.slot).completion)
    }

    /// Value the completion semaphore reaches when the generation is done.
    pub fn completion_value(&self, info: DependencyInfo) -> u64 {
        self.slot(info.slot).target
    }

    /// Surfaces the generation sampled while it was recorded.
    pub fn dependencies(&self, info: DependencyInfo) -> Vec<DependencyReference> {
        self.slot(info.slot).dependencies.clone()
    }

    /// Start recording a new frame into the other slot.
    ///
    /// Blocks until the slot's previous generation has completed on the
    /// device, bounded by the instance's sync timeout.
    ///
    /// # Errors
    ///
    /// - [`GraphicsError::InvalidState`] if already recording or poisoned.
    /// - [`GraphicsError::SynchronizationTimeout`] if the previous generation
    ///   did not complete in time. The surface is poisoned.
    pub fn begin_render(&self) -> Result<(), GraphicsError> {
        crate::profile_scope!("begin_render");
        self.ensure_usable("begin_render")?;
        if self.is_recording() {
            return self.reject("begin_render", "already recording");
        }

        let index = 1 - self.active_slot();
        self.active.store(index, Ordering::Release);

        let (pending, completion, target) = {
            let slot = self.slot(index);
            (
                slot.has_been_submitted,
                Arc::clone(&slot.completion),
                slot.target,
            )
        };

        let backend = self.instance.backend();
        if pending {
            let timeout = self.instance.sync_timeout();
            log::trace!("'{}'[{index}] waiting for generation {target}", self.label);
            match backend.wait_semaphore(&completion, target, Some(timeout)) {
                Ok(true) => {}
                Ok(false) => {
                    let what = format!("'{}'[{index}] generation {target}", self.label);
                    return Err(self.fail(
                        GraphicsError::SynchronizationTimeout { what, timeout },
                        "begin_render",
                    ));
                }
                Err(e) => return Err(self.fail(e, "begin_render")),
            }
        }

        let mut slot = self.slot(index);
        if !pending {
            // A generation that never reached the queue is dropped.
            let value = match backend.semaphore_value(&slot.completion) {
                Ok(value) => value,
                Err(e) => {
                    drop(slot);
                    return Err(self.fail(e, "begin_render"));
                }
            };
            if value < slot.target {
                log::debug!(
                    "'{}'[{index}] generation {} was never submitted, rolling back to {value}",
                    self.label,
                    slot.target
                );
                slot.target = value;
            }
        }
        slot.reset();

        let size = slot.images.size;
        slot.frame_data = FrameData::new(self.coordinate_space, size);

        let mut list = CommandList::new(format!("{}[{index}].render", self.label));
        let attachment = Arc::clone(&slot.images.attachment);
        list.barrier(
            &attachment,
            0,
            1,
            ImageLayout::Undefined,
            ImageLayout::ColorAttachment,
        );
        list.push(GpuCommand::BeginRenderPass {
            target: attachment,
            clear: self.clear_color,
            extent: size,
        });
        list.push(GpuCommand::SetViewport(Rect::from_extent(size)));
        list.push(GpuCommand::SetScissor(Rect::from_extent(size)));
        list.push(GpuCommand::BindFrameData(Arc::clone(&slot.frame_data_buffer)));
        slot.commands = Some(list);

        log::trace!("'{}'[{index}] recording generation {}", self.label, slot.target + 1);
        Ok(())
    }

    /// Finish recording: end the render pass, finalize and compile both command buffers.
    ///
    /// A zero `blur_amount` skips the blur passes of a blur-enabled surface.
    ///
    /// # Errors
    ///
    /// - [`GraphicsError::InvalidState`] if not recording.
    /// - [`GraphicsError::CommandRecordingFailed`] if compilation fails. The
    ///   surface is poisoned.
    pub fn end_render(
        &self,
        blur_amount: BlurAmount,
        blur_type: BlurType,
    ) -> Result<(), GraphicsError> {
        crate::profile_scope!("end_render");
        self.ensure_usable("end_render")?;

        let index = self.active_slot();
        let mut slot = self.slot(index);
        let Some(mut list) = slot.commands.take() else {
            drop(slot);
            return self.reject("end_render", "not recording");
        };
        list.push(GpuCommand::EndRenderPass);

        let variant = self.variant.for_frame(blur_amount);
        let blur = BlurSettings {
            amount: blur_amount,
            blur_type,
        };
        let granularity = self.instance.queue().transfer_granularity();
        let backend = self.instance.backend();

        let result = record_finalize(&mut list, variant, &slot.images, blur, granularity)
            .and_then(|()| backend.record(&slot.render_commands, &list))
            .and_then(|()| {
                let mut upload = CommandList::new(format!("{}[{index}].upload", self.label));
                upload.push(GpuCommand::UpdateBuffer {
                    buffer: Arc::clone(&slot.frame_data_buffer),
                    data: bytemuck::bytes_of(&slot.frame_data).to_vec(),
                });
                backend.record(&slot.upload_commands, &upload)
            });
        if let Err(e) = result {
            drop(slot);
            let e = match e {
                GraphicsError::CommandRecordingFailed(_) => e,
                other => GraphicsError::CommandRecordingFailed(other.to_string()),
            };
            return Err(self.fail(e, "end_render"));
        }

        let handoff = slot.handoff_wait();
        slot.render_waits = vec![handoff];
        slot.target += 1;
        slot.recorded = true;
        slot.binds = Default::default();

        log::trace!(
            "'{}'[{index}] recorded generation {} ({variant:?}, {} commands)",
            self.label,
            slot.target,
            list.len()
        );
        Ok(())
    }

    /// Returns true if the latest generation completed and its output can be sampled.
    ///
    /// Never blocks.
    pub fn is_ready(&self) -> bool {
        let mut slot = self.active_state();
        if slot.ready {
            return true;
        }
        if slot.is_recording() || !slot.recorded {
            return false;
        }
        match self.instance.backend().semaphore_value(&slot.completion) {
            Ok(value) if value >= slot.target => {
                slot.ready = true;
                slot.has_been_submitted = false;
                true
            }
            Ok(_) => false,
            Err(e) => {
                drop(slot);
                self.fail(e, "is_ready");
                false
            }
        }
    }

    /// Wait for the latest generation to complete. `None` waits indefinitely.
    ///
    /// Returns false at once if the generation was never submitted or the
    /// surface is poisoned.
    pub fn wait_until_ready(&self, timeout: Option<Duration>) -> bool {
        if self.is_ready() {
            return true;
        }
        if self.is_poisoned() {
            return false;
        }
        let index = self.active_slot();
        let (completion, target) = {
            let slot = self.slot(index);
            if slot.is_recording() || !slot.has_been_submitted {
                return false;
            }
            (Arc::clone(&slot.completion), slot.target)
        };

        match self
            .instance
            .backend()
            .wait_semaphore(&completion, target, timeout)
        {
            Ok(true) => {
                let mut slot = self.slot(index);
                if slot.target == target && !slot.is_recording() {
                    slot.ready = true;
                    slot.has_been_submitted = false;
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.fail(e, "wait_until_ready");
                false
            }
        }
    }

    /// Wait for every submitted generation of both slots.
    ///
    /// # Errors
    ///
    /// [`GraphicsError::SynchronizationTimeout`] if a generation did not
    /// complete within the sync timeout. The surface is poisoned.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        let backend = self.instance.backend();
        let timeout = self.instance.sync_timeout();

        for index in 0..2 {
            let (completion, target) = {
                let slot = self.slot(index);
                if !slot.has_been_submitted {
                    continue;
                }
                (Arc::clone(&slot.completion), slot.target)
            };
            match backend.wait_semaphore(&completion, target, Some(timeout)) {
                Ok(true) => {
                    let mut slot = self.slot(index);
                    slot.has_been_submitted = false;
                    if slot.target == target && !slot.is_recording() {
                        slot.ready = true;
                    }
                }
                Ok(false) => {
                    let what = format!("'{}'[{index}] generation {target}", self.label);
                    return Err(self.fail(
                        GraphicsError::SynchronizationTimeout { what, timeout },
                        "wait_idle",
                    ));
                }
                Err(e) => return Err(self.fail(e, "wait_idle")),
            }
        }
        Ok(())
    }

    /// Change the size of the surface.
    ///
    /// Waits for both slots, then recreates every image. The previous
    /// contents are lost and both slots start out ready and empty.
    pub fn resize(&self, size: Extent2d) -> Result<(), GraphicsError> {
        if size == self.size() {
            return Ok(());
        }
        if size.is_empty() {
            return Err(GraphicsError::InvalidParameter(format!(
                "surface size {}x{} is empty",
                size.width, size.height
            )));
        }
        if self.is_recording() {
            return self.reject("resize", "cannot resize while recording");
        }
        self.wait_idle()?;

        let backend = self.instance.backend();
        for index in 0..2 {
            let images = match SlotImages::new(
                backend.as_ref(),
                &self.instance.descriptor_pool(),
                &self.label,
                index,
                size,
                self.samples,
                self.variant,
            ) {
                Ok(images) => images,
                Err(e) => return Err(self.fail(e, "resize")),
            };

            let completed = match backend.semaphore_value(&self.slot(index).completion) {
                Ok(value) => value,
                Err(e) => return Err(self.fail(e, "resize")),
            };

            let mut slot = self.slot(index);
            slot.images = images;
            slot.dependencies.clear();
            slot.render_waits.clear();
            slot.request_count = 0;
            slot.recorded = false;
            slot.has_been_submitted = false;
            slot.ready = true;
            slot.binds = Default::default();
            free_sets(&mut slot.descriptors);
            slot.target = slot.target.min(completed);
        }

        log::debug!("Resized surface '{}' to {}x{}", self.label, size.width, size.height);
        Ok(())
    }

    /// Read back one mip level of the latest output as tightly packed RGBA8.
    ///
    /// # Errors
    ///
    /// [`GraphicsError::InvalidState`] if the latest generation is not ready.
    pub fn read_pixels(&self, mip_level: u32) -> Result<Vec<u8>, GraphicsError> {
        if !self.is_ready() {
            return Err(GraphicsError::InvalidState(format!(
                "'{}' has no completed output to read",
                self.label
            )));
        }
        let output = Arc::clone(&self.active_state().images.output);
        self.instance.backend().read_image(&output, mip_level)
    }

    pub(crate) fn active_slot(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn slot(&self, index: usize) -> MutexGuard<'_, FrameSwapState> {
        self.slots[index & 1].lock()
    }

    fn active_state(&self) -> MutexGuard<'_, FrameSwapState> {
        self.slot(self.active_slot())
    }

    fn ensure_usable(&self, operation: &str) -> Result<(), GraphicsError> {
        if self.is_poisoned() {
            return self.reject(operation, "surface is unusable after a fatal error");
        }
        Ok(())
    }

    /// Reject a call that violates the recording discipline.
    fn reject(&self, operation: &str, reason: &str) -> Result<(), GraphicsError> {
        let message = format!("{operation} on '{}': {reason}", self.label);
        self.instance
            .reporter()
            .report(ReportSeverity::Warning, &message);
        Err(GraphicsError::InvalidState(message))
    }

    /// Report a fatal error and poison the surface.
    fn fail(&self, error: GraphicsError, operation: &str) -> GraphicsError {
        self.poisoned.store(true, Ordering::Release);
        self.instance
            .reporter()
            .report_error(&error, &format!("{operation} on '{}'", self.label));
        error
    }
}

fn clamp_samples(instance: &GraphicsInstance, label: &str, requested: SampleCount) -> SampleCount {
    let supported = instance.capabilities().sample_counts;
    let max = supported.max();
    if requested.count() > max.count() {
        instance.reporter().report(
            ReportSeverity::Warning,
            &format!("'{label}': {requested:?} exceeds the device limit, using {max:?}"),
        );
        return max;
    }
    if !supported.supports(requested) {
        instance.reporter().report(
            ReportSeverity::Warning,
            &format!("'{label}': {requested:?} is not supported, using X1"),
        );
        return SampleCount::X1;
    }
    requested
}

impl Drop for RenderSurface {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::warn!("Surface '{}' dropped with work in flight: {e}", self.label);
        }
    }
}

impl std::fmt::Debug for RenderSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSurface")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("samples", &self.samples)
            .field("variant", &self.variant)
            .field("active", &self.active_slot())
            .finish_non_exhaustive()
    }
}

// Ensure RenderSurface is Send + Sync
static_assertions::assert_impl_all!(RenderSurface: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareParameters;
    use crate::instance::{BackendType, InstanceParameters};
    use crate::report::FatalPolicy;

    fn instance(max_samples: SampleCount) -> Arc<GraphicsInstance> {
        GraphicsInstance::new(
            InstanceParameters::new()
                .with_backend(BackendType::Software)
                .with_fatal_policy(FatalPolicy::Continue)
                .with_software(SoftwareParameters::default().with_max_samples(max_samples)),
        )
        .unwrap()
    }

    #[test]
    fn test_new_surface_is_ready_and_idle() {
        let instance = instance(SampleCount::X8);
        let surface = instance
            .create_surface(&SurfaceDescriptor::new(64, 32).with_label("s"))
            .unwrap();
        assert_eq!(surface.label(), "s");
        assert_eq!(surface.size(), Extent2d::new(64, 32));
        assert_eq!(surface.layer_count(), 1);
        assert_eq!(surface.mip_level_count(), 7);
        assert!(surface.is_ready());
        assert!(!surface.is_recording());
        assert_eq!(surface.finalize_variant(), FinalizeVariant::Direct);
    }

    #[test]
    fn test_default_label_uses_id() {
        let instance = instance(SampleCount::X8);
        let surface = instance.create_surface(&SurfaceDescriptor::new(4, 4)).unwrap();
        assert_eq!(surface.label(), format!("surface-{}", surface.id()));
    }

    #[test]
    fn test_empty_size_rejected() {
        let instance = instance(SampleCount::X8);
        assert!(matches!(
            instance.create_surface(&SurfaceDescriptor::new(0, 16)),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_sample_count_clamped_to_device() {
        let instance = instance(SampleCount::X4);
        let surface = instance
            .create_surface(&SurfaceDescriptor::new(8, 8).with_samples(SampleCount::X16))
            .unwrap();
        assert_eq!(surface.sample_count(), SampleCount::X4);
        assert_eq!(surface.finalize_variant(), FinalizeVariant::Multisample);
        assert_eq!(instance.reporter().count(ReportSeverity::Warning), 1);
    }

    #[test]
    fn test_begin_swaps_slot_and_records() {
        let instance = instance(SampleCount::X8);
        let surface = instance.create_surface(&SurfaceDescriptor::new(8, 8)).unwrap();
        let before = surface.active_dependency_info();

        surface.begin_render().unwrap();
        assert!(surface.is_recording());
        assert_ne!(surface.active_dependency_info(), before);
        assert!(!surface.is_ready());

        surface.end_render(BlurAmount::NONE, BlurType::Gaussian).unwrap();
        assert!(!surface.is_recording());
        assert_eq!(surface.completion_value(surface.active_dependency_info()), 1);
    }

    #[test]
    fn test_recording_discipline() {
        let instance = instance(SampleCount::X8);
        let surface = instance.create_surface(&SurfaceDescriptor::new(8, 8)).unwrap();

        assert!(matches!(
            surface.end_render(BlurAmount::NONE, BlurType::Box),
            Err(GraphicsError::InvalidState(_))
        ));
        surface.begin_render().unwrap();
        assert!(matches!(
            surface.begin_render(),
            Err(GraphicsError::InvalidState(_))
        ));
        assert!(matches!(
            surface.resize(Extent2d::new(4, 4)),
            Err(GraphicsError::InvalidState(_))
        ));
        assert_eq!(instance.reporter().count(ReportSeverity::Warning), 3);
        assert!(!surface.is_poisoned());
    }

    #[test]
    fn test_unsubmitted_generation_rolls_back() {
        let instance = instance(SampleCount::X8);
        let surface = instance.create_surface(&SurfaceDescriptor::new(8, 8)).unwrap();

        surface.begin_render().unwrap();
        surface.end_render(BlurAmount::NONE, BlurType::Box).unwrap();
        let first = surface.active_dependency_info();
        assert_eq!(surface.completion_value(first), 1);

        // Two more frames without submitting: slot 0 is reused without blocking.
        surface.begin_render().unwrap();
        surface.end_render(BlurAmount::NONE, BlurType::Box).unwrap();
        surface.begin_render().unwrap();
        surface.end_render(BlurAmount::NONE, BlurType::Box).unwrap();
        assert_eq!(surface.active_dependency_info(), first);
        assert_eq!(surface.completion_value(first), 1);
    }

    #[test]
    fn test_read_pixels_requires_ready() {
        let instance = instance(SampleCount::X8);
        let surface = instance.create_surface(&SurfaceDescriptor::new(8, 8)).unwrap();
        surface.begin_render().unwrap();
        surface.end_render(BlurAmount::NONE, BlurType::Box).unwrap();
        assert!(matches!(
            surface.read_pixels(0),
            Err(GraphicsError::InvalidState(_))
        ));
        assert!(!surface.wait_until_ready(Some(Duration::from_millis(1))));
    }
}
