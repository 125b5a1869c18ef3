//! Queue submission and frame scheduling.
//!
//! # Module Contents
//!
//! - [`Queue`] - The single submission queue, serialized by its own lock
//! - [`SubmitInfo`] - Command buffers plus the semaphores they wait on and signal
//! - [`FrameSchedule`] - Drives a root surface through commit, submit and confirmation
//! - [`sync`] - CPU-side semaphores and fences used by the software backend
//!
//! # Example
//!
//! ```ignore
//! let mut schedule = instance.create_frame_schedule();
//!
//! // Record surfaces in any order
//! shadow.begin_render()?;
//! shadow.draw_rectangle(rect, Color::BLACK, None)?;
//! shadow.end_render(BlurAmount::uniform(4.0), BlurType::Gaussian)?;
//!
//! scene.begin_render()?;
//! scene.draw_rectangle(rect, Color::WHITE, Some((&shadow).into()))?;
//! scene.end_render(BlurAmount::NONE, BlurType::Gaussian)?;
//!
//! // Commit the root: shadow is submitted first, scene waits for it
//! let ticket = schedule.submit(&scene)?;
//! schedule.finish(&ticket, None)?;
//! ```

pub mod sync;

pub use sync::{BinarySemaphore, Fence, FenceStatus, TimelineSemaphore};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{DeviceCapabilities, GpuBackend, GpuCommandBuffer, GpuFence, GpuSemaphore};
use crate::command::PipelineStage;
use crate::error::GraphicsError;
use crate::report::{ReportSeverity, Reporter};
use crate::surface::{DependencyInfo, RenderSurface, SubmissionCollector};
use crate::types::Extent2d;

/// A semaphore a submission waits on before the given stages execute.
#[derive(Debug, Clone)]
pub struct SemaphoreWait {
    pub semaphore: Arc<GpuSemaphore>,
    /// Value to wait for. Ignored for binary semaphores.
    pub value: u64,
    pub stage: PipelineStage,
}

/// A semaphore a submission signals once all of its command buffers completed.
#[derive(Debug, Clone)]
pub struct SemaphoreSignal {
    pub semaphore: Arc<GpuSemaphore>,
    /// Value to signal. Ignored for binary semaphores.
    pub value: u64,
}

/// One queue submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub command_buffers: Vec<Arc<GpuCommandBuffer>>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<SemaphoreSignal>,
}

/// The device queue every surface submits to.
///
/// Submissions from all surfaces go through one lock, so batches never
/// interleave on the queue.
pub struct Queue {
    backend: Arc<dyn GpuBackend>,
    submit_lock: Mutex<()>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("backend", &self.backend.name())
            .field("family_index", &self.family_index())
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            submit_lock: Mutex::new(()),
        }
    }

    /// Submit a batch, optionally signaling `fence` when all of it has completed.
    pub fn submit(
        &self,
        submits: &[SubmitInfo],
        fence: Option<&GpuFence>,
    ) -> Result<(), GraphicsError> {
        crate::profile_scope!("queue_submit");
        let _guard = self.submit_lock.lock();
        log::trace!(
            "Queue: submitting {} infos ({} command buffers, fence: {})",
            submits.len(),
            submits
                .iter()
                .map(|s| s.command_buffers.len())
                .sum::<usize>(),
            fence.is_some()
        );
        self.backend.submit(submits, fence)
    }

    /// Queue family the queue belongs to.
    pub fn family_index(&self) -> u32 {
        self.backend.capabilities().queue_family_index
    }

    /// Minimum image transfer granularity.
    pub fn transfer_granularity(&self) -> Extent2d {
        self.backend.capabilities().transfer_granularity
    }

    /// Capabilities of the device behind the queue.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.backend.capabilities()
    }
}

static_assertions::assert_impl_all!(Queue: Send, Sync);

/// Handle to a submitted frame of a root surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTicket {
    id: u64,
    order: Vec<String>,
}

impl FrameTicket {
    /// Unique id of the submission.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Labels of the submitted surfaces, dependencies first.
    pub fn submission_order(&self) -> &[String] {
        &self.order
    }
}

struct InFlight {
    id: u64,
    root: Arc<RenderSurface>,
    info: DependencyInfo,
    fence: GpuFence,
}

/// Drives root surfaces through commit, submission and completion.
///
/// A root surface is one nothing else samples this frame, such as the image a
/// window presents. [`submit`](Self::submit) commits everything the root
/// depends on and enqueues it as one batch; [`finish`](Self::finish) and
/// [`poll`](Self::poll) observe completion and mark the surfaces ready.
pub struct FrameSchedule {
    queue: Arc<Queue>,
    backend: Arc<dyn GpuBackend>,
    reporter: Arc<Reporter>,
    in_flight: Vec<InFlight>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for FrameSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSchedule")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl FrameSchedule {
    pub(crate) fn new(
        queue: Arc<Queue>,
        backend: Arc<dyn GpuBackend>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            queue,
            backend,
            reporter,
            in_flight: Vec::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Commit and submit everything `root` depends on, then `root` itself.
    ///
    /// On a commit failure nothing is submitted. On a submission failure the
    /// commit is rolled back so the surfaces can be committed again.
    pub fn submit(&mut self, root: &Arc<RenderSurface>) -> Result<FrameTicket, GraphicsError> {
        crate::profile_scope!("frame_schedule_submit");
        let info = root.active_dependency_info();

        // Nothing may fail between a commit and its submission except the submit itself.
        let fence = match self.backend.create_fence(false) {
            Ok(fence) => fence,
            Err(e) => {
                self.reporter
                    .report_error(&e, &format!("creating the fence for '{}'", root.label()));
                return Err(e);
            }
        };

        let mut collector = SubmissionCollector::new();
        if let Err(e) = root.commit_render(info, &mut collector) {
            self.reporter
                .report_error(&e, &format!("committing '{}'", root.label()));
            return Err(e);
        }

        let submits = collector.submit_infos();
        if let Err(e) = self.queue.submit(&submits, Some(&fence)) {
            root.abort_render(info);
            self.reporter.report(
                ReportSeverity::NonCriticalError,
                &format!("submitting '{}': {e}", root.label()),
            );
            return Err(e);
        }
        root.confirm_submission(info);
        crate::frame_mark!();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "FrameSchedule: ticket {id} submitted {} surfaces for '{}'",
            collector.len(),
            root.label()
        );
        self.in_flight.push(InFlight {
            id,
            root: Arc::clone(root),
            info,
            fence,
        });
        Ok(FrameTicket {
            id,
            order: collector.labels().map(str::to_string).collect(),
        })
    }

    /// Wait for a ticket's work to complete and mark its surfaces ready.
    ///
    /// Returns `Ok(false)` if the timeout elapsed first; the ticket stays in
    /// flight. `None` waits indefinitely.
    pub fn finish(
        &mut self,
        ticket: &FrameTicket,
        timeout: Option<Duration>,
    ) -> Result<bool, GraphicsError> {
        let index = self
            .in_flight
            .iter()
            .position(|f| f.id == ticket.id)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("ticket {} is not in flight", ticket.id))
            })?;

        if !self.backend.wait_fence(&self.in_flight[index].fence, timeout)? {
            return Ok(false);
        }
        let finished = self.in_flight.swap_remove(index);
        finished.root.confirm_finished(finished.info);
        Ok(true)
    }

    /// Confirm every ticket whose work has completed. Returns how many were confirmed.
    pub fn poll(&mut self) -> Result<usize, GraphicsError> {
        let mut confirmed = 0;
        let mut index = 0;
        while index < self.in_flight.len() {
            if self.backend.is_fence_signaled(&self.in_flight[index].fence)? {
                let finished = self.in_flight.swap_remove(index);
                finished.root.confirm_finished(finished.info);
                confirmed += 1;
            } else {
                index += 1;
            }
        }
        Ok(confirmed)
    }

    /// Number of tickets not yet confirmed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SemaphoreKind;
    use crate::backend::software::{ExecutionMode, SoftwareBackend, SoftwareParameters};

    fn deferred_queue() -> (Arc<dyn GpuBackend>, Queue) {
        let backend: Arc<dyn GpuBackend> = Arc::new(SoftwareBackend::new(
            &SoftwareParameters::default().with_execution(ExecutionMode::Deferred),
        ));
        let queue = Queue::new(Arc::clone(&backend));
        (backend, queue)
    }

    #[test]
    fn test_queue_signals_after_execution() {
        let (backend, queue) = deferred_queue();
        let semaphore = Arc::new(backend.create_semaphore(SemaphoreKind::Timeline).unwrap());
        let fence = backend.create_fence(false).unwrap();

        let info = SubmitInfo {
            signals: vec![SemaphoreSignal {
                semaphore: Arc::clone(&semaphore),
                value: 3,
            }],
            ..Default::default()
        };
        queue.submit(&[info], Some(&fence)).unwrap();
        assert_eq!(backend.semaphore_value(&semaphore).unwrap(), 0);
        assert!(!backend.is_fence_signaled(&fence).unwrap());

        assert_eq!(backend.process_pending().unwrap(), 1);
        assert_eq!(backend.semaphore_value(&semaphore).unwrap(), 3);
        assert!(backend.is_fence_signaled(&fence).unwrap());
    }

    #[test]
    fn test_queue_reports_backend_capabilities() {
        let (backend, queue) = deferred_queue();
        assert_eq!(queue.family_index(), backend.capabilities().queue_family_index);
        assert_eq!(queue.transfer_granularity(), Extent2d::new(1, 1));
    }
}
