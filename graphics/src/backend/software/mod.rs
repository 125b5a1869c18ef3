//! Software GPU backend.
//!
//! Executes command lists on the CPU with the same ordering rules a GPU queue
//! follows: a submission runs only once its semaphore waits are satisfied, and
//! its signals become visible after all of its command buffers have run.
//!
//! In [`ExecutionMode::Immediate`] every submission executes inside
//! [`GpuBackend::submit`]. In [`ExecutionMode::Deferred`] submissions are
//! queued until [`GpuBackend::process_pending`] runs them, which lets tests
//! observe work that has been submitted but not yet completed.

mod executor;
pub mod image;
pub mod raster;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::CommandList;
use crate::error::GraphicsError;
use crate::scheduler::SubmitInfo;
use crate::scheduler::sync::{BinarySemaphore, Fence, TimelineSemaphore};
use crate::types::{BufferDescriptor, Extent2d, ImageDescriptor, SampleCount, SampleCountFlags};

pub use image::SoftwareImage;

use super::{
    DescriptorLayout, DeviceCapabilities, GpuBackend, GpuBuffer, GpuCommandBuffer,
    GpuDescriptorSet, GpuFence, GpuImage, GpuSemaphore, SemaphoreKind, SoftwareSemaphore,
};

/// When submitted work executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// Execute inside `submit`.
    #[default]
    Immediate,
    /// Queue until `process_pending` (or `wait_idle`) is called.
    Deferred,
}

/// Configuration of the software backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareParameters {
    /// When submitted work executes.
    pub execution: ExecutionMode,
    /// Reported queue transfer granularity.
    pub transfer_granularity: Extent2d,
    /// Highest supported sample count.
    pub max_samples: SampleCount,
    /// Maximum number of live descriptor sets. `None` is unbounded.
    pub descriptor_capacity: Option<u32>,
}

impl Default for SoftwareParameters {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::Immediate,
            transfer_granularity: Extent2d::new(1, 1),
            max_samples: SampleCount::X8,
            descriptor_capacity: None,
        }
    }
}

impl SoftwareParameters {
    /// Set the execution mode.
    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    /// Set the reported transfer granularity.
    pub fn with_transfer_granularity(mut self, granularity: Extent2d) -> Self {
        self.transfer_granularity = granularity;
        self
    }

    /// Set the highest supported sample count.
    pub fn with_max_samples(mut self, samples: SampleCount) -> Self {
        self.max_samples = samples;
        self
    }

    /// Limit the number of live descriptor sets.
    pub fn with_descriptor_capacity(mut self, capacity: u32) -> Self {
        self.descriptor_capacity = Some(capacity);
        self
    }
}

/// CPU memory buffer.
#[derive(Debug)]
pub struct SoftwareBuffer {
    data: Mutex<Vec<u8>>,
}

impl SoftwareBuffer {
    fn new(size: u64) -> Self {
        Self {
            data: Mutex::new(vec![0; size as usize]),
        }
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    /// Write bytes at an offset.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), GraphicsError> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            return Err(GraphicsError::SubmissionFailed(format!(
                "buffer write of {} bytes at {offset} exceeds size {}",
                bytes.len(),
                data.len()
            )));
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a plain-data value at an offset.
    pub fn read_pod<T: bytemuck::Pod>(&self, offset: u64) -> Result<T, GraphicsError> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + std::mem::size_of::<T>();
        if end > data.len() {
            return Err(GraphicsError::SubmissionFailed(format!(
                "buffer read of {} bytes at {offset} exceeds size {}",
                std::mem::size_of::<T>(),
                data.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(&data[start..end]))
    }
}

/// Command buffer holding a compiled command list.
#[derive(Debug)]
pub struct SoftwareCommandBuffer {
    label: String,
    list: Mutex<Option<Arc<CommandList>>>,
}

impl SoftwareCommandBuffer {
    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A submission with its handles resolved and its command lists snapshotted.
struct PreparedSubmit {
    lists: Vec<Arc<CommandList>>,
    waits: Vec<(SoftwareSemaphore, u64)>,
    signals: Vec<(SoftwareSemaphore, u64)>,
}

struct PendingBatch {
    submits: Vec<PreparedSubmit>,
    fence: Option<Fence>,
}

/// Simulated semaphore state used to validate a batch before it runs.
#[derive(Default)]
struct SemaphoreSimulation {
    timelines: Vec<(TimelineSemaphore, u64)>,
    binaries: Vec<(BinarySemaphore, bool)>,
}

impl SemaphoreSimulation {
    fn timeline(&mut self, sem: &TimelineSemaphore) -> &mut u64 {
        let index = match self.timelines.iter().position(|(s, _)| s.same_as(sem)) {
            Some(index) => index,
            None => {
                self.timelines.push((sem.clone(), sem.value()));
                self.timelines.len() - 1
            }
        };
        &mut self.timelines[index].1
    }

    fn binary(&mut self, sem: &BinarySemaphore) -> &mut bool {
        let index = match self.binaries.iter().position(|(s, _)| s.same_as(sem)) {
            Some(index) => index,
            None => {
                self.binaries.push((sem.clone(), sem.is_signaled()));
                self.binaries.len() - 1
            }
        };
        &mut self.binaries[index].1
    }

    fn validate(&mut self, index: usize, submit: &PreparedSubmit) -> Result<(), GraphicsError> {
        for (semaphore, value) in &submit.waits {
            match semaphore {
                SoftwareSemaphore::Timeline(sem) => {
                    let current = *self.timeline(sem);
                    if current < *value {
                        return Err(GraphicsError::SubmissionFailed(format!(
                            "submit {index} waits for timeline value {value}, which is at {current} and has no pending signal"
                        )));
                    }
                }
                SoftwareSemaphore::Binary(sem) => {
                    let signaled = self.binary(sem);
                    if !*signaled {
                        return Err(GraphicsError::SubmissionFailed(format!(
                            "submit {index} waits on a binary semaphore with no pending signal"
                        )));
                    }
                    *signaled = false;
                }
            }
        }
        for (semaphore, value) in &submit.signals {
            match semaphore {
                SoftwareSemaphore::Timeline(sem) => {
                    let current = self.timeline(sem);
                    *current = (*current).max(*value);
                }
                SoftwareSemaphore::Binary(sem) => {
                    let signaled = self.binary(sem);
                    if *signaled {
                        return Err(GraphicsError::SubmissionFailed(format!(
                            "submit {index} signals a binary semaphore that is already signaled"
                        )));
                    }
                    *signaled = true;
                }
            }
        }
        Ok(())
    }
}

/// Software GPU backend.
pub struct SoftwareBackend {
    params: SoftwareParameters,
    capabilities: DeviceCapabilities,
    pending: Mutex<VecDeque<PendingBatch>>,
    execution: Mutex<()>,
    next_descriptor: AtomicU64,
    live_descriptors: Mutex<HashSet<u64>>,
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("params", &self.params)
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl SoftwareBackend {
    /// Create a software backend.
    pub fn new(params: &SoftwareParameters) -> Self {
        let sample_counts = SampleCount::ALL
            .into_iter()
            .filter(|s| *s <= params.max_samples)
            .fold(SampleCountFlags::empty(), |flags, s| {
                flags | SampleCountFlags::from_bits_truncate(s.count())
            });
        log::info!(
            "SoftwareBackend: created ({:?} execution, samples {:?})",
            params.execution,
            sample_counts
        );
        Self {
            params: params.clone(),
            capabilities: DeviceCapabilities {
                device_name: "Software Rasterizer".to_string(),
                sample_counts,
                transfer_granularity: params.transfer_granularity,
                queue_family_index: 0,
                max_image_dimension: 16384,
            },
            pending: Mutex::new(VecDeque::new()),
            execution: Mutex::new(()),
            next_descriptor: AtomicU64::new(1),
            live_descriptors: Mutex::new(HashSet::new()),
        }
    }

    /// Parameters the backend was created with.
    pub fn parameters(&self) -> &SoftwareParameters {
        &self.params
    }

    /// Number of submission batches waiting for `process_pending`.
    pub fn pending_batches(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of descriptor sets currently allocated.
    pub fn live_descriptor_sets(&self) -> usize {
        self.live_descriptors.lock().len()
    }

    fn image<'a>(&self, image: &'a GpuImage) -> Result<&'a SoftwareImage, GraphicsError> {
        match image {
            GpuImage::Software(image) => Ok(image),
            #[allow(unreachable_patterns)]
            _ => Err(GraphicsError::InvalidParameter(
                "image was not created by the software backend".to_string(),
            )),
        }
    }

    fn semaphore<'a>(
        &self,
        semaphore: &'a GpuSemaphore,
    ) -> Result<&'a SoftwareSemaphore, GraphicsError> {
        match semaphore {
            GpuSemaphore::Software(semaphore) => Ok(semaphore),
            #[allow(unreachable_patterns)]
            _ => Err(GraphicsError::InvalidParameter(
                "semaphore was not created by the software backend".to_string(),
            )),
        }
    }

    fn timeline<'a>(
        &self,
        semaphore: &'a GpuSemaphore,
    ) -> Result<&'a TimelineSemaphore, GraphicsError> {
        match self.semaphore(semaphore)? {
            SoftwareSemaphore::Timeline(sem) => Ok(sem),
            SoftwareSemaphore::Binary(_) => Err(GraphicsError::InvalidParameter(
                "expected a timeline semaphore".to_string(),
            )),
        }
    }

    fn fence<'a>(&self, fence: &'a GpuFence) -> Result<&'a Fence, GraphicsError> {
        match fence {
            GpuFence::Software(fence) => Ok(fence),
            #[allow(unreachable_patterns)]
            _ => Err(GraphicsError::InvalidParameter(
                "fence was not created by the software backend".to_string(),
            )),
        }
    }

    fn prepare(&self, submit: &SubmitInfo) -> Result<PreparedSubmit, GraphicsError> {
        let mut lists = Vec::with_capacity(submit.command_buffers.len());
        for command_buffer in &submit.command_buffers {
            let buffer = match command_buffer.as_ref() {
                GpuCommandBuffer::Software(buffer) => buffer,
                #[allow(unreachable_patterns)]
                _ => {
                    return Err(GraphicsError::InvalidParameter(
                        "command buffer was not created by the software backend".to_string(),
                    ));
                }
            };
            let list = buffer.list.lock().clone().ok_or_else(|| {
                GraphicsError::SubmissionFailed(format!(
                    "command buffer '{}' was never recorded",
                    buffer.label
                ))
            })?;
            lists.push(list);
        }

        let waits = submit
            .waits
            .iter()
            .map(|wait| Ok((self.semaphore(&wait.semaphore)?.clone(), wait.value)))
            .collect::<Result<_, GraphicsError>>()?;
        let signals = submit
            .signals
            .iter()
            .map(|signal| Ok((self.semaphore(&signal.semaphore)?.clone(), signal.value)))
            .collect::<Result<_, GraphicsError>>()?;

        Ok(PreparedSubmit {
            lists,
            waits,
            signals,
        })
    }

    /// Validate and run a batch. Callers hold the execution lock.
    fn run_batch(&self, batch: PendingBatch) -> Result<(), GraphicsError> {
        crate::profile_scope!("software_run_batch");

        let mut simulation = SemaphoreSimulation::default();
        for (index, submit) in batch.submits.iter().enumerate() {
            simulation.validate(index, submit)?;
        }

        for submit in &batch.submits {
            for (semaphore, _) in &submit.waits {
                if let SoftwareSemaphore::Binary(sem) = semaphore {
                    sem.try_consume();
                }
            }
            for list in &submit.lists {
                executor::execute(list)?;
            }
            for (semaphore, value) in &submit.signals {
                match semaphore {
                    SoftwareSemaphore::Timeline(sem) => sem.signal(*value),
                    SoftwareSemaphore::Binary(sem) => sem.signal(),
                }
            }
        }

        if let Some(fence) = batch.fence {
            fence.signal();
        }
        Ok(())
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "Software Backend"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<GpuImage, GraphicsError> {
        log::trace!(
            "SoftwareBackend: creating image {:?} ({}x{}, {} mips, {:?})",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.mip_level_count,
            descriptor.samples
        );
        if descriptor.size.is_empty()
            || descriptor.size.width > self.capabilities.max_image_dimension
            || descriptor.size.height > self.capabilities.max_image_dimension
        {
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "image {:?}: unsupported size {}x{}",
                descriptor.label, descriptor.size.width, descriptor.size.height
            )));
        }
        if !self.capabilities.sample_counts.supports(descriptor.samples) {
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "image {:?}: sample count {:?} not supported",
                descriptor.label, descriptor.samples
            )));
        }
        Ok(GpuImage::Software(SoftwareImage::new(descriptor)?))
    }

    fn write_image(&self, image: &GpuImage, pixels: &[u8]) -> Result<(), GraphicsError> {
        self.image(image)?.upload_rgba8(pixels)
    }

    fn read_image(&self, image: &GpuImage, mip_level: u32) -> Result<Vec<u8>, GraphicsError> {
        self.image(image)?.download_rgba8(mip_level)
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        log::trace!(
            "SoftwareBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Ok(GpuBuffer::Software(SoftwareBuffer::new(descriptor.size)))
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<GpuSemaphore, GraphicsError> {
        let semaphore = match kind {
            SemaphoreKind::Timeline => SoftwareSemaphore::Timeline(TimelineSemaphore::new(0)),
            SemaphoreKind::Binary => SoftwareSemaphore::Binary(BinarySemaphore::new()),
        };
        Ok(GpuSemaphore::Software(semaphore))
    }

    fn create_fence(&self, signaled: bool) -> Result<GpuFence, GraphicsError> {
        let fence = if signaled {
            Fence::new_signaled()
        } else {
            Fence::new_unsignaled()
        };
        Ok(GpuFence::Software(fence))
    }

    fn create_command_buffer(&self, label: &str) -> Result<GpuCommandBuffer, GraphicsError> {
        Ok(GpuCommandBuffer::Software(SoftwareCommandBuffer {
            label: label.to_string(),
            list: Mutex::new(None),
        }))
    }

    fn record(
        &self,
        command_buffer: &GpuCommandBuffer,
        commands: &CommandList,
    ) -> Result<(), GraphicsError> {
        let buffer = match command_buffer {
            GpuCommandBuffer::Software(buffer) => buffer,
            #[allow(unreachable_patterns)]
            _ => {
                return Err(GraphicsError::CommandRecordingFailed(
                    "command buffer was not created by the software backend".to_string(),
                ));
            }
        };
        log::trace!(
            "SoftwareBackend: recording '{}' ({} commands) into '{}'",
            commands.label(),
            commands.len(),
            buffer.label
        );
        *buffer.list.lock() = Some(Arc::new(commands.clone()));
        Ok(())
    }

    fn submit(
        &self,
        submits: &[SubmitInfo],
        fence: Option<&GpuFence>,
    ) -> Result<(), GraphicsError> {
        let batch = PendingBatch {
            submits: submits
                .iter()
                .map(|submit| self.prepare(submit))
                .collect::<Result<_, _>>()?,
            fence: fence.map(|f| self.fence(f).cloned()).transpose()?,
        };
        log::trace!(
            "SoftwareBackend: submitting {} submits ({:?})",
            batch.submits.len(),
            self.params.execution
        );

        match self.params.execution {
            ExecutionMode::Immediate => {
                let _guard = self.execution.lock();
                self.run_batch(batch)
            }
            ExecutionMode::Deferred => {
                self.pending.lock().push_back(batch);
                Ok(())
            }
        }
    }

    fn semaphore_value(&self, semaphore: &GpuSemaphore) -> Result<u64, GraphicsError> {
        Ok(self.timeline(semaphore)?.value())
    }

    fn wait_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, GraphicsError> {
        Ok(self.timeline(semaphore)?.wait(value, timeout))
    }

    fn wait_fence(
        &self,
        fence: &GpuFence,
        timeout: Option<Duration>,
    ) -> Result<bool, GraphicsError> {
        Ok(self.fence(fence)?.wait(timeout))
    }

    fn is_fence_signaled(&self, fence: &GpuFence) -> Result<bool, GraphicsError> {
        Ok(self.fence(fence)?.is_signaled())
    }

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayout,
    ) -> Result<GpuDescriptorSet, GraphicsError> {
        let mut live = self.live_descriptors.lock();
        if let Some(capacity) = self.params.descriptor_capacity {
            if live.len() >= capacity as usize {
                return Err(GraphicsError::DescriptorAllocationFailed(format!(
                    "pool exhausted ({capacity} sets)"
                )));
            }
        }
        let id = self.next_descriptor.fetch_add(1, Ordering::Relaxed);
        live.insert(id);
        Ok(GpuDescriptorSet::Software { id, layout })
    }

    fn free_descriptor_set(&self, set: GpuDescriptorSet) {
        match set {
            GpuDescriptorSet::Software { id, .. } => {
                if !self.live_descriptors.lock().remove(&id) {
                    log::warn!("SoftwareBackend: freeing unknown descriptor set {id}");
                }
            }
            #[allow(unreachable_patterns)]
            other => log::warn!("SoftwareBackend: ignoring foreign descriptor set {other:?}"),
        }
    }

    fn process_pending(&self) -> Result<usize, GraphicsError> {
        let _guard = self.execution.lock();
        let mut processed = 0;
        loop {
            let Some(batch) = self.pending.lock().pop_front() else {
                break;
            };
            self.run_batch(batch)?;
            processed += 1;
        }
        if processed > 0 {
            log::trace!("SoftwareBackend: processed {processed} pending batches");
        }
        Ok(processed)
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.process_pending().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{GpuCommand, PipelineStage};
    use crate::scheduler::{SemaphoreSignal, SemaphoreWait};
    use crate::types::{BufferUsage, Color, TextureUsage};

    fn recorded(backend: &SoftwareBackend, list: CommandList) -> Arc<GpuCommandBuffer> {
        let buffer = backend.create_command_buffer(list.label()).unwrap();
        backend.record(&buffer, &list).unwrap();
        Arc::new(buffer)
    }

    fn clear_list(target: &Arc<GpuImage>, color: Color) -> CommandList {
        let mut list = CommandList::new("clear");
        list.push(GpuCommand::BeginRenderPass {
            target: Arc::clone(target),
            clear: color,
            extent: target.descriptor().size,
        });
        list.push(GpuCommand::EndRenderPass);
        list
    }

    fn target(backend: &SoftwareBackend) -> Arc<GpuImage> {
        Arc::new(
            backend
                .create_image(&ImageDescriptor::new_2d(2, 2, TextureUsage::all()))
                .unwrap(),
        )
    }

    #[test]
    fn test_immediate_submit_executes_and_signals() {
        let backend = SoftwareBackend::new(&SoftwareParameters::default());
        let image = target(&backend);
        let timeline = Arc::new(backend.create_semaphore(SemaphoreKind::Timeline).unwrap());
        let fence = backend.create_fence(false).unwrap();

        let submit = SubmitInfo {
            command_buffers: vec![recorded(&backend, clear_list(&image, Color::RED))],
            waits: Vec::new(),
            signals: vec![SemaphoreSignal {
                semaphore: Arc::clone(&timeline),
                value: 3,
            }],
        };
        backend.submit(&[submit], Some(&fence)).unwrap();

        assert_eq!(backend.semaphore_value(&timeline).unwrap(), 3);
        assert!(backend.is_fence_signaled(&fence).unwrap());
        assert_eq!(&backend.read_image(&image, 0).unwrap()[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_unsatisfiable_wait_is_rejected() {
        let backend = SoftwareBackend::new(&SoftwareParameters::default());
        let image = target(&backend);
        let timeline = Arc::new(backend.create_semaphore(SemaphoreKind::Timeline).unwrap());

        let submit = SubmitInfo {
            command_buffers: vec![recorded(&backend, clear_list(&image, Color::RED))],
            waits: vec![SemaphoreWait {
                semaphore: Arc::clone(&timeline),
                value: 1,
                stage: PipelineStage::ALL_COMMANDS,
            }],
            signals: Vec::new(),
        };
        assert!(matches!(
            backend.submit(&[submit], None),
            Err(GraphicsError::SubmissionFailed(_))
        ));
        // Nothing ran
        assert_eq!(backend.read_image(&image, 0).unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_binary_handoff_within_batch() {
        let backend = SoftwareBackend::new(&SoftwareParameters::default());
        let image = target(&backend);
        let handoff = Arc::new(backend.create_semaphore(SemaphoreKind::Binary).unwrap());
        let buffer = Arc::new(
            backend
                .create_buffer(&BufferDescriptor::new(4, BufferUsage::COPY_DST))
                .unwrap(),
        );

        let mut upload = CommandList::new("upload");
        upload.push(GpuCommand::UpdateBuffer {
            buffer: Arc::clone(&buffer),
            data: vec![1, 2, 3, 4],
        });
        let first = SubmitInfo {
            command_buffers: vec![recorded(&backend, upload)],
            waits: Vec::new(),
            signals: vec![SemaphoreSignal {
                semaphore: Arc::clone(&handoff),
                value: 0,
            }],
        };
        let second = SubmitInfo {
            command_buffers: vec![recorded(&backend, clear_list(&image, Color::GREEN))],
            waits: vec![SemaphoreWait {
                semaphore: Arc::clone(&handoff),
                value: 0,
                stage: PipelineStage::VERTEX_SHADER,
            }],
            signals: Vec::new(),
        };
        backend.submit(&[first, second], None).unwrap();

        let GpuBuffer::Software(buffer) = buffer.as_ref() else {
            unreachable!()
        };
        assert_eq!(buffer.read_pod::<[u8; 4]>(0).unwrap(), [1, 2, 3, 4]);
        let GpuSemaphore::Software(SoftwareSemaphore::Binary(sem)) = handoff.as_ref() else {
            unreachable!()
        };
        assert!(!sem.is_signaled());
    }

    #[test]
    fn test_deferred_runs_on_process_pending() {
        let params = SoftwareParameters::default().with_execution(ExecutionMode::Deferred);
        let backend = SoftwareBackend::new(&params);
        let image = target(&backend);
        let timeline = Arc::new(backend.create_semaphore(SemaphoreKind::Timeline).unwrap());

        let first = SubmitInfo {
            command_buffers: vec![recorded(&backend, clear_list(&image, Color::BLUE))],
            waits: Vec::new(),
            signals: vec![SemaphoreSignal {
                semaphore: Arc::clone(&timeline),
                value: 1,
            }],
        };
        let second = SubmitInfo {
            command_buffers: vec![recorded(&backend, clear_list(&image, Color::WHITE))],
            waits: vec![SemaphoreWait {
                semaphore: Arc::clone(&timeline),
                value: 1,
                stage: PipelineStage::ALL_COMMANDS,
            }],
            signals: Vec::new(),
        };
        backend.submit(&[first], None).unwrap();
        backend.submit(&[second], None).unwrap();

        assert_eq!(backend.pending_batches(), 2);
        assert_eq!(backend.semaphore_value(&timeline).unwrap(), 0);

        assert_eq!(backend.process_pending().unwrap(), 2);
        assert_eq!(backend.semaphore_value(&timeline).unwrap(), 1);
        assert_eq!(&backend.read_image(&image, 0).unwrap()[..4], &[255; 4]);
    }

    #[test]
    fn test_descriptor_capacity() {
        let params = SoftwareParameters::default().with_descriptor_capacity(1);
        let backend = SoftwareBackend::new(&params);

        let set = backend
            .allocate_descriptor_set(DescriptorLayout::Draw)
            .unwrap();
        assert!(matches!(
            backend.allocate_descriptor_set(DescriptorLayout::Draw),
            Err(GraphicsError::DescriptorAllocationFailed(_))
        ));

        backend.free_descriptor_set(set);
        assert_eq!(backend.live_descriptor_sets(), 0);
        assert!(backend.allocate_descriptor_set(DescriptorLayout::Blur).is_ok());
    }

    #[test]
    fn test_capabilities_follow_parameters() {
        let params = SoftwareParameters::default()
            .with_max_samples(SampleCount::X4)
            .with_transfer_granularity(Extent2d::new(8, 8));
        let backend = SoftwareBackend::new(&params);
        let caps = backend.capabilities();

        assert_eq!(caps.sample_counts.max(), SampleCount::X4);
        assert!(!caps.sample_counts.supports(SampleCount::X8));
        assert_eq!(caps.transfer_granularity, Extent2d::new(8, 8));
    }
}
