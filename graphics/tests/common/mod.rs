//! Common utilities for surface integration tests.
//!
//! This module provides shared test infrastructure that can be reused
//! across different backend implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use vellum_graphics::backend::software::SoftwareBackend;
use vellum_graphics::backend::{
    DescriptorLayout, DeviceCapabilities, GpuBackend, GpuBuffer, GpuCommandBuffer,
    GpuDescriptorSet, GpuFence, GpuImage, GpuSemaphore, SemaphoreKind,
};
use vellum_graphics::command::CommandList;
use vellum_graphics::types::{BufferDescriptor, ImageDescriptor};
use vellum_graphics::{
    BackendType, BlurAmount, BlurType, Color, ExecutionMode, FatalPolicy, GraphicsError,
    GraphicsInstance, InstanceParameters, Rect, RenderSurface, SoftwareParameters, SubmitInfo,
    SurfaceDescriptor,
};

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Available backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// CPU backend, always available.
    Software,
    /// Vulkan backend (native via ash).
    Vulkan,
}

impl Backend {
    /// Check if this backend is currently available.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Software => true,
            // Compiled in with the feature; a device may still be missing.
            #[cfg(feature = "vulkan-backend")]
            Backend::Vulkan => true,
            #[cfg(not(feature = "vulkan-backend"))]
            Backend::Vulkan => false,
        }
    }

    /// Convert to InstanceParameters for creating a GraphicsInstance.
    pub fn to_instance_parameters(self) -> InstanceParameters {
        let params = InstanceParameters::new()
            .with_fatal_policy(FatalPolicy::Continue)
            .with_validation(false);
        match self {
            Backend::Software => params.with_backend(BackendType::Software),
            Backend::Vulkan => params.with_backend(BackendType::Vulkan),
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// Test context owning the graphics instance of one test.
pub struct TestContext {
    #[allow(dead_code)]
    pub backend: Backend,
    pub instance: Arc<GraphicsInstance>,
}

impl TestContext {
    /// Create a new test context for the given backend.
    ///
    /// Returns `None` if the backend is not available.
    pub fn new(backend: Backend) -> Option<Self> {
        Self::with_parameters(backend, backend.to_instance_parameters())
    }

    /// Create a context with custom parameters.
    pub fn with_parameters(backend: Backend, params: InstanceParameters) -> Option<Self> {
        if !backend.is_available() {
            return None;
        }
        let _ = env_logger::builder().is_test(true).try_init();
        let instance = GraphicsInstance::new(params).ok()?;
        Some(Self { backend, instance })
    }

    /// Software context whose submissions only run on `process_pending`.
    #[allow(dead_code)]
    pub fn deferred(sync_timeout: Duration) -> Self {
        let params = Backend::Software
            .to_instance_parameters()
            .with_sync_timeout(sync_timeout)
            .with_software(SoftwareParameters::default().with_execution(ExecutionMode::Deferred));
        match Self::with_parameters(Backend::Software, params) {
            Some(ctx) => ctx,
            None => panic!("software backend must always be available"),
        }
    }

    /// Software context whose backend fails on demand.
    #[allow(dead_code)]
    pub fn faulty() -> (Self, Arc<Faults>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let faults = Arc::new(Faults::default());
        let backend = Arc::new(FaultyBackend {
            inner: SoftwareBackend::new(&SoftwareParameters::default()),
            faults: Arc::clone(&faults),
        });
        let instance = match GraphicsInstance::with_backend(
            Backend::Software.to_instance_parameters(),
            backend,
        ) {
            Ok(instance) => instance,
            Err(e) => panic!("software backend must always be available: {e}"),
        };
        let ctx = Self {
            backend: Backend::Software,
            instance,
        };
        (ctx, faults)
    }

    /// Create a surface cleared to `clear`.
    pub fn surface(&self, label: &str, width: u32, height: u32, clear: Color) -> Arc<RenderSurface> {
        self.instance
            .create_surface(
                &SurfaceDescriptor::new(width, height)
                    .with_label(label)
                    .with_clear_color(clear),
            )
            .unwrap()
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

/// Failures a [`FaultyBackend`] injects while set.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct Faults {
    /// `create_fence` fails.
    pub fence_creation: AtomicBool,
    /// `submit` rejects every batch.
    pub submission: AtomicBool,
    /// Semaphore queries and waits report a lost device.
    pub device_lost: AtomicBool,
}

impl Faults {
    fn check(flag: &AtomicBool, error: impl FnOnce() -> GraphicsError) -> Result<(), GraphicsError> {
        if flag.load(Ordering::SeqCst) {
            return Err(error());
        }
        Ok(())
    }
}

/// Software backend that fails the operations enabled in its [`Faults`].
#[allow(dead_code)]
pub struct FaultyBackend {
    inner: SoftwareBackend,
    faults: Arc<Faults>,
}

impl GpuBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        "Faulty Software Backend"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        self.inner.capabilities()
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<GpuImage, GraphicsError> {
        self.inner.create_image(descriptor)
    }

    fn write_image(&self, image: &GpuImage, pixels: &[u8]) -> Result<(), GraphicsError> {
        self.inner.write_image(image, pixels)
    }

    fn read_image(&self, image: &GpuImage, mip_level: u32) -> Result<Vec<u8>, GraphicsError> {
        self.inner.read_image(image, mip_level)
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        self.inner.create_buffer(descriptor)
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<GpuSemaphore, GraphicsError> {
        self.inner.create_semaphore(kind)
    }

    fn create_fence(&self, signaled: bool) -> Result<GpuFence, GraphicsError> {
        Faults::check(&self.faults.fence_creation, || {
            GraphicsError::ResourceCreationFailed("fence".to_string())
        })?;
        self.inner.create_fence(signaled)
    }

    fn create_command_buffer(&self, label: &str) -> Result<GpuCommandBuffer, GraphicsError> {
        self.inner.create_command_buffer(label)
    }

    fn record(
        &self,
        command_buffer: &GpuCommandBuffer,
        commands: &CommandList,
    ) -> Result<(), GraphicsError> {
        self.inner.record(command_buffer, commands)
    }

    fn submit(&self, submits: &[SubmitInfo], fence: Option<&GpuFence>) -> Result<(), GraphicsError> {
        Faults::check(&self.faults.submission, || {
            GraphicsError::SubmissionFailed("queue rejected the batch".to_string())
        })?;
        self.inner.submit(submits, fence)
    }

    fn semaphore_value(&self, semaphore: &GpuSemaphore) -> Result<u64, GraphicsError> {
        Faults::check(&self.faults.device_lost, || GraphicsError::DeviceLost)?;
        self.inner.semaphore_value(semaphore)
    }

    fn wait_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, GraphicsError> {
        Faults::check(&self.faults.device_lost, || GraphicsError::DeviceLost)?;
        self.inner.wait_semaphore(semaphore, value, timeout)
    }

    fn wait_fence(&self, fence: &GpuFence, timeout: Option<Duration>) -> Result<bool, GraphicsError> {
        self.inner.wait_fence(fence, timeout)
    }

    fn is_fence_signaled(&self, fence: &GpuFence) -> Result<bool, GraphicsError> {
        self.inner.is_fence_signaled(fence)
    }

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayout,
    ) -> Result<GpuDescriptorSet, GraphicsError> {
        self.inner.allocate_descriptor_set(layout)
    }

    fn free_descriptor_set(&self, set: GpuDescriptorSet) {
        self.inner.free_descriptor_set(set)
    }

    fn process_pending(&self) -> Result<usize, GraphicsError> {
        self.inner.process_pending()
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.inner.wait_idle()
    }
}

/// Record a frame that only clears the surface.
#[allow(dead_code)]
pub fn record_clear(surface: &RenderSurface) {
    surface.begin_render().unwrap();
    surface.end_render(BlurAmount::NONE, BlurType::Gaussian).unwrap();
}

/// Record a frame that draws every source over the whole surface.
#[allow(dead_code)]
pub fn record_sampling(surface: &RenderSurface, sources: &[&Arc<RenderSurface>]) {
    let size = surface.size();
    let rect = Rect::new(0.0, 0.0, size.width as f32, size.height as f32);
    surface.begin_render().unwrap();
    for source in sources {
        surface
            .draw_rectangle(rect, Color::WHITE, Some((*source).into()))
            .unwrap();
    }
    surface.end_render(BlurAmount::NONE, BlurType::Gaussian).unwrap();
}

/// RGBA8 pixel at (x, y) of a tightly packed image.
#[allow(dead_code)]
pub fn pixel(data: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let offset = ((y * width + x) * 4) as usize;
    [
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]
}
