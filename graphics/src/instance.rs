//! Graphics instance.
//!
//! The [`GraphicsInstance`] is the top-level entry point for the graphics system.
//! It owns the backend, the submission [`Queue`], the [`Reporter`] and the
//! descriptor pool that every surface created from it shares.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::backend::{self, DeviceCapabilities, GpuBackend};
use crate::backend::software::SoftwareParameters;
use crate::descriptor::{BackendDescriptorPool, DescriptorPool};
use crate::error::GraphicsError;
use crate::report::{FatalPolicy, ReportCallback, Reporter};
use crate::scheduler::{FrameSchedule, Queue};
use crate::surface::RenderSurface;
use crate::texture::Texture;
use crate::types::{ImageDescriptor, SurfaceDescriptor, TextureUsage};

/// Default bound on every wait for a completion signal.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Which backend an instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendType {
    /// CPU execution, always available.
    Software,
    /// Native Vulkan, requires the `vulkan-backend` feature.
    Vulkan,
    /// Vulkan when available, software otherwise.
    #[default]
    Auto,
}

/// Parameters for creating a [`GraphicsInstance`].
#[derive(Clone)]
pub struct InstanceParameters {
    /// Backend to create.
    pub backend: BackendType,
    /// Enable API validation layers where the backend has them.
    pub validation: bool,
    /// Bound on every wait for a completion signal.
    pub sync_timeout: Duration,
    /// What happens after a critical report.
    pub fatal_policy: FatalPolicy,
    /// Software backend configuration.
    pub software: SoftwareParameters,
    /// Callback invoked for every report.
    pub report_callback: Option<ReportCallback>,
}

impl Default for InstanceParameters {
    fn default() -> Self {
        Self {
            backend: BackendType::Auto,
            validation: cfg!(debug_assertions),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            fatal_policy: FatalPolicy::Exit,
            software: SoftwareParameters::default(),
            report_callback: None,
        }
    }
}

impl std::fmt::Debug for InstanceParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceParameters")
            .field("backend", &self.backend)
            .field("validation", &self.validation)
            .field("sync_timeout", &self.sync_timeout)
            .field("fatal_policy", &self.fatal_policy)
            .field("software", &self.software)
            .field("report_callback", &self.report_callback.is_some())
            .finish()
    }
}

impl InstanceParameters {
    /// Default parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the backend.
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the bound on completion waits.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set the policy applied to critical reports.
    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }

    /// Configure the software backend.
    pub fn with_software(mut self, software: SoftwareParameters) -> Self {
        self.software = software;
        self
    }

    /// Install a report callback.
    pub fn with_report_callback(mut self, callback: ReportCallback) -> Self {
        self.report_callback = Some(callback);
        self
    }
}

/// The graphics instance.
///
/// # Thread Safety
///
/// `GraphicsInstance` is `Send + Sync` and can be safely shared across threads.
///
/// # Example
///
/// ```ignore
/// let instance = GraphicsInstance::new(InstanceParameters::new())?;
/// let surface = instance.create_surface(&SurfaceDescriptor::new(256, 256))?;
/// ```
pub struct GraphicsInstance {
    params: InstanceParameters,
    backend: Arc<dyn GpuBackend>,
    queue: Arc<Queue>,
    reporter: Arc<Reporter>,
    descriptor_pool: RwLock<Arc<dyn DescriptorPool>>,
    white_texture: Arc<Texture>,
    next_id: AtomicU64,
}

impl GraphicsInstance {
    /// Create a new graphics instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested backend cannot be initialized.
    pub fn new(params: InstanceParameters) -> Result<Arc<Self>, GraphicsError> {
        log::info!("Creating GraphicsInstance ({:?} backend)", params.backend);
        let backend = backend::create_backend(&params)?;
        Self::with_backend(params, backend)
    }

    /// Create an instance on an already constructed backend.
    ///
    /// `params.backend` is ignored; every other parameter applies.
    pub fn with_backend(
        params: InstanceParameters,
        backend: Arc<dyn GpuBackend>,
    ) -> Result<Arc<Self>, GraphicsError> {
        log::info!(
            "Using GPU backend: {} ({})",
            backend.name(),
            backend.capabilities().device_name
        );

        let reporter = Arc::new(Reporter::new(params.fatal_policy));
        reporter.set_callback(params.report_callback.clone());

        let white = backend.create_image(
            &ImageDescriptor::new_2d(1, 1, TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST)
                .with_label("white"),
        )?;
        backend.write_image(&white, &[255; 4])?;

        Ok(Arc::new(Self {
            queue: Arc::new(Queue::new(Arc::clone(&backend))),
            descriptor_pool: RwLock::new(Arc::new(BackendDescriptorPool::new(Arc::clone(
                &backend,
            )))),
            white_texture: Arc::new(Texture::new(0, white)),
            next_id: AtomicU64::new(1),
            params,
            backend,
            reporter,
        }))
    }

    /// Parameters the instance was created with.
    pub fn parameters(&self) -> &InstanceParameters {
        &self.params
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// The submission queue.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// The report sink.
    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Limits and properties of the device.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.backend.capabilities()
    }

    /// Bound on every wait for a completion signal.
    pub fn sync_timeout(&self) -> Duration {
        self.params.sync_timeout
    }

    /// The current descriptor pool.
    pub fn descriptor_pool(&self) -> Arc<dyn DescriptorPool> {
        Arc::clone(&self.descriptor_pool.read())
    }

    /// Replace the descriptor pool used by subsequent allocations.
    ///
    /// Sets already allocated are returned to the pool they came from.
    pub fn set_descriptor_pool(&self, pool: Arc<dyn DescriptorPool>) {
        *self.descriptor_pool.write() = pool;
    }

    pub(crate) fn white_texture(&self) -> &Arc<Texture> {
        &self.white_texture
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a render-to-texture surface.
    pub fn create_surface(
        self: &Arc<Self>,
        descriptor: &SurfaceDescriptor,
    ) -> Result<Arc<RenderSurface>, GraphicsError> {
        RenderSurface::new(Arc::clone(self), descriptor).map(Arc::new)
    }

    /// Create an immutable texture from tightly packed RGBA8 pixels.
    ///
    /// The upload has completed when this returns.
    pub fn create_texture(
        &self,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Arc<Texture>, GraphicsError> {
        if width == 0 || height == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "texture size {width}x{height} is empty"
            )));
        }
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "expected {expected} bytes of RGBA8 data, got {}",
                pixels.len()
            )));
        }

        let id = self.next_id();
        let descriptor = ImageDescriptor::new_2d(
            width,
            height,
            TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        )
        .with_label(format!("texture {id}"));

        let image = self
            .backend
            .create_image(&descriptor)
            .and_then(|image| {
                self.backend.write_image(&image, pixels)?;
                Ok(image)
            })
            .map_err(|e| {
                let e = GraphicsError::ResourceCreationFailed(format!("texture {id}: {e}"));
                self.reporter.report_error(&e, "create_texture");
                e
            })?;

        log::trace!("GraphicsInstance: created texture {id} ({width}x{height})");
        Ok(Arc::new(Texture::new(id, image)))
    }

    /// Create a frame schedule for driving root surfaces.
    pub fn create_frame_schedule(&self) -> FrameSchedule {
        FrameSchedule::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.backend),
            Arc::clone(&self.reporter),
        )
    }

    /// Execute submissions the backend has queued but not yet run.
    pub fn process_pending(&self) -> Result<usize, GraphicsError> {
        self.backend.process_pending()
    }

    /// Block until all submitted work has completed.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.backend.wait_idle()
    }
}

impl std::fmt::Debug for GraphicsInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsInstance")
            .field("backend", &self.backend.name())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

// Ensure GraphicsInstance is Send + Sync
static_assertions::assert_impl_all!(GraphicsInstance: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn software() -> Arc<GraphicsInstance> {
        GraphicsInstance::new(
            InstanceParameters::new()
                .with_backend(BackendType::Software)
                .with_fatal_policy(FatalPolicy::Continue),
        )
        .unwrap()
    }

    #[test]
    fn test_instance_creation() {
        let instance = software();
        assert_eq!(instance.backend().name(), "Software Backend");
        assert_eq!(instance.sync_timeout(), DEFAULT_SYNC_TIMEOUT);
        assert_eq!(instance.queue().family_index(), 0);
    }

    #[test]
    fn test_create_texture() {
        let instance = software();
        let texture = instance.create_texture(2, 1, &[255; 8]).unwrap();
        assert_eq!(texture.width(), 2);
        assert_eq!(texture.height(), 1);
        assert_eq!(
            instance.backend().read_image(texture.image(), 0).unwrap(),
            vec![255; 8]
        );
    }

    #[test]
    fn test_create_texture_validates_input() {
        let instance = software();
        assert!(matches!(
            instance.create_texture(0, 4, &[]),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert!(matches!(
            instance.create_texture(2, 2, &[0; 4]),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_texture_ids_are_unique() {
        let instance = software();
        let a = instance.create_texture(1, 1, &[0; 4]).unwrap();
        let b = instance.create_texture(1, 1, &[0; 4]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[cfg(not(feature = "vulkan-backend"))]
    #[test]
    fn test_vulkan_requires_feature() {
        let result = GraphicsInstance::new(InstanceParameters::new().with_backend(BackendType::Vulkan));
        assert!(matches!(result, Err(GraphicsError::FeatureNotSupported(_))));
    }
}
