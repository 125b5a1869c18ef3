//! # Vellum Graphics
//!
//! Render-to-texture surfaces for the Vellum engine: double-buffered frame
//! state, finalization into sampleable mip chains, and submission ordering for
//! graphs of surfaces that sample each other.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GraphicsInstance`] - Owns the backend, queue, reporter and descriptor pool
//! - [`RenderSurface`] - A double-buffered render target other surfaces can sample
//! - [`SubmissionCollector`] - The ordered output of a commit, dependencies first
//! - [`FrameSchedule`] - Submits a root surface and tracks its frames in flight
//! - Multiple backend support: Vulkan and Software (always available)
//!
//! ## Example
//!
//! ```ignore
//! use vellum_graphics::{BlurAmount, BlurType, GraphicsInstance, InstanceParameters};
//! use vellum_graphics::{SamplerDescriptor, SurfaceDescriptor};
//!
//! let instance = GraphicsInstance::new(InstanceParameters::new())?;
//! let shadow = instance.create_surface(&SurfaceDescriptor::new(256, 256).with_blur(true))?;
//! let scene = instance.create_surface(&SurfaceDescriptor::new(512, 512))?;
//!
//! shadow.begin_render()?;
//! // draw into the shadow surface...
//! shadow.end_render(BlurAmount::uniform(4.0), BlurType::Gaussian)?;
//!
//! scene.begin_render()?;
//! scene.draw_rectangle(rect, Color::WHITE, Some((&shadow).into()))?;
//! scene.end_render(BlurAmount::NONE, BlurType::Gaussian)?;
//!
//! let mut schedule = instance.create_frame_schedule();
//! let ticket = schedule.submit(&scene)?; // shadow is submitted first
//! schedule.finish(&ticket, None)?;
//! ```

#[macro_use]
pub mod profiling;

pub mod backend;
pub mod command;
pub mod descriptor;
pub mod error;
pub mod instance;
pub mod report;
pub mod scheduler;
pub mod surface;
pub mod texture;
pub mod types;

// Re-export main types for convenience
pub use backend::{DeviceCapabilities, GpuBackend};
pub use backend::software::{ExecutionMode, SoftwareParameters};
pub use descriptor::DescriptorPool;
pub use error::GraphicsError;
pub use instance::{BackendType, DEFAULT_SYNC_TIMEOUT, GraphicsInstance, InstanceParameters};
pub use report::{FatalPolicy, ReportCallback, ReportSeverity, Reporter};
pub use scheduler::{FrameSchedule, FrameTicket, Queue, SubmitInfo};
pub use surface::{
    DependencyInfo, DependencyReference, FinalizeVariant, RenderSurface, Submission,
    SubmissionCollector, TextureRef,
};
pub use texture::Texture;
pub use types::{
    AddressMode, BlurAmount, BlurType, Color, CoordinateSpace, Extent2d, FilterMode, FrameData,
    Rect, SampleCount, SamplerDescriptor, SurfaceDescriptor, Vertex,
};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// This should be called before using any graphics functionality.
pub fn init() {
    log::info!("Vellum Graphics v{} initialized", VERSION);
}
