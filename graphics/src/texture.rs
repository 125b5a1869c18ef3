//! Immutable sampled textures.

use std::sync::Arc;

use crate::backend::GpuImage;
use crate::types::{Extent2d, ImageDescriptor};

/// An immutable RGBA8 texture with a single mip level.
///
/// Textures are created by
/// [`GraphicsInstance::create_texture`](crate::instance::GraphicsInstance::create_texture)
/// and are reference-counted. Their pixels are uploaded before creation
/// returns, so they are always ready to sample.
///
/// # Example
///
/// ```ignore
/// let texture = instance.create_texture(2, 2, &pixels)?;
/// surface.draw_rectangle(rect, Color::WHITE, Some((&texture).into()))?;
/// ```
pub struct Texture {
    id: u64,
    image: Arc<GpuImage>,
}

impl Texture {
    pub(crate) fn new(id: u64, image: GpuImage) -> Self {
        Self {
            id,
            image: Arc::new(image),
        }
    }

    /// Unique id within the instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the image descriptor.
    pub fn descriptor(&self) -> &ImageDescriptor {
        self.image.descriptor()
    }

    /// Get the texture size.
    pub fn size(&self) -> Extent2d {
        self.descriptor().size
    }

    /// Get the texture width.
    pub fn width(&self) -> u32 {
        self.size().width
    }

    /// Get the texture height.
    pub fn height(&self) -> u32 {
        self.size().height
    }

    /// Get the texture label, if set.
    pub fn label(&self) -> Option<&str> {
        self.descriptor().label.as_deref()
    }

    /// The backend image.
    pub fn image(&self) -> &Arc<GpuImage> {
        &self.image
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id)
            .field("label", &self.label())
            .field("size", &self.size())
            .finish()
    }
}

static_assertions::assert_impl_all!(Texture: Send, Sync);
