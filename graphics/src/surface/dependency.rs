//! Textures a draw call samples, and the edges they add to the frame graph.

use std::sync::{Arc, Weak};

use crate::error::GraphicsError;
use crate::texture::Texture;

use super::RenderSurface;

/// Identifies one of the two buffered generations of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyInfo {
    /// Slot index, 0 or 1.
    pub slot: usize,
}

/// A texture bound to a draw call.
///
/// Drawing with a [`TextureRef::Surface`] makes the drawing surface depend on
/// the sampled one for the current frame.
#[derive(Debug, Clone, Copy)]
pub enum TextureRef<'a> {
    /// A texture whose contents never change.
    Opaque(&'a Texture),
    /// The output of another render surface.
    Surface(&'a Arc<RenderSurface>),
}

impl<'a> From<&'a Texture> for TextureRef<'a> {
    fn from(texture: &'a Texture) -> Self {
        Self::Opaque(texture)
    }
}

impl<'a> From<&'a Arc<Texture>> for TextureRef<'a> {
    fn from(texture: &'a Arc<Texture>) -> Self {
        Self::Opaque(texture)
    }
}

impl<'a> From<&'a Arc<RenderSurface>> for TextureRef<'a> {
    fn from(surface: &'a Arc<RenderSurface>) -> Self {
        Self::Surface(surface)
    }
}

/// A captured edge: one generation of a surface that a slot samples this frame.
///
/// Edges do not keep the sampled surface alive, so surfaces that sample each
/// other are still freed once the caller drops them.
#[derive(Clone)]
pub struct DependencyReference {
    surface: Weak<RenderSurface>,
    surface_id: u64,
    pub info: DependencyInfo,
}

impl DependencyReference {
    pub(crate) fn new(surface: &Arc<RenderSurface>, slot: usize) -> Self {
        Self {
            surface: Arc::downgrade(surface),
            surface_id: surface.id(),
            info: DependencyInfo { slot },
        }
    }

    /// The sampled surface, if it is still alive.
    pub fn surface(&self) -> Option<Arc<RenderSurface>> {
        self.surface.upgrade()
    }

    pub fn surface_id(&self) -> u64 {
        self.surface_id
    }

    /// Identity of the referenced generation.
    pub fn key(&self) -> (u64, usize) {
        (self.surface_id, self.info.slot)
    }

    /// Upgrade for a graph walk; a dropped surface cannot be committed.
    pub(crate) fn resolve(&self) -> Result<Arc<RenderSurface>, GraphicsError> {
        self.surface().ok_or_else(|| {
            GraphicsError::InvalidState(format!(
                "sampled surface {}[{}] was dropped",
                self.surface_id, self.info.slot
            ))
        })
    }
}

impl std::fmt::Debug for DependencyReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyReference")
            .field("surface", &self.surface_id)
            .field("slot", &self.info.slot)
            .field("alive", &(self.surface.strong_count() > 0))
            .finish()
    }
}

/// Append `reference` unless the list already samples the same surface.
///
/// Returns true if the reference was added.
pub(crate) fn track(dependencies: &mut Vec<DependencyReference>, reference: DependencyReference) -> bool {
    if dependencies
        .iter()
        .any(|d| d.surface_id == reference.surface_id)
    {
        return false;
    }
    dependencies.push(reference);
    true
}
