//! Descriptor set allocation.
//!
//! Surfaces never talk to a descriptor allocator directly. They go through the
//! narrow [`DescriptorPool`] interface, so an application can put its own pool
//! behind it with [`GraphicsInstance::set_descriptor_pool`].
//!
//! [`GraphicsInstance::set_descriptor_pool`]: crate::instance::GraphicsInstance::set_descriptor_pool

use std::sync::Arc;

use crate::backend::{DescriptorLayout, GpuBackend, GpuDescriptorSet};
use crate::error::GraphicsError;

/// Allocator of descriptor sets.
pub trait DescriptorPool: Send + Sync {
    /// Allocate a set for `layout`.
    fn allocate(&self, layout: DescriptorLayout) -> Result<GpuDescriptorSet, GraphicsError>;

    /// Return a set. The GPU must be done with it.
    fn free(&self, set: GpuDescriptorSet);
}

/// Pool that allocates straight from the backend.
pub struct BackendDescriptorPool {
    backend: Arc<dyn GpuBackend>,
}

impl BackendDescriptorPool {
    /// Create a pool over a backend.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self { backend }
    }
}

impl DescriptorPool for BackendDescriptorPool {
    fn allocate(&self, layout: DescriptorLayout) -> Result<GpuDescriptorSet, GraphicsError> {
        self.backend.allocate_descriptor_set(layout)
    }

    fn free(&self, set: GpuDescriptorSet) {
        self.backend.free_descriptor_set(set);
    }
}

impl std::fmt::Debug for BackendDescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptorPool")
            .field("backend", &self.backend.name())
            .finish()
    }
}
