//! Render surface creation parameters.

use super::{Color, CoordinateSpace, Extent2d, SampleCount};

/// Descriptor for creating a [`RenderSurface`](crate::surface::RenderSurface).
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceDescriptor {
    /// Debug label. Defaults to `surface-<id>`.
    pub label: Option<String>,
    /// Logical size in texels.
    pub size: Extent2d,
    /// Requested samples per texel. Clamped to what the device supports.
    pub samples: SampleCount,
    /// Allocate blur scratch images and honor blur amounts at `end_render`.
    pub enable_blur: bool,
    /// How draw call positions map onto the surface.
    pub coordinate_space: CoordinateSpace,
    /// Color the attachment is cleared to at `begin_render`.
    pub clear_color: Color,
}

impl SurfaceDescriptor {
    /// Create a descriptor for a surface of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Extent2d::new(width, height),
            ..Default::default()
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the requested sample count.
    pub fn with_samples(mut self, samples: SampleCount) -> Self {
        self.samples = samples;
        self
    }

    /// Enable or disable blur support.
    pub fn with_blur(mut self, enable: bool) -> Self {
        self.enable_blur = enable;
        self
    }

    /// Set the coordinate space.
    pub fn with_coordinate_space(mut self, space: CoordinateSpace) -> Self {
        self.coordinate_space = space;
        self
    }

    /// Set the clear color.
    pub fn with_clear_color(mut self, color: Color) -> Self {
        self.clear_color = color;
        self
    }
}

impl Default for SurfaceDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: Extent2d::new(512, 512),
            samples: SampleCount::X1,
            enable_blur: false,
            coordinate_space: CoordinateSpace::TexelSpace,
            clear_color: Color::TRANSPARENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_descriptor_builder() {
        let desc = SurfaceDescriptor::new(256, 128)
            .with_label("shadow")
            .with_samples(SampleCount::X4)
            .with_blur(true)
            .with_coordinate_space(CoordinateSpace::NormalizedSpace);

        assert_eq!(desc.size, Extent2d::new(256, 128));
        assert_eq!(desc.label.as_deref(), Some("shadow"));
        assert_eq!(desc.samples, SampleCount::X4);
        assert!(desc.enable_blur);
        assert_eq!(desc.coordinate_space, CoordinateSpace::NormalizedSpace);
    }

    #[test]
    fn test_surface_descriptor_default() {
        let desc = SurfaceDescriptor::default();
        assert_eq!(desc.size, Extent2d::new(512, 512));
        assert_eq!(desc.samples, SampleCount::X1);
        assert!(!desc.enable_blur);
    }
}
