//! Common types shared across the graphics system.

use bytemuck::{Pod, Zeroable};

// ============================================================================
// Extents and rectangles
// ============================================================================

/// Two-dimensional size in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
}

impl Extent2d {
    /// Create a new extent.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of texels.
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Returns true if both dimensions are multiples of the given granularity.
    ///
    /// A zero granularity component only allows whole-image transfers, which
    /// always holds for a full-size copy.
    pub fn is_multiple_of(&self, granularity: Extent2d) -> bool {
        let fits = |size: u32, step: u32| step == 0 || size % step == 0;
        fits(self.width, granularity.width) && fits(self.height, granularity.height)
    }
}

/// Axis-aligned rectangle in texel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub width: f32,
    /// Height.
    pub height: f32,
}

impl Rect {
    /// Create a new rectangle.
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole extent.
    pub fn from_extent(extent: Extent2d) -> Self {
        Self::new(0.0, 0.0, extent.width as f32, extent.height as f32)
    }
}

// ============================================================================
// Color
// ============================================================================

/// Linear RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);
    pub const RED: Self = Self::new(1.0, 0.0, 0.0, 1.0);
    pub const GREEN: Self = Self::new(0.0, 1.0, 0.0, 1.0);
    pub const BLUE: Self = Self::new(0.0, 0.0, 1.0, 1.0);

    /// Create a new color.
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Color as an array.
    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl From<[f32; 4]> for Color {
    fn from(value: [f32; 4]) -> Self {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

// ============================================================================
// Blur
// ============================================================================

/// Blur kernel shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlurType {
    /// Every texel in the support contributes equally.
    Box,
    /// Closer texels contribute more, following a gaussian falloff.
    #[default]
    Gaussian,
}

/// Blur coverage in texels, per axis.
///
/// `x` drives the horizontal pass, `y` the vertical pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlurAmount {
    /// Horizontal coverage.
    pub x: f32,
    /// Vertical coverage.
    pub y: f32,
}

impl BlurAmount {
    /// No blur.
    pub const NONE: Self = Self::new(0.0, 0.0);

    /// Create a new blur amount.
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Same coverage on both axes.
    pub const fn uniform(amount: f32) -> Self {
        Self::new(amount, amount)
    }

    /// Returns true if this amount requests no blur at all.
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

// ============================================================================
// Coordinate space
// ============================================================================

/// How vertex positions of draw calls map onto the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoordinateSpace {
    /// Texel coordinates with the origin in the top-left corner.
    #[default]
    TexelSpace,
    /// Texel coordinates with the origin in the center.
    TexelSpaceCentered,
    /// The shorter side spans 0..1, origin in the top-left corner.
    NormalizedSpace,
    /// The shorter side spans -1..1, origin in the center.
    NormalizedSpaceCentered,
    /// Raw normalized device coordinates.
    NormalizedVulkan,
}

/// Per-frame uniform data uploaded before the render work of a slot executes.
///
/// Vertex positions are transformed as `ndc = position * multiplier + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FrameData {
    pub multiplier: [f32; 2],
    pub offset: [f32; 2],
}

impl FrameData {
    /// Compute the coordinate scaling for a surface of the given size.
    pub fn new(space: CoordinateSpace, size: Extent2d) -> Self {
        let w = size.width.max(1) as f32;
        let h = size.height.max(1) as f32;
        let min = w.min(h);

        let (multiplier, offset) = match space {
            CoordinateSpace::TexelSpace => ([2.0 / w, 2.0 / h], [-1.0, -1.0]),
            CoordinateSpace::TexelSpaceCentered => ([2.0 / w, 2.0 / h], [0.0, 0.0]),
            CoordinateSpace::NormalizedSpace => ([2.0 * min / w, 2.0 * min / h], [-1.0, -1.0]),
            CoordinateSpace::NormalizedSpaceCentered => ([min / w, min / h], [0.0, 0.0]),
            CoordinateSpace::NormalizedVulkan => ([1.0, 1.0], [0.0, 0.0]),
        };

        Self { multiplier, offset }
    }

    /// Transform a vertex position into normalized device coordinates.
    pub fn to_ndc(&self, position: [f32; 2]) -> [f32; 2] {
        [
            position[0] * self.multiplier[0] + self.offset[0],
            position[1] * self.multiplier[1] + self.offset[1],
        ]
    }
}
