//! Vertex types for 2D draw calls.

use bytemuck::{Pod, Zeroable};

use super::Color;

/// Vertex accepted by the draw calls of a render surface.
///
/// `position` is expressed in the surface's [`CoordinateSpace`](super::CoordinateSpace).
/// `point_size` (in texels) is only read by point draws.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
    pub point_size: f32,
}

impl Vertex {
    /// Create a vertex with a white color and a point size of one texel.
    pub fn new(position: [f32; 2], uv: [f32; 2]) -> Self {
        Self {
            position,
            uv,
            color: Color::WHITE.to_array(),
            point_size: 1.0,
        }
    }

    /// Set the vertex color.
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color.to_array();
        self
    }

    /// Set the point size in texels.
    pub fn with_point_size(mut self, size: f32) -> Self {
        self.point_size = size;
        self
    }
}

impl Default for Vertex {
    fn default() -> Self {
        Self::new([0.0, 0.0], [0.0, 0.0])
    }
}

/// Triangle-list vertex as consumed by the backends.
///
/// Every primitive is expanded into triangles before it is recorded, so this is the
/// only vertex layout a draw pipeline ever sees. 32 bytes, tightly packed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct DrawVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

static_assertions::const_assert_eq!(std::mem::size_of::<DrawVertex>(), 32);

impl From<&Vertex> for DrawVertex {
    fn from(vertex: &Vertex) -> Self {
        Self {
            position: vertex.position,
            uv: vertex.uv,
            color: vertex.color,
        }
    }
}

/// Primitive topology of a draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Topology {
    /// Every three indices form a triangle.
    #[default]
    TriangleList,
    /// Every two indices form a line segment.
    LineList,
    /// Every index is a point.
    PointList,
}

impl Topology {
    /// Number of indices per primitive.
    pub fn indices_per_primitive(self) -> usize {
        match self {
            Self::TriangleList => 3,
            Self::LineList => 2,
            Self::PointList => 1,
        }
    }
}
