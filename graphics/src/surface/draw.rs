//! Draw calls.
//!
//! Lines and points are expanded into triangles here, so backends only ever
//! run one triangle pipeline. Expansion happens in texel space: a line is
//! `line_width` texels wide and a point `point_size` texels wide whatever the
//! surface's coordinate space.

use std::sync::Arc;

use crate::backend::{DescriptorLayout, GpuImage};
use crate::command::GpuCommand;
use crate::error::GraphicsError;
use crate::report::ReportSeverity;
use crate::types::{
    Color, DrawVertex, Extent2d, FrameData, Rect, SamplerDescriptor, Topology, Vertex,
};

use super::RenderSurface;
use super::dependency::{self, DependencyReference, TextureRef};

/// Pipeline and texture state already bound in the current command list.
#[derive(Default)]
pub(crate) struct BindCache {
    pub pipeline: bool,
    pub texture: Option<(Arc<GpuImage>, SamplerDescriptor)>,
}

impl BindCache {
    /// Returns true if binding `image` with `sampler` changes the bound state.
    pub fn needs_texture(&self, image: &Arc<GpuImage>, sampler: &SamplerDescriptor) -> bool {
        match &self.texture {
            Some((bound, bound_sampler)) => {
                !Arc::ptr_eq(bound, image) || bound_sampler != sampler
            }
            None => true,
        }
    }
}

/// Maps coordinate-space positions to texels and back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TexelMapping {
    frame_data: FrameData,
    width: f32,
    height: f32,
}

impl TexelMapping {
    pub fn new(frame_data: FrameData, size: Extent2d) -> Self {
        Self {
            frame_data,
            width: size.width.max(1) as f32,
            height: size.height.max(1) as f32,
        }
    }

    fn texel(&self, position: [f32; 2]) -> [f32; 2] {
        let ndc = self.frame_data.to_ndc(position);
        [
            (ndc[0] + 1.0) * 0.5 * self.width,
            (ndc[1] + 1.0) * 0.5 * self.height,
        ]
    }

    fn position(&self, texel: [f32; 2]) -> [f32; 2] {
        let FrameData { multiplier, offset } = self.frame_data;
        [
            (texel[0] * 2.0 / self.width - 1.0 - offset[0]) / multiplier[0],
            (texel[1] * 2.0 / self.height - 1.0 - offset[1]) / multiplier[1],
        ]
    }
}

/// Resolve the vertex order of a draw. An empty index list draws the vertices in order.
fn resolve_indices(
    vertex_count: usize,
    indices: &[u32],
    topology: Topology,
) -> Result<Vec<usize>, GraphicsError> {
    let order: Vec<usize> = if indices.is_empty() {
        (0..vertex_count).collect()
    } else {
        indices.iter().map(|&i| i as usize).collect()
    };

    if let Some(&bad) = order.iter().find(|&&i| i >= vertex_count) {
        return Err(GraphicsError::InvalidParameter(format!(
            "index {bad} out of range for {vertex_count} vertices"
        )));
    }
    let per_primitive = topology.indices_per_primitive();
    if order.len() % per_primitive != 0 {
        return Err(GraphicsError::InvalidParameter(format!(
            "{} indices do not form whole {topology:?} primitives",
            order.len()
        )));
    }
    Ok(order)
}

pub(crate) fn expand_triangles(
    vertices: &[Vertex],
    indices: &[u32],
) -> Result<Vec<DrawVertex>, GraphicsError> {
    let order = resolve_indices(vertices.len(), indices, Topology::TriangleList)?;
    Ok(order.into_iter().map(|i| DrawVertex::from(&vertices[i])).collect())
}

pub(crate) fn expand_lines(
    vertices: &[Vertex],
    indices: &[u32],
    line_width: f32,
    mapping: &TexelMapping,
) -> Result<Vec<DrawVertex>, GraphicsError> {
    if line_width <= 0.0 || !line_width.is_finite() {
        return Err(GraphicsError::InvalidParameter(format!(
            "line width {line_width} must be positive"
        )));
    }
    let order = resolve_indices(vertices.len(), indices, Topology::LineList)?;

    let mut out = Vec::with_capacity(order.len() * 3);
    for segment in order.chunks_exact(2) {
        let (a, b) = (&vertices[segment[0]], &vertices[segment[1]]);
        let pa = mapping.texel(a.position);
        let pb = mapping.texel(b.position);
        let (dx, dy) = (pb[0] - pa[0], pb[1] - pa[1]);
        let length = (dx * dx + dy * dy).sqrt();
        if length <= f32::EPSILON {
            continue;
        }
        let half = line_width * 0.5;
        let normal = [-dy / length * half, dx / length * half];

        let corner = |v: &Vertex, p: [f32; 2], sign: f32| DrawVertex {
            position: mapping.position([p[0] + normal[0] * sign, p[1] + normal[1] * sign]),
            uv: v.uv,
            color: v.color,
        };
        let quad = [
            corner(a, pa, 1.0),
            corner(a, pa, -1.0),
            corner(b, pb, 1.0),
            corner(b, pb, -1.0),
        ];
        out.extend_from_slice(&[quad[0], quad[1], quad[2], quad[2], quad[1], quad[3]]);
    }
    Ok(out)
}

pub(crate) fn expand_points(vertices: &[Vertex], mapping: &TexelMapping) -> Vec<DrawVertex> {
    let mut out = Vec::with_capacity(vertices.len() * 6);
    for v in vertices.iter().filter(|v| v.point_size > 0.0) {
        let center = mapping.texel(v.position);
        let half = v.point_size * 0.5;
        let corner = |dx: f32, dy: f32| DrawVertex {
            position: mapping.position([center[0] + dx * half, center[1] + dy * half]),
            uv: v.uv,
            color: v.color,
        };
        let (tl, tr, bl, br) = (
            corner(-1.0, -1.0),
            corner(1.0, -1.0),
            corner(-1.0, 1.0),
            corner(1.0, 1.0),
        );
        out.extend_from_slice(&[tl, tr, bl, bl, tr, br]);
    }
    out
}

pub(crate) fn expand_rectangle(rect: Rect, color: Color) -> Vec<DrawVertex> {
    let color = color.to_array();
    let vertex = |x: f32, y: f32, u: f32, v: f32| DrawVertex {
        position: [x, y],
        uv: [u, v],
        color,
    };
    let (x0, y0) = (rect.x, rect.y);
    let (x1, y1) = (rect.x + rect.width, rect.y + rect.height);
    let tl = vertex(x0, y0, 0.0, 0.0);
    let tr = vertex(x1, y0, 1.0, 0.0);
    let bl = vertex(x0, y1, 0.0, 1.0);
    let br = vertex(x1, y1, 1.0, 1.0);
    vec![tl, tr, bl, bl, tr, br]
}

impl RenderSurface {
    /// Draw a triangle list.
    ///
    /// With an empty `indices` slice every three consecutive vertices form a
    /// triangle.
    pub fn draw_triangles(
        &self,
        vertices: &[Vertex],
        indices: &[u32],
        texture: Option<TextureRef<'_>>,
        sampler: &SamplerDescriptor,
    ) -> Result<(), GraphicsError> {
        self.record_draw("draw_triangles", texture, sampler, |_| {
            expand_triangles(vertices, indices)
        })
    }

    /// Draw a line list, every segment `line_width` texels wide.
    pub fn draw_lines(
        &self,
        vertices: &[Vertex],
        indices: &[u32],
        texture: Option<TextureRef<'_>>,
        sampler: &SamplerDescriptor,
        line_width: f32,
    ) -> Result<(), GraphicsError> {
        self.record_draw("draw_lines", texture, sampler, |mapping| {
            expand_lines(vertices, indices, line_width, mapping)
        })
    }

    /// Draw one square of `point_size` texels per vertex.
    pub fn draw_points(
        &self,
        vertices: &[Vertex],
        texture: Option<TextureRef<'_>>,
        sampler: &SamplerDescriptor,
    ) -> Result<(), GraphicsError> {
        self.record_draw("draw_points", texture, sampler, |mapping| {
            Ok(expand_points(vertices, mapping))
        })
    }

    /// Draw an axis-aligned rectangle, mapping the whole texture onto it.
    pub fn draw_rectangle(
        &self,
        rect: Rect,
        color: Color,
        texture: Option<TextureRef<'_>>,
    ) -> Result<(), GraphicsError> {
        self.record_draw("draw_rectangle", texture, &SamplerDescriptor::default(), |_| {
            Ok(expand_rectangle(rect, color))
        })
    }

    fn record_draw(
        &self,
        operation: &str,
        texture: Option<TextureRef<'_>>,
        sampler: &SamplerDescriptor,
        expand: impl FnOnce(&TexelMapping) -> Result<Vec<DrawVertex>, GraphicsError>,
    ) -> Result<(), GraphicsError> {
        crate::profile_scope!("record_draw");
        self.ensure_usable(operation)?;

        let mapping = {
            let slot = self.active_state();
            if !slot.is_recording() {
                drop(slot);
                return self.reject(operation, "not recording");
            }
            TexelMapping::new(slot.frame_data, slot.images.size)
        };

        let (image, dependency) = match texture {
            None => (Arc::clone(self.instance.white_texture().image()), None),
            Some(TextureRef::Opaque(texture)) => (Arc::clone(texture.image()), None),
            Some(TextureRef::Surface(surface)) => {
                if surface.id() == self.id() {
                    return self.reject(operation, "a surface cannot sample itself");
                }
                let slot = surface.active_slot();
                let image = Arc::clone(&surface.slot(slot).images.output);
                (image, Some(DependencyReference::new(surface, slot)))
            }
        };

        let vertices = expand(&mapping)?;
        if vertices.is_empty() {
            return Ok(());
        }

        let mut slot = self.active_state();
        let state = &mut *slot;
        let Some(commands) = state.commands.as_mut() else {
            drop(slot);
            return self.reject(operation, "not recording");
        };

        if !state.binds.pipeline {
            commands.push(GpuCommand::BindDrawPipeline);
            state.binds.pipeline = true;
        }

        if state.binds.needs_texture(&image, sampler) {
            let pool = self.instance.descriptor_pool();
            let descriptor = match pool.allocate(DescriptorLayout::Draw) {
                Ok(set) => set,
                Err(e) => {
                    self.instance.reporter().report(
                        ReportSeverity::NonCriticalError,
                        &format!("{operation} on '{}': {e}", self.label()),
                    );
                    return Err(e);
                }
            };
            commands.push(GpuCommand::BindTexture {
                image: Arc::clone(&image),
                sampler: *sampler,
                descriptor: descriptor.clone(),
            });
            state.descriptors.push((pool, descriptor));
            state.binds.texture = Some((image, *sampler));
        }

        if let Some(reference) = dependency {
            let target = reference.surface_id();
            if dependency::track(&mut state.dependencies, reference) {
                log::trace!("'{}' now samples surface {target}", self.label());
            }
        }

        commands.push(GpuCommand::Draw { vertices });
        Ok(())
    }
}
