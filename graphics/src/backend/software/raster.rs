//! Triangle rasterizer.
//!
//! Coverage is evaluated per sample with edge functions and a top-left fill
//! rule, so triangles sharing an edge never touch the same sample twice.
//! Shading happens once per pixel at its center and the result is alpha
//! blended into every covered sample.

use crate::types::{DrawVertex, Extent2d, FrameData, Rect, SamplerDescriptor};

use super::image::{ImageLevels, Texel};

/// Standard sample positions inside a pixel.
pub fn sample_positions(samples: u32) -> Vec<[f32; 2]> {
    match samples {
        1 => vec![[0.5, 0.5]],
        2 => vec![[0.75, 0.75], [0.25, 0.25]],
        4 => vec![
            [0.375, 0.125],
            [0.875, 0.375],
            [0.125, 0.625],
            [0.625, 0.875],
        ],
        8 => vec![
            [0.5625, 0.3125],
            [0.4375, 0.6875],
            [0.8125, 0.5625],
            [0.3125, 0.1875],
            [0.1875, 0.8125],
            [0.0625, 0.4375],
            [0.6875, 0.9375],
            [0.9375, 0.0625],
        ],
        _ => {
            // Regular grid for the higher counts
            let columns = (samples as f32).sqrt().ceil() as u32;
            let rows = samples.div_ceil(columns);
            (0..samples)
                .map(|i| {
                    let (cx, cy) = (i % columns, i / columns);
                    [
                        (cx as f32 + 0.5) / columns as f32,
                        (cy as f32 + 0.5) / rows as f32,
                    ]
                })
                .collect()
        }
    }
}

/// Render target of a draw: mip 0 of an attachment.
pub struct RasterTarget<'a> {
    pub texels: &'a mut [Texel],
    pub extent: Extent2d,
    pub samples: u32,
}

/// Texture bound to a draw.
pub struct BoundTexture<'a> {
    pub levels: &'a ImageLevels,
    pub sampler: SamplerDescriptor,
}

/// Fixed-function state of a draw.
pub struct RasterState<'a> {
    pub frame_data: FrameData,
    pub viewport: Rect,
    pub scissor: Rect,
    pub texture: Option<BoundTexture<'a>>,
}

#[derive(Clone, Copy)]
struct ScreenVertex {
    x: f32,
    y: f32,
    uv: [f32; 2],
    color: [f32; 4],
}

fn edge(a: &ScreenVertex, b: &ScreenVertex, px: f32, py: f32) -> f32 {
    (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x)
}

fn is_top_left(a: &ScreenVertex, b: &ScreenVertex) -> bool {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    (dy == 0.0 && dx > 0.0) || dy < 0.0
}

fn covers(value: f32, top_left: bool) -> bool {
    value > 0.0 || (value == 0.0 && top_left)
}

/// Source-over alpha blending.
fn blend(src: Texel, dst: Texel) -> Texel {
    let a = src[3];
    [
        src[0] * a + dst[0] * (1.0 - a),
        src[1] * a + dst[1] * (1.0 - a),
        src[2] * a + dst[2] * (1.0 - a),
        a + dst[3] * (1.0 - a),
    ]
}

/// Rasterize a triangle list.
pub fn draw_triangles(target: &mut RasterTarget<'_>, vertices: &[DrawVertex], state: &RasterState<'_>) {
    let positions = sample_positions(target.samples);
    let to_screen = |v: &DrawVertex| {
        let ndc = state.frame_data.to_ndc(v.position);
        ScreenVertex {
            x: state.viewport.x + (ndc[0] + 1.0) * 0.5 * state.viewport.width,
            y: state.viewport.y + (ndc[1] + 1.0) * 0.5 * state.viewport.height,
            uv: v.uv,
            color: v.color,
        }
    };

    for triangle in vertices.chunks_exact(3) {
        let a = to_screen(&triangle[0]);
        let mut b = to_screen(&triangle[1]);
        let mut c = to_screen(&triangle[2]);
        let mut area = edge(&a, &b, c.x, c.y);
        if area.abs() <= f32::EPSILON {
            continue;
        }
        if area < 0.0 {
            std::mem::swap(&mut b, &mut c);
            area = -area;
        }
        rasterize(target, &positions, state, [a, b, c], area);
    }
}

fn rasterize(
    target: &mut RasterTarget<'_>,
    positions: &[[f32; 2]],
    state: &RasterState<'_>,
    [a, b, c]: [ScreenVertex; 3],
    area: f32,
) {
    let clip_x0 = state.scissor.x.max(0.0);
    let clip_y0 = state.scissor.y.max(0.0);
    let clip_x1 = (state.scissor.x + state.scissor.width).min(target.extent.width as f32);
    let clip_y1 = (state.scissor.y + state.scissor.height).min(target.extent.height as f32);

    let min_x = a.x.min(b.x).min(c.x).floor().max(clip_x0) as i64;
    let min_y = a.y.min(b.y).min(c.y).floor().max(clip_y0) as i64;
    let max_x = a.x.max(b.x).max(c.x).ceil().min(clip_x1) as i64;
    let max_y = a.y.max(b.y).max(c.y).ceil().min(clip_y1) as i64;
    if min_x >= max_x || min_y >= max_y {
        return;
    }

    let lod = state
        .texture
        .as_ref()
        .map(|texture| texture_lod(texture.levels, [&a, &b, &c]))
        .unwrap_or(0.0);

    let tl_ab = is_top_left(&a, &b);
    let tl_bc = is_top_left(&b, &c);
    let tl_ca = is_top_left(&c, &a);
    let samples = target.samples as usize;

    for y in min_y..max_y {
        for x in min_x..max_x {
            let mut mask = 0u64;
            for (s, pos) in positions.iter().enumerate() {
                let px = x as f32 + pos[0];
                let py = y as f32 + pos[1];
                if covers(edge(&b, &c, px, py), tl_bc)
                    && covers(edge(&c, &a, px, py), tl_ca)
                    && covers(edge(&a, &b, px, py), tl_ab)
                {
                    mask |= 1 << s;
                }
            }
            if mask == 0 {
                continue;
            }

            let cx = x as f32 + 0.5;
            let cy = y as f32 + 0.5;
            let wa = edge(&b, &c, cx, cy) / area;
            let wb = edge(&c, &a, cx, cy) / area;
            let wc = edge(&a, &b, cx, cy) / area;

            let uv = [
                a.uv[0] * wa + b.uv[0] * wb + c.uv[0] * wc,
                a.uv[1] * wa + b.uv[1] * wb + c.uv[1] * wc,
            ];
            let mut color = [0.0; 4];
            for (i, channel) in color.iter_mut().enumerate() {
                *channel = (a.color[i] * wa + b.color[i] * wb + c.color[i] * wc).clamp(0.0, 1.0);
            }
            if let Some(texture) = &state.texture {
                let texel = texture.levels.sample(uv, &texture.sampler, lod);
                for (channel, t) in color.iter_mut().zip(texel) {
                    *channel *= t;
                }
            }

            let base = (y as usize * target.extent.width as usize + x as usize) * samples;
            for s in 0..samples {
                if mask & (1 << s) != 0 {
                    let dst = &mut target.texels[base + s];
                    *dst = blend(color, *dst);
                }
            }
        }
    }
}

/// Level of detail of an affine texture mapping over a triangle.
fn texture_lod(levels: &ImageLevels, [a, b, c]: [&ScreenVertex; 3]) -> f32 {
    let Some(extent) = levels.extent(0) else {
        return 0.0;
    };
    let det = (b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y);
    if det.abs() <= f32::EPSILON {
        return 0.0;
    }
    let gradient = |ta: f32, tb: f32, tc: f32| {
        let dx = ((tb - ta) * (c.y - a.y) - (tc - ta) * (b.y - a.y)) / det;
        let dy = ((tc - ta) * (b.x - a.x) - (tb - ta) * (c.x - a.x)) / det;
        (dx, dy)
    };
    let (du_dx, du_dy) = gradient(a.uv[0], b.uv[0], c.uv[0]);
    let (dv_dx, dv_dy) = gradient(a.uv[1], b.uv[1], c.uv[1]);
    let w = extent.width as f32;
    let h = extent.height as f32;
    let rho_x = ((du_dx * w).powi(2) + (dv_dx * h).powi(2)).sqrt();
    let rho_y = ((du_dy * w).powi(2) + (dv_dy * h).powi(2)).sqrt();
    let rho = rho_x.max(rho_y);
    if rho <= 0.0 { 0.0 } else { rho.log2() }
}
