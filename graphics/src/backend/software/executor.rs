//! Command list execution for the software backend.

use std::sync::Arc;

use crate::backend::{GpuBuffer, GpuImage};
use crate::command::{BlurDirection, CommandList, GpuCommand, blur_kernel};
use crate::error::GraphicsError;
use crate::types::{BlurType, Color, DrawVertex, Extent2d, FilterMode, FrameData, Rect, SamplerDescriptor};

use super::SoftwareImage;
use super::image::{Texel, bilinear, fetch_clamped};
use super::raster::{self, BoundTexture, RasterState, RasterTarget};

fn image(image: &GpuImage) -> Result<&SoftwareImage, GraphicsError> {
    match image {
        GpuImage::Software(image) => Ok(image),
        #[allow(unreachable_patterns)]
        _ => Err(GraphicsError::SubmissionFailed(
            "image belongs to another backend".to_string(),
        )),
    }
}

fn buffer(buffer: &GpuBuffer) -> Result<&super::SoftwareBuffer, GraphicsError> {
    match buffer {
        GpuBuffer::Software(buffer) => Ok(buffer),
        #[allow(unreachable_patterns)]
        _ => Err(GraphicsError::SubmissionFailed(
            "buffer belongs to another backend".to_string(),
        )),
    }
}

fn failed(list: &CommandList, message: impl std::fmt::Display) -> GraphicsError {
    GraphicsError::SubmissionFailed(format!("{}: {message}", list.label()))
}

struct RenderPass {
    target: Arc<GpuImage>,
    extent: Extent2d,
}

/// Bound state while executing a list.
#[derive(Default)]
struct ExecutionState {
    pass: Option<RenderPass>,
    viewport: Rect,
    scissor: Rect,
    frame_data: Option<Arc<GpuBuffer>>,
    pipeline_bound: bool,
    texture: Option<(Arc<GpuImage>, SamplerDescriptor)>,
}

/// Execute every command of a list in order.
pub fn execute(list: &CommandList) -> Result<(), GraphicsError> {
    crate::profile_scope!("software_execute");
    log::trace!(
        "SoftwareBackend: executing '{}' ({} commands)",
        list.label(),
        list.len()
    );

    let mut state = ExecutionState::default();
    for command in list.commands() {
        match command {
            GpuCommand::BeginRenderPass {
                target,
                clear,
                extent,
            } => {
                if state.pass.is_some() {
                    return Err(failed(list, "render pass already active"));
                }
                clear_image(image(target)?, *clear);
                state.pass = Some(RenderPass {
                    target: Arc::clone(target),
                    extent: *extent,
                });
                state.viewport = Rect::from_extent(*extent);
                state.scissor = Rect::from_extent(*extent);
                state.pipeline_bound = false;
                state.texture = None;
            }
            GpuCommand::EndRenderPass => {
                if state.pass.take().is_none() {
                    return Err(failed(list, "no active render pass"));
                }
            }
            GpuCommand::SetViewport(rect) => state.viewport = *rect,
            GpuCommand::SetScissor(rect) => state.scissor = *rect,
            GpuCommand::BindFrameData(buffer) => state.frame_data = Some(Arc::clone(buffer)),
            GpuCommand::BindDrawPipeline => state.pipeline_bound = true,
            GpuCommand::BindTexture { image, sampler, .. } => {
                state.texture = Some((Arc::clone(image), *sampler));
            }
            GpuCommand::Draw { vertices } => draw(list, &state, vertices)?,
            GpuCommand::Resolve { src, dst, extent } => {
                resolve(image(src)?, image(dst)?, *extent)?
            }
            GpuCommand::Blur {
                src,
                dst,
                extent,
                direction,
                blur_type,
                coverage,
                ..
            } => blur(
                image(src)?,
                image(dst)?,
                *extent,
                *direction,
                *blur_type,
                *coverage,
            )?,
            GpuCommand::Copy {
                src,
                src_mip,
                dst,
                dst_mip,
                extent,
            } => copy(image(src)?, *src_mip, image(dst)?, *dst_mip, *extent)?,
            GpuCommand::Blit {
                src,
                src_mip,
                src_extent,
                dst,
                dst_mip,
                dst_extent,
                filter,
            } => blit(
                image(src)?,
                *src_mip,
                *src_extent,
                image(dst)?,
                *dst_mip,
                *dst_extent,
                *filter,
            )?,
            GpuCommand::Barrier(barrier) => {
                log::trace!(
                    "SoftwareBackend: barrier {:?} mips {}..{} {:?} -> {:?}",
                    barrier.image.descriptor().label,
                    barrier.base_mip,
                    barrier.base_mip + barrier.mip_count,
                    barrier.old_layout,
                    barrier.new_layout
                );
            }
            GpuCommand::UpdateBuffer { buffer: target, data } => buffer(target)?.write(0, data)?,
        }
    }

    if state.pass.is_some() {
        return Err(failed(list, "render pass was never ended"));
    }
    Ok(())
}

fn clear_image(image: &SoftwareImage, color: Color) {
    let mut levels = image.write();
    let value = color.to_array();
    levels.data[0].fill(value);
}

fn draw(
    list: &CommandList,
    state: &ExecutionState,
    vertices: &[DrawVertex],
) -> Result<(), GraphicsError> {
    let pass = state
        .pass
        .as_ref()
        .ok_or_else(|| failed(list, "draw outside of a render pass"))?;
    if !state.pipeline_bound {
        return Err(failed(list, "draw without a bound pipeline"));
    }
    let frame_buffer = state
        .frame_data
        .as_ref()
        .ok_or_else(|| failed(list, "draw without frame data"))?;
    let frame_data: FrameData = buffer(frame_buffer)?.read_pod(0)?;

    let target = image(&pass.target)?;
    let texture_guard = match &state.texture {
        Some((texture, sampler)) => {
            if Arc::ptr_eq(texture, &pass.target) {
                return Err(failed(list, "render target is bound as a texture"));
            }
            Some((image(texture)?.read(), *sampler))
        }
        None => None,
    };

    let raster_state = RasterState {
        frame_data,
        viewport: state.viewport,
        scissor: state.scissor,
        texture: texture_guard.as_ref().map(|(levels, sampler)| BoundTexture {
            levels,
            sampler: *sampler,
        }),
    };

    let mut levels = target.write();
    let samples = levels.samples;
    let mut raster_target = RasterTarget {
        texels: &mut levels.data[0],
        extent: pass.extent,
        samples,
    };
    raster::draw_triangles(&mut raster_target, vertices, &raster_state);
    Ok(())
}

fn read_level(image: &SoftwareImage, mip: u32) -> Result<(Vec<Texel>, Extent2d), GraphicsError> {
    let levels = image.read();
    let extent = levels.extent(mip).ok_or_else(|| {
        GraphicsError::SubmissionFailed(format!(
            "{:?}: mip level {mip} out of range",
            image.descriptor().label
        ))
    })?;
    let texels = levels
        .resolved(mip)
        .ok_or_else(|| GraphicsError::Internal("mip storage missing".to_string()))?;
    Ok((texels, extent))
}

fn write_level(
    image: &SoftwareImage,
    mip: u32,
    extent: Extent2d,
    texel: impl Fn(u32, u32) -> Texel,
) -> Result<(), GraphicsError> {
    let mut levels = image.write();
    let level_extent = levels.extent(mip).ok_or_else(|| {
        GraphicsError::SubmissionFailed(format!(
            "{:?}: mip level {mip} out of range",
            image.descriptor().label
        ))
    })?;
    if extent.width > level_extent.width || extent.height > level_extent.height {
        return Err(GraphicsError::SubmissionFailed(format!(
            "{:?}: region {}x{} exceeds mip {mip} ({}x{})",
            image.descriptor().label,
            extent.width,
            extent.height,
            level_extent.width,
            level_extent.height
        )));
    }
    if mip == 0 && levels.samples != 1 {
        return Err(GraphicsError::SubmissionFailed(format!(
            "{:?}: transfer destination is multisampled",
            image.descriptor().label
        )));
    }
    let data = &mut levels.data[mip as usize];
    for y in 0..extent.height {
        for x in 0..extent.width {
            data[(y * level_extent.width + x) as usize] = texel(x, y);
        }
    }
    Ok(())
}

fn resolve(src: &SoftwareImage, dst: &SoftwareImage, extent: Extent2d) -> Result<(), GraphicsError> {
    let (texels, src_extent) = read_level(src, 0)?;
    write_level(dst, 0, extent, |x, y| {
        texels[(y * src_extent.width + x) as usize]
    })
}

fn copy(
    src: &SoftwareImage,
    src_mip: u32,
    dst: &SoftwareImage,
    dst_mip: u32,
    extent: Extent2d,
) -> Result<(), GraphicsError> {
    let (texels, src_extent) = read_level(src, src_mip)?;
    if extent.width > src_extent.width || extent.height > src_extent.height {
        return Err(GraphicsError::SubmissionFailed(
            "copy region exceeds the source".to_string(),
        ));
    }
    write_level(dst, dst_mip, extent, |x, y| {
        texels[(y * src_extent.width + x) as usize]
    })
}

fn blit(
    src: &SoftwareImage,
    src_mip: u32,
    src_extent: Extent2d,
    dst: &SoftwareImage,
    dst_mip: u32,
    dst_extent: Extent2d,
    filter: FilterMode,
) -> Result<(), GraphicsError> {
    let (texels, level_extent) = read_level(src, src_mip)?;
    let scale_x = src_extent.width as f32 / dst_extent.width.max(1) as f32;
    let scale_y = src_extent.height as f32 / dst_extent.height.max(1) as f32;
    let fetch = |x: i64, y: i64| {
        let x = x.clamp(0, i64::from(src_extent.width) - 1);
        let y = y.clamp(0, i64::from(src_extent.height) - 1);
        fetch_clamped(&texels, level_extent, x, y)
    };

    write_level(dst, dst_mip, dst_extent, |x, y| {
        let sx = (x as f32 + 0.5) * scale_x;
        let sy = (y as f32 + 0.5) * scale_y;
        match filter {
            FilterMode::Nearest => fetch(sx.floor() as i64, sy.floor() as i64),
            FilterMode::Linear => bilinear(sx - 0.5, sy - 0.5, &fetch),
        }
    })
}

fn blur(
    src: &SoftwareImage,
    dst: &SoftwareImage,
    extent: Extent2d,
    direction: BlurDirection,
    blur_type: BlurType,
    coverage: f32,
) -> Result<(), GraphicsError> {
    let (texels, src_extent) = read_level(src, 0)?;
    let weights = blur_kernel(blur_type, coverage);
    let support = (weights.len() / 2) as i64;
    let (step_x, step_y) = direction.step();

    write_level(dst, 0, extent, |x, y| {
        let mut sum = [0.0; 4];
        for (i, weight) in weights.iter().enumerate() {
            let offset = i as i64 - support;
            let texel = fetch_clamped(
                &texels,
                src_extent,
                i64::from(x) + offset * step_x,
                i64::from(y) + offset * step_y,
            );
            for c in 0..4 {
                sum[c] += texel[c] * weight;
            }
        }
        sum
    })
}
