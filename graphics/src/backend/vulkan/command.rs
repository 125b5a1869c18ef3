//! Translation of command lists into Vulkan command buffers.

use ash::vk;

use crate::command::{CommandList, GpuCommand};
use crate::error::GraphicsError;
use crate::types::{Color, DrawVertex, Extent2d, Rect};

use super::conversion::{color_layers, convert_sample_count, corner, image_barrier};
use super::pipeline::{BlurPushConstants, PipelineManager};
use super::{vulkan_buffer, vulkan_image, vulkan_set};

/// Create a command pool for graphics operations.
pub fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<vk::CommandPool, GraphicsError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
    })
}

/// Every draw vertex of the list, in recording order.
///
/// The backend uploads them into one vertex buffer per command buffer; draws
/// consume consecutive ranges of it.
pub fn gather_vertices(list: &CommandList) -> Vec<DrawVertex> {
    list.commands()
        .iter()
        .filter_map(|command| match command {
            GpuCommand::Draw { vertices } => Some(vertices.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

#[derive(Default)]
struct EncodeState {
    pass_samples: Option<vk::SampleCountFlags>,
    frame_data: Option<vk::Buffer>,
    pipeline_bound: bool,
    vertex_offset: u32,
}

/// Records a [`CommandList`] into a command buffer in the recording state.
pub struct Encoder<'a> {
    pub device: &'a ash::Device,
    pub pipelines: &'a PipelineManager,
    pub command_buffer: vk::CommandBuffer,
    /// Holds the output of [`gather_vertices`]; null if the list draws nothing.
    pub vertex_buffer: vk::Buffer,
}

impl Encoder<'_> {
    pub fn encode(&self, list: &CommandList) -> Result<(), GraphicsError> {
        let failed = |reason: &str| {
            GraphicsError::CommandRecordingFailed(format!("{}: {reason}", list.label()))
        };
        let cmd = self.command_buffer;
        let mut state = EncodeState::default();

        for command in list.commands() {
            match command {
                GpuCommand::BeginRenderPass {
                    target,
                    clear,
                    extent,
                } => {
                    if state.pass_samples.is_some() {
                        return Err(failed("render pass already active"));
                    }
                    let target = vulkan_image(target)?;
                    self.begin_rendering(target.attachment_view, *extent, Some(*clear));
                    self.set_viewport(Rect::from_extent(*extent));
                    self.set_scissor(Rect::from_extent(*extent));
                    state.pass_samples = Some(convert_sample_count(target.descriptor.samples));
                    state.pipeline_bound = false;
                }
                GpuCommand::EndRenderPass => {
                    if state.pass_samples.take().is_none() {
                        return Err(failed("no active render pass"));
                    }
                    unsafe { self.device.cmd_end_rendering(cmd) };
                }
                GpuCommand::SetViewport(rect) => self.set_viewport(*rect),
                GpuCommand::SetScissor(rect) => self.set_scissor(*rect),
                GpuCommand::BindFrameData(buffer) => {
                    state.frame_data = Some(vulkan_buffer(buffer)?.buffer);
                }
                GpuCommand::BindDrawPipeline => {
                    let samples = state
                        .pass_samples
                        .ok_or_else(|| failed("pipeline bound outside of a render pass"))?;
                    let pipeline = self.pipelines.draw_pipeline(samples)?;
                    unsafe {
                        self.device
                            .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                        if self.vertex_buffer != vk::Buffer::null() {
                            self.device
                                .cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer], &[0]);
                        }
                    }
                    state.pipeline_bound = true;
                }
                GpuCommand::BindTexture {
                    image,
                    sampler,
                    descriptor,
                } => {
                    let frame_data = state
                        .frame_data
                        .ok_or_else(|| failed("texture bound without frame data"))?;
                    let set = vulkan_set(descriptor)?;
                    let sampler = self.pipelines.sampler(sampler)?;
                    self.write_draw_set(set, frame_data, vulkan_image(image)?.sampled_view, sampler);
                    unsafe {
                        self.device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            self.pipelines.draw_layout(),
                            0,
                            &[set],
                            &[],
                        );
                    }
                }
                GpuCommand::Draw { vertices } => {
                    if !state.pipeline_bound {
                        return Err(failed("draw without a bound pipeline"));
                    }
                    let count = vertices.len() as u32;
                    unsafe { self.device.cmd_draw(cmd, count, 1, state.vertex_offset, 0) };
                    state.vertex_offset += count;
                }
                GpuCommand::Resolve { src, dst, extent } => {
                    let region = vk::ImageResolve::default()
                        .src_subresource(color_layers(0))
                        .dst_subresource(color_layers(0))
                        .extent(extent3d(*extent));
                    unsafe {
                        self.device.cmd_resolve_image(
                            cmd,
                            vulkan_image(src)?.image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vulkan_image(dst)?.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                }
                GpuCommand::Blur {
                    src,
                    dst,
                    extent,
                    direction,
                    blur_type,
                    coverage,
                    descriptor,
                } => {
                    if state.pass_samples.is_some() {
                        return Err(failed("blur inside a render pass"));
                    }
                    let set = vulkan_set(descriptor)?;
                    self.write_blur_set(set, vulkan_image(src)?.sampled_view);
                    let constants =
                        BlurPushConstants::new(*direction, *blur_type, *coverage, *extent);

                    self.begin_rendering(vulkan_image(dst)?.attachment_view, *extent, None);
                    self.set_viewport(Rect::from_extent(*extent));
                    self.set_scissor(Rect::from_extent(*extent));
                    unsafe {
                        self.device.cmd_bind_pipeline(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            self.pipelines.blur_pipeline(),
                        );
                        self.device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            self.pipelines.blur_layout(),
                            0,
                            &[set],
                            &[],
                        );
                        self.device.cmd_push_constants(
                            cmd,
                            self.pipelines.blur_layout(),
                            vk::ShaderStageFlags::FRAGMENT,
                            0,
                            bytemuck::bytes_of(&constants),
                        );
                        self.device.cmd_draw(cmd, 3, 1, 0, 0);
                        self.device.cmd_end_rendering(cmd);
                    }
                }
                GpuCommand::Copy {
                    src,
                    src_mip,
                    dst,
                    dst_mip,
                    extent,
                } => {
                    let region = vk::ImageCopy::default()
                        .src_subresource(color_layers(*src_mip))
                        .dst_subresource(color_layers(*dst_mip))
                        .extent(extent3d(*extent));
                    unsafe {
                        self.device.cmd_copy_image(
                            cmd,
                            vulkan_image(src)?.image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vulkan_image(dst)?.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                }
                GpuCommand::Blit {
                    src,
                    src_mip,
                    src_extent,
                    dst,
                    dst_mip,
                    dst_extent,
                    filter,
                } => {
                    let region = vk::ImageBlit::default()
                        .src_subresource(color_layers(*src_mip))
                        .src_offsets([
                            vk::Offset3D::default(),
                            corner(src_extent.width, src_extent.height),
                        ])
                        .dst_subresource(color_layers(*dst_mip))
                        .dst_offsets([
                            vk::Offset3D::default(),
                            corner(dst_extent.width, dst_extent.height),
                        ]);
                    unsafe {
                        self.device.cmd_blit_image(
                            cmd,
                            vulkan_image(src)?.image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            vulkan_image(dst)?.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                            super::conversion::convert_filter_mode(*filter),
                        );
                    }
                }
                GpuCommand::Barrier(barrier) => {
                    let barriers = [image_barrier(
                        vulkan_image(&barrier.image)?.image,
                        barrier.base_mip,
                        barrier.mip_count,
                        barrier.old_layout,
                        barrier.new_layout,
                    )];
                    let dependency =
                        vk::DependencyInfo::default().image_memory_barriers(&barriers);
                    unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) };
                }
                GpuCommand::UpdateBuffer { buffer, data } => {
                    if data.len() % 4 != 0 || data.len() > 65536 {
                        return Err(failed("buffer update must be 4-byte aligned and at most 64 KiB"));
                    }
                    let buffer = vulkan_buffer(buffer)?.buffer;
                    let barriers = [vk::BufferMemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
                        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                        .dst_stage_mask(vk::PipelineStageFlags2::VERTEX_SHADER)
                        .dst_access_mask(vk::AccessFlags2::UNIFORM_READ)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)];
                    unsafe {
                        self.device.cmd_update_buffer(cmd, buffer, 0, data);
                        self.device.cmd_pipeline_barrier2(
                            cmd,
                            &vk::DependencyInfo::default().buffer_memory_barriers(&barriers),
                        );
                    }
                }
            }
        }

        if state.pass_samples.is_some() {
            return Err(failed("render pass was never ended"));
        }
        Ok(())
    }

    /// Begin dynamic rendering into mip 0; `clear` selects clearing over discarding.
    fn begin_rendering(&self, view: vk::ImageView, extent: Extent2d, clear: Option<Color>) {
        let (load_op, clear_value) = match clear {
            Some(color) => (
                vk::AttachmentLoadOp::CLEAR,
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: color.to_array(),
                    },
                },
            ),
            None => (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default()),
        };
        let attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_value)];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            })
            .layer_count(1)
            .color_attachments(&attachments);
        unsafe {
            self.device
                .cmd_begin_rendering(self.command_buffer, &rendering_info)
        };
    }

    fn set_viewport(&self, rect: Rect) {
        let viewport = vk::Viewport {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device
                .cmd_set_viewport(self.command_buffer, 0, &[viewport])
        };
    }

    fn set_scissor(&self, rect: Rect) {
        unsafe {
            self.device
                .cmd_set_scissor(self.command_buffer, 0, &[scissor_rect(rect)])
        };
    }

    fn write_draw_set(
        &self,
        set: vk::DescriptorSet,
        frame_data: vk::Buffer,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: frame_data,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let sampler_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        }];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&sampler_info),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    fn write_blur_set(&self, set: vk::DescriptorSet, view: vk::ImageView) {
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let writes = [vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info)];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }
}

fn extent3d(extent: Extent2d) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
    }
}

/// Smallest texel rectangle covering `rect`, clipped at the origin.
fn scissor_rect(rect: Rect) -> vk::Rect2D {
    let x0 = rect.x.floor().max(0.0);
    let y0 = rect.y.floor().max(0.0);
    let x1 = (rect.x + rect.width).ceil().max(x0);
    let y1 = (rect.y + rect.height).ceil().max(y0);
    vk::Rect2D {
        offset: vk::Offset2D {
            x: x0 as i32,
            y: y0 as i32,
        },
        extent: vk::Extent2D {
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scissor_covers_fractional_rect() {
        let rect = scissor_rect(Rect::new(1.5, -2.0, 3.0, 4.25));
        assert_eq!((rect.offset.x, rect.offset.y), (1, 0));
        assert_eq!((rect.extent.width, rect.extent.height), (4, 3));
    }

    #[test]
    fn test_gather_vertices_concatenates_draws() {
        let mut list = CommandList::new("draws");
        let vertex = DrawVertex::default();
        list.push(GpuCommand::Draw {
            vertices: vec![vertex; 3],
        });
        list.push(GpuCommand::EndRenderPass);
        list.push(GpuCommand::Draw {
            vertices: vec![vertex; 6],
        });
        assert_eq!(gather_vertices(&list).len(), 9);
        assert!(gather_vertices(&CommandList::new("empty")).is_empty());
    }
}
