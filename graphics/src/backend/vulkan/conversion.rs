//! Conversions from engine types to Vulkan types.

use ash::vk;

use crate::command::{ImageLayout, PipelineStage};
use crate::types::{AddressMode, BufferUsage, FilterMode, SampleCount, TextureUsage};

/// Every surface image is RGBA8.
pub const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Convert BufferUsage flags to Vulkan buffer usage flags.
pub fn convert_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut result = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        // Uniforms are written with vkCmdUpdateBuffer.
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    result
}

/// Convert TextureUsage flags to Vulkan image usage flags.
///
/// Multisampled images are never sampled; they are resolved first.
pub fn convert_texture_usage(usage: TextureUsage, samples: SampleCount) -> vk::ImageUsageFlags {
    let mut result = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        result |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        result |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) && !samples.is_multisampled() {
        result |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        result |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    result
}

pub fn convert_sample_count(samples: SampleCount) -> vk::SampleCountFlags {
    vk::SampleCountFlags::from_raw(samples.count())
}

/// Convert FilterMode to Vulkan filter.
pub fn convert_filter_mode(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

/// Convert FilterMode to Vulkan mipmap filter mode.
pub fn convert_mipmap_filter_mode(mode: FilterMode) -> vk::SamplerMipmapMode {
    match mode {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

/// Convert AddressMode to Vulkan sampler address mode.
pub fn convert_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

/// Convert semaphore wait stages.
pub fn convert_pipeline_stage(stage: PipelineStage) -> vk::PipelineStageFlags2 {
    if stage.contains(PipelineStage::ALL_COMMANDS) {
        return vk::PipelineStageFlags2::ALL_COMMANDS;
    }
    let mut result = vk::PipelineStageFlags2::empty();
    if stage.contains(PipelineStage::VERTEX_INPUT) {
        result |= vk::PipelineStageFlags2::VERTEX_INPUT;
    }
    if stage.contains(PipelineStage::VERTEX_SHADER) {
        result |= vk::PipelineStageFlags2::VERTEX_SHADER;
    }
    if stage.contains(PipelineStage::FRAGMENT_SHADER) {
        result |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if stage.contains(PipelineStage::COLOR_ATTACHMENT_OUTPUT) {
        result |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
    }
    if stage.contains(PipelineStage::TRANSFER) {
        result |= vk::PipelineStageFlags2::ALL_TRANSFER;
    }
    if result.is_empty() {
        vk::PipelineStageFlags2::ALL_COMMANDS
    } else {
        result
    }
}

/// How an image in a given layout is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutUsage {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// Layout, stage and access of each engine image layout.
pub fn layout_usage(layout: ImageLayout) -> LayoutUsage {
    let (layout, stage, access) = match layout {
        ImageLayout::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::NONE,
        ),
        ImageLayout::ColorAttachment => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        ImageLayout::TransferSrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        ImageLayout::TransferDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
    };
    LayoutUsage {
        layout,
        stage,
        access,
    }
}

/// Barrier moving a mip range of a color image between two layouts.
pub fn image_barrier(
    image: vk::Image,
    base_mip: u32,
    mip_count: u32,
    old: ImageLayout,
    new: ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    let src = layout_usage(old);
    let dst = layout_usage(new);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .old_layout(src.layout)
        .new_layout(dst.layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_range(base_mip, mip_count))
}

pub fn color_range(base_mip: u32, mip_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: base_mip,
        level_count: mip_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn color_layers(mip: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: mip,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Extent as a blit corner offset.
pub fn corner(width: u32, height: u32) -> vk::Offset3D {
    vk::Offset3D {
        x: width as i32,
        y: height as i32,
        z: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_count_bits_match() {
        for samples in SampleCount::ALL {
            assert_eq!(convert_sample_count(samples).as_raw(), samples.count());
        }
    }

    #[test]
    fn test_multisampled_images_are_not_sampled() {
        let usage = TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT;
        assert!(convert_texture_usage(usage, SampleCount::X1).contains(vk::ImageUsageFlags::SAMPLED));
        assert!(!convert_texture_usage(usage, SampleCount::X4).contains(vk::ImageUsageFlags::SAMPLED));
    }

    #[test]
    fn test_barrier_maps_layouts() {
        let barrier = image_barrier(
            vk::Image::null(),
            1,
            3,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        );
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.subresource_range.base_mip_level, 1);
        assert_eq!(barrier.subresource_range.level_count, 3);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn test_empty_wait_stage_waits_for_everything() {
        assert_eq!(
            convert_pipeline_stage(PipelineStage::empty()),
            vk::PipelineStageFlags2::ALL_COMMANDS
        );
        assert_eq!(
            convert_pipeline_stage(PipelineStage::TRANSFER),
            vk::PipelineStageFlags2::ALL_TRANSFER
        );
    }
}
