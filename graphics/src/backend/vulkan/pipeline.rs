//! Draw and blur pipelines, compiled from WGSL through naga.

use std::collections::HashMap;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::backend::DescriptorLayout;
use crate::command::BlurDirection;
use crate::error::GraphicsError;
use crate::types::{BlurType, DrawVertex, Extent2d, SamplerDescriptor};

use super::conversion::{
    COLOR_FORMAT, convert_address_mode, convert_filter_mode, convert_mipmap_filter_mode,
};

const DRAW_SHADER: &str = r#"
struct FrameData {
    multiplier: vec2<f32>,
    offset: vec2<f32>,
}

@group(0) @binding(0) var<uniform> frame: FrameData;
@group(0) @binding(1) var color_texture: texture_2d<f32>;
@group(0) @binding(2) var color_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) color: vec4<f32>,
}

@vertex
fn vs_main(
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) color: vec4<f32>,
) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position * frame.multiplier + frame.offset, 0.0, 1.0);
    out.uv = uv;
    out.color = color;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return clamp(in.color, vec4<f32>(0.0), vec4<f32>(1.0))
        * textureSample(color_texture, color_sampler, in.uv);
}
"#;

const BLUR_SHADER: &str = r#"
struct BlurParams {
    step: vec2<i32>,
    extent: vec2<i32>,
    support: i32,
    gaussian: u32,
    sigma: f32,
    pad: f32,
}

var<push_constant> params: BlurParams;
@group(0) @binding(0) var source: texture_2d<f32>;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    return vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    let center = vec2<i32>(floor(position.xy));
    let last = params.extent - vec2<i32>(1);
    var sum = vec4<f32>(0.0);
    var total = 0.0;
    for (var i = -params.support; i <= params.support; i++) {
        var weight = 1.0;
        if (params.gaussian != 0u) {
            let x = f32(i);
            weight = exp(-0.5 * x * x / (params.sigma * params.sigma));
        }
        let coord = clamp(center + params.step * i, vec2<i32>(0), last);
        sum += weight * textureLoad(source, coord, 0);
        total += weight;
    }
    return sum / total;
}
"#;

/// Push constants of one blur pass. Mirrors `BlurParams` in the blur shader.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BlurPushConstants {
    pub step: [i32; 2],
    pub extent: [i32; 2],
    pub support: i32,
    pub gaussian: u32,
    pub sigma: f32,
    pub pad: f32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<BlurPushConstants>(), 32);

impl BlurPushConstants {
    /// Parameters matching [`blur_kernel`](crate::command::blur_kernel) for `coverage`.
    pub fn new(direction: BlurDirection, blur_type: BlurType, coverage: f32, extent: Extent2d) -> Self {
        let coverage = coverage.max(1.0);
        let (dx, dy) = direction.step();
        Self {
            step: [dx as i32, dy as i32],
            extent: [extent.width as i32, extent.height as i32],
            support: coverage.floor() as i32,
            gaussian: u32::from(blur_type == BlurType::Gaussian),
            sigma: coverage / 3.0,
            pad: 0.0,
        }
    }
}

/// Compile a WGSL entry point to SPIR-V and wrap it in a shader module.
fn compile_shader(
    device: &ash::Device,
    source: &str,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> Result<vk::ShaderModule, GraphicsError> {
    let failed = |what: String| {
        GraphicsError::InitializationFailed(format!("shader {entry_point} ({stage:?}): {what}"))
    };

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| failed(format!("WGSL parse error: {e}")))?;
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::PUSH_CONSTANT,
    );
    let info = validator
        .validate(&module)
        .map_err(|e| failed(format!("validation error: {e}")))?;

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_string(),
    };
    let spv = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| failed(format!("SPIR-V generation error: {e}")))?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&spv);
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| failed(format!("shader module creation failed: {e:?}")))
}

/// Owns every pipeline object the backend records with.
pub struct PipelineManager {
    device: ash::Device,
    draw_set_layout: vk::DescriptorSetLayout,
    blur_set_layout: vk::DescriptorSetLayout,
    draw_layout: vk::PipelineLayout,
    blur_layout: vk::PipelineLayout,
    modules: Vec<vk::ShaderModule>,
    draw_vertex: vk::ShaderModule,
    draw_fragment: vk::ShaderModule,
    blur_pipeline: vk::Pipeline,
    /// Draw pipelines by attachment sample count.
    draw_pipelines: Mutex<HashMap<vk::SampleCountFlags, vk::Pipeline>>,
    samplers: Mutex<HashMap<SamplerDescriptor, vk::Sampler>>,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    destroyed: bool,
}

impl PipelineManager {
    /// Maximum descriptor sets alive at once.
    pub const MAX_SETS: u32 = 4096;

    pub fn new(device: ash::Device) -> Result<Self, GraphicsError> {
        let mut manager = Self {
            device,
            draw_set_layout: vk::DescriptorSetLayout::null(),
            blur_set_layout: vk::DescriptorSetLayout::null(),
            draw_layout: vk::PipelineLayout::null(),
            blur_layout: vk::PipelineLayout::null(),
            modules: Vec::new(),
            draw_vertex: vk::ShaderModule::null(),
            draw_fragment: vk::ShaderModule::null(),
            blur_pipeline: vk::Pipeline::null(),
            draw_pipelines: Mutex::new(HashMap::new()),
            samplers: Mutex::new(HashMap::new()),
            descriptor_pool: Mutex::new(vk::DescriptorPool::null()),
            destroyed: false,
        };
        // Partially created objects are released by destroy().
        if let Err(e) = manager.create_objects() {
            unsafe { manager.destroy() };
            return Err(e);
        }
        Ok(manager)
    }

    fn create_objects(&mut self) -> Result<(), GraphicsError> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: Self::MAX_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: Self::MAX_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: Self::MAX_SETS,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(Self::MAX_SETS)
            .pool_sizes(&pool_sizes);
        *self.descriptor_pool.get_mut() =
            unsafe { self.device.create_descriptor_pool(&pool_info, None) }
                .map_err(|e| creation_failed("descriptor pool", e))?;

        let draw_bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(2)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        self.draw_set_layout = self.create_set_layout(&draw_bindings)?;

        let blur_bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        self.blur_set_layout = self.create_set_layout(&blur_bindings)?;

        let draw_set_layouts = [self.draw_set_layout];
        self.draw_layout = unsafe {
            self.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(&draw_set_layouts),
                None,
            )
        }
        .map_err(|e| creation_failed("draw pipeline layout", e))?;

        let blur_set_layouts = [self.blur_set_layout];
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: std::mem::size_of::<BlurPushConstants>() as u32,
        }];
        self.blur_layout = unsafe {
            self.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&blur_set_layouts)
                    .push_constant_ranges(&push_constant_ranges),
                None,
            )
        }
        .map_err(|e| creation_failed("blur pipeline layout", e))?;

        self.draw_vertex = self.module(DRAW_SHADER, naga::ShaderStage::Vertex, "vs_main")?;
        self.draw_fragment = self.module(DRAW_SHADER, naga::ShaderStage::Fragment, "fs_main")?;
        let blur_vertex = self.module(BLUR_SHADER, naga::ShaderStage::Vertex, "vs_main")?;
        let blur_fragment = self.module(BLUR_SHADER, naga::ShaderStage::Fragment, "fs_main")?;

        self.blur_pipeline = self.create_pipeline(
            blur_vertex,
            blur_fragment,
            self.blur_layout,
            vk::SampleCountFlags::TYPE_1,
            false,
        )?;
        Ok(())
    }

    fn create_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, GraphicsError> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| creation_failed("descriptor set layout", e))
    }

    fn module(
        &mut self,
        source: &str,
        stage: naga::ShaderStage,
        entry_point: &str,
    ) -> Result<vk::ShaderModule, GraphicsError> {
        let module = compile_shader(&self.device, source, stage, entry_point)?;
        self.modules.push(module);
        Ok(module)
    }

    /// Triangle-list pipeline rendering into one RGBA8 attachment.
    ///
    /// Draw pipelines read [`DrawVertex`] and alpha blend; blur pipelines
    /// generate a full-screen triangle and overwrite.
    fn create_pipeline(
        &self,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
        layout: vk::PipelineLayout,
        samples: vk::SampleCountFlags,
        draw: bool,
    ) -> Result<vk::Pipeline, GraphicsError> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(c"vs_main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(c"fs_main"),
        ];

        let bindings = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<DrawVertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)];
        let attributes = [
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(DrawVertex, position) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(DrawVertex, uv) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(std::mem::offset_of!(DrawVertex, color) as u32),
        ];
        let vertex_input_state = if draw {
            vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes)
        } else {
            vk::PipelineVertexInputStateCreateInfo::default()
        };

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE);
        let multisample_state =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(samples);

        let blend_attachment = if draw {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        };
        let blend_attachments = [blend_attachment];
        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [COLOR_FORMAT];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| creation_failed("graphics pipeline", e))?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GraphicsError::Internal("no pipeline returned".to_string()))
    }

    /// Draw pipeline for attachments with `samples` samples, created on first use.
    pub fn draw_pipeline(&self, samples: vk::SampleCountFlags) -> Result<vk::Pipeline, GraphicsError> {
        let mut pipelines = self.draw_pipelines.lock();
        if let Some(pipeline) = pipelines.get(&samples) {
            return Ok(*pipeline);
        }
        log::debug!("VulkanBackend: creating draw pipeline for {:?}", samples);
        let pipeline = self.create_pipeline(
            self.draw_vertex,
            self.draw_fragment,
            self.draw_layout,
            samples,
            true,
        )?;
        pipelines.insert(samples, pipeline);
        Ok(pipeline)
    }

    pub fn blur_pipeline(&self) -> vk::Pipeline {
        self.blur_pipeline
    }

    pub fn draw_layout(&self) -> vk::PipelineLayout {
        self.draw_layout
    }

    pub fn blur_layout(&self) -> vk::PipelineLayout {
        self.blur_layout
    }

    /// Sampler matching `descriptor`, created on first use.
    pub fn sampler(&self, descriptor: &SamplerDescriptor) -> Result<vk::Sampler, GraphicsError> {
        let mut samplers = self.samplers.lock();
        if let Some(sampler) = samplers.get(descriptor) {
            return Ok(*sampler);
        }
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter_mode(descriptor.mag_filter))
            .min_filter(convert_filter_mode(descriptor.min_filter))
            .mipmap_mode(convert_mipmap_filter_mode(descriptor.min_filter))
            .address_mode_u(convert_address_mode(descriptor.address_mode_u))
            .address_mode_v(convert_address_mode(descriptor.address_mode_v))
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }
            .map_err(|e| creation_failed("sampler", e))?;
        samplers.insert(*descriptor, sampler);
        Ok(sampler)
    }

    /// Allocate a descriptor set of the given layout.
    pub fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayout,
    ) -> Result<vk::DescriptorSet, GraphicsError> {
        let layouts = [match layout {
            DescriptorLayout::Draw => self.draw_set_layout,
            DescriptorLayout::Blur => self.blur_set_layout,
        }];
        let pool = self.descriptor_pool.lock();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(|e| {
            GraphicsError::DescriptorAllocationFailed(format!("{layout:?}: {:?}", e))
        })?;
        sets.into_iter()
            .next()
            .ok_or_else(|| GraphicsError::DescriptorAllocationFailed(format!("{layout:?}: empty")))
    }

    /// Return a set to the pool.
    pub fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        let pool = self.descriptor_pool.lock();
        if let Err(e) = unsafe { self.device.free_descriptor_sets(*pool, &[set]) } {
            log::error!("Failed to free descriptor set: {:?}", e);
        }
    }

    /// Explicitly destroy all resources.
    ///
    /// # Safety
    ///
    /// The GPU must be idle, and this must run before the device is destroyed.
    pub unsafe fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        unsafe {
            for (_, pipeline) in self.draw_pipelines.get_mut().drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            self.device.destroy_pipeline(self.blur_pipeline, None);
            for (_, sampler) in self.samplers.get_mut().drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for module in self.modules.drain(..) {
                self.device.destroy_shader_module(module, None);
            }
            self.device.destroy_pipeline_layout(self.draw_layout, None);
            self.device.destroy_pipeline_layout(self.blur_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.draw_set_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.blur_set_layout, None);
            self.device
                .destroy_descriptor_pool(*self.descriptor_pool.get_mut(), None);
        }
        self.destroyed = true;
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("PipelineManager dropped without destroy(); pipeline objects leaked");
        }
    }
}

fn creation_failed(what: &str, e: vk::Result) -> GraphicsError {
    GraphicsError::ResourceCreationFailed(format!("Failed to create {what}: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) {
        let module = naga::front::wgsl::parse_str(source).unwrap();
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::PUSH_CONSTANT,
        )
        .validate(&module)
        .unwrap();
    }

    #[test]
    fn test_shaders_validate() {
        validate(DRAW_SHADER);
        validate(BLUR_SHADER);
    }

    #[test]
    fn test_blur_constants_follow_kernel() {
        let params = BlurPushConstants::new(
            BlurDirection::Vertical,
            BlurType::Gaussian,
            4.7,
            Extent2d::new(64, 32),
        );
        assert_eq!(params.step, [0, 1]);
        assert_eq!(params.extent, [64, 32]);
        // Same tap count as the CPU kernel.
        let taps = (2 * params.support + 1) as usize;
        assert_eq!(taps, crate::command::blur_kernel(BlurType::Gaussian, 4.7).len());
        assert_eq!(params.gaussian, 1);

        let boxed = BlurPushConstants::new(
            BlurDirection::Horizontal,
            BlurType::Box,
            0.2,
            Extent2d::new(8, 8),
        );
        assert_eq!(boxed.support, 1);
        assert_eq!(boxed.gaussian, 0);
    }
}
