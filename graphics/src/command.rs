//! Backend-neutral command lists.
//!
//! Surfaces record their per-frame work into a [`CommandList`]. A backend
//! compiles the list into a command buffer with
//! [`GpuBackend::record`](crate::backend::GpuBackend::record): the software
//! backend keeps it for execution, the Vulkan backend translates it into native
//! commands. Lists are plain data, so finalization sequences can be inspected
//! in tests without a device.

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::{GpuBuffer, GpuDescriptorSet, GpuImage};
use crate::types::{BlurType, Color, DrawVertex, Extent2d, FilterMode, Rect, SamplerDescriptor};

bitflags! {
    /// Pipeline stages a semaphore wait applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStage: u32 {
        const VERTEX_INPUT = 1 << 0;
        const VERTEX_SHADER = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 3;
        const TRANSFER = 1 << 4;
        const ALL_COMMANDS = 1 << 5;
    }
}

/// Layout an image (or a range of its mips) is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents may be discarded.
    Undefined,
    /// Render target of a render pass.
    ColorAttachment,
    /// Source of copy, blit or resolve.
    TransferSrc,
    /// Destination of copy, blit or resolve.
    TransferDst,
    /// Sampled by shaders.
    ShaderReadOnly,
}

/// Layout transition of a mip range.
#[derive(Debug, Clone)]
pub struct ImageBarrier {
    pub image: Arc<GpuImage>,
    pub base_mip: u32,
    pub mip_count: u32,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// Axis of a separable blur pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlurDirection {
    Horizontal,
    Vertical,
}

impl BlurDirection {
    /// Texel step along this axis.
    pub fn step(self) -> (i64, i64) {
        match self {
            Self::Horizontal => (1, 0),
            Self::Vertical => (0, 1),
        }
    }
}

/// Normalized weights of a separable blur kernel.
///
/// `amount` is the blur coverage in texels along one axis. Coverages below one
/// texel are raised to one. The kernel spans `2 * floor(coverage) + 1` taps
/// centered on the sampled texel; Gaussian weights use `sigma = coverage / 3`.
pub fn blur_kernel(blur_type: BlurType, amount: f32) -> Vec<f32> {
    let coverage = amount.max(1.0);
    let support = coverage.floor() as i32;
    let sigma = coverage / 3.0;

    let mut weights: Vec<f32> = (-support..=support)
        .map(|i| match blur_type {
            BlurType::Box => 1.0,
            BlurType::Gaussian => {
                let x = i as f32;
                (-0.5 * x * x / (sigma * sigma)).exp()
            }
        })
        .collect();
    let total: f32 = weights.iter().sum();
    for weight in &mut weights {
        *weight /= total;
    }
    weights
}

/// A single recorded command.
#[derive(Debug, Clone)]
pub enum GpuCommand {
    /// Begin rendering into mip 0 of `target`, clearing it first.
    BeginRenderPass {
        target: Arc<GpuImage>,
        clear: Color,
        extent: Extent2d,
    },
    EndRenderPass,
    SetViewport(Rect),
    SetScissor(Rect),
    /// Bind the per-frame coordinate scaling uniform.
    BindFrameData(Arc<GpuBuffer>),
    /// Bind the alpha-blended draw pipeline.
    BindDrawPipeline,
    /// Bind a texture and sampler through a descriptor set.
    BindTexture {
        image: Arc<GpuImage>,
        sampler: SamplerDescriptor,
        descriptor: GpuDescriptorSet,
    },
    /// Draw a triangle list with the bound state.
    Draw { vertices: Vec<DrawVertex> },
    /// Average every sample of `src` into single-sample `dst`.
    Resolve {
        src: Arc<GpuImage>,
        dst: Arc<GpuImage>,
        extent: Extent2d,
    },
    /// One pass of a separable blur, sampling mip 0 of `src` into mip 0 of `dst`.
    Blur {
        src: Arc<GpuImage>,
        dst: Arc<GpuImage>,
        extent: Extent2d,
        direction: BlurDirection,
        blur_type: BlurType,
        coverage: f32,
        descriptor: GpuDescriptorSet,
    },
    /// Texel-exact copy between equally sized mips.
    Copy {
        src: Arc<GpuImage>,
        src_mip: u32,
        dst: Arc<GpuImage>,
        dst_mip: u32,
        extent: Extent2d,
    },
    /// Scaled, filtered copy.
    Blit {
        src: Arc<GpuImage>,
        src_mip: u32,
        src_extent: Extent2d,
        dst: Arc<GpuImage>,
        dst_mip: u32,
        dst_extent: Extent2d,
        filter: FilterMode,
    },
    Barrier(ImageBarrier),
    /// Write `data` at offset 0 of `buffer`.
    UpdateBuffer {
        buffer: Arc<GpuBuffer>,
        data: Vec<u8>,
    },
}

/// An ordered list of commands, compiled into a command buffer as a whole.
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    label: String,
    commands: Vec<GpuCommand>,
}

impl CommandList {
    /// Create an empty list.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append a command.
    pub fn push(&mut self, command: GpuCommand) {
        self.commands.push(command);
    }

    /// Append a layout transition.
    pub fn barrier(
        &mut self,
        image: &Arc<GpuImage>,
        base_mip: u32,
        mip_count: u32,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        self.push(GpuCommand::Barrier(ImageBarrier {
            image: Arc::clone(image),
            base_mip,
            mip_count,
            old_layout,
            new_layout,
        }));
    }

    /// Recorded commands, in order.
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blur_direction_step() {
        assert_eq!(BlurDirection::Horizontal.step(), (1, 0));
        assert_eq!(BlurDirection::Vertical.step(), (0, 1));
    }

    #[test]
    fn test_blur_kernel_is_normalized() {
        for blur_type in [BlurType::Box, BlurType::Gaussian] {
            for amount in [0.0, 1.0, 2.5, 8.0] {
                let kernel = blur_kernel(blur_type, amount);
                let total: f32 = kernel.iter().sum();
                assert!((total - 1.0).abs() < 1e-5, "{blur_type:?} {amount}");
            }
        }
    }

    #[test]
    fn test_blur_kernel_support() {
        assert_eq!(blur_kernel(BlurType::Gaussian, 0.2).len(), 3);
        assert_eq!(blur_kernel(BlurType::Gaussian, 4.7).len(), 9);

        let boxed = blur_kernel(BlurType::Box, 2.0);
        assert_eq!(boxed.len(), 5);
        assert!(boxed.iter().all(|w| (w - 0.2).abs() < 1e-6));

        // Gaussian peaks at the center tap
        let gaussian = blur_kernel(BlurType::Gaussian, 3.0);
        assert!(gaussian[3] > gaussian[2] && gaussian[2] > gaussian[0]);
    }

    #[test]
    fn test_command_list_records_in_order() {
        let mut list = CommandList::new("frame");
        list.push(GpuCommand::EndRenderPass);
        list.push(GpuCommand::BindDrawPipeline);

        assert_eq!(list.label(), "frame");
        assert_eq!(list.len(), 2);
        assert!(matches!(list.commands()[0], GpuCommand::EndRenderPass));
        assert!(matches!(list.commands()[1], GpuCommand::BindDrawPipeline));
    }
}
