//! Finalization: turning a rendered attachment into a sampleable, mip-mapped image.
//!
//! Every variant ends the same way: the source image is left in
//! [`ImageLayout::TransferSrc`] and [`record_mip_chain`] fills the output image
//! from it, leaving every output level in [`ImageLayout::ShaderReadOnly`].

use std::sync::Arc;

use crate::backend::{GpuDescriptorSet, GpuImage};
use crate::command::{BlurDirection, CommandList, GpuCommand, ImageLayout};
use crate::error::GraphicsError;
use crate::types::{BlurAmount, BlurType, Extent2d, FilterMode, SampleCount, mip_extents};

use super::swap::SlotImages;

/// The finalize sequence of a surface, chosen from (multisampled, blurred).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalizeVariant {
    /// Mip chain straight from the attachment.
    Direct,
    /// Resolve into scratch A, mip chain from A.
    Multisample,
    /// Blur through scratch A and B, copy back into the attachment, mip chain from it.
    Blur,
    /// Resolve into A, blur A → B → A, mip chain from A.
    MultisampleBlur,
}

impl FinalizeVariant {
    /// Variant for a surface's creation parameters.
    pub fn select(samples: SampleCount, blur: bool) -> Self {
        match (samples.is_multisampled(), blur) {
            (false, false) => Self::Direct,
            (true, false) => Self::Multisample,
            (false, true) => Self::Blur,
            (true, true) => Self::MultisampleBlur,
        }
    }

    /// Variant used for one frame: a zero blur amount skips the blur passes.
    pub fn for_frame(self, amount: BlurAmount) -> Self {
        if !amount.is_zero() {
            return self;
        }
        match self {
            Self::Blur => Self::Direct,
            Self::MultisampleBlur => Self::Multisample,
            other => other,
        }
    }

    /// Number of scratch images the variant needs.
    pub fn scratch_count(self) -> usize {
        match self {
            Self::Direct => 0,
            Self::Multisample => 1,
            Self::Blur | Self::MultisampleBlur => 2,
        }
    }

    /// Returns true if the variant runs blur passes.
    pub fn blurs(self) -> bool {
        matches!(self, Self::Blur | Self::MultisampleBlur)
    }
}

/// Blur parameters of one frame.
#[derive(Debug, Clone, Copy)]
pub struct BlurSettings {
    pub amount: BlurAmount,
    pub blur_type: BlurType,
}

fn scratch(image: &Option<Arc<GpuImage>>, name: &str) -> Result<Arc<GpuImage>, GraphicsError> {
    image
        .clone()
        .ok_or_else(|| GraphicsError::Internal(format!("scratch image {name} missing")))
}

fn blur_descriptor(
    images: &SlotImages,
    index: usize,
) -> Result<GpuDescriptorSet, GraphicsError> {
    images
        .blur_descriptors
        .get(index)
        .map(|(_, set)| set.clone())
        .ok_or_else(|| GraphicsError::Internal("blur descriptor sets missing".to_string()))
}

fn blur_pass(
    list: &mut CommandList,
    src: &Arc<GpuImage>,
    dst: &Arc<GpuImage>,
    extent: Extent2d,
    direction: BlurDirection,
    blur: BlurSettings,
    descriptor: GpuDescriptorSet,
) {
    let coverage = match direction {
        BlurDirection::Horizontal => blur.amount.x,
        BlurDirection::Vertical => blur.amount.y,
    };
    list.push(GpuCommand::Blur {
        src: Arc::clone(src),
        dst: Arc::clone(dst),
        extent,
        direction,
        blur_type: blur.blur_type,
        coverage: coverage.max(1.0),
        descriptor,
    });
}

/// Record the finalize sequence of `variant` after the render pass ended.
///
/// The attachment is in [`ImageLayout::ColorAttachment`] on entry.
pub fn record_finalize(
    list: &mut CommandList,
    variant: FinalizeVariant,
    images: &SlotImages,
    blur: BlurSettings,
    granularity: Extent2d,
) -> Result<(), GraphicsError> {
    let attachment = &images.attachment;
    let extent = images.size;

    let source = match variant {
        FinalizeVariant::Direct => {
            list.barrier(attachment, 0, 1, ImageLayout::ColorAttachment, ImageLayout::TransferSrc);
            Arc::clone(attachment)
        }
        FinalizeVariant::Multisample => {
            let a = scratch(&images.scratch_a, "A")?;
            list.barrier(&a, 0, 1, ImageLayout::Undefined, ImageLayout::TransferDst);
            list.barrier(attachment, 0, 1, ImageLayout::ColorAttachment, ImageLayout::TransferSrc);
            list.push(GpuCommand::Resolve {
                src: Arc::clone(attachment),
                dst: Arc::clone(&a),
                extent,
            });
            list.barrier(&a, 0, 1, ImageLayout::TransferDst, ImageLayout::TransferSrc);
            a
        }
        FinalizeVariant::Blur => {
            let a = scratch(&images.scratch_a, "A")?;
            let b = scratch(&images.scratch_b, "B")?;
            list.barrier(
                attachment,
                0,
                1,
                ImageLayout::ColorAttachment,
                ImageLayout::ShaderReadOnly,
            );
            list.barrier(&a, 0, 1, ImageLayout::Undefined, ImageLayout::ColorAttachment);
            blur_pass(
                list,
                attachment,
                &a,
                extent,
                BlurDirection::Horizontal,
                blur,
                blur_descriptor(images, 0)?,
            );
            list.barrier(&a, 0, 1, ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly);
            list.barrier(&b, 0, 1, ImageLayout::Undefined, ImageLayout::ColorAttachment);
            blur_pass(
                list,
                &a,
                &b,
                extent,
                BlurDirection::Vertical,
                blur,
                blur_descriptor(images, 1)?,
            );
            list.barrier(&b, 0, 1, ImageLayout::ColorAttachment, ImageLayout::TransferSrc);
            list.barrier(attachment, 0, 1, ImageLayout::ShaderReadOnly, ImageLayout::TransferDst);
            list.push(GpuCommand::Copy {
                src: Arc::clone(&b),
                src_mip: 0,
                dst: Arc::clone(attachment),
                dst_mip: 0,
                extent,
            });
            list.barrier(attachment, 0, 1, ImageLayout::TransferDst, ImageLayout::TransferSrc);
            Arc::clone(attachment)
        }
        FinalizeVariant::MultisampleBlur => {
            let a = scratch(&images.scratch_a, "A")?;
            let b = scratch(&images.scratch_b, "B")?;
            list.barrier(&a, 0, 1, ImageLayout::Undefined, ImageLayout::TransferDst);
            list.barrier(attachment, 0, 1, ImageLayout::ColorAttachment, ImageLayout::TransferSrc);
            list.push(GpuCommand::Resolve {
                src: Arc::clone(attachment),
                dst: Arc::clone(&a),
                extent,
            });
            list.barrier(&a, 0, 1, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly);
            list.barrier(&b, 0, 1, ImageLayout::Undefined, ImageLayout::ColorAttachment);
            blur_pass(
                list,
                &a,
                &b,
                extent,
                BlurDirection::Horizontal,
                blur,
                blur_descriptor(images, 0)?,
            );
            list.barrier(&b, 0, 1, ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly);
            list.barrier(&a, 0, 1, ImageLayout::ShaderReadOnly, ImageLayout::ColorAttachment);
            blur_pass(
                list,
                &b,
                &a,
                extent,
                BlurDirection::Vertical,
                blur,
                blur_descriptor(images, 1)?,
            );
            list.barrier(&a, 0, 1, ImageLayout::ColorAttachment, ImageLayout::TransferSrc);
            a
        }
    };

    record_mip_chain(list, &source, &images.output, extent, granularity);
    Ok(())
}

/// Fill every mip level of `output` from mip 0 of `source`.
///
/// `source` must be in [`ImageLayout::TransferSrc`]. Level 0 is a plain copy
/// when `size` is a multiple of the transfer granularity and a same-size blit
/// otherwise. Level 1 is blitted from the source, every later level from the
/// level above it.
pub fn record_mip_chain(
    list: &mut CommandList,
    source: &Arc<GpuImage>,
    output: &Arc<GpuImage>,
    size: Extent2d,
    granularity: Extent2d,
) {
    let extents = mip_extents(size);
    let levels = (output.descriptor().mip_level_count as usize).min(extents.len());
    if levels == 0 {
        return;
    }
    let level_count = levels as u32;

    list.barrier(output, 0, level_count, ImageLayout::Undefined, ImageLayout::TransferDst);

    if size.is_multiple_of(granularity) {
        list.push(GpuCommand::Copy {
            src: Arc::clone(source),
            src_mip: 0,
            dst: Arc::clone(output),
            dst_mip: 0,
            extent: size,
        });
    } else {
        list.push(GpuCommand::Blit {
            src: Arc::clone(source),
            src_mip: 0,
            src_extent: size,
            dst: Arc::clone(output),
            dst_mip: 0,
            dst_extent: size,
            filter: FilterMode::Nearest,
        });
    }

    for mip in 1..levels {
        let (src, src_mip) = if mip == 1 {
            (source, 0)
        } else {
            let above = (mip - 1) as u32;
            list.barrier(output, above, 1, ImageLayout::TransferDst, ImageLayout::TransferSrc);
            (output, above)
        };
        list.push(GpuCommand::Blit {
            src: Arc::clone(src),
            src_mip,
            src_extent: extents[mip - 1],
            dst: Arc::clone(output),
            dst_mip: mip as u32,
            dst_extent: extents[mip],
            filter: FilterMode::Linear,
        });
    }

    // Level 0 and the last level were only written; the ones between were also read.
    list.barrier(output, 0, 1, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly);
    if levels > 2 {
        list.barrier(
            output,
            1,
            level_count - 2,
            ImageLayout::TransferSrc,
            ImageLayout::ShaderReadOnly,
        );
    }
    if levels > 1 {
        list.barrier(
            output,
            level_count - 1,
            1,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareImage;
    use crate::types::{ImageDescriptor, TextureUsage, mip_level_count};

    fn image(size: Extent2d, mips: u32) -> Arc<GpuImage> {
        let desc = ImageDescriptor::new_2d(size.width, size.height, TextureUsage::all())
            .with_mip_levels(mips);
        Arc::new(GpuImage::Software(SoftwareImage::new(&desc).unwrap()))
    }

    fn blits(list: &CommandList) -> Vec<(u32, u32, FilterMode)> {
        list.commands()
            .iter()
            .filter_map(|c| match c {
                GpuCommand::Blit {
                    src_mip,
                    dst_mip,
                    filter,
                    ..
                } => Some((*src_mip, *dst_mip, *filter)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_variant_selection() {
        assert_eq!(FinalizeVariant::select(SampleCount::X1, false), FinalizeVariant::Direct);
        assert_eq!(FinalizeVariant::select(SampleCount::X4, false), FinalizeVariant::Multisample);
        assert_eq!(FinalizeVariant::select(SampleCount::X1, true), FinalizeVariant::Blur);
        assert_eq!(
            FinalizeVariant::select(SampleCount::X8, true),
            FinalizeVariant::MultisampleBlur
        );
        assert_eq!(FinalizeVariant::Blur.scratch_count(), 2);
    }

    #[test]
    fn test_zero_blur_falls_back() {
        assert_eq!(
            FinalizeVariant::Blur.for_frame(BlurAmount::NONE),
            FinalizeVariant::Direct
        );
        assert_eq!(
            FinalizeVariant::MultisampleBlur.for_frame(BlurAmount::NONE),
            FinalizeVariant::Multisample
        );
        assert_eq!(
            FinalizeVariant::Blur.for_frame(BlurAmount::new(2.0, 0.0)),
            FinalizeVariant::Blur
        );
    }

    #[test]
    fn test_mip_chain_513x217() {
        let size = Extent2d::new(513, 217);
        let levels = mip_level_count(size);
        assert_eq!(levels, 10);

        let source = image(size, 1);
        let output = image(size, levels);
        let mut list = CommandList::new("mips");
        record_mip_chain(&mut list, &source, &output, size, Extent2d::new(1, 1));

        // Level 0 copied, level 1 from the source, the rest from the level above
        assert!(matches!(list.commands()[1], GpuCommand::Copy { .. }));
        let blits = blits(&list);
        assert_eq!(blits.len(), 9);
        assert_eq!(blits[0], (0, 1, FilterMode::Linear));
        for (i, blit) in blits.iter().enumerate().skip(1) {
            assert_eq!(*blit, (i as u32, i as u32 + 1, FilterMode::Linear));
        }

        let last = list
            .commands()
            .iter()
            .filter_map(|c| match c {
                GpuCommand::Blit { dst_extent, .. } => Some(*dst_extent),
                _ => None,
            })
            .last();
        assert_eq!(last, Some(Extent2d::new(1, 1)));
    }

    #[test]
    fn test_mip_chain_granularity_blit() {
        let size = Extent2d::new(30, 30);
        let source = image(size, 1);
        let output = image(size, mip_level_count(size));
        let mut list = CommandList::new("mips");
        record_mip_chain(&mut list, &source, &output, size, Extent2d::new(8, 8));

        assert!(!list
            .commands()
            .iter()
            .any(|c| matches!(c, GpuCommand::Copy { .. })));
        assert_eq!(blits(&list)[0], (0, 0, FilterMode::Nearest));
    }

    #[test]
    fn test_mip_chain_ends_shader_readable() {
        let size = Extent2d::new(8, 8);
        let source = image(size, 1);
        let output = image(size, 4);
        let mut list = CommandList::new("mips");
        record_mip_chain(&mut list, &source, &output, size, Extent2d::new(1, 1));

        // Track the layout of every level through the barriers
        let mut layouts = [ImageLayout::Undefined; 4];
        for command in list.commands() {
            if let GpuCommand::Barrier(barrier) = command {
                if !Arc::ptr_eq(&barrier.image, &output) {
                    continue;
                }
                for mip in barrier.base_mip..barrier.base_mip + barrier.mip_count {
                    assert_eq!(layouts[mip as usize], barrier.old_layout, "mip {mip}");
                    layouts[mip as usize] = barrier.new_layout;
                }
            }
        }
        assert_eq!(layouts, [ImageLayout::ShaderReadOnly; 4]);
    }
}
