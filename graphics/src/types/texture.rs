//! Image and multisample types.

use bitflags::bitflags;

use super::Extent2d;

/// Number of samples per texel of a render attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SampleCount {
    /// No multisampling.
    #[default]
    X1,
    X2,
    X4,
    X8,
    X16,
    X32,
    X64,
}

impl SampleCount {
    /// Every sample count, lowest first.
    pub const ALL: [SampleCount; 7] = [
        Self::X1,
        Self::X2,
        Self::X4,
        Self::X8,
        Self::X16,
        Self::X32,
        Self::X64,
    ];

    /// Number of samples.
    pub fn count(self) -> u32 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
            Self::X16 => 16,
            Self::X32 => 32,
            Self::X64 => 64,
        }
    }

    /// Sample count from a raw number, if it is a power of two the engine knows.
    pub fn from_count(count: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.count() == count)
    }

    /// Returns true if this count enables multisampling.
    pub fn is_multisampled(self) -> bool {
        self != Self::X1
    }
}

bitflags! {
    /// Set of sample counts supported by a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SampleCountFlags: u32 {
        const X1 = 1;
        const X2 = 2;
        const X4 = 4;
        const X8 = 8;
        const X16 = 16;
        const X32 = 32;
        const X64 = 64;
    }
}

impl SampleCountFlags {
    /// Returns true if the given count is in the set.
    pub fn supports(self, samples: SampleCount) -> bool {
        self.bits() & samples.count() != 0
    }

    /// Highest count in the set.
    pub fn max(self) -> SampleCount {
        SampleCount::ALL
            .into_iter()
            .rev()
            .find(|s| self.supports(*s))
            .unwrap_or(SampleCount::X1)
    }
}

bitflags! {
    /// Usage flags for images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Image can be copied or blitted from.
        const COPY_SRC = 1 << 0;
        /// Image can be copied or blitted to.
        const COPY_DST = 1 << 1;
        /// Image can be sampled in a shader.
        const TEXTURE_BINDING = 1 << 2;
        /// Image can be used as a render attachment.
        const RENDER_ATTACHMENT = 1 << 3;
    }
}

impl Default for TextureUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a 2D RGBA8 image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDescriptor {
    /// Debug label.
    pub label: Option<String>,
    /// Size of mip level 0.
    pub size: Extent2d,
    /// Mip level count.
    pub mip_level_count: u32,
    /// Samples per texel.
    pub samples: SampleCount,
    /// Usage flags.
    pub usage: TextureUsage,
}

impl ImageDescriptor {
    /// Create a new single-level, single-sample image descriptor.
    pub fn new_2d(width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            label: None,
            size: Extent2d::new(width, height),
            mip_level_count: 1,
            samples: SampleCount::X1,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_level_count = count;
        self
    }

    /// Set the sample count.
    pub fn with_samples(mut self, samples: SampleCount) -> Self {
        self.samples = samples;
        self
    }
}

/// Number of mip levels of a full chain: `floor(log2(max(w, h))) + 1`.
pub fn mip_level_count(size: Extent2d) -> u32 {
    let largest = size.width.max(size.height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Size of every level of a full mip chain, level 0 first.
pub fn mip_extents(size: Extent2d) -> Vec<Extent2d> {
    let count = mip_level_count(size);
    let mut extents = Vec::with_capacity(count as usize);
    let mut current = Extent2d::new(size.width.max(1), size.height.max(1));
    for _ in 0..count {
        extents.push(current);
        current = Extent2d::new((current.width / 2).max(1), (current.height / 2).max(1));
    }
    extents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(Extent2d::new(1, 1)), 1);
        assert_eq!(mip_level_count(Extent2d::new(256, 256)), 9);
        assert_eq!(mip_level_count(Extent2d::new(513, 217)), 10);
        assert_eq!(mip_level_count(Extent2d::new(3, 1024)), 11);
    }

    #[test]
    fn test_mip_chain_ends_at_one() {
        let extents = mip_extents(Extent2d::new(513, 217));
        assert_eq!(extents.len(), 10);
        assert_eq!(extents[0], Extent2d::new(513, 217));
        assert_eq!(extents[1], Extent2d::new(256, 108));
        assert_eq!(*extents.last().unwrap(), Extent2d::new(1, 1));
    }

    #[test]
    fn test_sample_count_flags() {
        let flags = SampleCountFlags::X1 | SampleCountFlags::X2 | SampleCountFlags::X4;
        assert!(flags.supports(SampleCount::X4));
        assert!(!flags.supports(SampleCount::X8));
        assert_eq!(flags.max(), SampleCount::X4);
    }

    #[test]
    fn test_sample_count_from_count() {
        assert_eq!(SampleCount::from_count(8), Some(SampleCount::X8));
        assert_eq!(SampleCount::from_count(3), None);
        assert!(!SampleCount::X1.is_multisampled());
    }
}
