//! Sampler types and descriptors.

/// Texel filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    /// Nearest texel.
    Nearest,
    /// Bilinear interpolation.
    #[default]
    Linear,
}

/// How coordinates outside 0..1 are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

impl AddressMode {
    /// Map an integer texel coordinate into `0..size`.
    pub fn apply(self, coord: i64, size: u32) -> u32 {
        let size = i64::from(size.max(1));
        let wrapped = match self {
            Self::ClampToEdge => coord.clamp(0, size - 1),
            Self::Repeat => coord.rem_euclid(size),
            Self::MirrorRepeat => {
                let period = coord.rem_euclid(size * 2);
                if period < size {
                    period
                } else {
                    size * 2 - 1 - period
                }
            }
        };
        wrapped as u32
    }
}

/// Sampler used by textured draw calls.
///
/// Samplers are plain values: backends create (and cache) the native object
/// the first time a descriptor is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDescriptor {
    /// Magnification filter.
    pub mag_filter: FilterMode,
    /// Minification filter.
    pub min_filter: FilterMode,
    /// Address mode along U.
    pub address_mode_u: AddressMode,
    /// Address mode along V.
    pub address_mode_v: AddressMode,
}

impl SamplerDescriptor {
    /// Nearest filtering, clamped.
    pub fn nearest() -> Self {
        Self {
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            ..Default::default()
        }
    }

    /// Linear filtering, clamped.
    pub fn linear() -> Self {
        Self::default()
    }

    /// Set both address modes.
    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode_u = mode;
        self.address_mode_v = mode;
        self
    }
}
