//! CPU-resident images for the software backend.
//!
//! Texels are stored as linear `[f32; 4]` RGBA. Mip level 0 of a multisampled
//! image stores `samples` consecutive entries per texel.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::GraphicsError;
use crate::types::{
    AddressMode, Extent2d, FilterMode, ImageDescriptor, SamplerDescriptor, mip_extents,
};

/// Linear RGBA texel.
pub type Texel = [f32; 4];

/// Texel storage of every mip level.
#[derive(Debug)]
pub struct ImageLevels {
    pub(super) extents: Vec<Extent2d>,
    pub(super) samples: u32,
    pub(super) data: Vec<Vec<Texel>>,
}

impl ImageLevels {
    /// Extent of a mip level.
    pub fn extent(&self, mip: u32) -> Option<Extent2d> {
        self.extents.get(mip as usize).copied()
    }

    /// Texels of a mip level with every sample of a texel averaged.
    pub fn resolved(&self, mip: u32) -> Option<Vec<Texel>> {
        let level = self.data.get(mip as usize)?;
        if mip != 0 || self.samples == 1 {
            return Some(level.clone());
        }
        let samples = self.samples as usize;
        let inv = 1.0 / samples as f32;
        Some(
            level
                .chunks_exact(samples)
                .map(|texel| {
                    let mut sum = [0.0; 4];
                    for sample in texel {
                        for c in 0..4 {
                            sum[c] += sample[c];
                        }
                    }
                    sum.map(|v| v * inv)
                })
                .collect(),
        )
    }

    /// Sample with filtering at normalized coordinates.
    ///
    /// `lod` selects the mip level (nearest level) and picks the minification
    /// or magnification filter.
    pub fn sample(&self, uv: [f32; 2], sampler: &SamplerDescriptor, lod: f32) -> Texel {
        let max_level = self.data.len().saturating_sub(1);
        let (mip, filter) = if lod > 0.0 {
            ((lod.round() as usize).min(max_level), sampler.min_filter)
        } else {
            (0, sampler.mag_filter)
        };
        let extent = self.extents[mip];
        let level = &self.data[mip];
        let fetch = |x: i64, y: i64| -> Texel {
            let x = sampler.address_mode_u.apply(x, extent.width);
            let y = sampler.address_mode_v.apply(y, extent.height);
            self.texel(level, mip, extent, x, y)
        };

        let fx = uv[0] * extent.width as f32;
        let fy = uv[1] * extent.height as f32;
        match filter {
            FilterMode::Nearest => fetch(fx.floor() as i64, fy.floor() as i64),
            FilterMode::Linear => bilinear(fx - 0.5, fy - 0.5, fetch),
        }
    }

    fn texel(&self, level: &[Texel], mip: usize, extent: Extent2d, x: u32, y: u32) -> Texel {
        let index = (y * extent.width + x) as usize;
        if mip == 0 && self.samples > 1 {
            let samples = self.samples as usize;
            let start = index * samples;
            let inv = 1.0 / samples as f32;
            let mut sum = [0.0; 4];
            for sample in &level[start..start + samples] {
                for c in 0..4 {
                    sum[c] += sample[c];
                }
            }
            sum.map(|v| v * inv)
        } else {
            level[index]
        }
    }
}

/// Bilinear interpolation between the four texels around `(x, y)` in texel space.
pub fn bilinear(x: f32, y: f32, fetch: impl Fn(i64, i64) -> Texel) -> Texel {
    let x0 = x.floor();
    let y0 = y.floor();
    let tx = x - x0;
    let ty = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let t00 = fetch(x0, y0);
    let t10 = fetch(x0 + 1, y0);
    let t01 = fetch(x0, y0 + 1);
    let t11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0.0; 4];
    for c in 0..4 {
        let top = t00[c] + (t10[c] - t00[c]) * tx;
        let bottom = t01[c] + (t11[c] - t01[c]) * tx;
        out[c] = top + (bottom - top) * ty;
    }
    out
}

/// Clamp-to-edge texel fetch from a single-sample level.
pub fn fetch_clamped(level: &[Texel], extent: Extent2d, x: i64, y: i64) -> Texel {
    let x = AddressMode::ClampToEdge.apply(x, extent.width);
    let y = AddressMode::ClampToEdge.apply(y, extent.height);
    level[(y * extent.width + x) as usize]
}

/// Convert a linear texel to RGBA8.
pub fn to_rgba8(texel: &Texel) -> [u8; 4] {
    texel.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
}

/// Software backend image.
#[derive(Debug)]
pub struct SoftwareImage {
    descriptor: ImageDescriptor,
    levels: RwLock<ImageLevels>,
}

impl SoftwareImage {
    /// Allocate a zero-initialized image.
    pub fn new(descriptor: &ImageDescriptor) -> Result<Self, GraphicsError> {
        let full_chain = mip_extents(descriptor.size);
        let mip_count = descriptor.mip_level_count as usize;
        if mip_count == 0 || mip_count > full_chain.len() {
            return Err(GraphicsError::InvalidParameter(format!(
                "image {:?}: {} mip levels requested, at most {} possible",
                descriptor.label,
                mip_count,
                full_chain.len()
            )));
        }
        let samples = descriptor.samples.count();
        if samples > 1 && mip_count > 1 {
            return Err(GraphicsError::InvalidParameter(format!(
                "image {:?}: multisampled images cannot have mip levels",
                descriptor.label
            )));
        }

        let extents: Vec<Extent2d> = full_chain.into_iter().take(mip_count).collect();
        let data = extents
            .iter()
            .enumerate()
            .map(|(mip, extent)| {
                let per_texel = if mip == 0 { samples as usize } else { 1 };
                vec![[0.0; 4]; extent.area() * per_texel]
            })
            .collect();

        Ok(Self {
            descriptor: descriptor.clone(),
            levels: RwLock::new(ImageLevels {
                extents,
                samples,
                data,
            }),
        })
    }

    /// The descriptor the image was created with.
    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    /// Shared access to the texel storage.
    pub fn read(&self) -> RwLockReadGuard<'_, ImageLevels> {
        self.levels.read()
    }

    /// Exclusive access to the texel storage.
    pub fn write(&self) -> RwLockWriteGuard<'_, ImageLevels> {
        self.levels.write()
    }

    /// Replace mip 0 of a single-sample image with RGBA8 pixels.
    pub fn upload_rgba8(&self, pixels: &[u8]) -> Result<(), GraphicsError> {
        let mut levels = self.levels.write();
        if levels.samples != 1 {
            return Err(GraphicsError::InvalidParameter(
                "cannot upload into a multisampled image".to_string(),
            ));
        }
        let expected = levels.extents[0].area() * 4;
        if pixels.len() != expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "expected {expected} bytes of RGBA8 data, got {}",
                pixels.len()
            )));
        }
        for (texel, rgba) in levels.data[0].iter_mut().zip(pixels.chunks_exact(4)) {
            *texel = [
                f32::from(rgba[0]) / 255.0,
                f32::from(rgba[1]) / 255.0,
                f32::from(rgba[2]) / 255.0,
                f32::from(rgba[3]) / 255.0,
            ];
        }
        Ok(())
    }

    /// Read a mip level back as RGBA8 pixels, resolving samples if needed.
    pub fn download_rgba8(&self, mip: u32) -> Result<Vec<u8>, GraphicsError> {
        let levels = self.levels.read();
        let texels = levels.resolved(mip).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "mip level {mip} out of range ({} levels)",
                levels.data.len()
            ))
        })?;
        Ok(texels.iter().flat_map(to_rgba8).collect())
    }
}
