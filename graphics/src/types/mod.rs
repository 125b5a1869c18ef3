//! Core graphics types and descriptors.

mod buffer;
mod common;
mod sampler;
mod surface;
mod texture;
mod vertex;

pub use buffer::{BufferDescriptor, BufferUsage};
pub use common::{BlurAmount, BlurType, Color, CoordinateSpace, Extent2d, FrameData, Rect};
pub use sampler::{AddressMode, FilterMode, SamplerDescriptor};
pub use surface::SurfaceDescriptor;
pub use texture::{
    ImageDescriptor, SampleCount, SampleCountFlags, TextureUsage, mip_extents, mip_level_count,
};
pub use vertex::{DrawVertex, Topology, Vertex};
