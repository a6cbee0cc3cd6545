//! Collaborator interfaces consumed by the mesh manager
//!
//! Raster generation, geometry construction, material construction and the
//! graphics backend live outside this crate. The manager only sees them
//! through these traits and the opaque handles they hand out.

use std::sync::Arc;

use crate::core::types::{BoxFuture, Result, DVec3, Vec3};
use crate::streaming::address::ChunkAddress;
use crate::streaming::atlas::{AtlasConfig, AtlasKey, RasterChannel, UvTransform};
use crate::streaming::lod::{EdgeMask, SphereConfig};

pub use crate::streaming::cache::RasterHandle;

/// Opaque GPU geometry handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryHandle(pub u64);

/// Opaque material / shader binding handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialHandle(pub u64);

/// Per-frame environment state handed to `add_chunk`
#[derive(Clone, Debug, PartialEq)]
pub struct Environment {
    pub camera_position: DVec3,
    /// Render at this LOD instead of the distance-based one
    pub force_lod: Option<u32>,
    pub sun_direction: Vec3,
    pub sea_level: f32,
    pub fog_density: f32,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            camera_position: DVec3::ZERO,
            force_lod: None,
            sun_direction: Vec3::new(0.3, 0.8, 0.5).normalize(),
            sea_level: 0.0,
            fog_density: 0.0002,
        }
    }
}

impl Environment {
    pub fn at(camera_position: DVec3) -> Self {
        Self {
            camera_position,
            ..Default::default()
        }
    }
}

/// One atlas tier to generate
#[derive(Clone, Debug)]
pub struct AtlasRequest {
    pub key: AtlasKey,
    pub config: AtlasConfig,
    /// World-space edge length of a flat chunk
    pub chunk_world_size: f64,
    pub sphere: Option<SphereConfig>,
}

/// One generated raster
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneratedRaster {
    pub channel: RasterChannel,
    pub handle: RasterHandle,
    pub size_bytes: u64,
}

/// Rasters produced for one atlas tier
#[derive(Clone, Debug)]
pub struct GeneratedAtlas {
    pub key: AtlasKey,
    pub rasters: Vec<GeneratedRaster>,
}

/// CPU-side samples of one chunk, used for geometry and gameplay queries
#[derive(Clone, Debug, PartialEq)]
pub struct RegionSamples {
    pub chunk: ChunkAddress,
    pub lod: u32,
    /// Samples along one edge
    pub resolution: u32,
    /// Row-major heights, `resolution^2` values
    pub heights: Vec<f32>,
    /// Row-major material ids, `resolution^2` values
    pub tiles: Vec<u8>,
}

impl RegionSamples {
    pub fn height_at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.resolution || y >= self.resolution {
            return None;
        }
        self.heights.get((y * self.resolution + x) as usize).copied()
    }

    /// Min / max height, `None` when empty
    pub fn height_range(&self) -> Option<(f32, f32)> {
        if self.heights.is_empty() {
            return None;
        }
        let min = self.heights.iter().copied().fold(f32::INFINITY, f32::min);
        let max = self.heights.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Some((min, max))
    }
}

/// Everything a material needs to shade one chunk
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialDescriptor {
    pub chunk: ChunkAddress,
    pub lod: u32,
    pub rasters: Vec<(RasterChannel, RasterHandle)>,
    /// Where the chunk sits inside its rasters
    pub uv: UvTransform,
    pub edge_mask: EdgeMask,
    pub sun_direction: Vec3,
    pub sea_level: f32,
    pub fog_density: f32,
}

impl MaterialDescriptor {
    pub fn raster(&self, channel: RasterChannel) -> Option<RasterHandle> {
        self.rasters
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, handle)| *handle)
    }
}

/// Produces atlas rasters
pub trait RasterGenerator: Send + Sync {
    /// Generate every configured channel of one atlas tier
    fn generate_atlas(&self, request: AtlasRequest) -> BoxFuture<Result<GeneratedAtlas>>;

    /// CPU samples of one chunk of a generated atlas tier
    fn extract_region(&self, atlas: &AtlasKey, chunk: &ChunkAddress, config: &AtlasConfig) -> Option<RegionSamples>;
}

/// Builds chunk geometry
pub trait GeometryBuilder {
    /// Geometry owned by a single chunk, displaced on the CPU
    fn build(&mut self, samples: &RegionSamples, lod: u32, edge_mask: EdgeMask) -> Result<GeometryHandle>;

    /// Flat grid shared between chunks, displaced in the shader
    fn build_shared(&mut self, lod: u32, chunk_size: u32, edge_mask: EdgeMask) -> Result<GeometryHandle>;
}

/// Builds material bindings
pub trait MaterialBuilder: Send + Sync {
    fn create(&self, descriptor: MaterialDescriptor) -> BoxFuture<Result<MaterialHandle>>;

    /// Point an existing material at new rasters / UVs
    fn rebind(&self, material: MaterialHandle, descriptor: &MaterialDescriptor) -> Result<()>;
}

/// GPU resource lifetime
pub trait GraphicsBackend {
    fn compile_material(&mut self, material: MaterialHandle) -> Result<()>;
    fn release_material(&mut self, material: MaterialHandle);
    fn release_geometry(&mut self, geometry: GeometryHandle);
    fn release_raster(&mut self, raster: RasterHandle);
}

/// The full set of collaborators a manager drives
pub struct Collaborators {
    pub generator: Arc<dyn RasterGenerator>,
    pub geometry: Box<dyn GeometryBuilder>,
    pub materials: Arc<dyn MaterialBuilder>,
    pub backend: Box<dyn GraphicsBackend>,
}
