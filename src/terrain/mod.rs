//! Chunk mesh lifecycle and terrain raster collaborators

pub mod backend;
pub mod biome;
pub mod generator;
pub mod geometry_pool;
pub mod headless;
pub mod lod_update;
pub mod manager;

pub use backend::{
    AtlasRequest, Collaborators, Environment, GeneratedAtlas, GeneratedRaster, GeometryBuilder,
    GeometryHandle, GraphicsBackend, MaterialBuilder, MaterialDescriptor, MaterialHandle,
    RasterGenerator, RegionSamples,
};
pub use biome::{Biome, ClimateMap};
pub use generator::{AtlasSamples, NoiseParams, NoiseRasterGenerator};
pub use geometry_pool::{GeometryKey, GeometryPool, GeometryRef};
pub use headless::{HeadlessState, Ledger};
pub use lod_update::UpdateReport;
pub use manager::{ChunkMeshEntry, ChunkMeshManager, RasterBinding, RasterSource, StreamingStats};
