//! Chunk addressing, atlas mapping, raster caching and LOD selection

pub mod address;
pub mod atlas;
pub mod budget;
pub mod usage;
pub mod cache;
pub mod lod;
pub mod tasks;
pub mod config;

pub use address::ChunkAddress;
pub use atlas::{AtlasAddress, AtlasConfig, AtlasKey, RasterChannel, UvTransform};
pub use budget::{ByteBudget, DEFAULT_EVICTION_TARGET};
pub use usage::AtlasUsage;
pub use cache::{
    CacheCounters, RasterCache, RasterEntry, RasterHandle, RasterIdentity,
    DEFAULT_DEPENDENT_WEIGHT,
};
pub use lod::{
    EdgeMask, LodConfig, SphereConfig, chunk_center, chunk_distance, compute_edge_mask,
    DEFAULT_HYSTERESIS, DEFAULT_LOD_DISTANCES, NEIGHBOR_EDGES,
};
pub use tasks::{RequestTicket, TaskQueue, TaskResult};
pub use config::{CacheConfig, GenerationConfig, StreamingConfig, UpdateConfig};
