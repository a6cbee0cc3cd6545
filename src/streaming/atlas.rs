//! Atlas layout: mapping chunks onto shared raster atlases
//!
//! An atlas packs a `chunks_per_axis x chunks_per_axis` block of adjacent
//! chunks into one raster per channel. Chunk `(x, y)` belongs to atlas
//! `(floor(x / n), floor(y / n))` and samples the sub-rectangle
//! `offset = (x mod n, y mod n) / n`, `scale = 1 / n`.

use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::streaming::address::ChunkAddress;

/// Raster channels sharing one atlas layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RasterChannel {
    Height,
    Normal,
    Tile,
    Blend,
    Macro,
    BiomeMask,
}

impl RasterChannel {
    pub const ALL: [RasterChannel; 6] = [
        RasterChannel::Height,
        RasterChannel::Normal,
        RasterChannel::Tile,
        RasterChannel::Blend,
        RasterChannel::Macro,
        RasterChannel::BiomeMask,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RasterChannel::Height => "height",
            RasterChannel::Normal => "normal",
            RasterChannel::Tile => "tile",
            RasterChannel::Blend => "blend",
            RasterChannel::Macro => "macro",
            RasterChannel::BiomeMask => "biome_mask",
        }
    }

    /// Storage per texel
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            RasterChannel::Height => 4,   // r32float
            RasterChannel::Normal => 4,   // rgba8 snorm
            RasterChannel::Tile => 1,     // r8uint material id
            RasterChannel::Blend => 4,    // rgba8 weights
            RasterChannel::Macro => 4,    // rgba8 tint
            RasterChannel::BiomeMask => 1,
        }
    }
}

impl fmt::Display for RasterChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static atlas layout configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Atlas raster edge length in texels
    pub raster_size: u32,
    /// Chunk raster edge length in texels
    pub chunk_size: u32,
    /// Channels generated for every atlas
    pub channels: Vec<RasterChannel>,
    /// Highest LOD for which an atlas tier is generated
    pub max_lod: u32,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            raster_size: 2048,
            chunk_size: 128,
            channels: vec![
                RasterChannel::Height,
                RasterChannel::Normal,
                RasterChannel::Tile,
                RasterChannel::Blend,
            ],
            max_lod: 4,
        }
    }
}

impl AtlasConfig {
    /// Create and validate an atlas configuration
    pub fn new(raster_size: u32, chunk_size: u32, channels: Vec<RasterChannel>) -> Result<Self, Error> {
        let config = Self {
            raster_size,
            chunk_size,
            channels,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Builder-style override of the highest atlas tier
    pub fn with_max_lod(mut self, max_lod: u32) -> Self {
        self.max_lod = max_lod;
        self
    }

    /// `raster_size` must be a positive multiple of `chunk_size`
    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 || self.raster_size == 0 {
            return Err(Error::Config(format!(
                "atlas raster size {} and chunk size {} must be non-zero",
                self.raster_size, self.chunk_size
            )));
        }
        if self.raster_size % self.chunk_size != 0 {
            return Err(Error::Config(format!(
                "atlas raster size {} is not a multiple of chunk size {}",
                self.raster_size, self.chunk_size
            )));
        }
        if self.channels.is_empty() {
            return Err(Error::Config("atlas needs at least one raster channel".to_string()));
        }
        Ok(())
    }

    pub fn chunks_per_axis(&self) -> u32 {
        (self.raster_size / self.chunk_size.max(1)).max(1)
    }

    pub fn chunks_per_atlas(&self) -> u32 {
        let n = self.chunks_per_axis();
        n * n
    }

    /// Atlas containing the given chunk
    pub fn atlas_for(&self, chunk: &ChunkAddress) -> AtlasAddress {
        AtlasAddress::from_chunk(chunk, self)
    }

    /// Per-chunk raster edge length at `lod`, halved per level
    pub fn chunk_resolution(&self, lod: u32) -> u32 {
        self.chunk_size.checked_shr(lod).unwrap_or(0).max(1)
    }

    /// Atlas raster edge length at `lod`
    pub fn atlas_resolution(&self, lod: u32) -> u32 {
        self.chunk_resolution(lod) * self.chunks_per_axis()
    }

    /// Bytes of one channel of one atlas tier
    pub fn atlas_bytes(&self, channel: RasterChannel, lod: u32) -> u64 {
        let edge = self.atlas_resolution(lod) as u64;
        edge * edge * channel.bytes_per_texel()
    }
}

/// Sub-rectangle of an atlas sampled by one chunk
///
/// Laid out for direct upload into a uniform buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UvTransform {
    pub offset: [f32; 2],
    pub scale: f32,
    pub _padding: f32,
}

impl UvTransform {
    /// Transform of a raster covering exactly one chunk
    pub const IDENTITY: UvTransform = UvTransform {
        offset: [0.0, 0.0],
        scale: 1.0,
        _padding: 0.0,
    };

    pub fn new(offset: [f32; 2], scale: f32) -> Self {
        Self {
            offset,
            scale,
            _padding: 0.0,
        }
    }

    /// Map a chunk-local UV into atlas UV space
    pub fn apply(&self, uv: [f32; 2]) -> [f32; 2] {
        [
            self.offset[0] + uv[0] * self.scale,
            self.offset[1] + uv[1] * self.scale,
        ]
    }
}

/// Address of one shared raster atlas
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtlasAddress {
    pub atlas_x: i32,
    pub atlas_y: i32,
    pub face: Option<u8>,
    chunks_per_axis: u32,
}

impl AtlasAddress {
    pub fn new(atlas_x: i32, atlas_y: i32, face: Option<u8>, config: &AtlasConfig) -> Self {
        Self {
            atlas_x,
            atlas_y,
            face,
            chunks_per_axis: config.chunks_per_axis(),
        }
    }

    /// Atlas containing `chunk` (floor division by chunks per axis)
    pub fn from_chunk(chunk: &ChunkAddress, config: &AtlasConfig) -> Self {
        let n = config.chunks_per_axis() as i32;
        Self {
            atlas_x: chunk.x().div_euclid(n),
            atlas_y: chunk.y().div_euclid(n),
            face: chunk.face(),
            chunks_per_axis: n as u32,
        }
    }

    pub fn chunks_per_axis(&self) -> u32 {
        self.chunks_per_axis
    }

    pub fn contains_chunk(&self, x: i32, y: i32) -> bool {
        let n = self.chunks_per_axis as i32;
        x.div_euclid(n) == self.atlas_x && y.div_euclid(n) == self.atlas_y
    }

    /// Whether `chunk` lies in this atlas, including the face
    pub fn contains(&self, chunk: &ChunkAddress) -> bool {
        chunk.face() == self.face && self.contains_chunk(chunk.x(), chunk.y())
    }

    /// Grid coordinate of the first chunk covered by this atlas
    pub fn origin(&self) -> (i32, i32) {
        let n = self.chunks_per_axis as i32;
        (self.atlas_x * n, self.atlas_y * n)
    }

    /// All chunks packed into this atlas, row by row.
    ///
    /// `lod` is attached to spherical addresses and ignored for flat ones.
    pub fn covered_chunks(&self, lod: u32) -> Vec<ChunkAddress> {
        let n = self.chunks_per_axis as i32;
        let (x0, y0) = self.origin();
        let mut chunks = Vec::with_capacity((n * n) as usize);

        for y in y0..y0 + n {
            for x in x0..x0 + n {
                chunks.push(match self.face {
                    Some(face) => ChunkAddress::spherical(face, x, y, lod),
                    None => ChunkAddress::flat(x, y),
                });
            }
        }

        chunks
    }

    /// UV sub-rectangle for a chunk, `None` if the chunk lives elsewhere
    pub fn uv_transform(&self, chunk: &ChunkAddress) -> Option<UvTransform> {
        if !self.contains(chunk) {
            return None;
        }

        let n = self.chunks_per_axis as i32;
        let scale = 1.0 / n as f32;
        let local_x = chunk.x().rem_euclid(n);
        let local_y = chunk.y().rem_euclid(n);

        Some(UvTransform::new(
            [local_x as f32 * scale, local_y as f32 * scale],
            scale,
        ))
    }

    /// Canonical string key, e.g. `"atlas:1,0"` or `"atlas:3:1,0"`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AtlasAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.face {
            Some(face) => write!(f, "atlas:{}:{},{}", face, self.atlas_x, self.atlas_y),
            None => write!(f, "atlas:{},{}", self.atlas_x, self.atlas_y),
        }
    }
}

/// LOD-aware atlas identity: one atlas tier generated for one LOD
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtlasKey {
    pub atlas: AtlasAddress,
    pub lod: u32,
}

impl AtlasKey {
    pub fn new(atlas: AtlasAddress, lod: u32) -> Self {
        Self { atlas, lod }
    }

    /// Atlas tier a chunk samples at `lod`
    pub fn for_chunk(chunk: &ChunkAddress, lod: u32, config: &AtlasConfig) -> Self {
        Self {
            atlas: AtlasAddress::from_chunk(chunk, config),
            lod,
        }
    }
}

impl fmt::Display for AtlasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.atlas, self.lod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(raster_size: u32, chunk_size: u32) -> AtlasConfig {
        AtlasConfig::new(raster_size, chunk_size, vec![RasterChannel::Height]).unwrap()
    }

    #[test]
    fn test_config_derived_counts() {
        let config = config(2048, 128);
        assert_eq!(config.chunks_per_axis(), 16);
        assert_eq!(config.chunks_per_atlas(), 256);

        let single = self::config(64, 64);
        assert_eq!(single.chunks_per_axis(), 1);
        assert_eq!(single.chunks_per_atlas(), 1);
    }

    #[test]
    fn test_tier_resolution() {
        let config = config(2048, 128);
        assert_eq!(config.chunk_resolution(0), 128);
        assert_eq!(config.chunk_resolution(3), 16);
        assert_eq!(config.chunk_resolution(40), 1);
        assert_eq!(config.atlas_resolution(1), 1024);
        assert_eq!(config.atlas_bytes(RasterChannel::Height, 1), 1024 * 1024 * 4);
        assert_eq!(config.atlas_bytes(RasterChannel::Tile, 0), 2048 * 2048);
    }

    #[test]
    fn test_config_rejects_non_integer_layout() {
        assert!(matches!(
            AtlasConfig::new(1000, 128, vec![RasterChannel::Height]),
            Err(Error::Config(_))
        ));
        assert!(AtlasConfig::new(64, 128, vec![RasterChannel::Height]).is_err());
        assert!(AtlasConfig::new(128, 0, vec![RasterChannel::Height]).is_err());
        assert!(AtlasConfig::new(128, 64, vec![]).is_err());
    }

    #[test]
    fn test_scenario_chunk_20_5() {
        let config = config(2048, 128);
        let chunk = ChunkAddress::flat(20, 5);
        let atlas = AtlasAddress::from_chunk(&chunk, &config);

        assert_eq!(atlas.atlas_x, 1);
        assert_eq!(atlas.atlas_y, 0);
        assert_eq!(atlas.face, None);

        let uv = atlas.uv_transform(&chunk).unwrap();
        assert_eq!(uv.offset, [0.25, 0.3125]);
        assert_eq!(uv.scale, 0.0625);
    }

    #[test]
    fn test_negative_coordinates_floor() {
        let config = config(512, 128); // 4 chunks per axis
        let atlas = AtlasAddress::from_chunk(&ChunkAddress::flat(-1, -4), &config);
        assert_eq!((atlas.atlas_x, atlas.atlas_y), (-1, -1));

        let atlas = AtlasAddress::from_chunk(&ChunkAddress::flat(-5, 3), &config);
        assert_eq!((atlas.atlas_x, atlas.atlas_y), (-2, 0));

        let uv = atlas.uv_transform(&ChunkAddress::flat(-5, 3)).unwrap();
        assert_eq!(uv.offset, [0.75, 0.75]);
    }

    #[test]
    fn test_contains_chunk_matches_floor_division() {
        let config = config(1024, 128); // 8 per axis
        let atlas = AtlasAddress::new(-2, 3, None, &config);
        for x in -40i32..40 {
            for y in -40i32..40 {
                let expected = x.div_euclid(8) == -2 && y.div_euclid(8) == 3;
                assert_eq!(atlas.contains_chunk(x, y), expected, "chunk ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_covered_chunks_map_back() {
        for (raster, chunk) in [(128, 128), (256, 64), (2048, 128), (1536, 512)] {
            let config = config(raster, chunk);
            let n = config.chunks_per_axis();
            let atlas = AtlasAddress::new(3, -7, Some(2), &config);

            let covered = atlas.covered_chunks(1);
            assert_eq!(covered.len(), (n * n) as usize);

            let unique: HashSet<_> = covered.iter().copied().collect();
            assert_eq!(unique.len(), covered.len());

            for chunk in &covered {
                assert_eq!(AtlasAddress::from_chunk(chunk, &config), atlas);
                assert_eq!(chunk.face(), Some(2));
            }
        }
    }

    #[test]
    fn test_uv_transform_bounds() {
        let config = config(2048, 256); // 8 per axis
        let atlas = AtlasAddress::new(-1, 2, None, &config);
        let scale = 1.0 / 8.0;

        for chunk in atlas.covered_chunks(0) {
            let uv = atlas.uv_transform(&chunk).unwrap();
            assert_eq!(uv.scale, scale);
            for component in uv.offset {
                assert!(component >= 0.0 && component <= 1.0 - scale);
            }
        }
    }

    #[test]
    fn test_uv_transform_rejects_foreign_chunk() {
        let config = config(2048, 128);
        let atlas = AtlasAddress::new(0, 0, None, &config);
        assert!(atlas.uv_transform(&ChunkAddress::flat(16, 0)).is_none());
        assert!(atlas.uv_transform(&ChunkAddress::spherical(0, 1, 1, 0)).is_none());
    }

    #[test]
    fn test_uv_transform_is_pod() {
        let uv = UvTransform::new([0.25, 0.5], 0.125);
        let bytes: &[u8] = bytemuck::bytes_of(&uv);
        assert_eq!(bytes.len(), 16);
        assert_eq!(uv.apply([1.0, 1.0]), [0.375, 0.625]);
    }

    #[test]
    fn test_atlas_keys() {
        let config = config(2048, 128);
        assert_eq!(AtlasAddress::new(1, 0, None, &config).key(), "atlas:1,0");
        assert_eq!(AtlasAddress::new(-1, 2, Some(3), &config).key(), "atlas:3:-1,2");

        let key = AtlasKey::for_chunk(&ChunkAddress::flat(20, 5), 2, &config);
        assert_eq!(key.to_string(), "atlas:1,0@2");
    }

    #[test]
    fn test_channel_serde_names() {
        let json = serde_json::to_string(&RasterChannel::BiomeMask).unwrap();
        assert_eq!(json, "\"biome_mask\"");
        let parsed: RasterChannel = serde_json::from_str("\"normal\"").unwrap();
        assert_eq!(parsed, RasterChannel::Normal);
    }
}
