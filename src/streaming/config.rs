//! Streaming engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::atlas::AtlasConfig;
use crate::streaming::budget::DEFAULT_EVICTION_TARGET;
use crate::streaming::cache::{DEFAULT_DEPENDENT_WEIGHT, RasterCache};
use crate::streaming::lod::{LodConfig, SphereConfig};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Full streaming configuration. Every section falls back to its defaults
/// when missing from the file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Atlas layout and channels.
    pub atlas: AtlasConfig,
    /// Raster memory budget.
    pub cache: CacheConfig,
    /// LOD distance table and hysteresis.
    pub lod: LodConfig,
    /// Cube-sphere placement. `None` = flat world.
    pub sphere: Option<SphereConfig>,
    /// Share geometry between chunks with equal (lod, size, edge mask).
    pub instancing: bool,
    /// Amortized update pass limits.
    pub update: UpdateConfig,
    /// Async generation limits.
    pub generation: GenerationConfig,
}

impl StreamingConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.atlas.validate()?;
        self.cache.validate()?;
        self.lod.validate()?;
        if let Some(sphere) = &self.sphere {
            sphere.validate()?;
        }
        if self.generation.max_concurrent == 0 {
            return Err(Error::Config("generation.max_concurrent must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Highest LOD a chunk may render at: bounded by both the distance
    /// table and the atlas tiers that get generated.
    pub fn max_lod(&self) -> u32 {
        self.atlas.max_lod.min(self.lod.max_lod())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Raster cache budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard maximum of resident raster bytes.
    pub max_bytes: u64,
    /// Fraction of `max_bytes` eviction drains to.
    pub eviction_target: f64,
    /// Eviction priority bonus per active dependent chunk.
    pub dependent_weight: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024,
            eviction_target: DEFAULT_EVICTION_TARGET,
            dependent_weight: DEFAULT_DEPENDENT_WEIGHT,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.eviction_target > 0.0 && self.eviction_target <= 1.0) {
            return Err(Error::Config(format!(
                "cache eviction target {} must be in (0, 1]",
                self.eviction_target
            )));
        }
        if !(self.dependent_weight >= 0.0) {
            return Err(Error::Config(format!(
                "cache dependent weight {} must be non-negative",
                self.dependent_weight
            )));
        }
        Ok(())
    }

    pub fn build_cache(&self) -> RasterCache {
        RasterCache::new(self.max_bytes, self.eviction_target, self.dependent_weight)
    }
}

/// Limits of one amortized LOD update pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Maximum geometry/material swaps per pass.
    pub max_mutations_per_pass: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_mutations_per_pass: 32,
        }
    }
}

/// Async generation limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Atlas or material jobs running at once, per queue.
    pub max_concurrent: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}
