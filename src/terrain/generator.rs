//! CPU reference raster generator
//!
//! Fills atlas tiers from fractal noise on the rayon pool. The rasters are
//! represented by handles only; heights and tiles stay on the CPU so
//! `extract_region` can answer gameplay queries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::biome::ClimateMap;
use crate::core::error::Error;
use crate::core::types::{BoxFuture, DVec2, DVec3, Result, Vec3};
use crate::math::cube_sphere::face_uv_to_sphere;
use crate::streaming::address::ChunkAddress;
use crate::streaming::atlas::{AtlasConfig, AtlasKey, RasterChannel};
use crate::terrain::backend::{
    AtlasRequest, GeneratedAtlas, GeneratedRaster, RasterGenerator, RasterHandle, RegionSamples,
};

/// Parameters controlling the noise field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    pub seed: u32,
    pub scale: f64,        // Horizontal scale (larger = smoother)
    pub height_scale: f32, // Vertical scale (max height)
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f64,  // FBM persistence (0.5 typical)
    pub lacunarity: f64,   // FBM lacunarity (2.0 typical)
    pub sea_level: f32,
    /// Atlas tiers whose CPU samples are kept for `extract_region`
    pub retained_atlases: usize,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 100.0,
            height_scale: 64.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            sea_level: 24.0,
            retained_atlases: 64,
        }
    }
}

/// CPU copy of one generated atlas tier, row-major
#[derive(Clone, Debug, PartialEq)]
pub struct AtlasSamples {
    /// Texels along one atlas edge
    pub resolution: u32,
    pub heights: Vec<f32>,
    pub tiles: Vec<u8>,
    /// RGBA8 encoded normals, empty unless the normal channel is configured
    pub normals: Vec<[u8; 4]>,
}

/// Pack a unit normal into RGBA8
pub fn encode_normal(normal: Vec3) -> [u8; 4] {
    let n = normal * 0.5 + Vec3::splat(0.5);
    [
        (n.x.clamp(0.0, 1.0) * 255.0).round() as u8,
        (n.y.clamp(0.0, 1.0) * 255.0).round() as u8,
        (n.z.clamp(0.0, 1.0) * 255.0).round() as u8,
        255,
    ]
}

struct NoiseField {
    params: NoiseParams,
    fbm: Fbm<Perlin>,
    climate: ClimateMap,
}

impl NoiseField {
    fn new(params: NoiseParams) -> Self {
        let fbm = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence)
            .set_lacunarity(params.lacunarity);
        let climate = ClimateMap::new(params.seed);
        Self { params, fbm, climate }
    }

    /// Map noise in [-1, 1] to [0, height_scale]
    fn to_height(&self, value: f64) -> f32 {
        ((value.clamp(-1.0, 1.0) + 1.0) * 0.5) as f32 * self.params.height_scale
    }

    fn flat_height(&self, x: f64, z: f64) -> f32 {
        let s = self.params.scale;
        self.to_height(self.fbm.get([x / s, z / s]))
    }

    fn sphere_height(&self, point: DVec3) -> f32 {
        let p = point / self.params.scale;
        self.to_height(self.fbm.get([p.x, p.y, p.z]))
    }

    /// Height and surface position of a point given in chunk-grid units
    fn sample(&self, request: &AtlasRequest, grid: DVec2) -> (f32, DVec3) {
        match (request.key.atlas.face, request.sphere) {
            (Some(face), Some(sphere)) => {
                let uv = grid / sphere.chunks_per_face.max(1) as f64;
                let point = face_uv_to_sphere(face, uv, sphere.radius);
                (self.sphere_height(point), point)
            }
            _ => {
                let world = grid * request.chunk_world_size;
                (self.flat_height(world.x, world.y), DVec3::new(world.x, 0.0, world.y))
            }
        }
    }

    /// World distance between adjacent texels
    fn texel_spacing(&self, request: &AtlasRequest, chunk_resolution: u32) -> f32 {
        let chunk_span = match (request.key.atlas.face, request.sphere) {
            // Quarter circumference per face, roughly
            (Some(_), Some(sphere)) => {
                sphere.radius * std::f64::consts::FRAC_PI_2 / sphere.chunks_per_face.max(1) as f64
            }
            _ => request.chunk_world_size,
        };
        (chunk_span / chunk_resolution as f64) as f32
    }

    fn fill(&self, request: &AtlasRequest) -> AtlasSamples {
        let key = request.key;
        let chunk_resolution = request.config.chunk_resolution(key.lod);
        let resolution = chunk_resolution * key.atlas.chunks_per_axis();
        let width = resolution as usize;
        let (x0, y0) = key.atlas.origin();
        let sea_level = self.params.sea_level;

        let mut heights = vec![0.0f32; width * width];
        let mut tiles = vec![0u8; width * width];

        heights
            .par_chunks_mut(width)
            .zip(tiles.par_chunks_mut(width))
            .enumerate()
            .for_each(|(row, (height_row, tile_row))| {
                let gy = y0 as f64 + (row as f64 + 0.5) / chunk_resolution as f64;
                for (col, (height, tile)) in height_row.iter_mut().zip(tile_row.iter_mut()).enumerate() {
                    let gx = x0 as f64 + (col as f64 + 0.5) / chunk_resolution as f64;
                    let (h, surface) = self.sample(request, DVec2::new(gx, gy));
                    *height = h;
                    *tile = self.climate.classify(surface.x, surface.z, h, sea_level).tile_id();
                }
            });

        let normals = if request.config.channels.contains(&RasterChannel::Normal) {
            let spacing = self.texel_spacing(request, chunk_resolution);
            derive_normals(&heights, width, spacing)
        } else {
            Vec::new()
        };

        AtlasSamples {
            resolution,
            heights,
            tiles,
            normals,
        }
    }
}

/// Central differences, clamped at the raster border
fn derive_normals(heights: &[f32], width: usize, spacing: f32) -> Vec<[u8; 4]> {
    let at = |x: usize, y: usize| heights[y * width + x];
    let mut normals = vec![[0u8; 4]; heights.len()];

    normals.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let up = y.saturating_sub(1);
        let down = (y + 1).min(width - 1);
        for (x, out) in row.iter_mut().enumerate() {
            let left = x.saturating_sub(1);
            let right = (x + 1).min(width - 1);
            let dx = (at(right, y) - at(left, y)) / ((right - left).max(1) as f32 * spacing);
            let dz = (at(x, down) - at(x, up)) / ((down - up).max(1) as f32 * spacing);
            *out = encode_normal(Vec3::new(-dx, 1.0, -dz).normalize());
        }
    });

    normals
}

/// Bounded FIFO of atlas samples
#[derive(Default)]
struct SampleStore {
    atlases: HashMap<AtlasKey, Arc<AtlasSamples>>,
    order: VecDeque<AtlasKey>,
}

impl SampleStore {
    fn insert(&mut self, key: AtlasKey, samples: AtlasSamples, capacity: usize) {
        if self.atlases.insert(key, Arc::new(samples)).is_some() {
            self.order.retain(|k| *k != key);
        }
        self.order.push_back(key);

        while self.order.len() > capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.atlases.remove(&oldest);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct GeneratorState {
    field: NoiseField,
    store: Mutex<SampleStore>,
    next_handle: AtomicU64,
}

impl GeneratorState {
    fn generate(&self, request: &AtlasRequest) -> Result<GeneratedAtlas> {
        let key = request.key;
        if key.lod > request.config.max_lod {
            return Err(Error::Generation {
                key: key.to_string(),
                reason: format!("LOD {} above the highest tier {}", key.lod, request.config.max_lod),
            });
        }

        let start = Instant::now();
        let samples = self.field.fill(request);
        let resolution = samples.resolution;

        let rasters = request
            .config
            .channels
            .iter()
            .map(|&channel| GeneratedRaster {
                channel,
                handle: RasterHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1),
                size_bytes: request.config.atlas_bytes(channel, key.lod),
            })
            .collect();

        lock(&self.store).insert(key, samples, self.field.params.retained_atlases);

        log::debug!(
            "Generated atlas {} ({}x{} texels) in {:.1}ms",
            key,
            resolution,
            resolution,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(GeneratedAtlas { key, rasters })
    }
}

/// Procedural raster generator using fractal Brownian motion
pub struct NoiseRasterGenerator {
    state: Arc<GeneratorState>,
}

impl NoiseRasterGenerator {
    pub fn new(params: NoiseParams) -> Self {
        Self {
            state: Arc::new(GeneratorState {
                field: NoiseField::new(params),
                store: Mutex::new(SampleStore::default()),
                next_handle: AtomicU64::new(0),
            }),
        }
    }

    pub fn params(&self) -> &NoiseParams {
        &self.state.field.params
    }

    /// Terrain height at flat world position (x, z)
    pub fn height_at(&self, x: f64, z: f64) -> f32 {
        self.state.field.flat_height(x, z)
    }

    /// Samples of a generated tier, if still retained
    pub fn atlas_samples(&self, key: &AtlasKey) -> Option<Arc<AtlasSamples>> {
        lock(&self.state.store).atlases.get(key).cloned()
    }

    pub fn retained_count(&self) -> usize {
        lock(&self.state.store).atlases.len()
    }
}

impl RasterGenerator for NoiseRasterGenerator {
    fn generate_atlas(&self, request: AtlasRequest) -> BoxFuture<Result<GeneratedAtlas>> {
        let state = self.state.clone();
        Box::pin(async move {
            let key = request.key;
            tokio::task::spawn_blocking(move || state.generate(&request))
                .await
                .map_err(|e| Error::Generation {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?
        })
    }

    fn extract_region(&self, atlas: &AtlasKey, chunk: &ChunkAddress, config: &AtlasConfig) -> Option<RegionSamples> {
        if !atlas.atlas.contains(chunk) {
            return None;
        }
        let samples = self.atlas_samples(atlas)?;

        let r = config.chunk_resolution(atlas.lod);
        if samples.resolution != r * atlas.atlas.chunks_per_axis() {
            return None;
        }

        let (x0, y0) = atlas.atlas.origin();
        let left = (chunk.x() - x0) as usize * r as usize;
        let top = (chunk.y() - y0) as usize * r as usize;
        let width = samples.resolution as usize;
        let r = r as usize;

        let mut heights = Vec::with_capacity(r * r);
        let mut tiles = Vec::with_capacity(r * r);
        for row in top..top + r {
            let start = row * width + left;
            heights.extend_from_slice(samples.heights.get(start..start + r)?);
            tiles.extend_from_slice(samples.tiles.get(start..start + r)?);
        }

        Some(RegionSamples {
            chunk: *chunk,
            lod: atlas.lod,
            resolution: r as u32,
            heights,
            tiles,
        })
    }
}
