//! Chunk mesh lifecycle
//!
//! The manager owns, for every visible chunk, the geometry and material it
//! renders with. A chunk moves through these states:
//!
//! - absent: unknown to the manager
//! - pending rasters: its atlas tier is being generated, `add_chunk` keeps
//!   returning `None`
//! - staged: rasters resolved and geometry built, material still compiling
//! - ready: a [`ChunkMeshEntry`] is registered
//!
//! The amortized LOD and edge-mask pass lives in `lod_update.rs`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;

use crate::core::error::Error;
use crate::core::types::{DVec3, Result};
use crate::streaming::address::ChunkAddress;
use crate::streaming::atlas::{AtlasKey, RasterChannel, UvTransform};
use crate::streaming::cache::{RasterCache, RasterEntry, RasterIdentity};
use crate::streaming::config::StreamingConfig;
use crate::streaming::lod::{EdgeMask, chunk_distance};
use crate::streaming::tasks::{TaskQueue, TaskResult};
use crate::terrain::backend::{
    AtlasRequest, Collaborators, Environment, GeneratedAtlas, GeneratedRaster, GeometryBuilder,
    GraphicsBackend, MaterialBuilder, MaterialDescriptor, MaterialHandle, RasterGenerator,
    RasterHandle, RegionSamples,
};
use crate::terrain::geometry_pool::{GeometryKey, GeometryPool, GeometryRef};

/// Grid cell of a chunk regardless of its address LOD
pub(super) type Cell = (Option<u8>, i32, i32);

/// Material job of one staging of a chunk
///
/// A chunk removed and added again gets a new stage, so a material still
/// being built for the earlier one can never bind to the later one.
pub(super) type MaterialKey = (ChunkAddress, u64);

/// Where a chunk's rasters come from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RasterSource {
    /// A shared atlas tier
    Atlas(AtlasKey),
    /// Rasters installed for this chunk alone
    Chunk,
}

impl RasterSource {
    pub fn identity(&self, chunk: &ChunkAddress) -> RasterIdentity {
        match self {
            RasterSource::Atlas(key) => RasterIdentity::Atlas(*key),
            RasterSource::Chunk => RasterIdentity::Chunk(*chunk),
        }
    }

    pub fn atlas(&self) -> Option<AtlasKey> {
        match self {
            RasterSource::Atlas(key) => Some(*key),
            RasterSource::Chunk => None,
        }
    }
}

impl fmt::Display for RasterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterSource::Atlas(key) => write!(f, "{}", key),
            RasterSource::Chunk => f.write_str("chunk rasters"),
        }
    }
}

/// Live mesh binding of one chunk
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkMeshEntry {
    pub chunk: ChunkAddress,
    pub geometry: GeometryRef,
    pub material: MaterialHandle,
    pub lod: u32,
    pub edge_mask: EdgeMask,
    pub source: RasterSource,
    pub uv: UvTransform,
}

/// A raster handle plus the UV rectangle the chunk samples
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterBinding {
    pub handle: RasterHandle,
    pub uv: UvTransform,
}

/// Rasters resolved for one chunk at one LOD
#[derive(Clone, Debug)]
pub(super) struct ResolvedRasters {
    pub source: RasterSource,
    pub rasters: Vec<(RasterChannel, RasterHandle)>,
    pub uv: UvTransform,
}

/// Rasters and geometry ready, waiting for the material
#[derive(Debug)]
pub(super) struct StagedChunk {
    pub geometry: GeometryRef,
    pub lod: u32,
    pub edge_mask: EdgeMask,
    pub source: RasterSource,
    pub uv: UvTransform,
    pub stage: u64,
}

/// Streaming statistics
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamingStats {
    /// Distinct atlas tiers resident
    pub atlas_count: usize,
    /// Chunks with dedicated rasters resident
    pub per_chunk_count: usize,
    pub bytes_used: u64,
    pub max_bytes: u64,
    pub hit_rate: f32,
    pub evictions: u64,
    pub live_chunks: usize,
    pub staged_chunks: usize,
    pub pending_generations: usize,
    pub pending_materials: usize,
    pub shared_geometries: usize,
}

/// Owns the mesh binding of every visible chunk
pub struct ChunkMeshManager {
    pub(super) config: StreamingConfig,
    pub(super) cache: RasterCache,
    pub(super) pool: GeometryPool,
    pub(super) entries: HashMap<ChunkAddress, ChunkMeshEntry>,
    pub(super) staged: HashMap<ChunkAddress, StagedChunk>,
    /// Live and staged chunks by grid cell, for neighbor lookups
    pub(super) cells: HashMap<Cell, ChunkAddress>,
    /// CPU samples installed alongside per-chunk rasters
    pub(super) chunk_samples: HashMap<ChunkAddress, RegionSamples>,
    pub(super) generator: Arc<dyn RasterGenerator>,
    pub(super) geometry: Box<dyn GeometryBuilder>,
    pub(super) materials: Arc<dyn MaterialBuilder>,
    pub(super) backend: Box<dyn GraphicsBackend>,
    /// Last environment seen, used for material descriptors
    pub(super) environment: Environment,
    /// Chunks already warned about missing resources
    pub(super) warned: HashSet<ChunkAddress>,
    /// Round-robin order of the update pass
    pub(super) update_queue: VecDeque<ChunkAddress>,
    pub(super) queued: HashSet<ChunkAddress>,
    /// Chunks whose neighbors changed LOD, processed first
    pub(super) dirty: VecDeque<ChunkAddress>,
    pub(super) dirty_set: HashSet<ChunkAddress>,
    next_stage: u64,
    // Material jobs run on the atlas queue's runtime, so they drop first
    pub(super) material_tasks: TaskQueue<MaterialKey, MaterialHandle>,
    pub(super) atlas_tasks: TaskQueue<AtlasKey, GeneratedAtlas>,
}

impl ChunkMeshManager {
    /// Create a manager with its own async runtime
    pub fn new(config: StreamingConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let atlas_tasks = TaskQueue::new(config.generation.max_concurrent)?;
        let material_tasks = TaskQueue::with_handle(atlas_tasks.handle().clone(), config.generation.max_concurrent);
        Ok(Self::assemble(config, collaborators, atlas_tasks, material_tasks))
    }

    /// Create a manager that runs async work on an existing runtime
    pub fn with_runtime(config: StreamingConfig, collaborators: Collaborators, handle: Handle) -> Result<Self> {
        config.validate()?;
        let atlas_tasks = TaskQueue::with_handle(handle.clone(), config.generation.max_concurrent);
        let material_tasks = TaskQueue::with_handle(handle, config.generation.max_concurrent);
        Ok(Self::assemble(config, collaborators, atlas_tasks, material_tasks))
    }

    fn assemble(
        config: StreamingConfig,
        collaborators: Collaborators,
        atlas_tasks: TaskQueue<AtlasKey, GeneratedAtlas>,
        material_tasks: TaskQueue<MaterialKey, MaterialHandle>,
    ) -> Self {
        Self {
            cache: config.cache.build_cache(),
            config,
            pool: GeometryPool::new(),
            entries: HashMap::new(),
            staged: HashMap::new(),
            cells: HashMap::new(),
            chunk_samples: HashMap::new(),
            generator: collaborators.generator,
            geometry: collaborators.geometry,
            materials: collaborators.materials,
            backend: collaborators.backend,
            environment: Environment::default(),
            warned: HashSet::new(),
            update_queue: VecDeque::new(),
            queued: HashSet::new(),
            dirty: VecDeque::new(),
            dirty_set: HashSet::new(),
            next_stage: 0,
            material_tasks,
            atlas_tasks,
        }
    }

    // --- Chunk lifecycle ---

    /// Make `chunk` renderable
    ///
    /// Returns the mesh entry once the chunk is ready. Until then every call
    /// advances it one step (request rasters, build geometry, request the
    /// material) and returns `None`; the caller retries on a later frame.
    /// Calling it for a ready chunk returns the existing entry unchanged.
    pub fn add_chunk(&mut self, chunk: ChunkAddress, environment: &Environment) -> Option<&ChunkMeshEntry> {
        self.environment = environment.clone();
        self.poll();

        if self.entries.contains_key(&chunk) {
            return self.entries.get(&chunk);
        }
        if self.staged.contains_key(&chunk) {
            return None;
        }

        let distance = self.distance_to(&chunk);
        let lod = self.target_lod(&chunk, None);

        let Some(resolved) = self.resolve_rasters(&chunk, lod) else {
            self.request_atlas(&chunk, lod, distance);
            self.warn_once(&chunk, format_args!("rasters for chunk {} at LOD {} not resident yet", chunk, lod));
            return None;
        };

        let edge_mask = self.edge_mask_for(&chunk, lod);
        let geometry = match self.acquire_geometry(&chunk, lod, edge_mask, &resolved.source) {
            Ok(geometry) => geometry,
            Err(e) => {
                self.warn_once(&chunk, format_args!("no geometry for chunk {}: {}", chunk, e));
                return None;
            }
        };

        if let Some(atlas) = resolved.source.atlas() {
            self.cache.track_usage(atlas, chunk);
        }

        let descriptor = self.descriptor(&chunk, lod, edge_mask, &resolved);
        self.next_stage += 1;
        let stage = self.next_stage;
        let materials = &self.materials;
        self.material_tasks
            .request((chunk, stage), -distance as f32, || materials.create(descriptor));

        self.cells.insert(chunk.cell(), chunk);
        self.staged.insert(
            chunk,
            StagedChunk {
                geometry,
                lod,
                edge_mask,
                source: resolved.source,
                uv: resolved.uv,
                stage,
            },
        );
        log::trace!("Chunk {} staged at LOD {} from {}", chunk, lod, resolved.source);

        None
    }

    /// Release everything `chunk` holds
    ///
    /// Returns false if the chunk was neither ready nor staged. A material
    /// still being created for it is released when it arrives.
    pub fn remove_chunk(&mut self, chunk: &ChunkAddress) -> bool {
        let removed = self.release_chunk(chunk);
        if removed {
            log::debug!("Removed chunk {}", chunk);
        }
        removed
    }

    /// Detach entry, drop references, then release owned resources
    pub(super) fn release_chunk(&mut self, chunk: &ChunkAddress) -> bool {
        let (geometry, material, source) = if let Some(entry) = self.entries.remove(chunk) {
            (entry.geometry, Some(entry.material), entry.source)
        } else if let Some(staged) = self.staged.remove(chunk) {
            (staged.geometry, None, staged.source)
        } else {
            return false;
        };

        if self.cells.get(&chunk.cell()) == Some(chunk) {
            self.cells.remove(&chunk.cell());
        }
        if let Some(atlas) = source.atlas() {
            self.cache.release_usage(&atlas, chunk);
        }

        self.release_geometry(geometry);
        if let Some(material) = material {
            self.backend.release_material(material);
        }

        self.mark_neighbors_dirty(chunk);
        true
    }

    /// Release every chunk, shared geometry and raster
    pub fn cleanup(&mut self) {
        self.poll();

        let chunks: Vec<ChunkAddress> = self.entries.keys().chain(self.staged.keys()).copied().collect();
        for chunk in &chunks {
            self.release_chunk(chunk);
        }

        for handle in self.pool.drain() {
            self.backend.release_geometry(handle);
        }
        for entry in self.cache.clear() {
            self.backend.release_raster(entry.handle);
        }

        self.chunk_samples.clear();
        self.warned.clear();
        self.update_queue.clear();
        self.queued.clear();
        self.dirty.clear();
        self.dirty_set.clear();

        if !chunks.is_empty() {
            log::debug!("Cleaned up {} chunks", chunks.len());
        }
    }

    /// Install rasters produced for a single chunk
    ///
    /// Used when the chunk does not fit the atlas layout, e.g. edited terrain.
    /// These rasters cannot be regenerated by the manager, so evicting them
    /// is reported. `samples` feed non-instanced geometry.
    pub fn install_chunk_rasters(
        &mut self,
        chunk: ChunkAddress,
        rasters: Vec<GeneratedRaster>,
        samples: Option<RegionSamples>,
    ) {
        if let Some(samples) = samples {
            self.chunk_samples.insert(chunk, samples);
        }
        for raster in rasters {
            let displaced = self.cache.put(
                RasterIdentity::Chunk(chunk),
                raster.channel,
                raster.handle,
                raster.size_bytes,
                false,
            );
            self.release_rasters(displaced);
        }
    }

    // --- Async completion ---

    /// Install finished atlas generations and register finished materials
    pub fn poll(&mut self) {
        let atlases = self.atlas_tasks.poll_results();
        self.complete_atlases(atlases);
        let materials = self.material_tasks.poll_results();
        self.complete_materials(materials);
    }

    /// Block until no generation or material is pending, or `timeout` passes
    pub fn wait_for_pending(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let slice = Duration::from_millis(10);

        loop {
            self.poll();
            if self.atlas_tasks.pending_count() == 0 && self.material_tasks.pending_count() == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            if self.atlas_tasks.pending_count() > 0 {
                let results = self.atlas_tasks.wait_for_results(remaining.min(slice));
                self.complete_atlases(results);
            } else {
                let results = self.material_tasks.wait_for_results(remaining.min(slice));
                self.complete_materials(results);
            }
        }
    }

    /// Generated atlases are installed even when no chunk waits for them
    /// any more; the cache decides their fate.
    fn complete_atlases(&mut self, results: Vec<TaskResult<AtlasKey, GeneratedAtlas>>) {
        for result in results {
            match result.outcome {
                Ok(atlas) => {
                    let identity = RasterIdentity::Atlas(atlas.key);
                    for raster in atlas.rasters {
                        let displaced =
                            self.cache.put(identity, raster.channel, raster.handle, raster.size_bytes, true);
                        self.release_rasters(displaced);
                    }
                    log::debug!("Installed atlas {}", atlas.key);
                }
                Err(e) => {
                    log::warn!("Atlas generation failed for {}: {}", result.key, e);
                }
            }
        }
    }

    fn complete_materials(&mut self, results: Vec<TaskResult<MaterialKey, MaterialHandle>>) {
        for result in results {
            let (chunk, stage) = result.key;
            let staged = match self.staged.get(&chunk) {
                Some(staged) if staged.stage == stage => self.staged.remove(&chunk),
                _ => None,
            };

            match (result.outcome, staged) {
                (Ok(material), Some(staged)) => self.register(chunk, staged, material),
                (Ok(material), None) => {
                    // Chunk went away, or was staged again, while its
                    // material was being built
                    log::trace!("Discarding late material for chunk {}", chunk);
                    self.backend.release_material(material);
                }
                (Err(e), staged) => {
                    log::warn!("Material creation failed for chunk {}: {}", chunk, e);
                    if let Some(staged) = staged {
                        self.unstage(&chunk, staged);
                    }
                }
            }
        }
    }

    fn register(&mut self, chunk: ChunkAddress, staged: StagedChunk, material: MaterialHandle) {
        if let Err(e) = self.backend.compile_material(material) {
            log::warn!("Material compile failed for chunk {}: {}", chunk, e);
            self.backend.release_material(material);
            self.unstage(&chunk, staged);
            return;
        }

        self.entries.insert(
            chunk,
            ChunkMeshEntry {
                chunk,
                geometry: staged.geometry,
                material,
                lod: staged.lod,
                edge_mask: staged.edge_mask,
                source: staged.source,
                uv: staged.uv,
            },
        );
        self.warned.remove(&chunk);
        // A stale slot from an earlier life of this chunk may still be queued
        if self.queued.insert(chunk) {
            self.update_queue.push_back(chunk);
        }
        self.mark_neighbors_dirty(&chunk);
        log::debug!("Chunk {} ready at LOD {}", chunk, staged.lod);
    }

    /// Drop a staged chunk that will never become ready
    fn unstage(&mut self, chunk: &ChunkAddress, staged: StagedChunk) {
        if self.cells.get(&chunk.cell()) == Some(chunk) {
            self.cells.remove(&chunk.cell());
        }
        if let Some(atlas) = staged.source.atlas() {
            self.cache.release_usage(&atlas, chunk);
        }
        self.release_geometry(staged.geometry);
    }

    // --- Resource helpers ---

    /// Release rasters that left the cache
    ///
    /// Chunks still rendering from a displaced raster are detached first so
    /// no entry outlives the raster it samples.
    pub(super) fn release_rasters(&mut self, displaced: Vec<RasterEntry>) {
        for entry in displaced {
            let dependents: Vec<ChunkAddress> = match entry.identity {
                RasterIdentity::Atlas(key) => self.cache.usage().dependents(&key).copied().collect(),
                RasterIdentity::Chunk(chunk) => {
                    let uses_chunk_rasters = self.entries.get(&chunk).map(|e| e.source)
                        == Some(RasterSource::Chunk)
                        || self.staged.get(&chunk).map(|s| s.source) == Some(RasterSource::Chunk);
                    self.chunk_samples.remove(&chunk);
                    if uses_chunk_rasters { vec![chunk] } else { Vec::new() }
                }
            };

            if !dependents.is_empty() {
                log::warn!(
                    "Raster {} {} left the cache with {} chunks on it, detaching them",
                    entry.identity, entry.channel, dependents.len()
                );
                for chunk in &dependents {
                    self.release_chunk(chunk);
                }
            }

            self.backend.release_raster(entry.handle);
        }
    }

    pub(super) fn release_geometry(&mut self, geometry: GeometryRef) {
        match geometry {
            GeometryRef::Shared { key, .. } => {
                if let Some(handle) = self.pool.release(&key) {
                    log::trace!("Shared geometry {:?} has no users left", key);
                    self.backend.release_geometry(handle);
                }
            }
            GeometryRef::Exclusive(handle) => self.backend.release_geometry(handle),
        }
    }

    /// Shared grid when instancing, otherwise a mesh built from samples
    ///
    /// An atlas tier that is resident but whose CPU samples the generator
    /// no longer holds is dropped from the cache and generated again.
    pub(super) fn acquire_geometry(
        &mut self,
        chunk: &ChunkAddress,
        lod: u32,
        edge_mask: EdgeMask,
        source: &RasterSource,
    ) -> Result<GeometryRef> {
        if self.config.instancing {
            let key = GeometryKey {
                lod,
                chunk_size: self.config.atlas.chunk_size,
                edge_mask,
            };
            let builder = &mut self.geometry;
            return self
                .pool
                .acquire(key, || builder.build_shared(key.lod, key.chunk_size, key.edge_mask));
        }

        let Some(samples) = self.region_samples(chunk, source, lod) else {
            if let RasterSource::Atlas(key) = source {
                self.regenerate_atlas(*key, chunk);
            }
            return Err(Error::ResourceUnavailable(format!("samples for chunk {} from {}", chunk, source)));
        };
        let handle = self.geometry.build(&samples, lod, edge_mask)?;
        Ok(GeometryRef::Exclusive(handle))
    }

    pub(super) fn region_samples(&self, chunk: &ChunkAddress, source: &RasterSource, lod: u32) -> Option<RegionSamples> {
        match source {
            RasterSource::Atlas(key) => {
                debug_assert_eq!(key.lod, lod);
                self.generator.extract_region(key, chunk, &self.config.atlas)
            }
            RasterSource::Chunk => self.chunk_samples.get(chunk).cloned(),
        }
    }

    /// Look up every configured channel, atlas tier first, then chunk rasters
    pub(super) fn resolve_rasters(&mut self, chunk: &ChunkAddress, lod: u32) -> Option<ResolvedRasters> {
        let key = AtlasKey::for_chunk(chunk, lod, &self.config.atlas);
        if let Some(rasters) = self.lookup(&RasterIdentity::Atlas(key)) {
            let uv = key.atlas.uv_transform(chunk)?;
            return Some(ResolvedRasters {
                source: RasterSource::Atlas(key),
                rasters,
                uv,
            });
        }

        let identity = RasterIdentity::Chunk(*chunk);
        if !self.cache.has(&identity, RasterChannel::Height) {
            return None;
        }
        let rasters = self.lookup(&identity)?;
        Some(ResolvedRasters {
            source: RasterSource::Chunk,
            rasters,
            uv: UvTransform::IDENTITY,
        })
    }

    fn lookup(&mut self, identity: &RasterIdentity) -> Option<Vec<(RasterChannel, RasterHandle)>> {
        let mut rasters = Vec::with_capacity(self.config.atlas.channels.len());
        for &channel in &self.config.atlas.channels {
            rasters.push((channel, self.cache.get(identity, channel)?));
        }
        Some(rasters)
    }

    fn regenerate_atlas(&mut self, key: AtlasKey, chunk: &ChunkAddress) {
        log::debug!("Samples of atlas {} were dropped, generating it again", key);
        let removed = self.cache.remove(&RasterIdentity::Atlas(key));
        self.release_rasters(removed);
        let distance = self.distance_to(chunk);
        self.request_generation(key, distance);
    }

    /// Ask for the atlas tier `chunk` samples at `lod`; closer chunks first
    pub(super) fn request_atlas(&mut self, chunk: &ChunkAddress, lod: u32, distance: f64) {
        let key = AtlasKey::for_chunk(chunk, lod, &self.config.atlas);
        self.request_generation(key, distance);
    }

    fn request_generation(&mut self, key: AtlasKey, distance: f64) {
        let generator = &self.generator;
        let config = &self.config;
        self.atlas_tasks.request(key, -distance as f32, || {
            generator.generate_atlas(AtlasRequest {
                key,
                config: config.atlas.clone(),
                chunk_world_size: config.lod.chunk_world_size,
                sphere: config.sphere,
            })
        });
    }

    pub(super) fn descriptor(
        &self,
        chunk: &ChunkAddress,
        lod: u32,
        edge_mask: EdgeMask,
        resolved: &ResolvedRasters,
    ) -> MaterialDescriptor {
        MaterialDescriptor {
            chunk: *chunk,
            lod,
            rasters: resolved.rasters.clone(),
            uv: resolved.uv,
            edge_mask,
            sun_direction: self.environment.sun_direction,
            sea_level: self.environment.sea_level,
            fog_density: self.environment.fog_density,
        }
    }

    pub(super) fn distance_to(&self, chunk: &ChunkAddress) -> f64 {
        chunk_distance(
            self.environment.camera_position,
            chunk,
            self.config.lod.chunk_world_size,
            self.config.sphere.as_ref(),
        )
    }

    pub(super) fn warn_once(&mut self, chunk: &ChunkAddress, message: fmt::Arguments<'_>) {
        if self.warned.insert(*chunk) {
            log::warn!("{}", message);
        }
    }

    // --- Queries ---

    pub fn entry(&self, chunk: &ChunkAddress) -> Option<&ChunkMeshEntry> {
        self.entries.get(chunk)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChunkMeshEntry> + '_ {
        self.entries.values()
    }

    pub fn is_staged(&self, chunk: &ChunkAddress) -> bool {
        self.staged.contains_key(chunk)
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_generation_pending(&self, key: &AtlasKey) -> bool {
        self.atlas_tasks.is_pending(key)
    }

    /// Height raster a chunk samples, for collision and other CPU consumers
    pub fn get_height_raster(&mut self, chunk: &ChunkAddress) -> Option<RasterBinding> {
        self.raster_binding(chunk, RasterChannel::Height)
    }

    pub fn get_normal_raster(&mut self, chunk: &ChunkAddress) -> Option<RasterBinding> {
        self.raster_binding(chunk, RasterChannel::Normal)
    }

    /// Live chunks use their own source; others fall back to chunk rasters
    /// and then the finest atlas tier.
    fn raster_binding(&mut self, chunk: &ChunkAddress, channel: RasterChannel) -> Option<RasterBinding> {
        if let Some(entry) = self.entries.get(chunk).copied() {
            let handle = self.cache.get(&entry.source.identity(chunk), channel)?;
            return Some(RasterBinding { handle, uv: entry.uv });
        }

        let identity = RasterIdentity::Chunk(*chunk);
        if self.cache.has(&identity, channel) {
            let handle = self.cache.get(&identity, channel)?;
            return Some(RasterBinding {
                handle,
                uv: UvTransform::IDENTITY,
            });
        }

        let key = AtlasKey::for_chunk(chunk, 0, &self.config.atlas);
        let handle = self.cache.get(&RasterIdentity::Atlas(key), channel)?;
        Some(RasterBinding {
            handle,
            uv: key.atlas.uv_transform(chunk)?,
        })
    }

    /// CPU samples of a chunk at its current LOD, or LOD 0 if not live
    pub fn extract_region(&self, chunk: &ChunkAddress) -> Option<RegionSamples> {
        match self.entries.get(chunk) {
            Some(entry) => self.region_samples(chunk, &entry.source, entry.lod),
            None => {
                let key = AtlasKey::for_chunk(chunk, 0, &self.config.atlas);
                self.generator
                    .extract_region(&key, chunk, &self.config.atlas)
                    .or_else(|| self.chunk_samples.get(chunk).cloned())
            }
        }
    }

    pub fn stats(&self) -> StreamingStats {
        StreamingStats {
            atlas_count: self.cache.atlas_count(),
            per_chunk_count: self.cache.chunk_count(),
            bytes_used: self.cache.resident_bytes(),
            max_bytes: self.cache.max_bytes(),
            hit_rate: self.cache.hit_rate(),
            evictions: self.cache.counters().evictions,
            live_chunks: self.entries.len(),
            staged_chunks: self.staged.len(),
            pending_generations: self.atlas_tasks.pending_count(),
            pending_materials: self.material_tasks.pending_count(),
            shared_geometries: self.pool.len(),
        }
    }

    pub fn cache(&self) -> &RasterCache {
        &self.cache
    }

    pub fn geometry_pool(&self) -> &GeometryPool {
        &self.pool
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn camera_position(&self) -> DVec3 {
        self.environment.camera_position
    }
}

impl Drop for ChunkMeshManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}
