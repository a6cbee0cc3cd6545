//! Headless collaborators
//!
//! Stand-ins for the GPU side: they hand out fresh handles, produce
//! zero-filled rasters, and record every build and release in a shared
//! ledger. Used by the simulation binary and by tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::error::Error;
use crate::core::types::{BoxFuture, Result};
use crate::streaming::address::ChunkAddress;
use crate::streaming::atlas::{AtlasConfig, AtlasKey};
use crate::streaming::lod::EdgeMask;
use crate::terrain::backend::{
    AtlasRequest, Collaborators, GeneratedAtlas, GeneratedRaster, GeometryBuilder, GeometryHandle,
    GraphicsBackend, MaterialBuilder, MaterialDescriptor, MaterialHandle, RasterGenerator,
    RasterHandle, RegionSamples,
};

/// Everything the headless collaborators did
#[derive(Debug, Default)]
pub struct Ledger {
    /// Every `generate_atlas` call, in order
    pub generated: Vec<AtlasKey>,
    pub geometries_built: Vec<GeometryHandle>,
    pub shared_built: Vec<GeometryHandle>,
    pub materials_created: Vec<MaterialHandle>,
    /// LOD each material was created for
    pub material_lods: HashMap<MaterialHandle, u32>,
    pub materials_compiled: Vec<MaterialHandle>,
    pub rebinds: Vec<(MaterialHandle, u32)>,
    pub released_geometry: Vec<GeometryHandle>,
    pub released_materials: Vec<MaterialHandle>,
    pub released_rasters: Vec<RasterHandle>,
}

impl Ledger {
    pub fn geometry_release_count(&self, handle: GeometryHandle) -> usize {
        self.released_geometry.iter().filter(|h| **h == handle).count()
    }

    pub fn material_release_count(&self, handle: MaterialHandle) -> usize {
        self.released_materials.iter().filter(|h| **h == handle).count()
    }

    pub fn raster_release_count(&self, handle: RasterHandle) -> usize {
        self.released_rasters.iter().filter(|h| **h == handle).count()
    }

    /// Handles released more than once, of any kind
    pub fn double_releases(&self) -> Vec<u64> {
        fn repeated(ids: impl Iterator<Item = u64>) -> Vec<u64> {
            let mut seen = HashSet::new();
            ids.filter(|id| !seen.insert(*id)).collect()
        }

        let mut doubles = repeated(self.released_geometry.iter().map(|h| h.0));
        doubles.extend(repeated(self.released_materials.iter().map(|h| h.0)));
        doubles.extend(repeated(self.released_rasters.iter().map(|h| h.0)));
        doubles
    }

    /// Built or created handles that were never released
    pub fn leaked_geometry(&self) -> Vec<GeometryHandle> {
        let released: HashSet<_> = self.released_geometry.iter().collect();
        self.geometries_built
            .iter()
            .chain(&self.shared_built)
            .filter(|h| !released.contains(h))
            .copied()
            .collect()
    }

    pub fn leaked_materials(&self) -> Vec<MaterialHandle> {
        let released: HashSet<_> = self.released_materials.iter().collect();
        self.materials_created
            .iter()
            .filter(|h| !released.contains(h))
            .copied()
            .collect()
    }
}

/// State shared by all headless collaborators
#[derive(Debug, Default)]
pub struct HeadlessState {
    next_handle: AtomicU64,
    ledger: Mutex<Ledger>,
    /// Atlas keys whose generation fails
    failing_atlases: Mutex<HashSet<AtlasKey>>,
    /// Chunks whose material creation fails
    failing_materials: Mutex<HashSet<ChunkAddress>>,
    /// Raster sizes by handle
    raster_sizes: Mutex<HashMap<RasterHandle, u64>>,
    /// Artificial latency of async work
    latency: Mutex<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HeadlessState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ledger(&self) -> MutexGuard<'_, Ledger> {
        lock(&self.ledger)
    }

    pub fn fail_atlas(&self, key: AtlasKey) {
        lock(&self.failing_atlases).insert(key);
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_atlases).clear();
        lock(&self.failing_materials).clear();
    }

    pub fn fail_material(&self, chunk: ChunkAddress) {
        lock(&self.failing_materials).insert(chunk);
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    fn latency(&self) -> Duration {
        *lock(&self.latency)
    }

    /// Number of `generate_atlas` calls for `key`
    pub fn generation_calls(&self, key: &AtlasKey) -> usize {
        self.ledger().generated.iter().filter(|k| *k == key).count()
    }

    /// Total bytes of rasters handed out and not yet released
    pub fn live_raster_bytes(&self) -> u64 {
        lock(&self.raster_sizes).values().sum()
    }

    /// Build the four collaborators around this state
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            generator: Arc::new(HeadlessRasterGenerator { state: self.clone() }),
            geometry: Box::new(HeadlessGeometryBuilder { state: self.clone() }),
            materials: Arc::new(HeadlessMaterialBuilder { state: self.clone() }),
            backend: Box::new(HeadlessBackend { state: self.clone() }),
        }
    }
}

async fn simulated_latency(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Produces zero-filled rasters sized from the atlas layout
pub struct HeadlessRasterGenerator {
    state: Arc<HeadlessState>,
}

impl RasterGenerator for HeadlessRasterGenerator {
    fn generate_atlas(&self, request: AtlasRequest) -> BoxFuture<Result<GeneratedAtlas>> {
        let state = self.state.clone();
        state.ledger().generated.push(request.key);

        let fails = lock(&state.failing_atlases).contains(&request.key);
        let latency = state.latency();

        Box::pin(async move {
            simulated_latency(latency).await;
            if fails {
                return Err(Error::Generation {
                    key: request.key.to_string(),
                    reason: "injected failure".to_string(),
                });
            }

            let rasters = request
                .config
                .channels
                .iter()
                .map(|&channel| {
                    let handle = RasterHandle(state.allocate());
                    let size_bytes = request.config.atlas_bytes(channel, request.key.lod);
                    lock(&state.raster_sizes).insert(handle, size_bytes);
                    GeneratedRaster { channel, handle, size_bytes }
                })
                .collect();

            Ok(GeneratedAtlas { key: request.key, rasters })
        })
    }

    fn extract_region(&self, atlas: &AtlasKey, chunk: &ChunkAddress, config: &AtlasConfig) -> Option<RegionSamples> {
        if !atlas.atlas.contains(chunk) {
            return None;
        }
        let resolution = config.chunk_resolution(atlas.lod);
        let count = (resolution * resolution) as usize;
        Some(RegionSamples {
            chunk: *chunk,
            lod: atlas.lod,
            resolution,
            heights: vec![0.0; count],
            tiles: vec![0; count],
        })
    }
}

pub struct HeadlessGeometryBuilder {
    state: Arc<HeadlessState>,
}

impl GeometryBuilder for HeadlessGeometryBuilder {
    fn build(&mut self, samples: &RegionSamples, _lod: u32, _edge_mask: EdgeMask) -> Result<GeometryHandle> {
        if samples.heights.is_empty() {
            return Err(Error::Backend(format!("no samples for chunk {}", samples.chunk)));
        }
        let handle = GeometryHandle(self.state.allocate());
        self.state.ledger().geometries_built.push(handle);
        Ok(handle)
    }

    fn build_shared(&mut self, _lod: u32, _chunk_size: u32, _edge_mask: EdgeMask) -> Result<GeometryHandle> {
        let handle = GeometryHandle(self.state.allocate());
        self.state.ledger().shared_built.push(handle);
        Ok(handle)
    }
}

pub struct HeadlessMaterialBuilder {
    state: Arc<HeadlessState>,
}

impl MaterialBuilder for HeadlessMaterialBuilder {
    fn create(&self, descriptor: MaterialDescriptor) -> BoxFuture<Result<MaterialHandle>> {
        let state = self.state.clone();
        let fails = lock(&state.failing_materials).contains(&descriptor.chunk);
        let latency = state.latency();

        Box::pin(async move {
            simulated_latency(latency).await;
            if fails {
                return Err(Error::Generation {
                    key: descriptor.chunk.key(),
                    reason: "injected material failure".to_string(),
                });
            }
            let handle = MaterialHandle(state.allocate());
            let mut ledger = state.ledger();
            ledger.materials_created.push(handle);
            ledger.material_lods.insert(handle, descriptor.lod);
            Ok(handle)
        })
    }

    fn rebind(&self, material: MaterialHandle, descriptor: &MaterialDescriptor) -> Result<()> {
        self.state.ledger().rebinds.push((material, descriptor.lod));
        Ok(())
    }
}

pub struct HeadlessBackend {
    state: Arc<HeadlessState>,
}

impl GraphicsBackend for HeadlessBackend {
    fn compile_material(&mut self, material: MaterialHandle) -> Result<()> {
        self.state.ledger().materials_compiled.push(material);
        Ok(())
    }

    fn release_material(&mut self, material: MaterialHandle) {
        self.state.ledger().released_materials.push(material);
    }

    fn release_geometry(&mut self, geometry: GeometryHandle) {
        self.state.ledger().released_geometry.push(geometry);
    }

    fn release_raster(&mut self, raster: RasterHandle) {
        lock(&self.state.raster_sizes).remove(&raster);
        self.state.ledger().released_rasters.push(raster);
    }
}
