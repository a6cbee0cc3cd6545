//! Amortized LOD and edge-mask update pass
//!
//! Each pass walks live chunks, dirty ones first and then round-robin,
//! until the wall-clock budget or the mutation limit runs out. The next pass
//! resumes where this one stopped.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::core::error::Error;
use crate::core::types::{DVec3, Result};
use crate::streaming::address::ChunkAddress;
use crate::streaming::lod::{EdgeMask, NEIGHBOR_EDGES, compute_edge_mask};
use crate::terrain::manager::{ChunkMeshEntry, ChunkMeshManager};

/// Summary of one update pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub processed: usize,
    pub lod_changes: usize,
    pub mask_changes: usize,
    /// LOD changes postponed until replacement rasters exist
    pub deferred: usize,
    /// Every live chunk was visited before a limit was hit
    pub completed: bool,
}

impl UpdateReport {
    pub fn mutations(&self) -> usize {
        self.lod_changes + self.mask_changes
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Refresh {
    Unchanged,
    LodChanged,
    MaskChanged,
    Deferred,
}

impl ChunkMeshManager {
    /// Re-evaluate LOD and edge masks of live chunks within `budget`
    pub fn update_lods(&mut self, camera: DVec3, budget: Duration) -> UpdateReport {
        let start = Instant::now();
        self.environment.camera_position = camera;
        self.poll();

        let max_mutations = self.config.update.max_mutations_per_pass;
        let mut report = UpdateReport::default();
        let mut visited = HashSet::new();
        let mut carried = Vec::new();
        let mut round_robin = self.update_queue.len();

        loop {
            if report.mutations() >= max_mutations || start.elapsed() >= budget {
                break;
            }
            let Some((chunk, was_dirty)) = self.next_to_update(&mut round_robin) else {
                report.completed = true;
                break;
            };
            if !visited.insert(chunk) {
                // Neighbor changed after this chunk was processed
                if was_dirty {
                    carried.push(chunk);
                }
                continue;
            }

            report.processed += 1;
            match self.refresh_chunk(chunk) {
                Refresh::Unchanged => {}
                Refresh::LodChanged => report.lod_changes += 1,
                Refresh::MaskChanged => report.mask_changes += 1,
                Refresh::Deferred => report.deferred += 1,
            }
        }

        for chunk in carried {
            if self.dirty_set.insert(chunk) {
                self.dirty.push_back(chunk);
            }
        }

        log::trace!(
            "LOD pass: {} processed, {} LOD changes, {} edge changes, {} deferred in {:?}",
            report.processed, report.lod_changes, report.mask_changes, report.deferred, start.elapsed()
        );

        report
    }

    /// Next live chunk: dirty queue first, then at most one lap of the
    /// round-robin queue
    fn next_to_update(&mut self, round_robin: &mut usize) -> Option<(ChunkAddress, bool)> {
        while let Some(chunk) = self.dirty.pop_front() {
            self.dirty_set.remove(&chunk);
            if self.entries.contains_key(&chunk) {
                return Some((chunk, true));
            }
        }

        while *round_robin > 0 {
            *round_robin -= 1;
            let chunk = self.update_queue.pop_front()?;
            if self.entries.contains_key(&chunk) {
                self.update_queue.push_back(chunk);
                return Some((chunk, false));
            }
            self.queued.remove(&chunk);
        }

        None
    }

    fn refresh_chunk(&mut self, chunk: ChunkAddress) -> Refresh {
        let Some(entry) = self.entries.get(&chunk).copied() else {
            return Refresh::Unchanged;
        };

        let mut outcome = Refresh::Unchanged;
        let target = self.target_lod(&chunk, Some(entry.lod));
        if target != entry.lod {
            match self.swap_lod(&entry, target) {
                Ok(()) => return Refresh::LodChanged,
                Err(e) => {
                    log::debug!("LOD change of chunk {} to {} deferred: {}", chunk, target, e);
                    outcome = Refresh::Deferred;
                }
            }
        }

        // Neighbors may have changed even if this chunk keeps its LOD
        let mask = self.edge_mask_for(&chunk, entry.lod);
        if mask != entry.edge_mask {
            match self.swap_edge_mask(&entry, mask) {
                Ok(()) => return Refresh::MaskChanged,
                Err(e) => log::warn!("Edge update of chunk {} failed: {}", chunk, e),
            }
        }

        outcome
    }

    /// Move a chunk to `target`, rebinding its material to the new tier
    ///
    /// Fails without touching the entry if the tier's rasters are not
    /// resident yet; generation is requested in that case.
    fn swap_lod(&mut self, entry: &ChunkMeshEntry, target: u32) -> Result<()> {
        let chunk = entry.chunk;
        let Some(resolved) = self.resolve_rasters(&chunk, target) else {
            let distance = self.distance_to(&chunk);
            self.request_atlas(&chunk, target, distance);
            return Err(Error::ResourceUnavailable(format!(
                "rasters for chunk {} at LOD {}",
                chunk, target
            )));
        };

        let mask = self.edge_mask_for(&chunk, target);
        let geometry = self.acquire_geometry(&chunk, target, mask, &resolved.source)?;
        let descriptor = self.descriptor(&chunk, target, mask, &resolved);
        if let Err(e) = self.materials.rebind(entry.material, &descriptor) {
            self.release_geometry(geometry);
            return Err(e);
        }

        if let Some(live) = self.entries.get_mut(&chunk) {
            live.lod = target;
            live.edge_mask = mask;
            live.geometry = geometry;
            live.source = resolved.source;
            live.uv = resolved.uv;
        }

        self.release_geometry(entry.geometry);
        if let Some(old) = entry.source.atlas() {
            self.cache.release_usage(&old, &chunk);
        }
        if let Some(new) = resolved.source.atlas() {
            self.cache.track_usage(new, chunk);
        }

        self.mark_neighbors_dirty(&chunk);
        log::debug!("Chunk {} LOD {} -> {}", chunk, entry.lod, target);
        Ok(())
    }

    /// Swap geometry only; rasters and material stay
    fn swap_edge_mask(&mut self, entry: &ChunkMeshEntry, mask: EdgeMask) -> Result<()> {
        let geometry = self.acquire_geometry(&entry.chunk, entry.lod, mask, &entry.source)?;

        if let Some(live) = self.entries.get_mut(&entry.chunk) {
            live.geometry = geometry;
            live.edge_mask = mask;
        }
        self.release_geometry(entry.geometry);
        Ok(())
    }

    /// LOD a chunk should render at
    ///
    /// A forced LOD wins. Otherwise distance decides, through the hysteresis
    /// band when the chunk already has a LOD. Clamped to the generated tiers.
    pub(super) fn target_lod(&self, chunk: &ChunkAddress, current: Option<u32>) -> u32 {
        let max_lod = self.config.max_lod();
        if let Some(force) = self.environment.force_lod {
            return force.min(max_lod);
        }

        let distance = self.distance_to(chunk);
        let lod = match current {
            Some(current) => self.config.lod.lod_with_hysteresis(distance, current),
            None => self.config.lod.lod_from_distance(distance),
        };
        lod.min(max_lod)
    }

    /// Edge mask of `chunk` rendered at `lod`
    ///
    /// Live or staged neighbors report their LOD; missing ones are estimated
    /// from distance. Cells beyond a cube face edge are left out.
    pub(super) fn edge_mask_for(&self, chunk: &ChunkAddress, lod: u32) -> EdgeMask {
        let mut neighbors = [None; 4];

        for (slot, (dx, dy, _)) in neighbors.iter_mut().zip(NEIGHBOR_EDGES) {
            let neighbor = chunk.offset(dx, dy);
            if let (Some(_), Some(sphere)) = (chunk.face(), self.config.sphere.as_ref()) {
                if !sphere.on_face(neighbor.x(), neighbor.y()) {
                    continue;
                }
            }
            *slot = Some(self.neighbor_lod(&neighbor));
        }

        compute_edge_mask(lod, neighbors)
    }

    fn neighbor_lod(&self, neighbor: &ChunkAddress) -> u32 {
        let known = self.cells.get(&neighbor.cell()).and_then(|address| {
            self.entries
                .get(address)
                .map(|entry| entry.lod)
                .or_else(|| self.staged.get(address).map(|staged| staged.lod))
        });
        known.unwrap_or_else(|| self.target_lod(neighbor, None))
    }

    /// Queue live neighbors of `chunk` for an edge-mask refresh
    pub(super) fn mark_neighbors_dirty(&mut self, chunk: &ChunkAddress) {
        for (dx, dy, _) in NEIGHBOR_EDGES {
            let cell = chunk.offset(dx, dy).cell();
            let Some(neighbor) = self.cells.get(&cell).copied() else {
                continue;
            };
            if self.entries.contains_key(&neighbor) && self.dirty_set.insert(neighbor) {
                self.dirty.push_back(neighbor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::streaming::atlas::{AtlasConfig, RasterChannel};
    use crate::streaming::config::StreamingConfig;
    use crate::streaming::lod::{LodConfig, SphereConfig};
    use crate::terrain::backend::Environment;
    use crate::terrain::headless::HeadlessState;

    const WAIT: Duration = Duration::from_secs(5);
    const BUDGET: Duration = Duration::from_secs(1);

    fn config(distances: Vec<f64>, hysteresis: f64, chunk_world_size: f64) -> StreamingConfig {
        StreamingConfig {
            atlas: AtlasConfig::new(256, 64, vec![RasterChannel::Height, RasterChannel::Normal])
                .unwrap()
                .with_max_lod(3),
            lod: LodConfig {
                distances,
                hysteresis,
                chunk_world_size,
            },
            instancing: true,
            ..Default::default()
        }
    }

    fn manager(config: StreamingConfig) -> (ChunkMeshManager, Arc<HeadlessState>) {
        let state = HeadlessState::new();
        let manager = ChunkMeshManager::new(config, state.collaborators()).unwrap();
        (manager, state)
    }

    fn add_ready(manager: &mut ChunkMeshManager, chunk: ChunkAddress, env: &Environment) -> ChunkMeshEntry {
        for _ in 0..10 {
            if let Some(entry) = manager.add_chunk(chunk, env) {
                return *entry;
            }
            manager.wait_for_pending(WAIT);
        }
        panic!("chunk {} never became ready", chunk);
    }

    /// Run passes (waiting for generation in between) and total the reports
    fn settle(manager: &mut ChunkMeshManager, camera: DVec3, passes: usize) -> UpdateReport {
        let mut total = UpdateReport::default();
        for _ in 0..passes {
            let report = manager.update_lods(camera, BUDGET);
            total.processed += report.processed;
            total.lod_changes += report.lod_changes;
            total.mask_changes += report.mask_changes;
            total.deferred += report.deferred;
            manager.wait_for_pending(WAIT);
        }
        total
    }

    #[test]
    fn test_hysteresis_in_update_pass() {
        let (mut manager, _state) = manager(config(vec![200.0, 400.0, 800.0], 0.1, 64.0));
        let chunk = ChunkAddress::flat(0, 0); // center (32, 32)
        let at = |distance: f64| DVec3::new(32.0 + distance, 0.0, 32.0);

        let entry = add_ready(&mut manager, chunk, &Environment::at(at(190.0)));
        assert_eq!(entry.lod, 0);

        // Within 5% of the 200 threshold: no changes
        let mut lod_changes = 0;
        for i in 0..10 {
            let distance = if i % 2 == 0 { 210.0 } else { 190.0 };
            lod_changes += settle(&mut manager, at(distance), 1).lod_changes;
        }
        assert_eq!(lod_changes, 0);
        assert_eq!(manager.entry(&chunk).unwrap().lod, 0);

        // Sustained move past the margin: exactly one change
        let report = settle(&mut manager, at(230.0), 6);
        assert_eq!(report.lod_changes, 1);
        assert!(report.deferred >= 1);

        let entry = *manager.entry(&chunk).unwrap();
        assert_eq!(entry.lod, 1);
        assert_eq!(entry.source.atlas().unwrap().lod, 1);
    }

    #[test]
    fn test_lod_swap_moves_usage_and_rebinds() {
        let (mut manager, state) = manager(config(vec![200.0, 400.0, 800.0], 0.1, 64.0));
        let chunk = ChunkAddress::flat(0, 0);

        let before = add_ready(&mut manager, chunk, &Environment::at(DVec3::new(32.0, 0.0, 32.0)));
        settle(&mut manager, DVec3::new(32.0 + 600.0, 0.0, 32.0), 4);
        let after = *manager.entry(&chunk).unwrap();

        assert_eq!(after.lod, 2);
        assert_eq!(after.material, before.material);
        assert_ne!(after.geometry, before.geometry);

        let old_atlas = before.source.atlas().unwrap();
        let new_atlas = after.source.atlas().unwrap();
        assert_eq!(manager.cache().dependent_count(&old_atlas), 0);
        assert_eq!(manager.cache().dependent_count(&new_atlas), 1);

        let ledger = state.ledger();
        assert!(ledger.rebinds.contains(&(before.material, 2)));
        assert!(ledger.double_releases().is_empty());
    }

    #[test]
    fn test_edge_mask_follows_neighbor_lod() {
        // Wide chunks so adjacent chunks can sit two LODs apart
        let (mut manager, _state) = manager(config(vec![100.0, 200.0, 300.0], 0.0, 200.0));
        let a = ChunkAddress::flat(0, 0); // center x = 100
        let b = ChunkAddress::flat(1, 0); // center x = 300

        let env = Environment::at(DVec3::new(200.0, 0.0, 100.0));
        let entry_a = add_ready(&mut manager, a, &env);
        let entry_b = add_ready(&mut manager, b, &env);
        assert_eq!((entry_a.lod, entry_b.lod), (1, 1));
        settle(&mut manager, env.camera_position, 2);
        assert!(!manager.entry(&a).unwrap().edge_mask.contains(EdgeMask::RIGHT));

        // A stays at LOD 1 (distance 150), B drops to LOD 3 (distance 350)
        settle(&mut manager, DVec3::new(-50.0, 0.0, 100.0), 6);
        assert_eq!(manager.entry(&a).unwrap().lod, 1);
        assert_eq!(manager.entry(&b).unwrap().lod, 3);
        assert!(manager.entry(&a).unwrap().edge_mask.contains(EdgeMask::RIGHT));
        assert!(!manager.entry(&b).unwrap().edge_mask.contains(EdgeMask::LEFT));
    }

    #[test]
    fn test_off_face_neighbors_ignored() {
        let mut config = config(vec![100.0, 200.0, 300.0], 0.1, 64.0);
        config.sphere = Some(SphereConfig {
            radius: 1000.0,
            chunks_per_face: 4,
        });
        let (manager, _state) = manager(config);

        // Camera at the center: every neighbor estimates to LOD 3
        let corner = ChunkAddress::spherical(0, 0, 0, 0);
        let mask = manager.edge_mask_for(&corner, 0);
        assert_eq!(mask.bits(), EdgeMask::RIGHT.bits() | EdgeMask::TOP.bits());

        let inner = ChunkAddress::spherical(0, 1, 1, 0);
        assert_eq!(manager.edge_mask_for(&inner, 0), EdgeMask::ALL);
    }

    #[test]
    fn test_mutation_limit_spreads_work() {
        let mut config = config(vec![200.0, 400.0, 800.0], 0.1, 64.0);
        config.update.max_mutations_per_pass = 1;
        let (mut manager, _state) = manager(config);

        let env = Environment::default();
        let chunks: Vec<_> = (0..3).map(|x| ChunkAddress::flat(x * 3, 0)).collect();
        for chunk in &chunks {
            add_ready(&mut manager, *chunk, &env);
        }

        // Everything far away: all three want LOD 3
        let camera = DVec3::new(5000.0, 0.0, 0.0);
        let mut passes = 0;
        while manager.entries().any(|e| e.lod != 3) && passes < 30 {
            let report = manager.update_lods(camera, BUDGET);
            assert!(report.mutations() <= 1);
            assert!(report.processed <= manager.live_count());
            manager.wait_for_pending(WAIT);
            passes += 1;
        }
        assert!(manager.entries().all(|e| e.lod == 3));
        assert!(passes >= 3);
    }

    #[test]
    fn test_zero_budget_processes_nothing() {
        let (mut manager, _state) = manager(config(vec![200.0, 400.0, 800.0], 0.1, 64.0));
        add_ready(&mut manager, ChunkAddress::flat(0, 0), &Environment::default());

        let report = manager.update_lods(DVec3::new(5000.0, 0.0, 0.0), Duration::ZERO);
        assert_eq!(report.processed, 0);
        assert!(!report.completed);
    }

    #[test]
    fn test_readded_chunk_queued_once() {
        let (mut manager, _state) = manager(config(vec![200.0, 400.0, 800.0], 0.1, 64.0));
        let env = Environment::default();
        let a = ChunkAddress::flat(0, 0);
        let b = ChunkAddress::flat(1, 0);
        add_ready(&mut manager, a, &env);
        add_ready(&mut manager, b, &env);

        for _ in 0..3 {
            assert!(manager.remove_chunk(&a));
            add_ready(&mut manager, a, &env);
        }
        assert_eq!(manager.update_queue.len(), 2);
        assert_eq!(manager.queued.len(), 2);

        // The pass reclaims the slot of a removed chunk
        manager.remove_chunk(&b);
        assert!(manager.update_lods(DVec3::ZERO, BUDGET).completed);
        assert_eq!(manager.update_queue.len(), 1);
        assert!(!manager.queued.contains(&b));
    }

    #[test]
    fn test_pass_visits_each_chunk_once() {
        let (mut manager, _state) = manager(config(vec![200.0, 400.0, 800.0], 0.1, 64.0));
        let env = Environment::default();
        for x in 0..4 {
            for y in 0..4 {
                add_ready(&mut manager, ChunkAddress::flat(x, y), &env);
            }
        }

        let report = manager.update_lods(DVec3::ZERO, BUDGET);
        assert!(report.completed);
        assert!(report.processed <= 16);

        manager.remove_chunk(&ChunkAddress::flat(0, 0));
        let report = manager.update_lods(DVec3::ZERO, BUDGET);
        assert!(report.completed);
        assert_eq!(report.processed, 15);
    }
}
