//! Atlas dependent bookkeeping
//!
//! Records which chunks currently sample each atlas tier. This is advisory
//! only: it biases eviction towards atlases nobody renders from, it does not
//! keep anything alive.

use std::collections::{HashMap, HashSet};

use crate::streaming::address::ChunkAddress;
use crate::streaming::atlas::AtlasKey;

/// Atlas tier -> chunks depending on it
#[derive(Default, Debug)]
pub struct AtlasUsage {
    dependents: HashMap<AtlasKey, HashSet<ChunkAddress>>,
}

impl AtlasUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `chunk` as a dependent of `atlas`
    ///
    /// Returns true if the chunk was not tracked before.
    pub fn track(&mut self, atlas: AtlasKey, chunk: ChunkAddress) -> bool {
        self.dependents.entry(atlas).or_default().insert(chunk)
    }

    /// Drop `chunk` from the dependents of `atlas`
    ///
    /// Returns true if it was tracked. When the last dependent goes away the
    /// atlas only becomes an ordinary eviction candidate, nothing is freed.
    pub fn release(&mut self, atlas: &AtlasKey, chunk: &ChunkAddress) -> bool {
        let Some(set) = self.dependents.get_mut(atlas) else {
            return false;
        };

        let removed = set.remove(chunk);
        if set.is_empty() {
            self.dependents.remove(atlas);
            log::debug!("Atlas {} has no dependents left, eligible for eviction", atlas);
        }
        removed
    }

    pub fn dependent_count(&self, atlas: &AtlasKey) -> usize {
        self.dependents.get(atlas).map_or(0, HashSet::len)
    }

    pub fn dependents(&self, atlas: &AtlasKey) -> impl Iterator<Item = &ChunkAddress> + '_ {
        self.dependents.get(atlas).into_iter().flatten()
    }

    /// Forget every dependent of `atlas`, returning them
    pub fn take(&mut self, atlas: &AtlasKey) -> Vec<ChunkAddress> {
        self.dependents
            .remove(atlas)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Number of atlases with at least one dependent
    pub fn tracked_atlases(&self) -> usize {
        self.dependents.len()
    }

    pub fn clear(&mut self) {
        self.dependents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::atlas::{AtlasAddress, AtlasConfig};

    fn atlas_key(x: i32, lod: u32) -> AtlasKey {
        let config = AtlasConfig::default();
        AtlasKey::new(AtlasAddress::new(x, 0, None, &config), lod)
    }

    #[test]
    fn test_track_and_release() {
        let mut usage = AtlasUsage::new();
        let atlas = atlas_key(0, 0);

        assert!(usage.track(atlas, ChunkAddress::flat(0, 0)));
        assert!(usage.track(atlas, ChunkAddress::flat(1, 0)));
        assert!(!usage.track(atlas, ChunkAddress::flat(1, 0)));
        assert_eq!(usage.dependent_count(&atlas), 2);

        assert!(usage.release(&atlas, &ChunkAddress::flat(0, 0)));
        assert!(!usage.release(&atlas, &ChunkAddress::flat(0, 0)));
        assert_eq!(usage.dependent_count(&atlas), 1);

        assert!(usage.release(&atlas, &ChunkAddress::flat(1, 0)));
        assert_eq!(usage.dependent_count(&atlas), 0);
        assert_eq!(usage.tracked_atlases(), 0);
    }

    #[test]
    fn test_lod_tiers_tracked_separately() {
        let mut usage = AtlasUsage::new();
        usage.track(atlas_key(0, 0), ChunkAddress::flat(0, 0));
        usage.track(atlas_key(0, 1), ChunkAddress::flat(0, 0));

        assert_eq!(usage.tracked_atlases(), 2);
        usage.release(&atlas_key(0, 0), &ChunkAddress::flat(0, 0));
        assert_eq!(usage.dependent_count(&atlas_key(0, 1)), 1);
    }

    #[test]
    fn test_take_dependents() {
        let mut usage = AtlasUsage::new();
        let atlas = atlas_key(2, 0);
        usage.track(atlas, ChunkAddress::flat(32, 0));
        usage.track(atlas, ChunkAddress::flat(33, 0));

        let mut taken = usage.take(&atlas);
        taken.sort();
        assert_eq!(taken, vec![ChunkAddress::flat(32, 0), ChunkAddress::flat(33, 0)]);
        assert_eq!(usage.dependent_count(&atlas), 0);
        assert!(usage.take(&atlas).is_empty());
    }

    #[test]
    fn test_release_unknown_atlas() {
        let mut usage = AtlasUsage::new();
        assert!(!usage.release(&atlas_key(9, 0), &ChunkAddress::flat(0, 0)));
    }
}
