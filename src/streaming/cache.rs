//! Budgeted cache of GPU raster handles
//!
//! Maps `(identity, channel)` to a raster handle, where the identity is either
//! an atlas tier or a single chunk. The cache is the sole owner of the handles
//! it stores: every entry that leaves it (overwrite, removal, eviction) is
//! handed back to the caller exactly once so the GPU resource can be released.
//!
//! Eviction is budget-triggered. Once resident bytes exceed the maximum,
//! entries are dropped in ascending priority order until usage is back at the
//! eviction target. Priority is the access tick plus a large bonus per active
//! dependent chunk, so atlases that are still rendered from go last.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::streaming::address::ChunkAddress;
use crate::streaming::atlas::{AtlasKey, RasterChannel};
use crate::streaming::budget::ByteBudget;
use crate::streaming::usage::AtlasUsage;

/// Default priority bonus per active dependent
pub const DEFAULT_DEPENDENT_WEIGHT: f64 = 1.0e9;

/// Opaque GPU raster handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RasterHandle(pub u64);

/// What a cached raster belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RasterIdentity {
    /// One LOD tier of a shared atlas
    Atlas(AtlasKey),
    /// Raster dedicated to a single chunk
    Chunk(ChunkAddress),
}

impl fmt::Display for RasterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterIdentity::Atlas(key) => write!(f, "{}", key),
            RasterIdentity::Chunk(chunk) => write!(f, "chunk:{}", chunk),
        }
    }
}

/// A resident raster
#[derive(Clone, Debug, PartialEq)]
pub struct RasterEntry {
    pub handle: RasterHandle,
    pub size_bytes: u64,
    /// Cache tick of the last successful `get`
    pub last_access: u64,
    /// Cache tick of insertion
    pub created: u64,
    pub identity: RasterIdentity,
    pub channel: RasterChannel,
    /// Whether the raster can be regenerated cheaply after eviction
    pub reconstructible: bool,
}

impl RasterEntry {
    pub fn is_atlas(&self) -> bool {
        matches!(self.identity, RasterIdentity::Atlas(_))
    }
}

/// Lookup counters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheCounters {
    /// Fraction of lookups that hit, 1.0 before the first lookup
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

/// Budgeted raster cache with usage-aware eviction
pub struct RasterCache {
    entries: HashMap<(RasterIdentity, RasterChannel), RasterEntry>,
    usage: AtlasUsage,
    budget: ByteBudget,
    dependent_weight: f64,
    /// Monotonic access clock
    tick: u64,
    counters: CacheCounters,
}

impl RasterCache {
    /// Create a new raster cache
    ///
    /// # Arguments
    /// * `max_bytes` - Hard maximum of resident bytes
    /// * `eviction_target` - Fraction of `max_bytes` eviction drains to
    /// * `dependent_weight` - Priority bonus per active dependent chunk
    pub fn new(max_bytes: u64, eviction_target: f64, dependent_weight: f64) -> Self {
        Self {
            entries: HashMap::new(),
            usage: AtlasUsage::new(),
            budget: ByteBudget::new(max_bytes, eviction_target),
            dependent_weight,
            tick: 0,
            counters: CacheCounters::default(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a raster, refreshing its recency on a hit
    pub fn get(&mut self, identity: &RasterIdentity, channel: RasterChannel) -> Option<RasterHandle> {
        let tick = self.next_tick();
        match self.entries.get_mut(&(*identity, channel)) {
            Some(entry) => {
                entry.last_access = tick;
                self.counters.hits += 1;
                Some(entry.handle)
            }
            None => {
                self.counters.misses += 1;
                None
            }
        }
    }

    /// Look up a raster without touching recency or counters
    pub fn peek(&self, identity: &RasterIdentity, channel: RasterChannel) -> Option<&RasterEntry> {
        self.entries.get(&(*identity, channel))
    }

    pub fn has(&self, identity: &RasterIdentity, channel: RasterChannel) -> bool {
        self.entries.contains_key(&(*identity, channel))
    }

    /// Whether every listed channel of `identity` is resident
    pub fn has_all(&self, identity: &RasterIdentity, channels: &[RasterChannel]) -> bool {
        channels.iter().all(|&channel| self.has(identity, channel))
    }

    /// Insert a raster
    ///
    /// Returns every entry displaced by this call: the previous raster stored
    /// under the same key (unless it is the very same handle) and anything
    /// evicted to get back under budget. The caller must release them.
    #[must_use = "displaced rasters must be released"]
    pub fn put(
        &mut self,
        identity: RasterIdentity,
        channel: RasterChannel,
        handle: RasterHandle,
        size_bytes: u64,
        reconstructible: bool,
    ) -> Vec<RasterEntry> {
        let tick = self.next_tick();
        let mut displaced = Vec::new();

        if let Some(old) = self.entries.remove(&(identity, channel)) {
            self.budget.remove(old.size_bytes);
            if old.handle != handle {
                displaced.push(old);
            }
        }

        self.entries.insert(
            (identity, channel),
            RasterEntry {
                handle,
                size_bytes,
                last_access: tick,
                created: tick,
                identity,
                channel,
                reconstructible,
            },
        );
        self.budget.add(size_bytes);

        displaced.extend(self.evict_to_budget());
        displaced
    }

    /// Remove every channel stored for `identity`
    #[must_use = "removed rasters must be released"]
    pub fn remove(&mut self, identity: &RasterIdentity) -> Vec<RasterEntry> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|(id, _)| id == identity)
            .copied()
            .collect();

        keys.into_iter()
            .filter_map(|key| self.take_entry(&key))
            .collect()
    }

    fn take_entry(&mut self, key: &(RasterIdentity, RasterChannel)) -> Option<RasterEntry> {
        let entry = self.entries.remove(key)?;
        self.budget.remove(entry.size_bytes);
        Some(entry)
    }

    /// Eviction priority, lower is evicted first
    pub fn eviction_priority(&self, entry: &RasterEntry) -> f64 {
        let dependents = match &entry.identity {
            RasterIdentity::Atlas(key) => self.usage.dependent_count(key),
            RasterIdentity::Chunk(_) => 0,
        };
        entry.last_access as f64 + self.dependent_weight * dependents as f64
    }

    /// Evict lowest-priority entries once over budget, down to the target
    ///
    /// Entries that are still depended on, or cannot be regenerated, are
    /// evicted anyway when the budget demands it; this is logged.
    #[must_use = "evicted rasters must be released"]
    pub fn evict_to_budget(&mut self) -> Vec<RasterEntry> {
        if !self.budget.over_budget() {
            return Vec::new();
        }

        let mut candidates: Vec<((RasterIdentity, RasterChannel), f64)> = self
            .entries
            .iter()
            .map(|(key, entry)| (*key, self.eviction_priority(entry)))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let before = self.budget.used();
        let mut evicted = Vec::new();

        for (key, _priority) in candidates {
            if !self.budget.above_target() {
                break;
            }
            let Some(entry) = self.take_entry(&key) else {
                continue;
            };

            if let RasterIdentity::Atlas(atlas) = &entry.identity {
                let dependents = self.usage.dependent_count(atlas);
                if dependents > 0 {
                    log::warn!(
                        "Budget anomaly: evicting {} {} with {} active dependents",
                        entry.identity, entry.channel, dependents
                    );
                }
            }
            if !entry.reconstructible {
                log::warn!(
                    "Budget anomaly: evicting non-reconstructible raster {} {}",
                    entry.identity, entry.channel
                );
            }

            self.counters.evictions += 1;
            evicted.push(entry);
        }

        if !evicted.is_empty() {
            log::debug!(
                "Evicted {} rasters to enforce budget (usage: {} -> {}, target: {})",
                evicted.len(), before, self.budget.used(), self.budget.target()
            );
        }

        evicted
    }

    /// Record `chunk` as depending on `atlas`
    pub fn track_usage(&mut self, atlas: AtlasKey, chunk: ChunkAddress) -> bool {
        self.usage.track(atlas, chunk)
    }

    /// Drop `chunk` from the dependents of `atlas`
    pub fn release_usage(&mut self, atlas: &AtlasKey, chunk: &ChunkAddress) -> bool {
        self.usage.release(atlas, chunk)
    }

    pub fn dependent_count(&self, atlas: &AtlasKey) -> usize {
        self.usage.dependent_count(atlas)
    }

    pub fn usage(&self) -> &AtlasUsage {
        &self.usage
    }

    /// Drop every entry and all usage records
    #[must_use = "cleared rasters must be released"]
    pub fn clear(&mut self) -> Vec<RasterEntry> {
        self.usage.clear();
        let entries: Vec<RasterEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            self.budget.remove(entry.size_bytes);
        }
        entries
    }

    pub fn resident_bytes(&self) -> u64 {
        self.budget.used()
    }

    pub fn max_bytes(&self) -> u64 {
        self.budget.max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct atlas tiers with at least one resident channel
    pub fn atlas_count(&self) -> usize {
        self.entries
            .keys()
            .filter_map(|(identity, _)| match identity {
                RasterIdentity::Atlas(key) => Some(*key),
                RasterIdentity::Chunk(_) => None,
            })
            .collect::<HashSet<_>>()
            .len()
    }

    /// Distinct chunks with at least one dedicated raster
    pub fn chunk_count(&self) -> usize {
        self.entries
            .keys()
            .filter_map(|(identity, _)| match identity {
                RasterIdentity::Chunk(chunk) => Some(*chunk),
                RasterIdentity::Atlas(_) => None,
            })
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters
    }

    pub fn hit_rate(&self) -> f32 {
        self.counters.hit_rate()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RasterEntry> + '_ {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::atlas::{AtlasAddress, AtlasConfig};

    fn atlas(x: i32) -> RasterIdentity {
        let config = AtlasConfig::default();
        RasterIdentity::Atlas(AtlasKey::new(AtlasAddress::new(x, 0, None, &config), 0))
    }

    fn atlas_key(x: i32) -> AtlasKey {
        match atlas(x) {
            RasterIdentity::Atlas(key) => key,
            RasterIdentity::Chunk(_) => unreachable!(),
        }
    }

    fn summed_bytes(cache: &RasterCache) -> u64 {
        cache.entries().map(|e| e.size_bytes).sum()
    }

    #[test]
    fn test_cache_put_and_get() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let displaced = cache.put(atlas(0), RasterChannel::Height, RasterHandle(1), 100, true);
        assert!(displaced.is_empty());

        assert_eq!(cache.get(&atlas(0), RasterChannel::Height), Some(RasterHandle(1)));
        assert_eq!(cache.get(&atlas(0), RasterChannel::Normal), None);
        assert!(cache.has(&atlas(0), RasterChannel::Height));
        assert_eq!(cache.resident_bytes(), 100);
        assert_eq!(cache.hit_rate(), 0.5);
    }

    #[test]
    fn test_cache_get_refreshes_recency() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(1), 100, true);
        let created = cache.peek(&atlas(0), RasterChannel::Height).unwrap().last_access;

        cache.get(&atlas(0), RasterChannel::Height);
        let entry = cache.peek(&atlas(0), RasterChannel::Height).unwrap();
        assert!(entry.last_access > created);
        assert_eq!(entry.created, created);
    }

    #[test]
    fn test_cache_overwrite_returns_old_handle() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(1), 100, true);

        let displaced = cache.put(atlas(0), RasterChannel::Height, RasterHandle(2), 300, true);
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].handle, RasterHandle(1));
        assert_eq!(cache.resident_bytes(), 300);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_overwrite_with_same_handle() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(7), 100, true);
        let displaced = cache.put(atlas(0), RasterChannel::Height, RasterHandle(7), 150, true);
        assert!(displaced.is_empty());
        assert_eq!(cache.resident_bytes(), 150);
    }

    #[test]
    fn test_cache_remove_all_channels() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(1), 100, true);
        let _ = cache.put(atlas(0), RasterChannel::Normal, RasterHandle(2), 100, true);
        let _ = cache.put(atlas(1), RasterChannel::Height, RasterHandle(3), 100, true);

        let mut removed: Vec<_> = cache.remove(&atlas(0)).into_iter().map(|e| e.handle).collect();
        removed.sort();
        assert_eq!(removed, vec![RasterHandle(1), RasterHandle(2)]);
        assert_eq!(cache.resident_bytes(), 100);
        assert!(cache.remove(&atlas(0)).is_empty());
    }

    #[test]
    fn test_eviction_hysteresis() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        for i in 0..10 {
            let evicted = cache.put(atlas(i), RasterChannel::Height, RasterHandle(i as u64), 100, true);
            assert!(evicted.is_empty());
        }

        // 1100 bytes > 1000: drain down to 800
        let evicted = cache.put(atlas(10), RasterChannel::Height, RasterHandle(10), 100, true);
        let handles: Vec<_> = evicted.iter().map(|e| e.handle).collect();
        assert_eq!(handles, vec![RasterHandle(0), RasterHandle(1), RasterHandle(2)]);
        assert_eq!(cache.resident_bytes(), 800);
        assert_eq!(cache.counters().evictions, 3);
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        // Drains to about 210 bytes once over 300
        let mut cache = RasterCache::new(300, 0.7, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(0), 100, true);
        let _ = cache.put(atlas(1), RasterChannel::Height, RasterHandle(1), 100, true);
        let _ = cache.put(atlas(2), RasterChannel::Height, RasterHandle(2), 100, true);

        cache.get(&atlas(0), RasterChannel::Height);

        let evicted = cache.put(atlas(3), RasterChannel::Height, RasterHandle(3), 100, true);
        let handles: Vec<_> = evicted.iter().map(|e| e.handle).collect();
        assert_eq!(handles, vec![RasterHandle(1), RasterHandle(2)]);
        assert!(cache.has(&atlas(0), RasterChannel::Height));
        assert!(cache.has(&atlas(3), RasterChannel::Height));
        assert_eq!(cache.resident_bytes(), 200);
    }

    #[test]
    fn test_eviction_bias_towards_unused_atlases() {
        let mut cache = RasterCache::new(200, 0.5, DEFAULT_DEPENDENT_WEIGHT);

        // Older atlas with an active dependent
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(0), 100, true);
        cache.track_usage(atlas_key(0), ChunkAddress::flat(0, 0));
        // Newer atlas nobody depends on
        let _ = cache.put(atlas(1), RasterChannel::Height, RasterHandle(1), 100, true);

        let evicted = cache.put(atlas(2), RasterChannel::Height, RasterHandle(2), 100, true);
        let handles: Vec<_> = evicted.iter().map(|e| e.handle).collect();
        assert_eq!(handles, vec![RasterHandle(1), RasterHandle(2)]);
        assert!(cache.has(&atlas(0), RasterChannel::Height));
    }

    #[test]
    fn test_priority_equal_age_dependents_first_kept() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(0), 100, true);
        let _ = cache.put(atlas(1), RasterChannel::Height, RasterHandle(1), 100, true);
        cache.track_usage(atlas_key(1), ChunkAddress::flat(16, 0));

        let mut a = cache.peek(&atlas(0), RasterChannel::Height).unwrap().clone();
        let mut b = cache.peek(&atlas(1), RasterChannel::Height).unwrap().clone();
        a.last_access = 42;
        b.last_access = 42;
        assert!(cache.eviction_priority(&a) < cache.eviction_priority(&b));
    }

    #[test]
    fn test_chunk_entries_rank_by_recency_only() {
        let mut cache = RasterCache::new(1000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let chunk = RasterIdentity::Chunk(ChunkAddress::flat(3, 3));
        let _ = cache.put(chunk, RasterChannel::Height, RasterHandle(5), 100, false);
        let entry = cache.peek(&chunk, RasterChannel::Height).unwrap();
        assert_eq!(cache.eviction_priority(entry), entry.last_access as f64);
        assert!(!entry.is_atlas());
    }

    #[test]
    fn test_eviction_proceeds_for_dependents_and_non_reconstructible() {
        let mut cache = RasterCache::new(100, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(0), 100, false);
        cache.track_usage(atlas_key(0), ChunkAddress::flat(0, 0));

        let evicted = cache.put(atlas(1), RasterChannel::Height, RasterHandle(1), 100, true);
        // The unused atlas goes first, then the depended-on one to honor the budget
        assert_eq!(evicted.len(), 2);
        assert_eq!(cache.resident_bytes(), 0);
        assert!(cache.resident_bytes() <= cache.max_bytes());
    }

    #[test]
    fn test_budget_invariant_under_mixed_operations() {
        let mut cache = RasterCache::new(4096, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for step in 0..2000u64 {
            let x = (next() % 24) as i32;
            let channel = RasterChannel::ALL[(next() % 3) as usize];
            match next() % 5 {
                0 => {
                    let _ = cache.remove(&atlas(x));
                }
                1 => {
                    let _ = cache.evict_to_budget();
                }
                2 => {
                    cache.track_usage(atlas_key(x), ChunkAddress::flat(x * 16, 0));
                }
                _ => {
                    let size = 64 + next() % 512;
                    let _ = cache.put(atlas(x), channel, RasterHandle(step), size, true);
                }
            }
            assert!(cache.resident_bytes() <= cache.max_bytes(), "step {}", step);
            assert_eq!(cache.resident_bytes(), summed_bytes(&cache), "step {}", step);
        }
    }

    #[test]
    fn test_counts_and_clear() {
        let mut cache = RasterCache::new(10_000, 0.8, DEFAULT_DEPENDENT_WEIGHT);
        let _ = cache.put(atlas(0), RasterChannel::Height, RasterHandle(1), 100, true);
        let _ = cache.put(atlas(0), RasterChannel::Normal, RasterHandle(2), 100, true);
        let chunk = RasterIdentity::Chunk(ChunkAddress::flat(1, 1));
        let _ = cache.put(chunk, RasterChannel::Height, RasterHandle(3), 50, false);

        assert_eq!(cache.atlas_count(), 1);
        assert_eq!(cache.chunk_count(), 1);
        assert!(cache.has_all(&atlas(0), &[RasterChannel::Height, RasterChannel::Normal]));
        assert!(!cache.has_all(&chunk, &[RasterChannel::Height, RasterChannel::Normal]));

        let cleared = cache.clear();
        assert_eq!(cleared.len(), 3);
        assert_eq!(cache.resident_bytes(), 0);
        assert!(cache.is_empty());
    }
}
