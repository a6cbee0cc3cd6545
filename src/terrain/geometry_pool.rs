//! Shared chunk geometry
//!
//! With instancing enabled, chunks that agree on LOD, chunk size and edge
//! mask render the same flat grid, displaced by their own height raster.
//! The pool owns those grids and counts the chunks using each one.

use std::collections::HashMap;

use crate::core::types::Result;
use crate::streaming::lod::EdgeMask;
use crate::terrain::backend::GeometryHandle;

/// Identity of a shareable grid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryKey {
    pub lod: u32,
    pub chunk_size: u32,
    pub edge_mask: EdgeMask,
}

/// Geometry as referenced by a mesh entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryRef {
    /// Borrowed from the pool
    Shared { key: GeometryKey, handle: GeometryHandle },
    /// Owned by the entry
    Exclusive(GeometryHandle),
}

impl GeometryRef {
    pub fn handle(&self) -> GeometryHandle {
        match *self {
            GeometryRef::Shared { handle, .. } | GeometryRef::Exclusive(handle) => handle,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, GeometryRef::Shared { .. })
    }
}

#[derive(Debug)]
struct PoolEntry {
    handle: GeometryHandle,
    users: usize,
}

/// Reference-counted pool of shared grids
#[derive(Debug, Default)]
pub struct GeometryPool {
    entries: HashMap<GeometryKey, PoolEntry>,
}

impl GeometryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference to the grid for `key`, building it on first use
    pub fn acquire<F>(&mut self, key: GeometryKey, build: F) -> Result<GeometryRef>
    where
        F: FnOnce() -> Result<GeometryHandle>,
    {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.users += 1;
            return Ok(GeometryRef::Shared { key, handle: entry.handle });
        }

        let handle = build()?;
        self.entries.insert(key, PoolEntry { handle, users: 1 });
        Ok(GeometryRef::Shared { key, handle })
    }

    /// Drop one reference to `key`
    ///
    /// Returns the grid once nobody uses it any more; the caller disposes it.
    #[must_use = "an unused shared grid must be released"]
    pub fn release(&mut self, key: &GeometryKey) -> Option<GeometryHandle> {
        let entry = self.entries.get_mut(key)?;
        entry.users = entry.users.saturating_sub(1);
        if entry.users > 0 {
            return None;
        }
        self.entries.remove(key).map(|entry| entry.handle)
    }

    /// Remove every grid regardless of users
    #[must_use = "drained grids must be released"]
    pub fn drain(&mut self) -> Vec<GeometryHandle> {
        self.entries.drain().map(|(_, entry)| entry.handle).collect()
    }

    pub fn users(&self, key: &GeometryKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.users)
    }

    pub fn contains_handle(&self, handle: GeometryHandle) -> bool {
        self.entries.values().any(|entry| entry.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;

    fn key(lod: u32, edge_mask: EdgeMask) -> GeometryKey {
        GeometryKey { lod, chunk_size: 128, edge_mask }
    }

    #[test]
    fn test_acquire_builds_once() {
        let mut pool = GeometryPool::new();
        let mut builds = 0;

        for _ in 0..3 {
            let geometry = pool
                .acquire(key(2, EdgeMask::NONE), || {
                    builds += 1;
                    Ok(GeometryHandle(10))
                })
                .unwrap();
            assert!(geometry.is_shared());
            assert_eq!(geometry.handle(), GeometryHandle(10));
        }

        assert_eq!(builds, 1);
        assert_eq!(pool.users(&key(2, EdgeMask::NONE)), 3);
    }

    #[test]
    fn test_release_on_last_user() {
        let mut pool = GeometryPool::new();
        for _ in 0..3 {
            pool.acquire(key(2, EdgeMask::NONE), || Ok(GeometryHandle(10))).unwrap();
        }

        assert_eq!(pool.release(&key(2, EdgeMask::NONE)), None);
        assert_eq!(pool.release(&key(2, EdgeMask::NONE)), None);
        assert_eq!(pool.release(&key(2, EdgeMask::NONE)), Some(GeometryHandle(10)));
        assert_eq!(pool.release(&key(2, EdgeMask::NONE)), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_keys_differ_by_edge_mask() {
        let mut pool = GeometryPool::new();
        let a = pool.acquire(key(1, EdgeMask::NONE), || Ok(GeometryHandle(1))).unwrap();
        let b = pool.acquire(key(1, EdgeMask::RIGHT), || Ok(GeometryHandle(2))).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(pool.len(), 2);
        assert!(pool.contains_handle(GeometryHandle(2)));
    }

    #[test]
    fn test_failed_build_registers_nothing() {
        let mut pool = GeometryPool::new();
        let result = pool.acquire(key(0, EdgeMask::NONE), || Err(Error::Backend("out of memory".to_string())));
        assert!(result.is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_drain() {
        let mut pool = GeometryPool::new();
        pool.acquire(key(0, EdgeMask::NONE), || Ok(GeometryHandle(1))).unwrap();
        pool.acquire(key(0, EdgeMask::NONE), || Ok(GeometryHandle(1))).unwrap();
        pool.acquire(key(1, EdgeMask::NONE), || Ok(GeometryHandle(2))).unwrap();

        let mut drained = pool.drain();
        drained.sort();
        assert_eq!(drained, vec![GeometryHandle(1), GeometryHandle(2)]);
        assert!(pool.is_empty());
    }
}
