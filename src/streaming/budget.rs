//! Memory budget accounting for resident rasters
//!
//! Tracks bytes held by the raster cache against a hard maximum and
//! exposes the hysteresis target eviction drains down to.

/// Default fraction of the budget eviction drains to
pub const DEFAULT_EVICTION_TARGET: f64 = 0.8;

/// Byte budget with an eviction hysteresis band
///
/// Eviction starts once usage exceeds `max_bytes` and stops once usage
/// falls to `max_bytes * eviction_target`, so one allocation past the limit
/// does not cause an evict/recreate cycle on every following allocation.
#[derive(Clone, Debug)]
pub struct ByteBudget {
    /// Hard maximum (bytes)
    max_bytes: u64,
    /// Currently resident (bytes)
    used_bytes: u64,
    /// Fraction of `max_bytes` eviction drains to
    eviction_target: f64,
}

impl ByteBudget {
    /// Create a new budget
    ///
    /// # Arguments
    /// * `max_bytes` - Hard maximum of resident bytes
    /// * `eviction_target` - Fraction of `max_bytes` to drain to, clamped to (0, 1]
    pub fn new(max_bytes: u64, eviction_target: f64) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
            eviction_target: eviction_target.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Create a budget from megabytes with the default eviction target
    pub fn from_mb(max_mb: u64) -> Self {
        Self::new(max_mb * 1024 * 1024, DEFAULT_EVICTION_TARGET)
    }

    // --- Tracking methods ---

    pub fn add(&mut self, bytes: u64) {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
    }

    pub fn remove(&mut self, bytes: u64) {
        self.used_bytes = self.used_bytes.saturating_sub(bytes);
    }

    // --- Query methods ---

    pub fn used(&self) -> u64 {
        self.used_bytes
    }

    pub fn max(&self) -> u64 {
        self.max_bytes
    }

    pub fn available(&self) -> u64 {
        self.max_bytes.saturating_sub(self.used_bytes)
    }

    /// Usage relative to the maximum (0.0 to 1.0+)
    pub fn pressure(&self) -> f32 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f32 / self.max_bytes as f32
    }

    /// Byte count eviction drains down to
    pub fn target(&self) -> u64 {
        (self.max_bytes as f64 * self.eviction_target) as u64
    }

    // --- Decision methods ---

    /// Usage exceeds the hard maximum
    pub fn over_budget(&self) -> bool {
        self.used_bytes > self.max_bytes
    }

    /// Usage is still above the eviction target
    pub fn above_target(&self) -> bool {
        self.used_bytes > self.target()
    }
}
