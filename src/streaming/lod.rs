//! Level of Detail (LOD) selection and seam masks
//!
//! LOD is chosen from the distance between the camera and a chunk's center.
//! Distances are compared against an ascending threshold table: LOD 0 is used
//! below the first threshold, LOD 1 below the second, and so on.
//!
//! Once a chunk has a LOD, changes go through a hysteresis band so a camera
//! resting near a threshold does not flip the chunk back and forth.

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{DVec2, DVec3, Result};
use crate::math::cube_sphere::face_uv_to_sphere;
use crate::streaming::address::ChunkAddress;

/// Default LOD thresholds in world units
/// - LOD 0: 0-256
/// - LOD 1: 256-512
/// - LOD 2: 512-1024
/// - LOD 3: 1024-2048
/// - LOD 4: 2048+
pub const DEFAULT_LOD_DISTANCES: [f64; 4] = [256.0, 512.0, 1024.0, 2048.0];

/// Default fraction a distance must clear a threshold by before LOD changes
pub const DEFAULT_HYSTERESIS: f64 = 0.1;

/// Configuration for LOD behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Ascending distance thresholds, one per LOD transition
    pub distances: Vec<f64>,
    /// Hysteresis margin as a fraction of the crossed threshold
    pub hysteresis: f64,
    /// World-space edge length of a flat chunk
    pub chunk_world_size: f64,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            distances: DEFAULT_LOD_DISTANCES.to_vec(),
            hysteresis: DEFAULT_HYSTERESIS,
            chunk_world_size: 128.0,
        }
    }
}

impl LodConfig {
    pub fn validate(&self) -> Result<()> {
        if self.distances.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return Err(Error::Config(format!(
                "LOD distances must be positive and finite: {:?}",
                self.distances
            )));
        }
        if self.distances.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(format!(
                "LOD distances must be strictly ascending: {:?}",
                self.distances
            )));
        }
        if !(0.0..1.0).contains(&self.hysteresis) {
            return Err(Error::Config(format!(
                "LOD hysteresis {} must be in [0, 1)",
                self.hysteresis
            )));
        }
        if !(self.chunk_world_size > 0.0) {
            return Err(Error::Config(format!(
                "chunk world size {} must be positive",
                self.chunk_world_size
            )));
        }
        Ok(())
    }

    /// Coarsest LOD the distance table can produce
    pub fn max_lod(&self) -> u32 {
        self.distances.len() as u32
    }

    /// Calculate LOD level from distance
    ///
    /// # Examples
    /// ```
    /// use terrastream::streaming::lod::LodConfig;
    ///
    /// let config = LodConfig::default();
    /// assert_eq!(config.lod_from_distance(100.0), 0);
    /// assert_eq!(config.lod_from_distance(256.0), 1);
    /// assert_eq!(config.lod_from_distance(1500.0), 3);
    /// assert_eq!(config.lod_from_distance(1.0e9), 4);
    /// ```
    pub fn lod_from_distance(&self, distance: f64) -> u32 {
        self.distances
            .iter()
            .position(|&threshold| distance < threshold)
            .unwrap_or(self.distances.len()) as u32
    }

    /// LOD for `distance` given the LOD the chunk currently renders at
    ///
    /// Moving outward, the distance has to pass a threshold by the margin
    /// before the chunk coarsens; moving inward, it has to fall below the
    /// threshold by the margin before the chunk refines.
    ///
    /// # Examples
    /// ```
    /// use terrastream::streaming::lod::LodConfig;
    ///
    /// let config = LodConfig::default(); // first threshold at 256, 10% margin
    /// assert_eq!(config.lod_with_hysteresis(270.0, 0), 0);
    /// assert_eq!(config.lod_with_hysteresis(290.0, 0), 1);
    /// assert_eq!(config.lod_with_hysteresis(240.0, 1), 1);
    /// assert_eq!(config.lod_with_hysteresis(220.0, 1), 0);
    /// ```
    pub fn lod_with_hysteresis(&self, distance: f64, current: u32) -> u32 {
        let raw = self.lod_from_distance(distance);

        if raw > current {
            let coarser = self.lod_from_distance(distance / (1.0 + self.hysteresis));
            if coarser > current { coarser } else { current }
        } else if raw < current {
            let finer = self.lod_from_distance(distance / (1.0 - self.hysteresis));
            if finer < current { finer } else { current }
        } else {
            current
        }
    }
}

/// Cube-sphere placement of spherical chunks
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SphereConfig {
    /// Sphere radius in world units
    pub radius: f64,
    /// Chunks along one edge of a cube face
    pub chunks_per_face: u32,
}

impl SphereConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.radius > 0.0) || self.chunks_per_face == 0 {
            return Err(Error::Config(format!(
                "sphere radius {} and chunks per face {} must be positive",
                self.radius, self.chunks_per_face
            )));
        }
        Ok(())
    }

    /// Whether a grid cell lies on its face
    pub fn on_face(&self, x: i32, y: i32) -> bool {
        let n = self.chunks_per_face as i32;
        (0..n).contains(&x) && (0..n).contains(&y)
    }
}

/// World-space center of a chunk
///
/// Flat chunks sit on the XZ plane. Spherical chunks are projected from
/// their face UV onto the sphere; without a sphere they are laid out flat.
pub fn chunk_center(chunk: &ChunkAddress, chunk_world_size: f64, sphere: Option<&SphereConfig>) -> DVec3 {
    match (chunk.face(), sphere) {
        (Some(face), Some(sphere)) => {
            let n = sphere.chunks_per_face.max(1) as f64;
            let uv = DVec2::new((chunk.x() as f64 + 0.5) / n, (chunk.y() as f64 + 0.5) / n);
            face_uv_to_sphere(face, uv, sphere.radius)
        }
        _ => DVec3::new(
            (chunk.x() as f64 + 0.5) * chunk_world_size,
            0.0,
            (chunk.y() as f64 + 0.5) * chunk_world_size,
        ),
    }
}

/// Distance used for LOD selection
///
/// Flat chunks ignore camera altitude; spherical chunks use the straight-line
/// distance to their projected center.
pub fn chunk_distance(
    camera: DVec3,
    chunk: &ChunkAddress,
    chunk_world_size: f64,
    sphere: Option<&SphereConfig>,
) -> f64 {
    let center = chunk_center(chunk, chunk_world_size, sphere);
    if chunk.is_spherical() && sphere.is_some() {
        camera.distance(center)
    } else {
        DVec2::new(camera.x, camera.z).distance(DVec2::new(center.x, center.z))
    }
}

/// Four-bit mask of edges bordering a coarser neighbor
///
/// Geometry builders fold the border vertices on every set edge so they
/// line up with the coarser neighbor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeMask(u8);

impl EdgeMask {
    pub const NONE: EdgeMask = EdgeMask(0);
    /// -X neighbor
    pub const LEFT: EdgeMask = EdgeMask(1);
    /// +X neighbor
    pub const RIGHT: EdgeMask = EdgeMask(2);
    /// -Y neighbor
    pub const BOTTOM: EdgeMask = EdgeMask(4);
    /// +Y neighbor
    pub const TOP: EdgeMask = EdgeMask(8);

    pub const ALL: EdgeMask = EdgeMask(0b1111);

    pub fn from_bits(bits: u8) -> Self {
        EdgeMask(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: EdgeMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EdgeMask) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Neighbor offsets paired with the edge they border, in mask bit order
pub const NEIGHBOR_EDGES: [(i32, i32, EdgeMask); 4] = [
    (-1, 0, EdgeMask::LEFT),
    (1, 0, EdgeMask::RIGHT),
    (0, -1, EdgeMask::BOTTOM),
    (0, 1, EdgeMask::TOP),
];

/// Edge mask for a chunk at `lod` given its neighbors' LODs
///
/// `neighbors` follows [`NEIGHBOR_EDGES`]; `None` means no neighbor is
/// known on that side and leaves the edge untouched.
pub fn compute_edge_mask(lod: u32, neighbors: [Option<u32>; 4]) -> EdgeMask {
    let mut mask = EdgeMask::NONE;
    for ((_, _, edge), neighbor) in NEIGHBOR_EDGES.iter().zip(neighbors) {
        if neighbor.is_some_and(|n| n > lod) {
            mask.insert(*edge);
        }
    }
    mask
}
