//! Chunk addressing
//!
//! A chunk is either a cell of a flat world grid or a cell of one of the six
//! faces of a cube-sphere. Both variants share one canonical string form:
//! `"x,y"` for flat chunks and `"face:x,y:lod"` for spherical ones.

use std::fmt;
use std::str::FromStr;

use crate::core::error::Error;
use crate::math::cube_sphere::FACE_COUNT;

/// Integer address of a terrain chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkAddress {
    /// Chunk of a flat world
    Flat { x: i32, y: i32 },
    /// Chunk on a cube-sphere face
    Spherical { face: u8, x: i32, y: i32, lod: u32 },
}

impl ChunkAddress {
    /// Create a flat world address
    pub fn flat(x: i32, y: i32) -> Self {
        Self::Flat { x, y }
    }

    /// Create a cube-sphere address
    pub fn spherical(face: u8, x: i32, y: i32, lod: u32) -> Self {
        Self::Spherical { face, x, y, lod }
    }

    pub fn x(&self) -> i32 {
        match *self {
            Self::Flat { x, .. } | Self::Spherical { x, .. } => x,
        }
    }

    pub fn y(&self) -> i32 {
        match *self {
            Self::Flat { y, .. } | Self::Spherical { y, .. } => y,
        }
    }

    /// Cube face, `None` for flat worlds
    pub fn face(&self) -> Option<u8> {
        match *self {
            Self::Flat { .. } => None,
            Self::Spherical { face, .. } => Some(face),
        }
    }

    /// LOD carried by the address (always 0 for flat chunks)
    pub fn lod(&self) -> u32 {
        match *self {
            Self::Flat { .. } => 0,
            Self::Spherical { lod, .. } => lod,
        }
    }

    pub fn is_spherical(&self) -> bool {
        matches!(self, Self::Spherical { .. })
    }

    /// Same face and LOD, shifted by `(dx, dy)` grid cells
    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        match *self {
            Self::Flat { x, y } => Self::Flat { x: x + dx, y: y + dy },
            Self::Spherical { face, x, y, lod } => Self::Spherical { face, x: x + dx, y: y + dy, lod },
        }
    }

    /// Grid cell without the LOD component, used to find neighbors
    /// regardless of the LOD they were requested at.
    pub fn cell(&self) -> (Option<u8>, i32, i32) {
        (self.face(), self.x(), self.y())
    }

    /// Canonical string key
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Parse a canonical key
    pub fn parse(s: &str) -> Result<Self, Error> {
        s.parse()
    }
}

impl fmt::Display for ChunkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Flat { x, y } => write!(f, "{},{}", x, y),
            Self::Spherical { face, x, y, lod } => write!(f, "{}:{},{}:{}", face, x, y, lod),
        }
    }
}

impl FromStr for ChunkAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::Format(s.to_string());

        let parse_xy = |xy: &str| -> Result<(i32, i32), Error> {
            let (x, y) = xy.split_once(',').ok_or_else(malformed)?;
            let x = x.parse().map_err(|_| malformed())?;
            let y = y.parse().map_err(|_| malformed())?;
            Ok((x, y))
        };

        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [xy] => {
                let (x, y) = parse_xy(xy)?;
                Ok(Self::Flat { x, y })
            }
            [face, xy, lod] => {
                let face: u8 = face.parse().map_err(|_| malformed())?;
                if face >= FACE_COUNT {
                    return Err(malformed());
                }
                let (x, y) = parse_xy(xy)?;
                let lod = lod.parse().map_err(|_| malformed())?;
                Ok(Self::Spherical { face, x, y, lod })
            }
            _ => Err(malformed()),
        }
    }
}
