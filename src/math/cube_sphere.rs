//! Cube-sphere projection
//!
//! A spherical world is split into six cube faces. A location on a face is
//! given as a UV coordinate in `[0, 1]^2`. Projecting onto the sphere maps the
//! UV onto the face of the unit cube, normalizes the resulting point and
//! scales it by the sphere radius.

use crate::core::types::{DVec2, DVec3};

/// Number of cube faces
pub const FACE_COUNT: u8 = 6;

/// Map a face UV in `[0, 1]^2` onto the surface of the unit cube `[-1, 1]^3`.
///
/// Face order: +X, -X, +Y, -Y, +Z, -Z. Faces outside `0..6` fall back to +X.
pub fn face_uv_to_cube(face: u8, uv: DVec2) -> DVec3 {
    let s = uv.x * 2.0 - 1.0;
    let t = uv.y * 2.0 - 1.0;

    match face {
        1 => DVec3::new(-1.0, t, s),
        2 => DVec3::new(s, 1.0, -t),
        3 => DVec3::new(s, -1.0, t),
        4 => DVec3::new(s, t, 1.0),
        5 => DVec3::new(-s, t, -1.0),
        _ => DVec3::new(1.0, t, -s),
    }
}

/// Project a face UV onto a sphere of the given radius centered at the origin.
pub fn face_uv_to_sphere(face: u8, uv: DVec2, radius: f64) -> DVec3 {
    face_uv_to_cube(face, uv).normalize() * radius
}
