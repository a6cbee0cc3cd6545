//! Mathematical utilities

pub mod cube_sphere;

pub use cube_sphere::{FACE_COUNT, face_uv_to_cube, face_uv_to_sphere};
