//! Terrastream - chunk-to-atlas terrain raster streaming and LOD mesh lifecycle

pub mod core;
pub mod math;
pub mod streaming;
pub mod terrain;
