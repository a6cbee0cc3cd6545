//! Core type aliases and re-exports

use std::future::Future;
use std::pin::Pin;

pub use glam::{DVec2, DVec3, Vec2, Vec3};

/// Standard Result type for the engine
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Boxed future handed out by async collaborators
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
