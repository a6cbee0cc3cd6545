//! Error types for the streaming engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// A chunk address string could not be parsed
    #[error("Malformed chunk address: {0:?}")]
    Format(String),

    /// A raster, sample set or geometry is not resolvable yet
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// An async raster or material generation was rejected
    #[error("Generation failed for {key}: {reason}")]
    Generation { key: String, reason: String },

    /// Eviction had to reclaim an entry that is still in use
    #[error("Budget anomaly: {0}")]
    BudgetAnomaly(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
