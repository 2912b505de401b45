//! Semantic conversation routing
//!
//! Classifies user utterances into named routes by embedding similarity to
//! example utterances, and trains route thresholds from labelled samples.

pub mod encoder;
pub mod layer;
pub mod trainer;

use crate::core::provider::ProviderError;
use thiserror::Error;

pub use layer::RouteLayer;

/// Error types for routing operations
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Failed to read or write layer file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid layer JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoder failed: {0}")]
    Encoder(#[from] ProviderError),

    #[error("Invalid route layer: {0}")]
    InvalidLayer(String),
}
