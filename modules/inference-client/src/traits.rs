use async_trait::async_trait;

use crate::error::InferenceError;
use crate::types::RawDetection;

/// Object detector over still-image bytes.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Vec<RawDetection>, InferenceError>;
    fn name(&self) -> &str;
}

/// Appearance-embedding extractor over crop bytes. All vectors from one
/// extractor share a single dimension; callers normalise if the engine does
/// not.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, crop: &[u8]) -> Result<Vec<f32>, InferenceError>;
    /// Extraction-scheme tag persisted alongside profile embeddings.
    fn version(&self) -> &str;
}
