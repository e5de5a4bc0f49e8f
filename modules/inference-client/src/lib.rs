//! Client for the GPU inference sidecar.
//!
//! The pipeline treats detection and embedding as opaque calls with a fixed
//! contract: `detect` is deterministic per model version and returns scored,
//! labelled boxes; `embed` is deterministic per model version and returns
//! vectors of one fixed dimension. Neither call mutates engine state.

mod error;
mod http;
mod registry;
mod traits;
mod types;

pub use error::InferenceError;
pub use http::{SidecarClient, SidecarDetector, SidecarEmbedder};
pub use registry::ModelRegistry;
pub use traits::{Detector, Embedder};
pub use types::RawDetection;
