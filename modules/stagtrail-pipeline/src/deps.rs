use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use inference_client::{Detector, Embedder, InferenceError};
use stagtrail_common::{PipelineSettings, WorkError};

use crate::traits::{MetadataStore, WorkQueue};

/// Everything a worker needs, injected at construction. Model handles are
/// process-wide singletons shared across the pools; inference calls are
/// stateless with respect to the caller.
pub struct WorkerDeps {
    pub store: Arc<dyn MetadataStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub detector: Arc<dyn Detector>,
    pub embedder: Arc<dyn Embedder>,
    pub aux_embedder: Option<Arc<dyn Embedder>>,
    pub settings: PipelineSettings,
    pub stats: Arc<RunStats>,
}

/// Run counters shared by all workers in the process.
#[derive(Debug, Default)]
pub struct RunStats {
    pub images_completed: AtomicU64,
    pub images_failed: AtomicU64,
    pub detections_recorded: AtomicU64,
    pub reid_enqueued: AtomicU64,
    pub profiles_created: AtomicU64,
    pub sightings_assigned: AtomicU64,
    pub burst_reuses: AtomicU64,
    pub items_nacked: AtomicU64,
}

impl RunStats {
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_by(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "images: {} completed, {} failed | detections: {} recorded, {} to reid | \
             profiles: {} created, {} matched, {} burst reuses | {} nacks",
            self.images_completed.load(Ordering::Relaxed),
            self.images_failed.load(Ordering::Relaxed),
            self.detections_recorded.load(Ordering::Relaxed),
            self.reid_enqueued.load(Ordering::Relaxed),
            self.profiles_created.load(Ordering::Relaxed),
            self.sightings_assigned.load(Ordering::Relaxed),
            self.burst_reuses.load(Ordering::Relaxed),
            self.items_nacked.load(Ordering::Relaxed),
        )
    }
}

/// Metadata-DB failures are retried via the queue; the taxonomy calls them
/// transient.
pub(crate) fn transient(e: anyhow::Error) -> WorkError {
    WorkError::TransientIo(e.to_string())
}

pub(crate) fn from_inference(e: InferenceError) -> WorkError {
    match e {
        InferenceError::OutOfMemory => WorkError::InferenceOom,
        InferenceError::Http(msg) | InferenceError::Decode(msg) | InferenceError::Unavailable(msg) => {
            WorkError::TransientIo(msg)
        }
    }
}
