pub mod config;
pub mod error;
pub mod types;
pub mod vecmath;

pub use config::{Config, PipelineSettings};
pub use error::{QueueAction, WorkError};
pub use types::{BBox, DeerClass, ProcessingStatus, Sex, DETECT_QUEUE, REID_QUEUE};
pub use vecmath::{
    cosine_similarity, ema_update, ensemble_score, l2_normalize, norm, EnsembleWeights,
};
