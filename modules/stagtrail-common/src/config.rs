use std::env;
use std::time::Duration;

use crate::vecmath::EnsembleWeights;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres (metadata DB, vector index, dispatch queue)
    pub database_url: String,

    // Inference sidecar
    pub inference_url: String,
    pub detector_model: String,
    pub embedder_model: String,
    /// Optional auxiliary extractor; enables ensemble scoring when set
    /// together with a two-weight `ENSEMBLE_WEIGHTS`.
    pub aux_embedder_model: Option<String>,
    pub embedding_version: String,

    // Image storage
    pub image_root: String,

    // Pipeline tunables
    pub settings: PipelineSettings,
}

/// The pure tunable subset handed to workers. Everything here is a plain
/// value; no I/O handles.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Detector cutoff. Results strictly below are discarded.
    pub detector_confidence: f32,
    /// In-image dedup threshold; IoU at or above marks a duplicate.
    pub iou_dedup_threshold: f32,
    /// Half-width of the burst window, inclusive at the boundary.
    pub burst_window: Duration,
    /// Assignment threshold; score at or above assigns.
    pub reid_threshold: f32,
    pub ensemble_weights: EnsembleWeights,
    pub profile_ema_alpha: f32,
    pub detect_concurrency: usize,
    pub reid_concurrency: usize,
    pub detect_deadline: Duration,
    pub reid_deadline: Duration,
    /// Reservation attempts before an item is dead-lettered.
    pub max_retries: u32,
    /// Persist non-deer detector output as `class = other`.
    pub record_non_deer: bool,
    /// Concurrent inference calls allowed on the device.
    pub inference_slots: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            detector_confidence: 0.5,
            iou_dedup_threshold: 0.5,
            burst_window: Duration::from_secs(5),
            reid_threshold: 0.70,
            ensemble_weights: EnsembleWeights::single(),
            profile_ema_alpha: 0.3,
            detect_concurrency: 2,
            reid_concurrency: 16,
            detect_deadline: Duration::from_millis(30_000),
            reid_deadline: Duration::from_millis(15_000),
            max_retries: 5,
            record_non_deer: true,
            inference_slots: 4,
        }
    }
}

impl Config {
    /// Load configuration for the pipeline binary.
    /// Panics with a clear message if required vars are missing.
    pub fn pipeline_from_env() -> Self {
        let defaults = PipelineSettings::default();
        Self {
            database_url: required_env("DATABASE_URL"),
            inference_url: required_env("INFERENCE_URL"),
            detector_model: env::var("DETECTOR_MODEL").unwrap_or_else(|_| "deer-yolo".to_string()),
            embedder_model: env::var("EMBEDDER_MODEL")
                .unwrap_or_else(|_| "deer-resnet".to_string()),
            aux_embedder_model: env::var("AUX_EMBEDDER_MODEL").ok().filter(|s| !s.is_empty()),
            embedding_version: env::var("EMBEDDING_VERSION")
                .unwrap_or_else(|_| "resnet50-v1".to_string()),
            image_root: required_env("IMAGE_ROOT"),
            settings: PipelineSettings {
                detector_confidence: parsed_env("DETECTOR_CONFIDENCE", defaults.detector_confidence),
                iou_dedup_threshold: parsed_env("IOU_DEDUP_THRESHOLD", defaults.iou_dedup_threshold),
                burst_window: Duration::from_secs(parsed_env("BURST_WINDOW_SECONDS", 5u64)),
                reid_threshold: parsed_env("REID_THRESHOLD", defaults.reid_threshold),
                ensemble_weights: ensemble_weights_from_env(),
                profile_ema_alpha: parsed_env("PROFILE_EMA_ALPHA", defaults.profile_ema_alpha),
                detect_concurrency: parsed_env("DETECT_CONCURRENCY", defaults.detect_concurrency),
                reid_concurrency: parsed_env("REID_CONCURRENCY", defaults.reid_concurrency),
                detect_deadline: Duration::from_millis(parsed_env("DETECT_DEADLINE_MS", 30_000u64)),
                reid_deadline: Duration::from_millis(parsed_env("REID_DEADLINE_MS", 15_000u64)),
                max_retries: parsed_env("MAX_RETRIES", defaults.max_retries),
                record_non_deer: parsed_env("RECORD_NON_DEER", defaults.record_non_deer),
                inference_slots: parsed_env("INFERENCE_SLOTS", defaults.inference_slots),
            },
        }
    }

    /// Load config for the admin binary (no inference sidecar required
    /// except by `re-embed`, which reads the same vars lazily).
    pub fn admin_from_env() -> Self {
        let mut config = Self {
            database_url: required_env("DATABASE_URL"),
            inference_url: env::var("INFERENCE_URL").unwrap_or_default(),
            detector_model: env::var("DETECTOR_MODEL").unwrap_or_else(|_| "deer-yolo".to_string()),
            embedder_model: env::var("EMBEDDER_MODEL")
                .unwrap_or_else(|_| "deer-resnet".to_string()),
            aux_embedder_model: env::var("AUX_EMBEDDER_MODEL").ok().filter(|s| !s.is_empty()),
            embedding_version: env::var("EMBEDDING_VERSION")
                .unwrap_or_else(|_| "resnet50-v1".to_string()),
            image_root: env::var("IMAGE_ROOT").unwrap_or_default(),
            settings: PipelineSettings::default(),
        };
        config.settings.ensemble_weights = ensemble_weights_from_env();
        config.settings.max_retries = parsed_env("MAX_RETRIES", config.settings.max_retries);
        config
    }

    /// Log connection targets without credentials.
    pub fn log_summary(&self) {
        let vars = [
            ("DATABASE_URL", &self.database_url),
            ("INFERENCE_URL", &self.inference_url),
            ("IMAGE_ROOT", &self.image_root),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
        tracing::info!(
            detector = %self.detector_model,
            embedder = %self.embedder_model,
            aux = ?self.aux_embedder_model,
            version = %self.embedding_version,
            "inference models"
        );
    }
}

fn ensemble_weights_from_env() -> EnsembleWeights {
    match env::var("ENSEMBLE_WEIGHTS") {
        Ok(raw) => EnsembleWeights::parse(&raw)
            .unwrap_or_else(|e| panic!("ENSEMBLE_WEIGHTS invalid: {e}")),
        Err(_) => EnsembleWeights::single(),
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must parse as {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}
