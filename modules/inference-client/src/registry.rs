use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::error::InferenceError;
use crate::http::{SidecarClient, SidecarDetector, SidecarEmbedder};
use crate::traits::{Detector, Embedder};

/// Process-wide registry of engine handles. The first caller pays the
/// sidecar warm-up; everyone after reuses the memoised handle. Handles are
/// injected into workers at construction time, never resolved from global
/// scope, and inference calls are stateless with respect to the caller.
pub struct ModelRegistry {
    client: Arc<SidecarClient>,
    detector_model: String,
    embedder_model: String,
    aux_embedder_model: Option<String>,
    embedding_version: String,
    warmed: OnceCell<()>,
    detector: OnceCell<Arc<SidecarDetector>>,
    embedder: OnceCell<Arc<SidecarEmbedder>>,
    aux_embedder: OnceCell<Option<Arc<SidecarEmbedder>>>,
}

impl ModelRegistry {
    pub fn new(
        base_url: &str,
        inference_slots: usize,
        detector_model: &str,
        embedder_model: &str,
        aux_embedder_model: Option<&str>,
        embedding_version: &str,
    ) -> Self {
        Self {
            client: Arc::new(SidecarClient::new(base_url, inference_slots)),
            detector_model: detector_model.to_string(),
            embedder_model: embedder_model.to_string(),
            aux_embedder_model: aux_embedder_model.map(str::to_string),
            embedding_version: embedding_version.to_string(),
            warmed: OnceCell::new(),
            detector: OnceCell::new(),
            embedder: OnceCell::new(),
            aux_embedder: OnceCell::new(),
        }
    }

    async fn warm(&self) -> Result<(), InferenceError> {
        self.warmed
            .get_or_try_init(|| async { self.client.ready().await })
            .await?;
        Ok(())
    }

    pub async fn detector(&self) -> Result<Arc<dyn Detector>, InferenceError> {
        self.warm().await?;
        let handle = self
            .detector
            .get_or_init(|| async {
                Arc::new(SidecarDetector::new(
                    self.client.clone(),
                    &self.detector_model,
                ))
            })
            .await;
        Ok(handle.clone())
    }

    pub async fn embedder(&self) -> Result<Arc<dyn Embedder>, InferenceError> {
        self.warm().await?;
        let handle = self
            .embedder
            .get_or_init(|| async {
                Arc::new(SidecarEmbedder::new(
                    self.client.clone(),
                    &self.embedder_model,
                    &self.embedding_version,
                ))
            })
            .await;
        Ok(handle.clone())
    }

    /// The auxiliary extractor, if one is configured. Shares the device
    /// semaphore and the extraction-scheme tag with the primary: the
    /// persisted version describes the whole scheme, not one model.
    pub async fn aux_embedder(&self) -> Result<Option<Arc<dyn Embedder>>, InferenceError> {
        self.warm().await?;
        let handle = self
            .aux_embedder
            .get_or_init(|| async {
                self.aux_embedder_model.as_ref().map(|model| {
                    Arc::new(SidecarEmbedder::new(
                        self.client.clone(),
                        model,
                        &self.embedding_version,
                    ))
                })
            })
            .await;
        Ok(handle.clone().map(|h| h as Arc<dyn Embedder>))
    }
}
