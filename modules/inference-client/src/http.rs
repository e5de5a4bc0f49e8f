use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::InferenceError;
use crate::traits::{Detector, Embedder};
use crate::types::RawDetection;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for the inference sidecar. One instance per device; the
/// internal semaphore caps concurrent inference calls so the configured
/// batch dimensions fit in device memory.
pub struct SidecarClient {
    http: reqwest::Client,
    base_url: String,
    slots: Semaphore,
}

#[derive(Serialize)]
struct InferRequest<'a> {
    model: &'a str,
    image_b64: String,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<RawDetection>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl SidecarClient {
    pub fn new(base_url: &str, slots: usize) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            slots: Semaphore::new(slots.max(1)),
        }
    }

    /// Probe the sidecar until its models are loaded. Fails fast on a
    /// missing model file so the process refuses to start.
    pub async fn ready(&self) -> Result<(), InferenceError> {
        let url = format!("{}/v1/ready", self.base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Unavailable(format!(
                "ready probe returned {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn post_infer(&self, path: &str, model: &str, image: &[u8]) -> Result<reqwest::Response, InferenceError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| InferenceError::Unavailable("inference slots closed".to_string()))?;

        let url = format!("{}{path}", self.base_url);
        let request = InferRequest {
            model,
            image_b64: base64::engine::general_purpose::STANDARD.encode(image),
        };

        let response = self.http.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 507 || body.to_ascii_lowercase().contains("out of memory") {
                return Err(InferenceError::OutOfMemory);
            }
            return Err(InferenceError::Http(format!(
                "{path} returned {status}: {body}"
            )));
        }
        Ok(response)
    }

    pub async fn detect(&self, model: &str, image: &[u8]) -> Result<Vec<RawDetection>, InferenceError> {
        debug!(model, bytes = image.len(), "detect request");
        let response = self.post_infer("/v1/detect", model, image).await?;
        let parsed: DetectResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        Ok(parsed.detections)
    }

    pub async fn embed(&self, model: &str, crop: &[u8]) -> Result<Vec<f32>, InferenceError> {
        debug!(model, bytes = crop.len(), "embed request");
        let response = self.post_infer("/v1/embed", model, crop).await?;
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        if parsed.embedding.is_empty() {
            return Err(InferenceError::Decode("empty embedding".to_string()));
        }
        Ok(parsed.embedding)
    }
}

/// A named detector model on a shared sidecar.
pub struct SidecarDetector {
    client: Arc<SidecarClient>,
    model: String,
}

impl SidecarDetector {
    pub fn new(client: Arc<SidecarClient>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Detector for SidecarDetector {
    async fn detect(&self, image: &[u8]) -> Result<Vec<RawDetection>, InferenceError> {
        self.client.detect(&self.model, image).await
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// A named embedding model on a shared sidecar.
pub struct SidecarEmbedder {
    client: Arc<SidecarClient>,
    model: String,
    version: String,
}

impl SidecarEmbedder {
    pub fn new(client: Arc<SidecarClient>, model: &str, version: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            version: version.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for SidecarEmbedder {
    async fn embed(&self, crop: &[u8]) -> Result<Vec<f32>, InferenceError> {
        self.client.embed(&self.model, crop).await
    }

    fn version(&self) -> &str {
        &self.version
    }
}
