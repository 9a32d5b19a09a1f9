//! Local Ollama vision provider.
//!
//! Talks to a local Ollama daemon (default <http://localhost:11434>) using
//! the generate API with base64-encoded images. Local models cost nothing,
//! which is why this provider sits at the head of the default fallback
//! chain. Ollama only accepts base64 images; URLs are not supported.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use dashsnap::vision::{
    classification_prompt, parse_classification, VisionClassification, VisionProvider,
    VisionRequest,
};
use dashsnap::{Result, SnapError};

/// Default daemon address.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
/// Default vision-capable model.
pub const DEFAULT_MODEL: &str = "llava";

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
    format: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Vision provider backed by a local Ollama daemon.
///
/// # Example
///
/// ```no_run
/// use dashsnap_ollama::OllamaVision;
///
/// let provider = OllamaVision::try_new()
///     .unwrap()
///     .with_model("llava:13b");
/// ```
#[derive(Debug, Clone)]
pub struct OllamaVision {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl OllamaVision {
    /// Connect to Ollama at the default address.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn try_new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Connect to Ollama at a custom address.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| SnapError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: DEFAULT_MODEL.to_string(),
            http_client,
        })
    }

    /// Use a different model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn provider_error(&self, message: impl Into<String>) -> SnapError {
        SnapError::ProviderFailed {
            provider: "ollama".to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl VisionProvider for OllamaVision {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        // The tags endpoint answers instantly when the daemon is up
        let url = format!("{}/api/tags", self.base_url);
        let probe = self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "ollama daemon not reachable");
                false
            }
        }
    }

    fn supports_vision(&self) -> bool {
        true
    }

    async fn analyze_visual_diff(&self, request: &VisionRequest) -> Result<VisionClassification> {
        let body = GenerateRequest {
            model: self.model.clone(),
            prompt: classification_prompt(request.context.as_ref()),
            images: vec![
                BASE64.encode(&request.baseline),
                BASE64.encode(&request.current),
            ],
            stream: false,
            format: "json".to_string(),
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.provider_error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.provider_error(format!("HTTP {status}: {text}")));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error(format!("invalid response body: {e}")))?;

        parse_classification("ollama", &generated.response)
    }
}
