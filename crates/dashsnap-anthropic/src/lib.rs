//! Anthropic Claude vision provider.
//!
//! Sends both screenshots as base64 image blocks through the Messages API
//! and parses the model's JSON verdict into the canonical classification.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use dashsnap::vision::{
    classification_prompt, parse_classification, VisionClassification, VisionProvider,
    VisionRequest,
};
use dashsnap::{Result, SnapError};

/// Environment variable holding the API key.
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
/// Default API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
/// Default model.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: &'static str,
    data: String,
}

impl ImageSource {
    fn base64(bytes: &[u8]) -> Self {
        Self {
            source_type: "base64",
            media_type: sniff_media_type(bytes),
            data: BASE64.encode(bytes),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

fn sniff_media_type(bytes: &[u8]) -> &'static str {
    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];
    const WEBP_RIFF: &[u8] = b"RIFF";
    if bytes.starts_with(PNG_MAGIC) {
        "image/png"
    } else if bytes.starts_with(WEBP_RIFF) {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Claude-backed vision provider.
///
/// # Example
///
/// ```no_run
/// use dashsnap_anthropic::AnthropicVision;
///
/// // Reads ANTHROPIC_API_KEY; construction fails when it is missing
/// let provider = AnthropicVision::try_new().unwrap()
///     .with_model("claude-3-5-haiku-latest");
/// ```
#[derive(Clone)]
pub struct AnthropicVision {
    api_key: String,
    model: String,
    api_url: String,
    http_client: reqwest::Client,
}

// Custom Debug to prevent API key exposure in logs
impl std::fmt::Debug for AnthropicVision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicVision")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl AnthropicVision {
    /// Create a provider with the key from `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`SnapError::Configuration`] when the variable is unset or empty.
    /// Configuration problems surface at construction, never mid-run.
    pub fn try_new() -> Result<Self> {
        let api_key = std::env::var(ANTHROPIC_API_KEY).unwrap_or_default();
        Self::with_api_key(api_key)
    }

    /// Create a provider with an explicit API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SnapError::Configuration(format!(
                "missing Anthropic API key (set {ANTHROPIC_API_KEY})"
            )));
        }
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| SnapError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            http_client,
        })
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> SnapError {
        let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
        let detail = parsed
            .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
            .unwrap_or_else(|| body.trim().to_string());
        SnapError::ProviderFailed {
            provider: "anthropic".to_string(),
            message: format!("HTTP {status}: {detail}"),
        }
    }
}

#[async_trait]
impl VisionProvider for AnthropicVision {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        // Construction already validated configuration; the fallback chain
        // discovers transport problems per call
        true
    }

    fn supports_vision(&self) -> bool {
        true
    }

    async fn analyze_visual_diff(&self, request: &VisionRequest) -> Result<VisionClassification> {
        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Text {
                        text: classification_prompt(request.context.as_ref()),
                    },
                    ContentBlock::Image {
                        source: ImageSource::base64(&request.baseline),
                    },
                    ContentBlock::Image {
                        source: ImageSource::base64(&request.current),
                    },
                ],
            }],
        };

        let response = self
            .http_client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| SnapError::ProviderFailed {
                provider: "anthropic".to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status, &text));
        }

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| SnapError::ProviderFailed {
                provider: "anthropic".to_string(),
                message: format!("invalid response body: {e}"),
            })?;

        let text = parsed
            .content
            .iter()
            .find_map(|block| match block {
                ResponseBlock::Text { text } => Some(text.as_str()),
                ResponseBlock::Other => None,
            })
            .ok_or_else(|| SnapError::ProviderResponseMalformed {
                provider: "anthropic".to_string(),
                message: "no text block in response".to_string(),
            })?;

        parse_classification("anthropic", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let err = AnthropicVision::with_api_key("").unwrap_err();
        assert!(matches!(err, SnapError::Configuration(_)));
        let err = AnthropicVision::with_api_key("   ").unwrap_err();
        assert!(matches!(err, SnapError::Configuration(_)));
    }

    #[test]
    fn test_builder_overrides() {
        let provider = AnthropicVision::with_api_key("sk-test")
            .unwrap()
            .with_model("claude-3-5-haiku-latest")
            .with_api_url("http://localhost:8080/v1/messages");
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.model(), "claude-3-5-haiku-latest");
        assert!(provider.supports_vision());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let provider = AnthropicVision::with_api_key("sk-secret").unwrap();
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_media_type_sniffing() {
        assert_eq!(sniff_media_type(&[0x89, b'P', b'N', b'G', 0]), "image/png");
        assert_eq!(sniff_media_type(b"RIFFxxxxWEBP"), "image/webp");
        assert_eq!(sniff_media_type(&[0xFF, 0xD8, 0xFF]), "image/jpeg");
    }

    #[test]
    fn test_request_serialization_shape() {
        let body = MessagesRequest {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Text {
                        text: "compare".to_string(),
                    },
                    ContentBlock::Image {
                        source: ImageSource::base64(&[0xFF, 0xD8, 0xFF, 0x01]),
                    },
                ],
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["messages"][0]["content"][1]["type"], "image");
        assert_eq!(
            json["messages"][0]["content"][1]["source"]["media_type"],
            "image/jpeg"
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_provider_failure() {
        let provider = AnthropicVision::with_api_key("sk-test")
            .unwrap()
            .with_api_url("http://127.0.0.1:59998/v1/messages");
        let err = provider
            .analyze_visual_diff(&VisionRequest {
                baseline: vec![1],
                current: vec![2],
                context: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::ProviderFailed { .. }));
    }
}
