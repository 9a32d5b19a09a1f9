//! OpenAI vision provider.
//!
//! Sends both screenshots as data-URL image parts through the Chat
//! Completions API and parses the model's JSON verdict into the canonical
//! classification.

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
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
/// Default API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
/// Default model.
pub const DEFAULT_MODEL: &str = "gpt-4o";

const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

impl ImageUrl {
    fn data_url(bytes: &[u8]) -> Self {
        let mime = if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            "image/png"
        } else {
            "image/jpeg"
        };
        Self {
            url: format!("data:{mime};base64,{}", BASE64.encode(bytes)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// GPT-backed vision provider.
///
/// # Example
///
/// ```no_run
/// use dashsnap_openai::OpenAIVision;
///
/// // Reads OPENAI_API_KEY; construction fails when it is missing
/// let provider = OpenAIVision::try_new().unwrap().with_model("gpt-4o-mini");
/// ```
#[derive(Clone)]
pub struct OpenAIVision {
    api_key: String,
    model: String,
    api_url: String,
    http_client: reqwest::Client,
}

// Custom Debug to prevent API key exposure in logs
impl std::fmt::Debug for OpenAIVision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIVision")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl OpenAIVision {
    /// Create a provider with the key from `OPENAI_API_KEY`.
    ///
    /// # Errors
    ///
    /// [`SnapError::Configuration`] when the variable is unset or empty.
    pub fn try_new() -> Result<Self> {
        let api_key = std::env::var(OPENAI_API_KEY).unwrap_or_default();
        Self::with_api_key(api_key)
    }

    /// Create a provider with an explicit API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SnapError::Configuration(format!(
                "missing OpenAI API key (set {OPENAI_API_KEY})"
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
}

#[async_trait]
impl VisionProvider for OpenAIVision {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn supports_vision(&self) -> bool {
        true
    }

    async fn analyze_visual_diff(&self, request: &VisionRequest) -> Result<VisionClassification> {
        let body = ChatRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: classification_prompt(request.context.as_ref()),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl::data_url(&request.baseline),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl::data_url(&request.current),
                    },
                ],
            }],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .http_client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SnapError::ProviderFailed {
                provider: "openai".to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SnapError::ProviderFailed {
                provider: "openai".to_string(),
                message: format!("HTTP {status}: {}", text.trim()),
            });
        }

        let parsed: ChatResponse =
            response.json().await.map_err(|e| SnapError::ProviderFailed {
                provider: "openai".to_string(),
                message: format!("invalid response body: {e}"),
            })?;

        let text = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .ok_or_else(|| SnapError::ProviderResponseMalformed {
                provider: "openai".to_string(),
                message: "no content in first choice".to_string(),
            })?;

        parse_classification("openai", text)
    }
}
