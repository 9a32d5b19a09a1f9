//! AI vision classification: canonical types, provider capability, caching,
//! cost tracking, and the smart client that composes them.

mod cache;
mod client;
mod cost;
mod provider;

pub use cache::{VisionCache, VisionCacheConfig, VisionCacheStats};
pub use client::{SmartVisionClient, SmartVisionClientConfig};
pub use cost::{
    BudgetConfig, BudgetStatus, CostEntry, CostStats, CostTracker, PricingTable,
};
pub use provider::VisionProvider;

use serde::{Deserialize, Serialize};

use crate::diff::Severity;
use crate::error::{Result, SnapError};

/// Change category reported by vision analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionCategory {
    Layout,
    Text,
    Color,
    Spacing,
    Content,
}

/// Canonical classification produced by a vision provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionClassification {
    pub severity: Severity,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    /// Model explanation of what changed.
    pub reasoning: String,
    pub categories: Vec<VisionCategory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// Context attached to a vision request to steer the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionContext {
    pub url: Option<String>,
    pub selector: Option<String>,
    /// Recent classifications for the same baseline key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent: Vec<VisionClassification>,
}

/// A request for semantic comparison of two images.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    /// Normalized baseline bytes.
    pub baseline: Vec<u8>,
    /// Normalized current bytes.
    pub current: Vec<u8>,
    pub context: Option<VisionContext>,
}

// ============================================================================
// Legacy severity view
// ============================================================================

/// Four-level severity space used by the legacy adapter surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacySeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Single change-type label for the legacy adapter surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyChangeType {
    Layout,
    Color,
    Content,
    Text,
    Unknown,
}

/// Legacy view of a classification. Always derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyVerdict {
    pub severity: LegacySeverity,
    pub is_intentional: bool,
    pub change_type: LegacyChangeType,
}

/// Map a canonical classification into the legacy 4-level space.
///
/// `none`/`minor` read as intentional low-severity changes; `moderate` and
/// `breaking` escalate to medium and critical. The change type is chosen by
/// category priority: layout > color > content | text > unknown.
pub fn to_legacy_verdict(classification: &VisionClassification) -> LegacyVerdict {
    let (severity, is_intentional) = match classification.severity {
        Severity::None | Severity::Minor => (LegacySeverity::Low, true),
        Severity::Moderate => (LegacySeverity::Medium, false),
        Severity::Breaking => (LegacySeverity::Critical, false),
    };

    let categories = &classification.categories;
    let change_type = if categories.contains(&VisionCategory::Layout) {
        LegacyChangeType::Layout
    } else if categories.contains(&VisionCategory::Color) {
        LegacyChangeType::Color
    } else if categories.contains(&VisionCategory::Content) {
        LegacyChangeType::Content
    } else if categories.contains(&VisionCategory::Text) {
        LegacyChangeType::Text
    } else {
        LegacyChangeType::Unknown
    };

    LegacyVerdict {
        severity,
        is_intentional,
        change_type,
    }
}

// ============================================================================
// Shared provider output parsing
// ============================================================================

/// Raw JSON shape models are prompted to emit.
#[derive(Debug, Deserialize)]
struct RawClassification {
    severity: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Extract the first JSON object from model output. Models frequently wrap
/// JSON in markdown fences or prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse provider model output into a canonical classification.
///
/// # Errors
///
/// [`SnapError::ProviderResponseMalformed`] when no parseable JSON object
/// with a valid severity is present. Adapters treat this as a provider
/// failure so the fallback chain advances.
pub fn parse_classification(provider: &str, text: &str) -> Result<VisionClassification> {
    let malformed = |message: String| SnapError::ProviderResponseMalformed {
        provider: provider.to_string(),
        message,
    };

    let json = extract_json_object(text)
        .ok_or_else(|| malformed(format!("no JSON object in output: {}", truncate(text, 120))))?;

    let raw: RawClassification =
        serde_json::from_str(json).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let severity = match raw.severity.to_ascii_lowercase().as_str() {
        "none" => Severity::None,
        "minor" => Severity::Minor,
        "moderate" => Severity::Moderate,
        "breaking" => Severity::Breaking,
        other => return Err(malformed(format!("unknown severity: {other}"))),
    };

    let categories = raw
        .categories
        .iter()
        .filter_map(|c| match c.to_ascii_lowercase().as_str() {
            "layout" => Some(VisionCategory::Layout),
            "text" => Some(VisionCategory::Text),
            "color" => Some(VisionCategory::Color),
            "spacing" => Some(VisionCategory::Spacing),
            "content" => Some(VisionCategory::Content),
            _ => None,
        })
        .collect();

    Ok(VisionClassification {
        severity,
        confidence: raw.confidence.clamp(0.0, 1.0),
        reasoning: raw.reasoning,
        categories,
        suggestions: raw.suggestions,
    })
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

/// Prompt shared by provider adapters: instructs the model to emit strict
/// JSON in the canonical shape.
pub fn classification_prompt(context: Option<&VisionContext>) -> String {
    let mut prompt = String::from(
        "You are comparing two screenshots of the same web page: the first is \
         the approved baseline, the second is the current render. Classify the \
         visual difference.\n\
         Respond with ONLY a JSON object:\n\
         {\"severity\": \"none|minor|moderate|breaking\", \
         \"confidence\": 0.0-1.0, \
         \"reasoning\": \"one or two sentences\", \
         \"categories\": [\"layout\"|\"text\"|\"color\"|\"spacing\"|\"content\"], \
         \"suggestions\": [\"optional follow-ups\"]}",
    );

    if let Some(ctx) = context {
        if let Some(url) = &ctx.url {
            prompt.push_str(&format!("\nPage under test: {url}"));
        }
        if let Some(selector) = &ctx.selector {
            prompt.push_str(&format!("\nScoped to element: {selector}"));
        }
        if !ctx.recent.is_empty() {
            prompt.push_str("\nRecent classifications for this page:");
            for recent in ctx.recent.iter().take(3) {
                prompt.push_str(&format!(
                    "\n- {} (confidence {:.2}): {}",
                    recent.severity, recent.confidence, recent.reasoning
                ));
            }
        }
    }

    prompt
}
