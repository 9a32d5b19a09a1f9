//! Provider capability interface.
//!
//! Providers are modelled as values implementing [`VisionProvider`]; the
//! smart client iterates an ordered list of them, so adding a provider is
//! purely additive.

use async_trait::async_trait;

use crate::error::Result;
use crate::vision::{VisionClassification, VisionRequest};

/// A vision-capable model provider.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Stable provider name used for cache keys and cost attribution
    /// (e.g. "ollama", "anthropic").
    fn name(&self) -> &str;

    /// Model identifier used for cache keys and pricing lookup.
    fn model(&self) -> &str;

    /// Whether the provider can currently serve requests. Local providers
    /// probe their daemon; cloud providers check configuration.
    async fn is_available(&self) -> bool;

    /// Whether the configured model accepts image input.
    fn supports_vision(&self) -> bool;

    /// Compare baseline and current images and classify the difference.
    ///
    /// # Errors
    ///
    /// Adapters surface [`crate::SnapError::ProviderResponseMalformed`] for
    /// unparseable output and [`crate::SnapError::ProviderFailed`] for
    /// transport or API failures. Both advance the fallback chain.
    async fn analyze_visual_diff(&self, request: &VisionRequest) -> Result<VisionClassification>;
}
