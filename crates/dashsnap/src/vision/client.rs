//! Smart vision client.
//!
//! Composes the image preprocessor, the two-tier response cache, the cost
//! tracker, and an ordered provider fallback chain. Cache and ledger
//! failures are advisory; provider failures advance the chain; an engaged
//! budget circuit breaker aborts the call.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, SnapError};
use crate::preprocess::{ImageInput, ImagePreprocessor, PreprocessedImage};
use crate::vision::{
    CostTracker, VisionCache, VisionClassification, VisionProvider, VisionRequest,
};

/// Client behavior knobs.
#[derive(Debug, Clone)]
pub struct SmartVisionClientConfig {
    /// When false, only the first configured provider is consulted.
    pub fallback_enabled: bool,
    /// Deadline for a single provider call.
    pub call_timeout: Duration,
}

impl Default for SmartVisionClientConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Budget-aware, cached, multi-provider vision client.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use dashsnap::preprocess::ImagePreprocessor;
/// use dashsnap::vision::{
///     BudgetConfig, CostTracker, PricingTable, SmartVisionClient,
///     SmartVisionClientConfig, VisionCache, VisionCacheConfig,
/// };
///
/// # fn example(providers: Vec<Arc<dyn dashsnap::vision::VisionProvider>>) -> dashsnap::Result<()> {
/// let cache = Arc::new(VisionCache::open(VisionCacheConfig::at_path("cache/vision.db"))?);
/// let cost = Arc::new(CostTracker::open(
///     "cache/cost.db",
///     PricingTable::with_defaults(),
///     BudgetConfig::default(),
/// )?);
/// let client = SmartVisionClient::new(
///     providers,
///     ImagePreprocessor::with_defaults(),
///     cache,
///     cost,
///     SmartVisionClientConfig::default(),
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct SmartVisionClient {
    providers: Vec<Arc<dyn VisionProvider>>,
    preprocessor: ImagePreprocessor,
    cache: Arc<VisionCache>,
    cost: Arc<CostTracker>,
    config: SmartVisionClientConfig,
}

impl std::fmt::Debug for SmartVisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartVisionClient")
            .field("providers", &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SmartVisionClient {
    /// Build a client over an ordered provider chain.
    ///
    /// # Errors
    ///
    /// [`SnapError::Configuration`] when the chain is empty or no provider
    /// supports vision. Configuration problems surface here, never during
    /// execution.
    pub fn new(
        providers: Vec<Arc<dyn VisionProvider>>,
        preprocessor: ImagePreprocessor,
        cache: Arc<VisionCache>,
        cost: Arc<CostTracker>,
        config: SmartVisionClientConfig,
    ) -> Result<Self> {
        if providers.is_empty() {
            return Err(SnapError::Configuration(
                "at least one vision provider is required".to_string(),
            ));
        }
        if !providers.iter().any(|p| p.supports_vision()) {
            return Err(SnapError::Configuration(
                "no configured provider supports vision input".to_string(),
            ));
        }
        Ok(Self {
            providers,
            preprocessor,
            cache,
            cost,
            config,
        })
    }

    /// The provider whose identity keys the cache lookup.
    fn primary(&self) -> &Arc<dyn VisionProvider> {
        &self.providers[0]
    }

    /// Classify the difference between two images.
    ///
    /// # Errors
    ///
    /// [`SnapError::BudgetExhausted`] when the circuit breaker is engaged
    /// and [`SnapError::AllProvidersFailed`] when every provider in the
    /// chain fails. Preprocessing errors pass through unchanged.
    pub async fn analyze_visual_diff(
        &self,
        request: &VisionRequest,
    ) -> Result<VisionClassification> {
        let baseline = self
            .preprocessor
            .preprocess(ImageInput::Bytes(request.baseline.clone()))?;
        let current = self
            .preprocessor
            .preprocess(ImageInput::Bytes(request.current.clone()))?;

        let key = VisionCache::cache_key(
            self.primary().name(),
            self.primary().model(),
            &baseline.hash,
            &current.hash,
        );

        // Cache is best-effort: an unreadable tier is a miss, not a failure.
        match self.cache.get(&key) {
            Ok(Some(cached)) => {
                debug!(key = %&key[..12], "vision cache hit");
                self.track_advisory(self.primary().name(), self.primary().model(), true);
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "vision cache read failed, treating as miss"),
        }

        let chain: Vec<&Arc<dyn VisionProvider>> = if self.config.fallback_enabled {
            self.providers.iter().collect()
        } else {
            vec![self.primary()]
        };

        let normalized = normalized_request(request, &baseline, &current);
        let mut last_error: Option<SnapError> = None;

        for provider in chain {
            if !provider.supports_vision() {
                continue;
            }
            if !provider.is_available().await {
                debug!(provider = provider.name(), "provider unavailable, skipping");
                continue;
            }

            let status = self.cost.budget_status()?;
            if status.circuit_breaker_triggered {
                return Err(SnapError::BudgetExhausted(format!(
                    "daily ${:.2}/${:.2}, monthly ${:.2}/${:.2}",
                    status.daily_used,
                    status.daily_limit,
                    status.monthly_used,
                    status.monthly_limit
                )));
            }

            let outcome = tokio::time::timeout(
                self.config.call_timeout,
                provider.analyze_visual_diff(&normalized),
            )
            .await;

            match outcome {
                Ok(Ok(classification)) => {
                    self.track_advisory(provider.name(), provider.model(), false);
                    // Keyed to the provider actually used, which may differ
                    // from the primary after fallback
                    let used_key = VisionCache::cache_key(
                        provider.name(),
                        provider.model(),
                        &baseline.hash,
                        &current.hash,
                    );
                    if let Err(e) = self.cache.set(
                        &used_key,
                        &classification,
                        provider.name(),
                        provider.model(),
                    ) {
                        warn!(error = %e, "vision cache write failed");
                    }
                    return Ok(classification);
                }
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), error = %e, "provider failed, trying next");
                    last_error = Some(e);
                }
                Err(_) => {
                    let timeout_ms = self.config.call_timeout.as_millis() as u64;
                    warn!(provider = provider.name(), timeout_ms, "provider timed out, trying next");
                    last_error = Some(SnapError::Timeout(timeout_ms));
                }
            }
        }

        Err(SnapError::AllProvidersFailed(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no provider was available".to_string()),
        ))
    }

    fn track_advisory(&self, provider: &str, model: &str, cached: bool) {
        if let Err(e) = self.cost.track_operation(provider, model, cached) {
            warn!(provider, model, error = %e, "cost ledger write failed");
        }
    }
}

fn normalized_request(
    request: &VisionRequest,
    baseline: &PreprocessedImage,
    current: &PreprocessedImage,
) -> VisionRequest {
    VisionRequest {
        baseline: baseline.bytes.clone(),
        current: current.bytes.clone(),
        context: request.context.clone(),
    }
}
