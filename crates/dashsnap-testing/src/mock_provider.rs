//! Mock vision provider for testing the fallback chain and caching.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use dashsnap::diff::Severity;
use dashsnap::vision::{
    VisionCategory, VisionClassification, VisionContext, VisionProvider, VisionRequest,
};
use dashsnap::{Result, SnapError};

/// A configurable mock provider.
///
/// # Example
///
/// ```rust
/// use dashsnap::diff::Severity;
/// use dashsnap_testing::MockVisionProvider;
///
/// let provider = MockVisionProvider::new("mock")
///     .with_severity(Severity::Breaking)
///     .with_reasoning("header is gone");
///
/// provider.fail_next();
/// ```
#[derive(Clone)]
pub struct MockVisionProvider {
    name: String,
    model: String,
    severity: Severity,
    confidence: f64,
    reasoning: String,
    categories: Vec<VisionCategory>,
    available: Arc<Mutex<bool>>,
    fail_next: Arc<Mutex<bool>>,
    always_fail: Arc<Mutex<bool>>,
    call_count: Arc<Mutex<usize>>,
    /// Request contexts seen, newest last.
    call_contexts: Arc<Mutex<Vec<Option<VisionContext>>>>,
}

impl std::fmt::Debug for MockVisionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVisionProvider")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("severity", &self.severity)
            .field("call_count", &self.call_count())
            .finish()
    }
}

impl MockVisionProvider {
    /// Create a mock provider with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            model: format!("{name}-model"),
            name,
            severity: Severity::None,
            confidence: 0.9,
            reasoning: "mock classification".to_string(),
            categories: Vec::new(),
            available: Arc::new(Mutex::new(true)),
            fail_next: Arc::new(Mutex::new(false)),
            always_fail: Arc::new(Mutex::new(false)),
            call_count: Arc::new(Mutex::new(0)),
            call_contexts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the model name used for cache keys and pricing lookups.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the severity every classification reports.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the confidence every classification reports.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set the reasoning text.
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Set the reported categories.
    #[must_use]
    pub fn with_categories(mut self, categories: Vec<VisionCategory>) -> Self {
        self.categories = categories;
        self
    }

    /// Make `is_available` report the given state.
    pub fn set_available(&self, available: bool) {
        *self.available.lock() = available;
    }

    /// Fail only the next `analyze_visual_diff` call.
    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }

    /// Fail every `analyze_visual_diff` call until reset.
    pub fn set_always_fail(&self, fail: bool) {
        *self.always_fail.lock() = fail;
    }

    /// Number of analyze calls received.
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }

    /// URLs from the context of each analyze call.
    pub fn call_history(&self) -> Vec<Option<String>> {
        self.call_contexts
            .lock()
            .iter()
            .map(|context| context.as_ref().and_then(|c| c.url.clone()))
            .collect()
    }

    /// Full request contexts, newest last.
    pub fn call_contexts(&self) -> Vec<Option<VisionContext>> {
        self.call_contexts.lock().clone()
    }
}

#[async_trait]
impl VisionProvider for MockVisionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        *self.available.lock()
    }

    fn supports_vision(&self) -> bool {
        true
    }

    async fn analyze_visual_diff(&self, request: &VisionRequest) -> Result<VisionClassification> {
        *self.call_count.lock() += 1;
        self.call_contexts.lock().push(request.context.clone());

        let fail_once = {
            let mut flag = self.fail_next.lock();
            std::mem::take(&mut *flag)
        };
        if fail_once || *self.always_fail.lock() {
            return Err(SnapError::ProviderResponseMalformed {
                provider: self.name.clone(),
                message: "mock failure".to_string(),
            });
        }

        Ok(VisionClassification {
            severity: self.severity,
            confidence: self.confidence,
            reasoning: self.reasoning.clone(),
            categories: self.categories.clone(),
            suggestions: Vec::new(),
        })
    }
}
