//! Scripted browser capability serving fixture screenshots per URL.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashsnap::capture::{BrowserPage, LoadState, ScreenshotOptions};
use dashsnap::diff::BoundingBox;
use dashsnap::runner::BrowserPool;
use dashsnap::{Result, SnapError};

#[derive(Default)]
struct MockBrowserState {
    screenshots: HashMap<String, Vec<u8>>,
    element_boxes: HashMap<String, BoundingBox>,
    navigation_delay: Duration,
}

/// A browser page backed by fixture maps.
///
/// Screenshots are looked up by the last navigated URL; element boxes by
/// selector. Unknown URLs fail the screenshot call, which is convenient
/// for error-path tests.
pub struct MockBrowserPage {
    state: Arc<Mutex<MockBrowserState>>,
    current_url: Mutex<String>,
    evaluated: Mutex<Vec<String>>,
}

impl MockBrowserPage {
    /// Scripts this page has evaluated, in order.
    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.evaluated.lock().clone()
    }
}

#[async_trait]
impl BrowserPage for MockBrowserPage {
    async fn set_viewport(&self, _width: u32, _height: u32, _dpr: f64) -> Result<()> {
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        let delay = self.state.lock().navigation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        *self.current_url.lock() = url.to_string();
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        self.evaluated.lock().push(script.to_string());
        Ok(serde_json::Value::Bool(true))
    }

    async fn wait_for_load_state(&self, _state: LoadState, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn screenshot(&self, _options: &ScreenshotOptions) -> Result<Vec<u8>> {
        let url = self.current_url.lock().clone();
        self.state
            .lock()
            .screenshots
            .get(&url)
            .cloned()
            .ok_or_else(|| SnapError::NavigationTimeout(30_000, url))
    }

    async fn element_box(&self, selector: &str) -> Result<Option<BoundingBox>> {
        Ok(self.state.lock().element_boxes.get(selector).copied())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Pool handing out [`MockBrowserPage`]s over a shared fixture map.
///
/// # Example
///
/// ```rust
/// use dashsnap_testing::{fixtures, MockBrowserPool};
///
/// let pool = MockBrowserPool::new()
///     .with_screenshot("https://example.com/", fixtures::solid_png(64, 64, [0, 0, 0, 255]));
/// ```
#[derive(Clone, Default)]
pub struct MockBrowserPool {
    state: Arc<Mutex<MockBrowserState>>,
    acquired: Arc<Mutex<usize>>,
    released: Arc<Mutex<usize>>,
}

impl MockBrowserPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` for screenshots of `url`.
    #[must_use]
    pub fn with_screenshot(self, url: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.state.lock().screenshots.insert(url.into(), bytes);
        self
    }

    /// Resolve `selector` to `bounds`.
    #[must_use]
    pub fn with_element_box(self, selector: impl Into<String>, bounds: BoundingBox) -> Self {
        self.state.lock().element_boxes.insert(selector.into(), bounds);
        self
    }

    /// Delay every navigation, useful for cancellation tests.
    #[must_use]
    pub fn with_navigation_delay(self, delay: Duration) -> Self {
        self.state.lock().navigation_delay = delay;
        self
    }

    /// Replace the screenshot served for `url` mid-test.
    pub fn update_screenshot(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.state.lock().screenshots.insert(url.into(), bytes);
    }

    /// (acquired, released) counters; equal after a clean run.
    pub fn pool_counters(&self) -> (usize, usize) {
        (*self.acquired.lock(), *self.released.lock())
    }
}

#[async_trait]
impl BrowserPool for MockBrowserPool {
    async fn acquire(&self) -> Result<Box<dyn BrowserPage>> {
        *self.acquired.lock() += 1;
        Ok(Box::new(MockBrowserPage {
            state: Arc::clone(&self.state),
            current_url: Mutex::new(String::new()),
            evaluated: Mutex::new(Vec::new()),
        }))
    }

    async fn release(&self, page: Box<dyn BrowserPage>) -> Result<()> {
        page.close().await?;
        *self.released.lock() += 1;
        Ok(())
    }
}
