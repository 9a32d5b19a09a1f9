//! Screenshot acquisition with stabilization and masking.
//!
//! The engine drives a [`BrowserPage`] capability: navigate, settle the
//! page (fonts, animations, network, fixed delay), hide masked elements,
//! then acquire bytes. Masking is deterministic: two captures of a page
//! differing only in masked regions produce byte-identical outputs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::diff::{BoundingBox, RegionResolver, RegionSpec};
use crate::error::{Result, SnapError};
use crate::hash::ImageHash;

/// What part of the page a capture covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode", content = "selector")]
pub enum CaptureMode {
    /// The current viewport only.
    Viewport,
    /// The full scrollable page.
    FullPage,
    /// A single element, identified by selector.
    Element(String),
}

/// Output encoding requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    Png,
    Jpeg,
}

/// Preferred color scheme for the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    #[default]
    Light,
    Dark,
}

/// Page readiness states the driver can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    Load,
    NetworkIdle,
}

/// Options forwarded to the driver's screenshot call.
#[derive(Debug, Clone)]
pub struct ScreenshotOptions {
    pub mode: CaptureMode,
    pub quality: u8,
    pub format: CaptureFormat,
}

/// The headless-browser capability consumed by this engine and by region
/// resolution. No other component may touch the driver.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn set_viewport(&self, width: u32, height: u32, device_pixel_ratio: f64) -> Result<()>;

    async fn goto(&self, url: &str) -> Result<()>;

    /// Evaluate a script in the page, returning its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<()>;

    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<Vec<u8>>;

    /// Bounding box for a selector, or `None` when it matches nothing.
    async fn element_box(&self, selector: &str) -> Result<Option<BoundingBox>>;

    async fn close(&self) -> Result<()>;
}

/// Stabilization steps applied before the screenshot, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilizationConfig {
    /// Wait for `document.fonts.ready`.
    pub wait_for_fonts: bool,
    /// Inject a style rule disabling animations and transitions.
    pub disable_animations: bool,
    /// Fixed settle delay after everything else.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
    /// Wait for the network to go idle, bounded by
    /// `network_idle_timeout`.
    pub wait_for_network_idle: bool,
    #[serde(with = "duration_millis")]
    pub network_idle_timeout: Duration,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            wait_for_fonts: true,
            disable_animations: true,
            delay: Duration::from_millis(250),
            wait_for_network_idle: true,
            network_idle_timeout: Duration::from_secs(5),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Full capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub mode: CaptureMode,
    /// Selectors hidden before the screenshot.
    pub mask: Vec<String>,
    pub stabilization: StabilizationConfig,
    pub quality: u8,
    pub format: CaptureFormat,
    pub device_pixel_ratio: f64,
    pub color_scheme: ColorScheme,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            viewport_width: 1280,
            viewport_height: 720,
            mode: CaptureMode::Viewport,
            mask: Vec::new(),
            stabilization: StabilizationConfig::default(),
            quality: 90,
            format: CaptureFormat::Png,
            device_pixel_ratio: 1.0,
            color_scheme: ColorScheme::Light,
        }
    }
}

/// Metadata recorded alongside captured bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_pixel_ratio: f64,
    pub color_scheme: ColorScheme,
    pub mode: CaptureMode,
    /// Whether stabilization steps ran before the screenshot.
    pub stabilized: bool,
}

/// A captured screenshot. Lives for the duration of the run.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub url: String,
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`; a pure function of the payload.
    pub hash: ImageHash,
    pub metadata: CaptureMetadata,
}

const DISABLE_ANIMATIONS_SCRIPT: &str = r#"(() => {
    const style = document.createElement('style');
    style.setAttribute('data-dashsnap', 'freeze');
    style.textContent = '*, *::before, *::after { animation: none !important; transition: none !important; caret-color: transparent !important; }';
    document.head.appendChild(style);
    return true;
})()"#;

const FONTS_READY_SCRIPT: &str = "document.fonts.ready.then(() => true)";

fn mask_script(selectors: &[String]) -> String {
    let rules: Vec<String> = selectors
        .iter()
        .map(|s| format!("{s} {{ visibility: hidden !important; }}"))
        .collect();
    format!(
        r#"(() => {{
    const style = document.createElement('style');
    style.setAttribute('data-dashsnap', 'mask');
    style.textContent = {};
    document.head.appendChild(style);
    return true;
}})()"#,
        serde_json::json!(rules.join("\n"))
    )
}

/// Wall-time slack on top of the configured stabilization budget.
const CAPTURE_BASE_BUDGET: Duration = Duration::from_secs(5);

/// Drives a [`BrowserPage`] through stabilization and screenshot
/// acquisition.
#[derive(Debug, Clone, Default)]
pub struct CaptureEngine;

impl CaptureEngine {
    pub fn new() -> Self {
        Self
    }

    /// Capture `url` on `page` with the given configuration.
    ///
    /// Total wall time is bounded by `stabilization.delay +
    /// stabilization.network_idle_timeout + 5s`.
    ///
    /// # Errors
    ///
    /// [`SnapError::NavigationTimeout`], [`SnapError::ElementNotFound`]
    /// (element mode), or [`SnapError::StabilizationTimeout`].
    pub async fn capture(
        &self,
        page: &dyn BrowserPage,
        url: &str,
        config: &CaptureConfig,
    ) -> Result<CaptureResult> {
        let budget =
            config.stabilization.delay + config.stabilization.network_idle_timeout + CAPTURE_BASE_BUDGET;

        match tokio::time::timeout(budget, self.capture_inner(page, url, config)).await {
            Ok(result) => result,
            Err(_) => Err(SnapError::StabilizationTimeout(format!(
                "capture of {url} exceeded {}ms",
                budget.as_millis()
            ))),
        }
    }

    async fn capture_inner(
        &self,
        page: &dyn BrowserPage,
        url: &str,
        config: &CaptureConfig,
    ) -> Result<CaptureResult> {
        page.set_viewport(
            config.viewport_width,
            config.viewport_height,
            config.device_pixel_ratio,
        )
        .await?;

        page.goto(url).await.map_err(|e| match e {
            SnapError::Timeout(ms) => SnapError::NavigationTimeout(ms, url.to_string()),
            other => other,
        })?;

        let stabilization = &config.stabilization;
        page.wait_for_load_state(LoadState::DomContentLoaded, CAPTURE_BASE_BUDGET)
            .await
            .map_err(|e| SnapError::StabilizationTimeout(e.to_string()))?;

        if stabilization.wait_for_fonts {
            page.evaluate(FONTS_READY_SCRIPT)
                .await
                .map_err(|e| SnapError::StabilizationTimeout(format!("fonts: {e}")))?;
        }

        if stabilization.disable_animations {
            page.evaluate(DISABLE_ANIMATIONS_SCRIPT).await?;
        }

        if stabilization.wait_for_network_idle {
            // Bounded wait; a page that never settles still gets captured
            if let Err(e) = page
                .wait_for_load_state(LoadState::NetworkIdle, stabilization.network_idle_timeout)
                .await
            {
                tracing::debug!(url, error = %e, "network did not go idle within budget");
            }
        }

        if !stabilization.delay.is_zero() {
            tokio::time::sleep(stabilization.delay).await;
        }

        if !config.mask.is_empty() {
            page.evaluate(&mask_script(&config.mask)).await?;
        }

        if let CaptureMode::Element(selector) = &config.mode {
            if page.element_box(selector).await?.is_none() {
                return Err(SnapError::ElementNotFound(selector.clone()));
            }
        }

        let bytes = page
            .screenshot(&ScreenshotOptions {
                mode: config.mode.clone(),
                quality: config.quality,
                format: config.format,
            })
            .await?;

        let hash = ImageHash::from_bytes(&bytes);
        let stabilized = stabilization.wait_for_fonts
            || stabilization.disable_animations
            || stabilization.wait_for_network_idle
            || !stabilization.delay.is_zero();

        Ok(CaptureResult {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            url: url.to_string(),
            bytes,
            hash,
            metadata: CaptureMetadata {
                viewport_width: config.viewport_width,
                viewport_height: config.viewport_height,
                device_pixel_ratio: config.device_pixel_ratio,
                color_scheme: config.color_scheme,
                mode: config.mode.clone(),
                stabilized,
            },
        })
    }
}

/// Resolve region selectors to boxes through the driver, producing a
/// resolver the (synchronous) diff engine can consume.
pub async fn resolve_regions(
    page: &dyn BrowserPage,
    specs: &[RegionSpec],
) -> Result<MapRegionResolver> {
    let mut boxes = HashMap::new();
    for spec in specs {
        if let Some(bounds) = page.element_box(&spec.selector).await? {
            boxes.insert(spec.selector.clone(), bounds);
        }
    }
    Ok(MapRegionResolver { boxes })
}

/// Selector-to-box resolver backed by a fixed map.
#[derive(Debug, Clone, Default)]
pub struct MapRegionResolver {
    boxes: HashMap<String, BoundingBox>,
}

impl MapRegionResolver {
    pub fn new(boxes: HashMap<String, BoundingBox>) -> Self {
        Self { boxes }
    }
}

impl RegionResolver for MapRegionResolver {
    fn resolve(&self, selector: &str) -> Option<BoundingBox> {
        self.boxes.get(selector).copied()
    }
}
