//! Parallel visual test runner.
//!
//! Orchestrates selection → capture → comparison → aggregation across many
//! pages with a bounded worker pool. Per-page failures never abort the run;
//! budget exhaustion downgrades remaining pages to structural-only
//! classification; cancellation produces a partial run flagged
//! `interrupted`. Results are always emitted in input order regardless of
//! completion order.

mod progress;
mod result_cache;
mod selection;

pub use progress::{EwmaEta, ProgressSink, ProgressUpdate};
pub use result_cache::{ResultCache, ResultCacheConfig};
pub use selection::{select_pages, IncrementalConfig, TestSelection};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::baseline::{BaselineManager, BaselineMeta, LookupStrategy};
use crate::capture::{resolve_regions, BrowserPage, CaptureConfig, CaptureEngine, CaptureMode, CaptureResult, MapRegionResolver};
use crate::diff::{DiffCacheKey, DiffEngine, DiffOptions, DiffResult, Severity};
use crate::error::{Result, SnapError};
use crate::vcs::VersionControl;
use crate::vision::{SmartVisionClient, VisionClassification, VisionContext, VisionRequest};

/// Classifications retained per (url, selector) key and offered back to
/// providers as context on later calls for the same key.
const SEMANTIC_HISTORY_LIMIT: usize = 5;

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation token. Cancelling flips a shared flag that is
/// checked between phases and at every suspension point.
#[derive(Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. In-flight captures are abandoned; in-flight
    /// diffs run to completion.
    pub fn cancel(&self) {
        let _ = self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

// ============================================================================
// Browser pool
// ============================================================================

/// Pool of browser pages shared by capture workers. `release` must clear
/// page-level state before the page can be handed out again.
#[async_trait]
pub trait BrowserPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn BrowserPage>>;
    async fn release(&self, page: Box<dyn BrowserPage>) -> Result<()>;
}

// ============================================================================
// Run inputs and outputs
// ============================================================================

/// One page under test.
#[derive(Debug, Clone)]
pub struct PageSpec {
    /// Stable page id; selection and reporting key on it.
    pub id: String,
    pub url: String,
    pub capture: CaptureConfig,
    pub diff: DiffOptions,
    /// Device tag contributing to the baseline key.
    pub device: Option<String>,
}

impl PageSpec {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            capture: CaptureConfig::default(),
            diff: DiffOptions::default(),
            device: None,
        }
    }
}

/// Final classification of a page within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum PageStatus {
    Passed,
    Regression(Severity),
    Errored(String),
    Skipped(String),
}

/// Per-page outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub id: String,
    pub url: String,
    pub status: PageStatus,
    pub diff: Option<DiffResult>,
    /// Set when a missing baseline was persisted instead of compared.
    pub baseline_created: bool,
    pub duration_ms: u64,
}

/// Counts by severity across compared pages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub none: usize,
    pub minor: usize,
    pub moderate: usize,
    pub breaking: usize,
}

impl SeverityCounts {
    fn record(&mut self, severity: Severity) {
        match severity {
            Severity::None => self.none += 1,
            Severity::Minor => self.minor += 1,
            Severity::Moderate => self.moderate += 1,
            Severity::Breaking => self.breaking += 1,
        }
    }
}

/// Aggregated run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub regressions: usize,
    pub errored: usize,
    pub skipped: usize,
    pub by_severity: SeverityCounts,
    pub cache_hits: usize,
    /// Pages whose semantic classification was unavailable after budget
    /// exhaustion.
    pub ai_unavailable: usize,
    pub duration_ms: u64,
    pub interrupted: bool,
    /// Overall verdict: true when any page errored or reached the
    /// configured failure threshold.
    pub failed: bool,
}

/// Environment the run executed in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentMetadata {
    pub branch: Option<String>,
    pub commit: Option<String>,
}

/// Complete result surface of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualTestRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Input page ids, in input order.
    pub input_pages: Vec<String>,
    /// Selection outcome when incremental mode was on.
    pub selection: Option<TestSelection>,
    /// One result per input page, ordered by input position.
    pub results: Vec<PageResult>,
    pub summary: RunSummary,
    pub environment: EnvironmentMetadata,
}

// ============================================================================
// Configuration
// ============================================================================

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Bounded worker pool size.
    pub concurrency: usize,
    /// Persist a new baseline when none exists instead of skipping.
    pub update_baselines: bool,
    /// Treat a missing baseline as a per-page error.
    pub strict_baselines: bool,
    /// Baseline lookup strategy.
    pub baseline_strategy: LookupStrategy,
    /// Run semantic classification for pages whose structural result
    /// indicates change (requires a vision client).
    pub semantic_enabled: bool,
    /// Semantic severity overrides structural severity at or above this
    /// confidence.
    pub semantic_override_confidence: f64,
    /// Per-capture deadline, including stabilization.
    pub capture_timeout: Duration,
    /// Per-diff deadline.
    pub diff_timeout: Duration,
    /// Incremental selection; `None` runs every page.
    pub incremental: Option<IncrementalConfig>,
    /// Run fails when any page reaches this severity.
    pub fail_threshold: Severity,
    /// Root for run artifacts; each run writes under `<root>/<run-id>/`.
    pub artifact_root: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            update_baselines: false,
            strict_baselines: false,
            baseline_strategy: LookupStrategy::Branch,
            semantic_enabled: false,
            semantic_override_confidence: 0.7,
            capture_timeout: Duration::from_secs(30),
            diff_timeout: Duration::from_secs(10),
            incremental: None,
            fail_threshold: Severity::Moderate,
            artifact_root: None,
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

struct RunShared {
    total: usize,
    completed: AtomicUsize,
    passed: AtomicUsize,
    failed: AtomicUsize,
    cache_hits: AtomicUsize,
    ai_unavailable: AtomicUsize,
    budget_exhausted: AtomicBool,
    eta: Mutex<EwmaEta>,
    started: Instant,
}

/// Orchestrates capture → diff → AI classification → aggregation.
pub struct VisualTestRunner {
    pool: Arc<dyn BrowserPool>,
    baselines: Arc<BaselineManager>,
    vcs: Arc<dyn VersionControl>,
    vision: Option<Arc<SmartVisionClient>>,
    capture_engine: CaptureEngine,
    diff_engine: Arc<DiffEngine>,
    result_cache: Option<ResultCache>,
    progress_sinks: Vec<Arc<dyn ProgressSink>>,
    /// Recent classifications per (url, selector) key, fed back to
    /// providers as request context.
    semantic_history: Mutex<HashMap<(String, Option<String>), VecDeque<VisionClassification>>>,
    config: RunnerConfig,
}

impl VisualTestRunner {
    pub fn new(
        pool: Arc<dyn BrowserPool>,
        baselines: Arc<BaselineManager>,
        vcs: Arc<dyn VersionControl>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            pool,
            baselines,
            vcs,
            vision: None,
            capture_engine: CaptureEngine::new(),
            diff_engine: Arc::new(DiffEngine::new()),
            result_cache: None,
            progress_sinks: Vec::new(),
            semantic_history: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Attach a vision client for semantic classification.
    #[must_use]
    pub fn with_vision(mut self, client: Arc<SmartVisionClient>) -> Self {
        self.vision = Some(client);
        self
    }

    /// Enable the advisory result cache.
    #[must_use]
    pub fn with_result_cache(mut self, config: ResultCacheConfig) -> Self {
        self.result_cache = Some(ResultCache::new(config));
        self
    }

    /// Register a progress sink; it receives an update per completed page.
    #[must_use]
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sinks.push(sink);
        self
    }

    /// Execute a run. Always produces a `VisualTestRun`; per-page failures
    /// land in the per-page status, never here.
    ///
    /// # Errors
    ///
    /// Only configuration validation can fail the entry point.
    pub async fn run(
        &self,
        pages: Vec<PageSpec>,
        token: &CancellationToken,
    ) -> Result<VisualTestRun> {
        if self.config.concurrency == 0 {
            return Err(SnapError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }
        for page in &pages {
            page.diff.validate()?;
        }
        if self.config.semantic_enabled && self.vision.is_none() {
            return Err(SnapError::Configuration(
                "semantic_enabled requires a vision client".to_string(),
            ));
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let input_pages: Vec<String> = pages.iter().map(|p| p.id.clone()).collect();

        let environment = EnvironmentMetadata {
            branch: self.vcs.current_branch().ok(),
            commit: self.vcs.current_commit().ok(),
        };

        // Phase 1: selection
        let selection = match &self.config.incremental {
            Some(config) => Some(select_pages(&input_pages, &self.vcs, config)?),
            None => None,
        };
        let is_selected = |id: &str| -> bool {
            selection
                .as_ref()
                .map(|s| s.selected.iter().any(|sel| sel == id))
                .unwrap_or(true)
        };

        let selected: Vec<(usize, &PageSpec)> = pages
            .iter()
            .enumerate()
            .filter(|(_, p)| is_selected(&p.id))
            .collect();

        info!(
            run_id = %run_id,
            total = pages.len(),
            selected = selected.len(),
            concurrency = self.config.concurrency,
            "starting visual test run"
        );

        let shared = Arc::new(RunShared {
            total: selected.len(),
            completed: AtomicUsize::new(0),
            passed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            ai_unavailable: AtomicUsize::new(0),
            budget_exhausted: AtomicBool::new(false),
            eta: Mutex::new(EwmaEta::new()),
            started,
        });

        let artifact_dir = self
            .config
            .artifact_root
            .as_ref()
            .map(|root| root.join(run_id.to_string()));

        // Phases 2 + 3: capture and comparison, pipelined per page through
        // a bounded worker pool; completion order is arbitrary
        let completed: Vec<(usize, PageResult)> = stream::iter(selected.into_iter().map(
            |(index, spec)| {
                let shared = Arc::clone(&shared);
                let artifact_dir = artifact_dir.clone();
                async move {
                    let result = self.run_page(spec, token, &shared, artifact_dir).await;
                    self.report_progress(&shared, &result);
                    (index, result)
                }
            },
        ))
        .buffer_unordered(self.config.concurrency)
        .collect()
        .await;

        // Phase 4: aggregation, restoring input order
        let mut slots: Vec<Option<PageResult>> = vec![None; pages.len()];
        for (index, result) in completed {
            slots[index] = Some(result);
        }
        let mut results = Vec::with_capacity(pages.len());
        for (index, page) in pages.iter().enumerate() {
            let result = slots[index].take().unwrap_or_else(|| {
                let reason = selection
                    .as_ref()
                    .and_then(|s| s.reasons.get(&page.id).cloned())
                    .unwrap_or_else(|| "not selected".to_string());
                PageResult {
                    id: page.id.clone(),
                    url: page.url.clone(),
                    status: PageStatus::Skipped(reason),
                    diff: None,
                    baseline_created: false,
                    duration_ms: 0,
                }
            });
            results.push(result);
        }

        let summary = summarize(
            &results,
            &shared,
            started.elapsed().as_millis() as u64,
            token.is_cancelled(),
            self.config.fail_threshold,
        );

        info!(
            run_id = %run_id,
            passed = summary.passed,
            regressions = summary.regressions,
            errored = summary.errored,
            skipped = summary.skipped,
            interrupted = summary.interrupted,
            "visual test run complete"
        );

        Ok(VisualTestRun {
            id: run_id,
            started_at,
            input_pages,
            selection,
            results,
            summary,
            environment,
        })
    }

    async fn run_page(
        &self,
        spec: &PageSpec,
        token: &CancellationToken,
        shared: &Arc<RunShared>,
        artifact_dir: Option<PathBuf>,
    ) -> PageResult {
        let page_started = Instant::now();
        let finish = |status: PageStatus, diff: Option<DiffResult>, baseline_created: bool| {
            PageResult {
                id: spec.id.clone(),
                url: spec.url.clone(),
                status,
                diff,
                baseline_created,
                duration_ms: page_started.elapsed().as_millis() as u64,
            }
        };

        if token.is_cancelled() {
            return finish(PageStatus::Skipped("cancelled".to_string()), None, false);
        }

        // Capture
        let (capture, resolver) = match self.capture_page(spec, token).await {
            Ok(out) => out,
            Err(SnapError::Cancelled) => {
                return finish(PageStatus::Skipped("cancelled".to_string()), None, false)
            }
            Err(e) => {
                warn!(page = %spec.id, error = %e, "capture failed");
                return finish(PageStatus::Errored(e.to_string()), None, false);
            }
        };

        // Cancellation checked between phases; the comparison phase does
        // not start after a cancel
        if token.is_cancelled() {
            return finish(PageStatus::Skipped("cancelled".to_string()), None, false);
        }

        // Baseline resolution
        let element = match &spec.capture.mode {
            CaptureMode::Element(selector) => Some(selector.as_str()),
            _ => None,
        };
        let record = match self.baselines.get_baseline(
            &spec.url,
            element,
            spec.device.as_deref(),
            &self.config.baseline_strategy,
        ) {
            Ok(record) => record,
            Err(e) => return finish(PageStatus::Errored(e.to_string()), None, false),
        };

        let Some(record) = record else {
            return match self.handle_missing_baseline(spec, &capture) {
                Ok(result) => finish(PageStatus::Passed, Some(result), true),
                Err(e) => {
                    if self.config.strict_baselines {
                        finish(PageStatus::Errored(e.to_string()), None, false)
                    } else {
                        finish(PageStatus::Skipped(e.to_string()), None, false)
                    }
                }
            };
        };

        let baseline_bytes = match self.baselines.load_bytes(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Store integrity problems on the baseline are fatal for
                // this page only
                warn!(page = %spec.id, error = %e, "baseline read failed");
                return finish(PageStatus::Errored(e.to_string()), None, false);
            }
        };

        // Comparison, with the advisory result cache in front
        let cache_key = DiffCacheKey {
            baseline: record.hash,
            current: capture.hash,
            options_fingerprint: spec.diff.fingerprint(),
        };
        let cached = self
            .result_cache
            .as_ref()
            .and_then(|cache| cache.get(&cache_key));
        let mut diff = match cached {
            Some(result) => {
                shared.cache_hits.fetch_add(1, Ordering::SeqCst);
                debug!(page = %spec.id, "result cache hit");
                result
            }
            None => {
                match self
                    .compare(spec, baseline_bytes, capture.bytes.clone(), resolver, artifact_dir)
                    .await
                {
                    Ok(result) => {
                        if let Some(cache) = &self.result_cache {
                            cache.insert(cache_key, result.clone());
                        }
                        result
                    }
                    Err(e) => {
                        warn!(page = %spec.id, error = %e, "comparison failed");
                        return finish(PageStatus::Errored(e.to_string()), None, false);
                    }
                }
            }
        };

        // Semantic classification
        if self.semantic_wanted(spec) && diff.overall.severity > Severity::None {
            self.classify_semantic(spec, &capture, &mut diff, shared).await;
        }

        let status = if diff.overall.pass {
            PageStatus::Passed
        } else {
            PageStatus::Regression(diff.overall.severity)
        };
        finish(status, Some(diff), false)
    }

    fn semantic_wanted(&self, spec: &PageSpec) -> bool {
        self.config.semantic_enabled && spec.diff.semantic_analysis && self.vision.is_some()
    }

    async fn capture_page(
        &self,
        spec: &PageSpec,
        token: &CancellationToken,
    ) -> Result<(CaptureResult, MapRegionResolver)> {
        let page = self.pool.acquire().await?;

        let outcome = {
            let page_ref: &dyn BrowserPage = page.as_ref();
            tokio::select! {
                result = async {
                    let capture = tokio::time::timeout(
                        self.config.capture_timeout,
                        self.capture_engine.capture(page_ref, &spec.url, &spec.capture),
                    )
                    .await
                    .map_err(|_| {
                        SnapError::Timeout(self.config.capture_timeout.as_millis() as u64)
                    })??;

                    let resolver = if spec.diff.regions.is_empty() {
                        MapRegionResolver::default()
                    } else {
                        resolve_regions(page_ref, &spec.diff.regions).await?
                    };
                    Ok::<_, SnapError>((capture, resolver))
                } => result,
                // In-flight captures are abandoned on cancel
                () = token.cancelled() => Err(SnapError::Cancelled),
            }
        };

        // The page always goes back to the pool; release clears page state
        if let Err(e) = self.pool.release(page).await {
            warn!(error = %e, "browser page release failed");
        }
        outcome
    }

    async fn compare(
        &self,
        spec: &PageSpec,
        baseline_bytes: Vec<u8>,
        current_bytes: Vec<u8>,
        resolver: MapRegionResolver,
        artifact_dir: Option<PathBuf>,
    ) -> Result<DiffResult> {
        let engine = Arc::clone(&self.diff_engine);
        let options = spec.diff.clone();

        let join = tokio::time::timeout(
            self.config.diff_timeout,
            tokio::task::spawn_blocking(move || {
                engine.compare_with_artifacts(
                    &baseline_bytes,
                    &current_bytes,
                    &options,
                    Some(&resolver),
                    artifact_dir.as_deref(),
                )
            }),
        )
        .await;

        match join {
            Err(_) => Err(SnapError::Timeout(
                self.config.diff_timeout.as_millis() as u64
            )),
            Ok(Err(join_error)) => Err(SnapError::InvalidInput(format!(
                "diff task failed: {join_error}"
            ))),
            Ok(Ok(result)) => result,
        }
    }

    fn handle_missing_baseline(
        &self,
        spec: &PageSpec,
        capture: &CaptureResult,
    ) -> Result<DiffResult> {
        if !self.config.update_baselines {
            return Err(SnapError::BaselineNotFound(format!(
                "no baseline for {}",
                spec.url
            )));
        }
        let meta = BaselineMeta {
            branch: self.vcs.current_branch()?,
            commit: self.vcs.current_commit()?,
            url: spec.url.clone(),
            element: match &spec.capture.mode {
                CaptureMode::Element(selector) => Some(selector.clone()),
                _ => None,
            },
            device: spec.device.clone(),
        };
        self.baselines.set_baseline(capture, &meta)?;
        info!(page = %spec.id, url = %spec.url, "baseline created from first capture");

        let total = image::load_from_memory(&capture.bytes)
            .map(|img| u64::from(img.width()) * u64::from(img.height()))
            .unwrap_or(0);
        Ok(DiffResult::identical(total))
    }

    async fn classify_semantic(
        &self,
        spec: &PageSpec,
        capture: &CaptureResult,
        diff: &mut DiffResult,
        shared: &Arc<RunShared>,
    ) {
        let Some(vision) = &self.vision else { return };

        if shared.budget_exhausted.load(Ordering::SeqCst) {
            diff.semantic_unavailable = true;
            shared.ai_unavailable.fetch_add(1, Ordering::SeqCst);
            return;
        }

        // The vision client re-reads the baseline through its own
        // preprocessing; sending capture bytes for both sides would defeat
        // the comparison, so reload the stored baseline payload.
        let baseline_bytes = match self.reload_baseline_bytes(spec) {
            Some(bytes) => bytes,
            None => return,
        };

        let key = semantic_history_key(spec);
        let recent = self.recent_classifications(&key);

        let request = VisionRequest {
            baseline: baseline_bytes,
            current: capture.bytes.clone(),
            context: Some(VisionContext {
                url: Some(spec.url.clone()),
                selector: key.1.clone(),
                recent,
            }),
        };

        match vision.analyze_visual_diff(&request).await {
            Ok(classification) => {
                self.record_classification(key, &classification);
                if classification.confidence >= self.config.semantic_override_confidence {
                    diff.overall.severity = classification.severity;
                    diff.overall.pass = classification.severity <= Severity::Minor;
                    diff.overall.confidence = classification.confidence;
                }
                diff.semantic = Some(classification);
            }
            Err(SnapError::BudgetExhausted(message)) => {
                // Stop submitting AI work for the rest of the run
                warn!(page = %spec.id, %message, "vision budget exhausted, remaining pages get structural classification only");
                shared.budget_exhausted.store(true, Ordering::SeqCst);
                diff.semantic_unavailable = true;
                shared.ai_unavailable.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                // Transient provider problems never fail the run
                warn!(page = %spec.id, error = %e, "semantic classification failed, keeping structural verdict");
            }
        }
    }

    /// Recent classifications for a key, newest first.
    fn recent_classifications(
        &self,
        key: &(String, Option<String>),
    ) -> Vec<VisionClassification> {
        self.semantic_history
            .lock()
            .get(key)
            .map(|history| history.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn record_classification(
        &self,
        key: (String, Option<String>),
        classification: &VisionClassification,
    ) {
        let mut history = self.semantic_history.lock();
        let entry = history.entry(key).or_default();
        entry.push_back(classification.clone());
        while entry.len() > SEMANTIC_HISTORY_LIMIT {
            entry.pop_front();
        }
    }

    fn reload_baseline_bytes(&self, spec: &PageSpec) -> Option<Vec<u8>> {
        let element = match &spec.capture.mode {
            CaptureMode::Element(selector) => Some(selector.as_str()),
            _ => None,
        };
        let record = self
            .baselines
            .get_baseline(
                &spec.url,
                element,
                spec.device.as_deref(),
                &self.config.baseline_strategy,
            )
            .ok()??;
        self.baselines.load_bytes(&record).ok()
    }

    fn report_progress(&self, shared: &Arc<RunShared>, result: &PageResult) {
        let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        match &result.status {
            PageStatus::Passed => {
                shared.passed.fetch_add(1, Ordering::SeqCst);
            }
            PageStatus::Regression(_) | PageStatus::Errored(_) => {
                shared.failed.fetch_add(1, Ordering::SeqCst);
            }
            PageStatus::Skipped(_) => {}
        }

        let estimated_remaining_ms = {
            let mut eta = shared.eta.lock();
            eta.observe(result.duration_ms);
            eta.estimate_remaining_ms(shared.total.saturating_sub(completed))
        };

        let update = ProgressUpdate {
            completed,
            total: shared.total,
            current_page: result.id.clone(),
            passed: shared.passed.load(Ordering::SeqCst),
            failed: shared.failed.load(Ordering::SeqCst),
            cache_hits: shared.cache_hits.load(Ordering::SeqCst),
            elapsed_ms: shared.started.elapsed().as_millis() as u64,
            estimated_remaining_ms,
        };
        for sink in &self.progress_sinks {
            sink.on_progress(&update);
        }
    }
}

/// The key a page's classifications are remembered under.
fn semantic_history_key(spec: &PageSpec) -> (String, Option<String>) {
    let selector = match &spec.capture.mode {
        CaptureMode::Element(selector) => Some(selector.clone()),
        _ => None,
    };
    (spec.url.clone(), selector)
}

fn summarize(
    results: &[PageResult],
    shared: &Arc<RunShared>,
    duration_ms: u64,
    interrupted: bool,
    fail_threshold: Severity,
) -> RunSummary {
    let mut summary = RunSummary {
        total: results.len(),
        passed: 0,
        regressions: 0,
        errored: 0,
        skipped: 0,
        by_severity: SeverityCounts::default(),
        cache_hits: shared.cache_hits.load(Ordering::SeqCst),
        ai_unavailable: shared.ai_unavailable.load(Ordering::SeqCst),
        duration_ms,
        interrupted,
        failed: false,
    };

    for result in results {
        match &result.status {
            PageStatus::Passed => summary.passed += 1,
            PageStatus::Regression(_) => summary.regressions += 1,
            PageStatus::Errored(_) => {
                summary.errored += 1;
                summary.failed = true;
            }
            PageStatus::Skipped(_) => summary.skipped += 1,
        }
        if let Some(diff) = &result.diff {
            summary.by_severity.record(diff.overall.severity);
            if diff.overall.severity >= fail_threshold {
                summary.failed = true;
            }
        }
    }

    summary
}
