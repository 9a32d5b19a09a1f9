// Tests use unwrap for setup where failures should be loud.
#![allow(clippy::unwrap_used)]

//! End-to-end scenarios exercising the full capture → diff → classify
//! pipeline against mock providers and a mock browser.

use std::sync::Arc;
use std::time::Duration;

use dashsnap::baseline::{BaselineManager, BaselineManagerConfig, BaselineFilter};
use dashsnap::diff::{DiffEngine, DiffOptions, RegionSpec, Severity, BoundingBox};
use dashsnap::preprocess::ImagePreprocessor;
use dashsnap::runner::{
    CancellationToken, PageSpec, ResultCacheConfig, RunnerConfig, VisualTestRunner,
};
use dashsnap::vcs::{StaticVersionControl, VersionControl};
use dashsnap::vision::{
    BudgetConfig, CostTracker, PricingTable, SmartVisionClient, SmartVisionClientConfig,
    VisionCache, VisionCategory, VisionProvider, VisionRequest,
};
use dashsnap_testing::{fixtures, MockBrowserPool, MockVisionProvider};

fn fast_spec(id: &str, url: &str) -> PageSpec {
    let mut spec = PageSpec::new(id, url);
    spec.capture.stabilization.delay = Duration::ZERO;
    spec.capture.stabilization.wait_for_network_idle = false;
    spec
}

fn vcs() -> Arc<dyn VersionControl> {
    Arc::new(StaticVersionControl::new("main", "c0ffee"))
}

/// Scenario: byte-identical captures produce a clean pass with no AI call
/// and no cost.
#[tokio::test]
async fn identical_images_pass_without_ai() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = fixtures::solid_png(320, 180, [245, 245, 245, 255]);
    let pool = MockBrowserPool::new().with_screenshot("https://app/", bytes);

    let vcs = vcs();
    let baselines = Arc::new(
        BaselineManager::open(BaselineManagerConfig::new(dir.path()), vcs.clone()).unwrap(),
    );

    let provider = MockVisionProvider::new("mock");
    let cache = Arc::new(VisionCache::open_in_memory(16).unwrap());
    let cost = Arc::new(
        CostTracker::open_in_memory(PricingTable::with_defaults(), BudgetConfig::default())
            .unwrap(),
    );
    let client = Arc::new(
        SmartVisionClient::new(
            vec![Arc::new(provider.clone()) as Arc<dyn VisionProvider>],
            ImagePreprocessor::with_defaults(),
            cache,
            Arc::clone(&cost),
            SmartVisionClientConfig::default(),
        )
        .unwrap(),
    );

    let runner = VisualTestRunner::new(
        Arc::new(pool),
        baselines,
        vcs,
        RunnerConfig {
            update_baselines: true,
            semantic_enabled: true,
            ..RunnerConfig::default()
        },
    )
    .with_vision(client);

    let mut page = fast_spec("app", "https://app/");
    page.diff.semantic_analysis = true;
    let pages = vec![page];

    // First run seeds the baseline; second compares identical bytes
    runner.run(pages.clone(), &CancellationToken::new()).await.unwrap();
    let run = runner.run(pages, &CancellationToken::new()).await.unwrap();

    let diff = run.results[0].diff.as_ref().unwrap();
    assert_eq!(diff.overall.severity, Severity::None);
    assert!(diff.overall.pass);
    assert!((diff.pixel.diff_pct - 0.0).abs() < f64::EPSILON);
    assert!((diff.pixel.ssim - 1.0).abs() < f64::EPSILON);
    assert_eq!(provider.call_count(), 0, "no AI call for identical images");
    assert!((cost.stats().unwrap().total_cost - 0.0).abs() < f64::EPSILON);
}

/// Scenario: a small positional drift lands in the minor band and passes.
#[test]
fn minor_shift_classifies_minor() {
    let engine = DiffEngine::new();
    // One changed row out of 100 is a 1% diff
    let baseline = fixtures::solid_png(100, 100, [240, 240, 240, 255]);
    let current = fixtures::striped_png(100, 100, [240, 240, 240, 255], [180, 180, 180, 255], 1);

    let result = engine
        .compare(&baseline, &current, &DiffOptions::default(), None)
        .unwrap();
    assert!(
        (0.008..=0.02).contains(&result.pixel.diff_pct),
        "diff_pct was {}",
        result.pixel.diff_pct
    );
    assert_eq!(result.overall.severity, Severity::Minor);
    assert!(result.overall.pass);
}

/// Scenario: a weighted header region in bad shape escalates a globally
/// mild diff to breaking.
#[test]
fn broken_header_region_escalates() {
    let engine = DiffEngine::new();
    let baseline = fixtures::solid_png(100, 100, [250, 250, 250, 255]);
    // 40x5 block inside the header band: 10% of the region, 2% globally
    let current = fixtures::rect_png(
        100,
        100,
        [250, 250, 250, 255],
        [30, 30, 30, 255],
        (10, 5, 40, 5),
    );

    struct Fixed;
    impl dashsnap::diff::RegionResolver for Fixed {
        fn resolve(&self, selector: &str) -> Option<BoundingBox> {
            (selector == "#header").then_some(BoundingBox {
                x: 0,
                y: 0,
                width: 100,
                height: 20,
            })
        }
    }

    let options = DiffOptions {
        regions: vec![RegionSpec {
            name: "header".to_string(),
            selector: "#header".to_string(),
            weight: 2.0,
        }],
        ..DiffOptions::default()
    };

    let result = engine.compare(&baseline, &current, &options, Some(&Fixed)).unwrap();
    let header = &result.regions[0];
    assert!(header.diff_pct > 0.01);
    assert_eq!(result.overall.severity, Severity::Breaking);
    assert!(!result.overall.pass);
}

/// Scenario: massive divergence takes the sampling early exit.
#[test]
fn early_exit_on_inverted_checkerboard() {
    let engine = DiffEngine::new();
    let baseline = fixtures::checkerboard_png(256, 144, 8, false);
    let current = fixtures::checkerboard_png(256, 144, 8, true);

    let result = engine
        .compare(&baseline, &current, &DiffOptions::default(), None)
        .unwrap();
    assert!(result.early_exit);
    assert_eq!(result.overall.severity, Severity::Breaking);
    assert!((result.pixel.ssim - 0.0).abs() < f64::EPSILON, "full SSIM skipped");
}

/// Scenario: malformed primary output falls back to the secondary
/// provider; cost and cache land on the provider actually used.
#[tokio::test]
async fn fallback_chain_uses_secondary() {
    let primary = MockVisionProvider::new("primary");
    primary.set_always_fail(true);
    let secondary = MockVisionProvider::new("secondary")
        .with_severity(Severity::Moderate)
        .with_confidence(0.82)
        .with_categories(vec![VisionCategory::Layout]);

    let cache = Arc::new(VisionCache::open_in_memory(16).unwrap());
    let cost = Arc::new(
        CostTracker::open_in_memory(
            PricingTable::new()
                .with_price("primary", "primary-model", 0.01)
                .with_price("secondary", "secondary-model", 0.005),
            BudgetConfig::default(),
        )
        .unwrap(),
    );
    let client = SmartVisionClient::new(
        vec![
            Arc::new(primary.clone()) as Arc<dyn VisionProvider>,
            Arc::new(secondary.clone()) as Arc<dyn VisionProvider>,
        ],
        ImagePreprocessor::with_defaults(),
        Arc::clone(&cache),
        Arc::clone(&cost),
        SmartVisionClientConfig::default(),
    )
    .unwrap();

    let request = VisionRequest {
        baseline: fixtures::solid_png(64, 64, [0, 0, 0, 255]),
        current: fixtures::solid_png(64, 64, [255, 255, 255, 255]),
        context: None,
    };
    let out = client.analyze_visual_diff(&request).await.unwrap();

    assert_eq!(out.severity, Severity::Moderate);
    assert!((out.confidence - 0.82).abs() < f64::EPSILON);
    assert_eq!(out.categories, vec![VisionCategory::Layout]);
    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 1);

    let stats = cost.stats().unwrap();
    assert!((stats.cost_by_provider["secondary"] - 0.005).abs() < 1e-12);
    assert!(stats.cost_by_provider.get("primary").is_none());

    // The cache entry is keyed to the secondary provider and model
    let preprocessor = ImagePreprocessor::with_defaults();
    let b = preprocessor.preprocess(request.baseline.clone().into()).unwrap();
    let c = preprocessor.preprocess(request.current.clone().into()).unwrap();
    let secondary_key =
        VisionCache::cache_key("secondary", "secondary-model", &b.hash, &c.hash);
    assert!(cache.get(&secondary_key).unwrap().is_some());
    let primary_key = VisionCache::cache_key("primary", "primary-model", &b.hash, &c.hash);
    assert!(cache.get(&primary_key).unwrap().is_none());
}

/// Scenario: the budget circuit breaker trips mid-run; remaining pages keep
/// their structural verdict and are flagged semantic-unavailable.
#[tokio::test]
async fn budget_breaker_mid_run_degrades_to_structural() {
    let dir = tempfile::tempdir().unwrap();
    let vcs = vcs();
    let baselines = Arc::new(
        BaselineManager::open(BaselineManagerConfig::new(dir.path()), vcs.clone()).unwrap(),
    );

    let total_pages = 6usize;
    let paid_budget = 3.0;

    // Each page gets a distinct baseline and a visibly changed current
    // render, so every comparison wants a semantic verdict
    let mut pool = MockBrowserPool::new();
    let mut pages = Vec::new();
    for i in 0..total_pages {
        let url = format!("https://app/page-{i}");
        let shade = 40 + (i as u8) * 20;
        let baseline_bytes = fixtures::solid_png(100, 100, [shade, shade, shade, 255]);
        let current_bytes = fixtures::striped_png(
            100,
            100,
            [shade, shade, shade, 255],
            [255, 0, 0, 255],
            2,
        );
        pool = pool.with_screenshot(url.clone(), current_bytes);

        // Seed the baseline directly through the manager
        let capture = dashsnap::capture::CaptureResult {
            id: uuid_like(),
            captured_at: chrono_now(),
            url: url.clone(),
            bytes: baseline_bytes.clone(),
            hash: dashsnap::ImageHash::from_bytes(&baseline_bytes),
            metadata: default_metadata(),
        };
        baselines
            .set_baseline(
                &capture,
                &dashsnap::baseline::BaselineMeta {
                    branch: "main".to_string(),
                    commit: "c0ffee".to_string(),
                    url: url.clone(),
                    element: None,
                    device: None,
                },
            )
            .unwrap();

        let mut spec = fast_spec(&format!("page-{i}"), &url);
        spec.diff.semantic_analysis = true;
        pages.push(spec);
    }

    let provider = MockVisionProvider::new("paid").with_severity(Severity::Minor);
    let cost = Arc::new(
        CostTracker::open_in_memory(
            PricingTable::new().with_price("paid", "paid-model", 1.0),
            BudgetConfig {
                daily_limit: paid_budget,
                monthly_limit: 1000.0,
                ..BudgetConfig::default()
            },
        )
        .unwrap(),
    );
    let client = Arc::new(
        SmartVisionClient::new(
            vec![Arc::new(provider.clone()) as Arc<dyn VisionProvider>],
            ImagePreprocessor::with_defaults(),
            Arc::new(VisionCache::open_in_memory(64).unwrap()),
            Arc::clone(&cost),
            SmartVisionClientConfig::default(),
        )
        .unwrap(),
    );

    let runner = VisualTestRunner::new(
        Arc::new(pool),
        baselines,
        vcs,
        RunnerConfig {
            semantic_enabled: true,
            concurrency: 1,
            ..RunnerConfig::default()
        },
    )
    .with_vision(client);

    let run = runner.run(pages, &CancellationToken::new()).await.unwrap();

    // Three paid calls spend the budget; the breaker blocks the rest
    // before any further provider work
    assert_eq!(provider.call_count(), 3);
    assert_eq!(run.summary.ai_unavailable, 3);
    assert!(cost.budget_status().unwrap().circuit_breaker_triggered);

    let with_semantic = run
        .results
        .iter()
        .filter(|r| r.diff.as_ref().is_some_and(|d| d.semantic.is_some()))
        .count();
    let unavailable = run
        .results
        .iter()
        .filter(|r| r.diff.as_ref().is_some_and(|d| d.semantic_unavailable))
        .count();
    assert_eq!(with_semantic, 3);
    assert_eq!(unavailable, 3);
    // Structural comparison kept running for every page
    assert!(run.results.iter().all(|r| r.diff.is_some()));
}

/// Scenario: later semantic calls for the same (url, selector) key carry
/// the earlier classifications as context.
#[tokio::test]
async fn semantic_context_carries_recent_classifications() {
    let dir = tempfile::tempdir().unwrap();
    let vcs = vcs();
    let baselines = Arc::new(
        BaselineManager::open(BaselineManagerConfig::new(dir.path()), vcs.clone()).unwrap(),
    );

    let url = "https://app/pricing";
    let base_color = [230, 230, 230, 255];
    let baseline_bytes = fixtures::solid_png(100, 100, base_color);
    let capture = dashsnap::capture::CaptureResult {
        id: uuid_like(),
        captured_at: chrono_now(),
        url: url.to_string(),
        bytes: baseline_bytes.clone(),
        hash: dashsnap::ImageHash::from_bytes(&baseline_bytes),
        metadata: default_metadata(),
    };
    baselines
        .set_baseline(
            &capture,
            &dashsnap::baseline::BaselineMeta {
                branch: "main".to_string(),
                commit: "c0ffee".to_string(),
                url: url.to_string(),
                element: None,
                device: None,
            },
        )
        .unwrap();

    // First run renders one changed row, the second run two, so both runs
    // produce a fresh (uncached) image pair that wants a semantic verdict
    let pool = MockBrowserPool::new()
        .with_screenshot(url, fixtures::striped_png(100, 100, base_color, [255, 0, 0, 255], 1));

    let provider = MockVisionProvider::new("mock")
        .with_severity(Severity::Minor)
        .with_reasoning("one row drifted");
    let client = Arc::new(
        SmartVisionClient::new(
            vec![Arc::new(provider.clone()) as Arc<dyn VisionProvider>],
            ImagePreprocessor::with_defaults(),
            Arc::new(VisionCache::open_in_memory(16).unwrap()),
            Arc::new(
                CostTracker::open_in_memory(PricingTable::with_defaults(), BudgetConfig::default())
                    .unwrap(),
            ),
            SmartVisionClientConfig::default(),
        )
        .unwrap(),
    );

    let runner = VisualTestRunner::new(
        Arc::new(pool.clone()),
        baselines,
        vcs,
        RunnerConfig {
            semantic_enabled: true,
            ..RunnerConfig::default()
        },
    )
    .with_vision(client);

    let mut spec = fast_spec("pricing", url);
    spec.diff.semantic_analysis = true;
    let pages = vec![spec];

    runner.run(pages.clone(), &CancellationToken::new()).await.unwrap();
    pool.update_screenshot(
        url,
        fixtures::striped_png(100, 100, base_color, [255, 0, 0, 255], 2),
    );
    runner.run(pages, &CancellationToken::new()).await.unwrap();

    let contexts = provider.call_contexts();
    assert_eq!(contexts.len(), 2);

    let first = contexts[0].as_ref().unwrap();
    assert_eq!(first.url.as_deref(), Some(url));
    assert!(first.recent.is_empty(), "no history on the first call");

    let second = contexts[1].as_ref().unwrap();
    assert_eq!(second.recent.len(), 1);
    assert_eq!(second.recent[0].severity, Severity::Minor);
    assert_eq!(second.recent[0].reasoning, "one row drifted");
}

/// Result cache round trip through the runner's advisory cache.
#[tokio::test]
async fn repeat_run_hits_result_cache() {
    let dir = tempfile::tempdir().unwrap();
    let vcs = vcs();
    let baselines = Arc::new(
        BaselineManager::open(BaselineManagerConfig::new(dir.path()), vcs.clone()).unwrap(),
    );

    let baseline_bytes = fixtures::solid_png(80, 80, [200, 200, 200, 255]);
    let current_bytes =
        fixtures::striped_png(80, 80, [200, 200, 200, 255], [0, 0, 0, 255], 1);
    let pool = MockBrowserPool::new().with_screenshot("https://app/", current_bytes);

    let capture = dashsnap::capture::CaptureResult {
        id: uuid_like(),
        captured_at: chrono_now(),
        url: "https://app/".to_string(),
        bytes: baseline_bytes.clone(),
        hash: dashsnap::ImageHash::from_bytes(&baseline_bytes),
        metadata: default_metadata(),
    };
    baselines
        .set_baseline(
            &capture,
            &dashsnap::baseline::BaselineMeta {
                branch: "main".to_string(),
                commit: "c0ffee".to_string(),
                url: "https://app/".to_string(),
                element: None,
                device: None,
            },
        )
        .unwrap();

    let runner = VisualTestRunner::new(Arc::new(pool), baselines, vcs, RunnerConfig::default())
        .with_result_cache(ResultCacheConfig::default());

    let pages = vec![fast_spec("app", "https://app/")];
    let first = runner.run(pages.clone(), &CancellationToken::new()).await.unwrap();
    let second = runner.run(pages, &CancellationToken::new()).await.unwrap();

    assert_eq!(first.summary.cache_hits, 0);
    assert_eq!(second.summary.cache_hits, 1);
}

/// Baseline store state survives across manager instances on the same
/// workspace path.
#[tokio::test]
async fn baseline_store_is_shared_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let vcs = vcs();

    let writer = BaselineManager::open(BaselineManagerConfig::new(dir.path()), vcs.clone())
        .unwrap();
    let bytes = fixtures::solid_png(32, 32, [1, 1, 1, 255]);
    let capture = dashsnap::capture::CaptureResult {
        id: uuid_like(),
        captured_at: chrono_now(),
        url: "https://app/".to_string(),
        bytes: bytes.clone(),
        hash: dashsnap::ImageHash::from_bytes(&bytes),
        metadata: default_metadata(),
    };
    writer
        .set_baseline(
            &capture,
            &dashsnap::baseline::BaselineMeta {
                branch: "main".to_string(),
                commit: "c0ffee".to_string(),
                url: "https://app/".to_string(),
                element: None,
                device: None,
            },
        )
        .unwrap();
    writer.close().unwrap();

    let reader =
        BaselineManager::open(BaselineManagerConfig::new(dir.path()), vcs).unwrap();
    let records = reader.list_baselines(&BaselineFilter::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(reader.load_bytes(&records[0]).unwrap(), bytes);
}

fn uuid_like() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

fn default_metadata() -> dashsnap::capture::CaptureMetadata {
    dashsnap::capture::CaptureMetadata {
        viewport_width: 1280,
        viewport_height: 720,
        device_pixel_ratio: 1.0,
        color_scheme: dashsnap::capture::ColorScheme::Light,
        mode: dashsnap::capture::CaptureMode::Viewport,
        stabilized: true,
    }
}
