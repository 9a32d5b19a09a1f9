//! # dashsnap
//!
//! Visual regression testing engine: turns a set of URLs and a baseline
//! reference into a classified, cached, cost-bounded diff report.
//!
//! # Architecture
//!
//! The engine is built from four tightly coupled subsystems:
//!
//! 1. **Diff engine** ([`diff`]): pixel comparison, structural similarity,
//!    weighted region analysis, seeded early-exit sampling, and a bounded
//!    in-process result cache.
//! 2. **Baseline manager** ([`baseline`]): maps (branch, url, element,
//!    device) keys to stored reference images with a git-aware lifecycle.
//! 3. **Smart vision client** ([`vision`]): multi-provider AI
//!    classification behind a two-tier cache and a budget-aware cost
//!    tracker with a circuit breaker.
//! 4. **Parallel runner** ([`runner`]): capture → diff → classify →
//!    aggregate across many pages with a bounded worker pool, incremental
//!    selection from version-control diffs, and cooperative cancellation.
//!
//! Provider adapters live in sibling crates (`dashsnap-ollama`,
//! `dashsnap-anthropic`, `dashsnap-openai`); testing utilities in
//! `dashsnap-testing`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dashsnap::baseline::{BaselineManager, BaselineManagerConfig};
//! use dashsnap::runner::{CancellationToken, PageSpec, RunnerConfig, VisualTestRunner};
//! use dashsnap::vcs::GitVersionControl;
//!
//! # async fn example(pool: Arc<dyn dashsnap::runner::BrowserPool>) -> dashsnap::Result<()> {
//! let vcs = Arc::new(GitVersionControl::discover(".")?);
//! let baselines = Arc::new(BaselineManager::open(
//!     BaselineManagerConfig::new(".dashsnap"),
//!     vcs.clone(),
//! )?);
//!
//! let runner = VisualTestRunner::new(pool, baselines, vcs, RunnerConfig::default());
//! let run = runner
//!     .run(vec![PageSpec::new("home", "https://localhost:3000/")], &CancellationToken::new())
//!     .await?;
//! println!("{} pages, {} regressions", run.summary.total, run.summary.regressions);
//! # Ok(())
//! # }
//! ```

pub mod baseline;
pub mod capture;
pub mod diff;
pub mod error;
pub mod hash;
pub mod preprocess;
pub mod runner;
pub mod vcs;
pub mod vision;

// Re-exports for convenience
pub use diff::{DiffEngine, DiffOptions, DiffResult, Severity};
pub use error::{Result, SnapError};
pub use hash::ImageHash;
pub use preprocess::{ImagePreprocessor, PreprocessConfig, PreprocessedImage};
pub use runner::{CancellationToken, PageSpec, RunnerConfig, VisualTestRun, VisualTestRunner};
pub use vision::{SmartVisionClient, VisionClassification, VisionProvider};
