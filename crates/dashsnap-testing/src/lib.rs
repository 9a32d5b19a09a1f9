// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! # dashsnap testing utilities
//!
//! This crate provides testing utilities for dashsnap, including:
//!
//! - **MockVisionProvider**: a configurable provider for exercising the
//!   fallback chain, caching, and cost tracking without network access
//! - **MockBrowserPage / MockBrowserPool**: a scripted browser capability
//!   serving fixture screenshots per URL
//! - **fixtures**: deterministic PNG generators for diff-engine scenarios
//!
//! ## Quick Start
//!
//! ```rust
//! use dashsnap::diff::Severity;
//! use dashsnap_testing::{fixtures, MockVisionProvider};
//!
//! let provider = MockVisionProvider::new("mock")
//!     .with_severity(Severity::Moderate)
//!     .with_confidence(0.9);
//!
//! let baseline = fixtures::solid_png(64, 64, [250, 250, 250, 255]);
//! ```

mod mock_browser;
mod mock_provider;

pub mod fixtures;

pub use mock_browser::{MockBrowserPage, MockBrowserPool};
pub use mock_provider::MockVisionProvider;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures;
    pub use crate::{MockBrowserPage, MockBrowserPool, MockVisionProvider};
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashsnap::vision::VisionProvider;

    #[test]
    fn test_mock_provider_reexport() {
        let provider = MockVisionProvider::new("reexport");
        assert_eq!(provider.name(), "reexport");
    }

    #[test]
    fn test_prelude() {
        use crate::prelude::MockVisionProvider as PreludeProvider;
        let provider = PreludeProvider::new("prelude");
        assert_eq!(provider.name(), "prelude");
    }
}
