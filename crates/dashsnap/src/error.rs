//! Error types for the visual regression engine.

use thiserror::Error;

/// Engine result type.
pub type Result<T> = std::result::Result<T, SnapError>;

/// Errors that can occur across the capture → diff → classify pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapError {
    /// Image bytes could not be decoded into a raster.
    #[error("Image decode failed: {0}")]
    ImageDecode(String),

    /// Re-encoding an image to the target format failed.
    #[error("Image encode failed: {0}")]
    ImageEncode(String),

    /// Baseline and current images differ in dimensions beyond tolerance.
    #[error("Dimension mismatch: baseline {baseline_width}x{baseline_height}, current {current_width}x{current_height}")]
    DimensionMismatch {
        baseline_width: u32,
        baseline_height: u32,
        current_width: u32,
        current_height: u32,
    },

    /// A region selector resolved to no bounding box.
    #[error("Region resolution failed for selector: {0}")]
    RegionResolution(String),

    /// Navigation did not complete within the deadline.
    #[error("Navigation timeout after {0}ms: {1}")]
    NavigationTimeout(u64, String),

    /// Element-mode capture could not find the target element.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Page stabilization (fonts, network idle) did not settle in time.
    #[error("Stabilization timeout: {0}")]
    StabilizationTimeout(String),

    /// No baseline exists for the requested key.
    #[error("Baseline not found: {0}")]
    BaselineNotFound(String),

    /// Stored baseline bytes no longer match the recorded hash.
    /// The record is quarantined, never auto-deleted.
    #[error("Baseline checksum mismatch for {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// Baseline payload or index I/O failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache value could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persistent cache / ledger I/O failed. Advisory for caches.
    #[error("Store I/O error: {0}")]
    StoreIo(String),

    /// The rolling budget is exhausted and the circuit breaker is engaged.
    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    /// A provider returned output that could not be parsed into a
    /// canonical classification.
    #[error("Provider response malformed ({provider}): {message}")]
    ProviderResponseMalformed { provider: String, message: String },

    /// A single provider call failed (network, API, rate limit).
    #[error("Provider {provider} failed: {message}")]
    ProviderFailed { provider: String, message: String },

    /// Every provider in the fallback chain failed.
    #[error("All providers failed, last error: {0}")]
    AllProvidersFailed(String),

    /// Provider or client configuration is invalid. Raised at
    /// construction, never during execution.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Git query failed.
    #[error("Version control error: {0}")]
    VersionControl(String),

    /// An operation exceeded its deadline.
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// The run was cancelled cooperatively.
    #[error("Run cancelled")]
    Cancelled,

    /// Invalid input to an operation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SnapError {
    fn from(err: serde_json::Error) -> Self {
        SnapError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for SnapError {
    fn from(err: rusqlite::Error) -> Self {
        SnapError::StoreIo(err.to_string())
    }
}

impl From<git2::Error> for SnapError {
    fn from(err: git2::Error) -> Self {
        SnapError::VersionControl(err.to_string())
    }
}

impl From<image::ImageError> for SnapError {
    fn from(err: image::ImageError) -> Self {
        SnapError::ImageDecode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SnapError::BaselineNotFound("main:/pricing".to_string());
        assert_eq!(err.to_string(), "Baseline not found: main:/pricing");

        let err = SnapError::ChecksumMismatch {
            id: "b1".to_string(),
            expected: "sha256:abc".to_string(),
            actual: "sha256:def".to_string(),
        };
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_dimension_mismatch_fields() {
        let err = SnapError::DimensionMismatch {
            baseline_width: 1920,
            baseline_height: 1080,
            current_width: 1280,
            current_height: 720,
        };
        assert!(err.to_string().contains("1920x1080"));
        assert!(err.to_string().contains("1280x720"));
    }
}
