//! Run progress reporting.
//!
//! A sink receives one update per completed page; the remaining-time
//! estimate uses an exponentially-weighted moving average of per-page
//! durations.

use serde::{Deserialize, Serialize};

/// Smoothing factor for per-page duration averaging.
const EWMA_ALPHA: f64 = 0.3;

/// One progress update, emitted after each completed page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub completed: usize,
    pub total: usize,
    /// Page that just finished.
    pub current_page: String,
    pub passed: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: u64,
}

/// Receives progress updates during a run.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
}

/// Exponentially-weighted moving average over per-page durations.
#[derive(Debug, Clone, Default)]
pub struct EwmaEta {
    average_ms: Option<f64>,
}

impl EwmaEta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observed page duration into the average.
    pub fn observe(&mut self, duration_ms: u64) {
        let sample = duration_ms as f64;
        self.average_ms = Some(match self.average_ms {
            Some(avg) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * avg,
            None => sample,
        });
    }

    /// Estimated time to finish `remaining` pages.
    pub fn estimate_remaining_ms(&self, remaining: usize) -> u64 {
        match self.average_ms {
            Some(avg) => (avg * remaining as f64).round() as u64,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_seeds_average() {
        let mut eta = EwmaEta::new();
        eta.observe(1000);
        assert_eq!(eta.estimate_remaining_ms(3), 3000);
    }

    #[test]
    fn test_ewma_weights_recent_samples() {
        let mut eta = EwmaEta::new();
        eta.observe(1000);
        eta.observe(2000);
        // 0.3 * 2000 + 0.7 * 1000 = 1300
        assert_eq!(eta.estimate_remaining_ms(1), 1300);
    }

    #[test]
    fn test_no_observations_means_zero_estimate() {
        let eta = EwmaEta::new();
        assert_eq!(eta.estimate_remaining_ms(10), 0);
    }
}
