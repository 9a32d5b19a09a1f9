//! Cost tracking for vision analysis calls.
//!
//! Every provider call lands in an append-only SQLite ledger; cached calls
//! record a zero-cost entry so cache effectiveness is visible in the same
//! stream. Rolling daily and monthly windows drive warning and critical
//! thresholds plus a circuit breaker that blocks further paid work once a
//! window is fully spent.

use chrono::{DateTime, Datelike, Local, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Result, SnapError};

/// The single operation kind recorded by this tracker.
pub const OPERATION_VISION_ANALYSIS: &str = "vision-analysis";

// ============================================================================
// Pricing
// ============================================================================

/// Per-image pricing keyed by (provider, model).
///
/// # Example
///
/// ```
/// use dashsnap::vision::PricingTable;
///
/// let pricing = PricingTable::new()
///     .with_price("anthropic", "claude-3-5-sonnet-latest", 0.009)
///     .with_price("openai", "gpt-4o", 0.007)
///     .with_price("ollama", "llava", 0.0);
///
/// assert_eq!(pricing.price_per_image("openai", "gpt-4o"), Some(0.007));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: HashMap<(String, String), f64>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-image price in USD.
    pub fn with_price(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        cost_per_image: f64,
    ) -> Self {
        self.prices
            .insert((provider.into(), model.into()), cost_per_image);
        self
    }

    /// Price for a (provider, model) pair, if configured.
    pub fn price_per_image(&self, provider: &str, model: &str) -> Option<f64> {
        self.prices
            .get(&(provider.to_string(), model.to_string()))
            .copied()
    }

    /// Defaults for the stock provider set. Cloud prices reflect one
    /// two-image comparison call; local models are free.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_price("ollama", "llava", 0.0)
            .with_price("anthropic", "claude-3-5-sonnet-latest", 0.009)
            .with_price("anthropic", "claude-3-5-haiku-latest", 0.002)
            .with_price("openai", "gpt-4o", 0.007)
            .with_price("openai", "gpt-4o-mini", 0.003)
    }
}

// ============================================================================
// Budget configuration
// ============================================================================

/// Budget limits and alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily spend limit in USD.
    pub daily_limit: f64,
    /// Monthly spend limit in USD.
    pub monthly_limit: f64,
    /// Advisory warning threshold as a fraction of either window.
    pub warning_threshold: f64,
    /// Advisory critical threshold as a fraction of either window.
    pub critical_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10.0,
            monthly_limit: 200.0,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
        }
    }
}

impl BudgetConfig {
    /// Validate thresholds and limits.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.warning_threshold) {
            return Err(SnapError::InvalidInput(format!(
                "warning_threshold must be 0.0-1.0, got {}",
                self.warning_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.critical_threshold) {
            return Err(SnapError::InvalidInput(format!(
                "critical_threshold must be 0.0-1.0, got {}",
                self.critical_threshold
            )));
        }
        if self.warning_threshold > self.critical_threshold {
            return Err(SnapError::InvalidInput(format!(
                "warning_threshold ({}) must not exceed critical_threshold ({})",
                self.warning_threshold, self.critical_threshold
            )));
        }
        if self.daily_limit < 0.0 || self.monthly_limit < 0.0 {
            return Err(SnapError::InvalidInput(
                "budget limits must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Records and reports
// ============================================================================

/// A single ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub operation: String,
    pub cost: f64,
    pub cached: bool,
}

/// Aggregated ledger statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostStats {
    pub total_cost: f64,
    pub total_operations: u64,
    pub cached_operations: u64,
    pub cost_by_provider: HashMap<String, f64>,
    pub cost_by_model: HashMap<String, f64>,
}

impl CostStats {
    /// Fraction of operations served from cache.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.cached_operations as f64 / self.total_operations as f64
        }
    }
}

/// Budget window status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub daily_used: f64,
    pub daily_limit: f64,
    pub daily_pct: f64,
    pub monthly_used: f64,
    pub monthly_limit: f64,
    pub monthly_pct: f64,
    pub warning_triggered: bool,
    pub critical_triggered: bool,
    pub circuit_breaker_triggered: bool,
}

// ============================================================================
// Cost tracker
// ============================================================================

/// Append-only cost ledger with budget enforcement.
///
/// Thread-safe; writes are serialized through a single connection.
pub struct CostTracker {
    conn: Mutex<Connection>,
    pricing: Mutex<PricingTable>,
    budget: Mutex<BudgetConfig>,
}

impl CostTracker {
    /// Open (or create) the ledger at the given path.
    pub fn open(
        path: impl AsRef<Path>,
        pricing: PricingTable,
        budget: BudgetConfig,
    ) -> Result<Self> {
        budget.validate()?;
        let path: PathBuf = path.as_ref().into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SnapError::StoreIo(format!("cannot create ledger dir: {e}")))?;
        }
        let conn = Connection::open(&path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pricing: Mutex::new(pricing),
            budget: Mutex::new(budget),
        })
    }

    /// An in-memory ledger for tests.
    pub fn open_in_memory(pricing: PricingTable, budget: BudgetConfig) -> Result<Self> {
        budget.validate()?;
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pricing: Mutex::new(pricing),
            budget: Mutex::new(budget),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cost_entries (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                provider  TEXT NOT NULL,
                model     TEXT NOT NULL,
                operation TEXT NOT NULL,
                cost      REAL NOT NULL,
                cached    INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cost_entries_timestamp
                ON cost_entries (timestamp);",
        )?;
        Ok(())
    }

    /// Record one vision operation and return its cost.
    ///
    /// Cached operations always record a zero-cost entry. Uncached
    /// operations are rejected with [`SnapError::BudgetExhausted`] while
    /// the circuit breaker is engaged.
    pub fn track_operation(&self, provider: &str, model: &str, cached: bool) -> Result<f64> {
        let status = self.budget_status()?;
        if !cached && status.circuit_breaker_triggered {
            return Err(SnapError::BudgetExhausted(format!(
                "daily ${:.2}/${:.2}, monthly ${:.2}/${:.2}",
                status.daily_used, status.daily_limit, status.monthly_used, status.monthly_limit
            )));
        }

        let cost = if cached {
            0.0
        } else {
            match self.pricing.lock().price_per_image(provider, model) {
                Some(price) => price,
                None => {
                    warn!(provider, model, "no pricing configured, assuming local model at $0");
                    0.0
                }
            }
        };

        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO cost_entries (timestamp, provider, model, operation, cost, cached)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Utc::now().timestamp(),
                    provider,
                    model,
                    OPERATION_VISION_ANALYSIS,
                    cost,
                    i64::from(cached),
                ],
            )?;
        }

        if !cached {
            let after = self.budget_status()?;
            if after.critical_triggered && !status.critical_triggered {
                warn!(
                    daily_pct = %format!("{:.1}", after.daily_pct * 100.0),
                    monthly_pct = %format!("{:.1}", after.monthly_pct * 100.0),
                    "vision budget crossed the critical threshold"
                );
            } else if after.warning_triggered && !status.warning_triggered {
                warn!(
                    daily_pct = %format!("{:.1}", after.daily_pct * 100.0),
                    monthly_pct = %format!("{:.1}", after.monthly_pct * 100.0),
                    "vision budget crossed the warning threshold"
                );
            }
        }

        Ok(cost)
    }

    /// Sum of recorded costs inside [start, end].
    pub fn cost_for_period(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64> {
        let conn = self.conn.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost), 0.0) FROM cost_entries
             WHERE timestamp >= ?1 AND timestamp <= ?2",
            params![start.timestamp(), end.timestamp()],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Spend from local midnight until now.
    pub fn daily_cost(&self) -> Result<f64> {
        self.cost_for_period(local_day_start(), Utc::now())
    }

    /// Spend from the first of the local month until now.
    pub fn monthly_cost(&self) -> Result<f64> {
        self.cost_for_period(local_month_start(), Utc::now())
    }

    /// Aggregate statistics over the whole ledger.
    pub fn stats(&self) -> Result<CostStats> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT provider, model, cost, cached FROM cost_entries")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)? != 0,
            ))
        })?;

        let mut stats = CostStats {
            total_cost: 0.0,
            total_operations: 0,
            cached_operations: 0,
            cost_by_provider: HashMap::new(),
            cost_by_model: HashMap::new(),
        };
        for row in rows {
            let (provider, model, cost, cached) = row?;
            stats.total_operations += 1;
            if cached {
                stats.cached_operations += 1;
            }
            stats.total_cost += cost;
            *stats.cost_by_provider.entry(provider).or_insert(0.0) += cost;
            *stats.cost_by_model.entry(model).or_insert(0.0) += cost;
        }
        Ok(stats)
    }

    /// All ledger entries, oldest first.
    pub fn entries(&self) -> Result<Vec<CostEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, provider, model, operation, cost, cached
             FROM cost_entries ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i64>(5)? != 0,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (timestamp, provider, model, operation, cost, cached) = row?;
            entries.push(CostEntry {
                timestamp: Utc
                    .timestamp_opt(timestamp, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                provider,
                model,
                operation,
                cost,
                cached,
            });
        }
        Ok(entries)
    }

    /// Current budget window status.
    pub fn budget_status(&self) -> Result<BudgetStatus> {
        let budget = self.budget.lock().clone();
        let daily_used = self.daily_cost()?;
        let monthly_used = self.monthly_cost()?;

        let daily_pct = if budget.daily_limit > 0.0 {
            daily_used / budget.daily_limit
        } else {
            0.0
        };
        let monthly_pct = if budget.monthly_limit > 0.0 {
            monthly_used / budget.monthly_limit
        } else {
            0.0
        };

        let max_pct = daily_pct.max(monthly_pct);
        Ok(BudgetStatus {
            daily_used,
            daily_limit: budget.daily_limit,
            daily_pct,
            monthly_used,
            monthly_limit: budget.monthly_limit,
            monthly_pct,
            warning_triggered: max_pct >= budget.warning_threshold,
            critical_triggered: max_pct >= budget.critical_threshold,
            circuit_breaker_triggered: max_pct >= 1.0,
        })
    }

    /// Replace the budget configuration. Raising a limit releases an
    /// engaged circuit breaker on the next status check.
    pub fn update_budget(&self, config: BudgetConfig) -> Result<()> {
        config.validate()?;
        *self.budget.lock() = config;
        Ok(())
    }

    /// Delete all ledger entries.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cost_entries", [])?;
        Ok(())
    }

    /// Release the underlying store.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner();
        conn.close()
            .map_err(|(_, e)| SnapError::StoreIo(e.to_string()))
    }
}

fn local_day_start() -> DateTime<Utc> {
    let now = Local::now();
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .unwrap_or(now);
    midnight.with_timezone(&Utc)
}

fn local_month_start() -> DateTime<Utc> {
    let now = Local::now();
    let first = now
        .date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).single())
        .unwrap_or(now);
    first.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_budget(daily: f64, monthly: f64) -> CostTracker {
        CostTracker::open_in_memory(
            PricingTable::new()
                .with_price("anthropic", "claude", 1.0)
                .with_price("ollama", "llava", 0.0),
            BudgetConfig {
                daily_limit: daily,
                monthly_limit: monthly,
                ..BudgetConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_track_uncached_records_price() {
        let tracker = tracker_with_budget(10.0, 200.0);
        let cost = tracker.track_operation("anthropic", "claude", false).unwrap();
        assert!((cost - 1.0).abs() < f64::EPSILON);

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.total_operations, 1);
        assert!((stats.total_cost - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cached_operation_is_free_and_counted() {
        let tracker = tracker_with_budget(10.0, 200.0);
        let cost = tracker.track_operation("anthropic", "claude", true).unwrap();
        assert!((cost - 0.0).abs() < f64::EPSILON);

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.cached_operations, 1);
        assert!((stats.cache_hit_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_pricing_assumes_zero() {
        let tracker = tracker_with_budget(10.0, 200.0);
        let cost = tracker.track_operation("mystery", "model-x", false).unwrap();
        assert!((cost - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_circuit_breaker_at_exact_daily_limit() {
        let tracker = tracker_with_budget(2.0, 200.0);
        tracker.track_operation("anthropic", "claude", false).unwrap();
        tracker.track_operation("anthropic", "claude", false).unwrap();

        // Exactly at the daily limit: breaker engages
        let status = tracker.budget_status().unwrap();
        assert!(status.circuit_breaker_triggered);

        let err = tracker.track_operation("anthropic", "claude", false).unwrap_err();
        assert!(matches!(err, SnapError::BudgetExhausted(_)));

        // Cached operations still pass
        assert!(tracker.track_operation("anthropic", "claude", true).is_ok());
    }

    #[test]
    fn test_raising_budget_releases_breaker() {
        let tracker = tracker_with_budget(1.0, 200.0);
        tracker.track_operation("anthropic", "claude", false).unwrap();
        assert!(tracker.budget_status().unwrap().circuit_breaker_triggered);

        tracker
            .update_budget(BudgetConfig {
                daily_limit: 100.0,
                monthly_limit: 200.0,
                ..BudgetConfig::default()
            })
            .unwrap();
        assert!(!tracker.budget_status().unwrap().circuit_breaker_triggered);
        assert!(tracker.track_operation("anthropic", "claude", false).is_ok());
    }

    #[test]
    fn test_monthly_window_trips_breaker_independently() {
        let tracker = tracker_with_budget(100.0, 3.0);
        for _ in 0..3 {
            tracker.track_operation("anthropic", "claude", false).unwrap();
        }
        let status = tracker.budget_status().unwrap();
        assert!(!status.daily_pct.is_nan());
        assert!(status.circuit_breaker_triggered);
        assert!((status.monthly_pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_for_period_matches_sum() {
        let tracker = tracker_with_budget(100.0, 1000.0);
        for _ in 0..5 {
            tracker.track_operation("anthropic", "claude", false).unwrap();
        }
        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        let total = tracker.cost_for_period(start, end).unwrap();
        assert!((total - 5.0).abs() < 1e-9);

        // Window that excludes everything
        let past = tracker
            .cost_for_period(start - chrono::Duration::days(2), start)
            .unwrap();
        assert!((past - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_warning_and_critical_thresholds() {
        let tracker = tracker_with_budget(10.0, 1000.0);
        for _ in 0..8 {
            tracker.track_operation("anthropic", "claude", false).unwrap();
        }
        let status = tracker.budget_status().unwrap();
        assert!(status.warning_triggered);
        assert!(!status.critical_triggered);

        for _ in 0..2 {
            // 9th succeeds; the 10th lands exactly on the limit
            let _ = tracker.track_operation("anthropic", "claude", false);
        }
        let status = tracker.budget_status().unwrap();
        assert!(status.critical_triggered);
    }

    #[test]
    fn test_entries_are_append_only_and_ordered() {
        let tracker = tracker_with_budget(100.0, 1000.0);
        tracker.track_operation("ollama", "llava", false).unwrap();
        tracker.track_operation("anthropic", "claude", true).unwrap();

        let entries = tracker.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].provider, "ollama");
        assert!(!entries[0].cached);
        assert!(entries[1].cached);
        assert_eq!(entries[0].operation, OPERATION_VISION_ANALYSIS);
    }

    #[test]
    fn test_clear() {
        let tracker = tracker_with_budget(100.0, 1000.0);
        tracker.track_operation("ollama", "llava", false).unwrap();
        tracker.clear().unwrap();
        assert_eq!(tracker.stats().unwrap().total_operations, 0);
    }

    #[test]
    fn test_budget_validation() {
        let bad = BudgetConfig {
            warning_threshold: 1.5,
            ..BudgetConfig::default()
        };
        assert!(bad.validate().is_err());

        let inverted = BudgetConfig {
            warning_threshold: 0.99,
            critical_threshold: 0.5,
            ..BudgetConfig::default()
        };
        assert!(inverted.validate().is_err());
    }
}
