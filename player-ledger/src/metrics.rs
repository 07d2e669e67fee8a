//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_mutations_total{kind}` - Successful balance mutations
//! - `ledger_rejections_total{reason}` - Mutations refused by validation
//! - `ledger_write_batch_size` - Histogram of write-behind batch sizes
//! - `ledger_write_failures_total` - Write-behind operations that exhausted retries
//! - `ledger_cached_accounts` - Accounts in the working set
//! - `ledger_rollbacks_total` - Completed rollbacks
//! - `ledger_leaderboard_refreshes_total` - Leaderboard queries against the store

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Successful mutations by kind
    pub mutations_total: IntCounterVec,

    /// Rejected mutations by reason
    pub rejections_total: IntCounterVec,

    /// Write-behind batch size histogram
    pub write_batch_size: Histogram,

    /// Writes that failed after retries
    pub write_failures_total: IntCounter,

    /// Accounts currently cached
    pub cached_accounts: IntGauge,

    /// Completed rollbacks
    pub rollbacks_total: IntCounter,

    /// Leaderboard refresh queries
    pub leaderboard_refreshes_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_total = IntCounterVec::new(
            Opts::new("ledger_mutations_total", "Successful balance mutations"),
            &["kind"],
        )?;
        registry.register(Box::new(mutations_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("ledger_rejections_total", "Mutations refused by validation"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let write_batch_size = Histogram::with_opts(
            HistogramOpts::new("ledger_write_batch_size", "Histogram of write-behind batch sizes")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
        )?;
        registry.register(Box::new(write_batch_size.clone()))?;

        let write_failures_total = IntCounter::new(
            "ledger_write_failures_total",
            "Write-behind operations that exhausted retries",
        )?;
        registry.register(Box::new(write_failures_total.clone()))?;

        let cached_accounts = IntGauge::new("ledger_cached_accounts", "Accounts in the working set")?;
        registry.register(Box::new(cached_accounts.clone()))?;

        let rollbacks_total = IntCounter::new("ledger_rollbacks_total", "Completed rollbacks")?;
        registry.register(Box::new(rollbacks_total.clone()))?;

        let leaderboard_refreshes_total = IntCounter::new(
            "ledger_leaderboard_refreshes_total",
            "Leaderboard queries against the store",
        )?;
        registry.register(Box::new(leaderboard_refreshes_total.clone()))?;

        Ok(Self {
            mutations_total,
            rejections_total,
            write_batch_size,
            write_failures_total,
            cached_accounts,
            rollbacks_total,
            leaderboard_refreshes_total,
            registry,
        })
    }

    /// Record a successful mutation
    pub fn record_mutation(&self, kind: &str) {
        self.mutations_total.with_label_values(&[kind]).inc();
    }

    /// Record a validation rejection
    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    /// Record batch flush
    pub fn record_batch_flush(&self, batch_size: usize) {
        self.write_batch_size.observe(batch_size as f64);
    }

    /// Record operations lost to a failed batch
    pub fn record_write_failures(&self, count: usize) {
        self.write_failures_total.inc_by(count as u64);
    }

    /// Update cached account count
    pub fn set_cached_accounts(&self, count: usize) {
        self.cached_accounts.set(count as i64);
    }

    /// Record a completed rollback
    pub fn record_rollback(&self) {
        self.rollbacks_total.inc();
    }

    /// Record a leaderboard refresh
    pub fn record_leaderboard_refresh(&self) {
        self.leaderboard_refreshes_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.write_failures_total.get(), 0);
        assert_eq!(metrics.rollbacks_total.get(), 0);

        // Independent registries do not collide
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_mutation("deposit");
        metrics.record_mutation("deposit");
        metrics.record_rejection("insufficient_funds");

        assert_eq!(metrics.mutations_total.with_label_values(&["deposit"]).get(), 2);
        assert_eq!(metrics.rejections_total.with_label_values(&["insufficient_funds"]).get(), 1);
    }

    #[test]
    fn test_gauge_and_batches() {
        let metrics = Metrics::new().unwrap();
        metrics.set_cached_accounts(42);
        metrics.record_batch_flush(10);
        metrics.record_write_failures(3);

        assert_eq!(metrics.cached_accounts.get(), 42);
        assert_eq!(metrics.write_failures_total.get(), 3);
        assert_eq!(metrics.write_batch_size.get_sample_count(), 1);
    }
}
