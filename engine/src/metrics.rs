//! Metrics collection for settlement monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Settlement engine metrics.
pub struct Metrics {
    /// Escrow releases committed (any reason).
    pub releases_total: AtomicU64,
    /// Releases committed by the auto-release sweep.
    pub releases_auto: AtomicU64,
    /// Release attempts that found the escrow already released.
    pub releases_already_settled: AtomicU64,
    /// Disputes opened.
    pub disputes_opened: AtomicU64,
    /// Requests rejected by a precondition guard.
    pub precondition_failures: AtomicU64,
    /// Atomic units that failed and rolled back.
    pub persistence_failures: AtomicU64,
    /// Post-commit notifications that failed.
    pub notifier_failures: AtomicU64,
    /// Auto-release sweeps executed.
    pub scheduler_runs: AtomicU64,
    /// Bookings held out of the sweep after a non-retryable failure.
    pub auto_release_holds: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            releases_total: AtomicU64::new(0),
            releases_auto: AtomicU64::new(0),
            releases_already_settled: AtomicU64::new(0),
            disputes_opened: AtomicU64::new(0),
            precondition_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            notifier_failures: AtomicU64::new(0),
            scheduler_runs: AtomicU64::new(0),
            auto_release_holds: AtomicU64::new(0),
        }
    }

    /// Record a committed release.
    pub fn release_committed(&self, automatic: bool) {
        self.releases_total.fetch_add(1, Ordering::Relaxed);
        if automatic {
            self.releases_auto.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn already_settled(&self) {
        self.releases_already_settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispute_opened(&self) {
        self.disputes_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn precondition_failed(&self) {
        self.precondition_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notifier_failed(&self) {
        self.notifier_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scheduler_run(&self) {
        self.scheduler_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auto_release_held(&self) {
        self.auto_release_holds.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            releases_total: self.releases_total.load(Ordering::Relaxed),
            releases_auto: self.releases_auto.load(Ordering::Relaxed),
            releases_already_settled: self.releases_already_settled.load(Ordering::Relaxed),
            disputes_opened: self.disputes_opened.load(Ordering::Relaxed),
            precondition_failures: self.precondition_failures.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            notifier_failures: self.notifier_failures.load(Ordering::Relaxed),
            scheduler_runs: self.scheduler_runs.load(Ordering::Relaxed),
            auto_release_holds: self.auto_release_holds.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let series = [
            ("escrow_releases_total", "counter", "Escrow releases committed", snapshot.releases_total),
            ("escrow_releases_auto_total", "counter", "Escrow releases committed by the auto-release sweep", snapshot.releases_auto),
            ("escrow_releases_already_settled_total", "counter", "Release attempts on already released escrow", snapshot.releases_already_settled),
            ("escrow_disputes_opened_total", "counter", "Disputes opened", snapshot.disputes_opened),
            ("escrow_precondition_failures_total", "counter", "Requests rejected by a settlement guard", snapshot.precondition_failures),
            ("escrow_persistence_failures_total", "counter", "Settlement units rolled back", snapshot.persistence_failures),
            ("escrow_notifier_failures_total", "counter", "Post-commit notifications that failed", snapshot.notifier_failures),
            ("escrow_scheduler_runs_total", "counter", "Auto-release sweeps executed", snapshot.scheduler_runs),
            ("escrow_auto_release_holds_total", "counter", "Bookings held out of the auto-release sweep", snapshot.auto_release_holds),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n"
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub releases_total: u64,
    pub releases_auto: u64,
    pub releases_already_settled: u64,
    pub disputes_opened: u64,
    pub precondition_failures: u64,
    pub persistence_failures: u64,
    pub notifier_failures: u64,
    pub scheduler_runs: u64,
    pub auto_release_holds: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.release_committed(true);
        metrics.release_committed(false);
        metrics.already_settled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.releases_total, 2);
        assert_eq!(snapshot.releases_auto, 1);
        assert_eq!(snapshot.releases_already_settled, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.dispute_opened();

        let output = metrics.to_prometheus();
        assert!(output.contains("escrow_disputes_opened_total 1"));
        assert!(output.contains("# TYPE escrow_releases_total counter"));
    }
}
