//! Metrics for wrangler observability.
//!
//! Prometheus-style counters, gauges and a duration histogram covering the
//! two protocols and the primitives they are built on:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      WranglerMetrics                          │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐  │
//! │  │  Migrations    │  │  Locks         │  │  Actions       │  │
//! │  │ - started      │  │ - acquired     │  │ - dispatched   │  │
//! │  │ - completed    │  │ - released     │  │ - failed       │  │
//! │  │ - failed       │  │ - release fail │  │                │  │
//! │  ├────────────────┤  └────────────────┘  └────────────────┘  │
//! │  │  Reparents     │   operations_active, operation_duration  │
//! │  └────────────────┘                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod histograms;

pub use counters::{Counter, Gauge};
pub use histograms::{Histogram, HistogramSnapshot, OPERATION_DURATION_BUCKETS};

use std::time::Duration;

/// Kind of top-level protocol being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Served-type migration.
    Migration,
    /// Graceful reparent.
    Reparent,
}

/// Metrics for wrangler operations.
#[derive(Debug)]
pub struct WranglerMetrics {
    /// Served-type migrations started.
    pub migrations_started: Counter,
    /// Served-type migrations that finished cleanly.
    pub migrations_completed: Counter,
    /// Served-type migrations that failed.
    pub migrations_failed: Counter,
    /// Reparents started.
    pub reparents_started: Counter,
    /// Reparents that finished cleanly.
    pub reparents_completed: Counter,
    /// Reparents that failed, including warning-level replica failures.
    pub reparents_failed: Counter,
    /// Keyspace and shard locks acquired.
    pub locks_acquired: Counter,
    /// Keyspace and shard locks released.
    pub locks_released: Counter,
    /// Releases that returned an error.
    pub lock_release_failures: Counter,
    /// Remote tablet actions dispatched.
    pub actions_dispatched: Counter,
    /// Remote tablet actions that failed or timed out.
    pub actions_failed: Counter,
    /// Top-level operations in flight.
    pub operations_active: Gauge,
    /// Duration of top-level operations (seconds).
    pub operation_duration: Histogram,
}

impl WranglerMetrics {
    /// Create new wrangler metrics.
    pub fn new() -> Self {
        Self {
            migrations_started: Counter::new("migrations_started", "Served-type migrations started"),
            migrations_completed: Counter::new(
                "migrations_completed",
                "Served-type migrations completed",
            ),
            migrations_failed: Counter::new("migrations_failed", "Served-type migrations failed"),
            reparents_started: Counter::new("reparents_started", "Reparents started"),
            reparents_completed: Counter::new("reparents_completed", "Reparents completed"),
            reparents_failed: Counter::new("reparents_failed", "Reparents failed"),
            locks_acquired: Counter::new("locks_acquired", "Topology locks acquired"),
            locks_released: Counter::new("locks_released", "Topology locks released"),
            lock_release_failures: Counter::new(
                "lock_release_failures",
                "Topology lock releases that failed",
            ),
            actions_dispatched: Counter::new("actions_dispatched", "Tablet actions dispatched"),
            actions_failed: Counter::new("actions_failed", "Tablet actions failed or timed out"),
            operations_active: Gauge::new("operations_active", "Top-level operations in flight"),
            operation_duration: Histogram::with_buckets(
                "operation_duration",
                "Top-level operation duration in seconds",
                OPERATION_DURATION_BUCKETS.to_vec(),
            ),
        }
    }

    /// Record the start of a top-level operation.
    pub fn record_start(&self, kind: OperationKind) {
        match kind {
            OperationKind::Migration => self.migrations_started.inc(),
            OperationKind::Reparent => self.reparents_started.inc(),
        }
        self.operations_active.inc();
    }

    /// Record the end of a top-level operation.
    pub fn record_end(&self, kind: OperationKind, duration: Duration, success: bool) {
        match (kind, success) {
            (OperationKind::Migration, true) => self.migrations_completed.inc(),
            (OperationKind::Migration, false) => self.migrations_failed.inc(),
            (OperationKind::Reparent, true) => self.reparents_completed.inc(),
            (OperationKind::Reparent, false) => self.reparents_failed.inc(),
        }
        self.operations_active.dec();
        self.operation_duration.observe_duration(duration);
    }

    /// Get a snapshot of the metrics.
    pub fn snapshot(&self) -> WranglerMetricsSnapshot {
        WranglerMetricsSnapshot {
            migrations_started: self.migrations_started.get(),
            migrations_completed: self.migrations_completed.get(),
            migrations_failed: self.migrations_failed.get(),
            reparents_started: self.reparents_started.get(),
            reparents_completed: self.reparents_completed.get(),
            reparents_failed: self.reparents_failed.get(),
            locks_acquired: self.locks_acquired.get(),
            locks_released: self.locks_released.get(),
            lock_release_failures: self.lock_release_failures.get(),
            actions_dispatched: self.actions_dispatched.get(),
            actions_failed: self.actions_failed.get(),
            operations_active: self.operations_active.get(),
        }
    }
}

impl Default for WranglerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`WranglerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WranglerMetricsSnapshot {
    pub migrations_started: u64,
    pub migrations_completed: u64,
    pub migrations_failed: u64,
    pub reparents_started: u64,
    pub reparents_completed: u64,
    pub reparents_failed: u64,
    pub locks_acquired: u64,
    pub locks_released: u64,
    pub lock_release_failures: u64,
    pub actions_dispatched: u64,
    pub actions_failed: u64,
    pub operations_active: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_lifecycle() {
        let metrics = WranglerMetrics::new();
        metrics.record_start(OperationKind::Migration);
        metrics.record_start(OperationKind::Reparent);
        assert_eq!(metrics.snapshot().operations_active, 2);

        metrics.record_end(OperationKind::Migration, Duration::from_millis(20), true);
        metrics.record_end(OperationKind::Reparent, Duration::from_millis(20), false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.migrations_started, 1);
        assert_eq!(snapshot.migrations_completed, 1);
        assert_eq!(snapshot.reparents_failed, 1);
        assert_eq!(snapshot.operations_active, 0);
        assert_eq!(metrics.operation_duration.snapshot().count, 2);
    }
}
