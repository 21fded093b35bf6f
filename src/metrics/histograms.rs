//! Histogram metrics for protocol durations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Buckets (in seconds) for whole-protocol durations. Migrations wait on
/// locks and filtered replication, so the tail is long.
pub const OPERATION_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
];

/// A cumulative-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    // f64 bits
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds.
    pub fn with_buckets(name: &'static str, help: &'static str, mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(f64::total_cmp);
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name,
            help,
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    /// Get the histogram name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the histogram help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (upper, count) in self.buckets.iter().zip(&self.bucket_counts) {
            if value <= *upper {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Get a snapshot of the histogram data.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of histogram data.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds.
    pub buckets: Vec<f64>,
    /// Count of observations <= each bound.
    pub bucket_counts: Vec<u64>,
    /// Sum of all observations.
    pub sum: f64,
    /// Total count of observations.
    pub count: u64,
}

impl HistogramSnapshot {
    /// Mean of all observations.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::with_buckets("op", "Operation duration", vec![1.0, 0.1, 10.0]);
        hist.observe(0.05);
        hist.observe(0.5);
        hist.observe(5.0);

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.buckets, vec![0.1, 1.0, 10.0]);
        assert_eq!(snapshot.bucket_counts, vec![1, 2, 3]);
        assert_eq!(snapshot.count, 3);
        assert!((snapshot.sum - 5.55).abs() < 1e-9);
        assert!((snapshot.mean() - 1.85).abs() < 1e-9);
    }
}
