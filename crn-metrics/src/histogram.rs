//! Lock-free latency histogram for replication phase timings.
//!
//! Percentile approximation via fixed bucket bounds; all updates are relaxed
//! atomics so recording on the replication hot path costs a handful of
//! uncontended fetch-adds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bucket boundaries in microseconds.
/// 100µs, 500µs, 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s, +Inf
const BUCKET_BOUNDS_US: [u64; 13] = [
    100,
    500,
    1_000,
    5_000,
    10_000,
    25_000,
    50_000,
    100_000,
    250_000,
    500_000,
    1_000_000,
    5_000_000,
    10_000_000,
];

/// Histogram with atomic buckets (13 bounded + 1 overflow).
pub struct LatencyHistogram {
    buckets: [AtomicU64; 14],
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub sum_us: u64,
    pub min_us: u64,
    pub max_us: u64,
}

impl LatencyHistogram {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU64 = AtomicU64::new(0);

    #[must_use]
    pub const fn new() -> Self {
        Self {
            buckets: [Self::ZERO; 14],
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record a latency observation.
    #[inline]
    pub fn record(&self, duration: Duration) {
        self.record_us(duration.as_micros() as u64);
    }

    /// Record a latency observation in microseconds.
    pub fn record_us(&self, us: u64) {
        let bucket_idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(13);

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);

        let mut current_min = self.min_us.load(Ordering::Relaxed);
        while us < current_min {
            match self.min_us.compare_exchange_weak(
                current_min,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_min = actual,
            }
        }

        let mut current_max = self.max_us.load(Ordering::Relaxed);
        while us > current_max {
            match self.max_us.compare_exchange_weak(
                current_max,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
            min_us: self.min_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }

    /// Approximate percentile (0.0..=1.0) from bucket upper bounds.
    #[must_use]
    pub fn percentile(&self, p: f64) -> u64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * p).ceil() as u64;
        let mut seen = 0u64;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return BUCKET_BOUNDS_US
                    .get(idx)
                    .copied()
                    .unwrap_or_else(|| self.max_us.load(Ordering::Relaxed));
            }
        }
        self.max_us.load(Ordering::Relaxed)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_updates_aggregates() {
        let h = LatencyHistogram::new();
        h.record_us(50);
        h.record_us(2_000);
        h.record_us(800_000);

        let snap = h.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.sum_us, 802_050);
        assert_eq!(snap.min_us, 50);
        assert_eq!(snap.max_us, 800_000);
    }

    #[test]
    fn test_percentile_of_empty_is_zero() {
        let h = LatencyHistogram::new();
        assert_eq!(h.percentile(0.99), 0);
    }

    #[test]
    fn test_percentile_tracks_buckets() {
        let h = LatencyHistogram::new();
        for _ in 0..99 {
            h.record_us(90); // <=100µs bucket
        }
        h.record_us(9_000_000); // 10s bucket
        assert_eq!(h.percentile(0.5), 100);
        assert!(h.percentile(1.0) >= 5_000_000);
    }

    #[test]
    fn test_overflow_bucket() {
        let h = LatencyHistogram::new();
        h.record(Duration::from_secs(60));
        assert_eq!(h.snapshot().count, 1);
        assert_eq!(h.percentile(1.0), 60_000_000);
    }
}
