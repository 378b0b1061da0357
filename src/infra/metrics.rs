//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics so the listener never waits on the reporter.
//! `report()` swaps the periodic counters to zero; totals are monotonic.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are
//! statistical counters only and must not drive any logic.

use crate::domain::types::ValidationOutcome;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for scan handling latency (microseconds)
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Upper bound of the bucket holding the given percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

pub struct Metrics {
    scans_total: AtomicU64,
    scans_since_report: AtomicU64,
    ingested_total: AtomicU64,
    rejected_duplicate_total: AtomicU64,
    rejected_case_total: AtomicU64,
    success_total: AtomicU64,
    out_of_order_total: AtomicU64,
    not_found_total: AtomicU64,
    empty_master_total: AtomicU64,
    debounced_total: AtomicU64,
    pulses_total: AtomicU64,
    fail_safe_total: AtomicU64,
    read_errors_total: AtomicU64,
    write_errors_total: AtomicU64,
    printer_errors_total: AtomicU64,
    /// Validation handling latency up to the ON write (reset on report)
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
    latency_count: AtomicU64,
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    last_report_time: Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            scans_total: AtomicU64::new(0),
            scans_since_report: AtomicU64::new(0),
            ingested_total: AtomicU64::new(0),
            rejected_duplicate_total: AtomicU64::new(0),
            rejected_case_total: AtomicU64::new(0),
            success_total: AtomicU64::new(0),
            out_of_order_total: AtomicU64::new(0),
            not_found_total: AtomicU64::new(0),
            empty_master_total: AtomicU64::new(0),
            debounced_total: AtomicU64::new(0),
            pulses_total: AtomicU64::new(0),
            fail_safe_total: AtomicU64::new(0),
            read_errors_total: AtomicU64::new(0),
            write_errors_total: AtomicU64::new(0),
            printer_errors_total: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_buckets: Default::default(),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    /// Any line read from an input channel
    #[inline]
    pub fn record_scan(&self) {
        self.scans_total.fetch_add(1, Ordering::Relaxed);
        self.scans_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ingested(&self) {
        self.ingested_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected_duplicate(&self) {
        self.rejected_duplicate_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected_case(&self) {
        self.rejected_case_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &ValidationOutcome) {
        let counter = match outcome {
            ValidationOutcome::Success { .. } => &self.success_total,
            ValidationOutcome::OutOfOrder => &self.out_of_order_total,
            ValidationOutcome::NotFound => &self.not_found_total,
            ValidationOutcome::EmptyMaster => &self.empty_master_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_debounced(&self) {
        self.debounced_total.fetch_add(1, Ordering::Relaxed);
    }

    /// An ON/OFF relay pulse was started
    pub fn record_pulse(&self, latency_us: u64) {
        self.pulses_total.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fail_safe(&self) {
        self.fail_safe_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read_error(&self) {
        self.read_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_error(&self) {
        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_printer_error(&self) {
        self.printer_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scans_total(&self) -> u64 {
        self.scans_total.load(Ordering::Relaxed)
    }

    pub fn success_total(&self) -> u64 {
        self.success_total.load(Ordering::Relaxed)
    }

    pub fn pulses_total(&self) -> u64 {
        self.pulses_total.load(Ordering::Relaxed)
    }

    pub fn debounced_total(&self) -> u64 {
        self.debounced_total.load(Ordering::Relaxed)
    }

    pub fn fail_safe_total(&self) -> u64 {
        self.fail_safe_total.load(Ordering::Relaxed)
    }

    pub fn read_errors_total(&self) -> u64 {
        self.read_errors_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let scans_count = self.scans_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_count = self.latency_count.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);

        let mut buckets = [0u64; NUM_BUCKETS];
        for (i, bucket) in self.latency_buckets.iter().enumerate() {
            buckets[i] = bucket.swap(0, Ordering::Relaxed);
        }

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let scans_per_min = if elapsed.as_secs_f64() > 0.0 {
            scans_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            scans_total: self.scans_total.load(Ordering::Relaxed),
            scans_per_min,
            ingested_total: self.ingested_total.load(Ordering::Relaxed),
            rejected_duplicate_total: self.rejected_duplicate_total.load(Ordering::Relaxed),
            rejected_case_total: self.rejected_case_total.load(Ordering::Relaxed),
            success_total: self.success_total.load(Ordering::Relaxed),
            out_of_order_total: self.out_of_order_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            empty_master_total: self.empty_master_total.load(Ordering::Relaxed),
            debounced_total: self.debounced_total.load(Ordering::Relaxed),
            pulses_total: self.pulses_total.load(Ordering::Relaxed),
            fail_safe_total: self.fail_safe_total.load(Ordering::Relaxed),
            read_errors_total: self.read_errors_total.load(Ordering::Relaxed),
            write_errors_total: self.write_errors_total.load(Ordering::Relaxed),
            printer_errors_total: self.printer_errors_total.load(Ordering::Relaxed),
            avg_latency_us: if latency_count > 0 { latency_sum / latency_count } else { 0 },
            max_latency_us: max_latency,
            lat_p99_us: percentile_from_buckets(&buckets, 0.99),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub scans_total: u64,
    pub scans_per_min: f64,
    pub ingested_total: u64,
    pub rejected_duplicate_total: u64,
    pub rejected_case_total: u64,
    pub success_total: u64,
    pub out_of_order_total: u64,
    pub not_found_total: u64,
    pub empty_master_total: u64,
    pub debounced_total: u64,
    pub pulses_total: u64,
    pub fail_safe_total: u64,
    pub read_errors_total: u64,
    pub write_errors_total: u64,
    pub printer_errors_total: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            scans_total = %self.scans_total,
            scans_per_min = format!("{:.1}", self.scans_per_min),
            ingested = %self.ingested_total,
            rejected_dup = %self.rejected_duplicate_total,
            rejected_case = %self.rejected_case_total,
            success = %self.success_total,
            out_of_order = %self.out_of_order_total,
            not_found = %self.not_found_total,
            empty_master = %self.empty_master_total,
            debounced = %self.debounced_total,
            pulses = %self.pulses_total,
            fail_safe = %self.fail_safe_total,
            read_errors = %self.read_errors_total,
            write_errors = %self.write_errors_total,
            printer_errors = %self.printer_errors_total,
            avg_latency_us = %self.avg_latency_us,
            max_latency_us = %self.max_latency_us,
            p99_us = %self.lat_p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(1_000_000), 10);
    }

    #[test]
    fn test_outcome_counters() {
        let metrics = Metrics::new();
        metrics.record_outcome(&ValidationOutcome::Success { index: 0 });
        metrics.record_outcome(&ValidationOutcome::OutOfOrder);
        metrics.record_outcome(&ValidationOutcome::NotFound);
        metrics.record_outcome(&ValidationOutcome::NotFound);

        let summary = metrics.report();
        assert_eq!(summary.success_total, 1);
        assert_eq!(summary.out_of_order_total, 1);
        assert_eq!(summary.not_found_total, 2);
        assert_eq!(summary.empty_master_total, 0);
    }

    #[test]
    fn test_report_resets_periodic_counters_only() {
        let metrics = Metrics::new();
        metrics.record_scan();
        metrics.record_scan();
        metrics.record_pulse(150);
        metrics.record_pulse(90);

        let first = metrics.report();
        assert_eq!(first.scans_total, 2);
        assert_eq!(first.pulses_total, 2);
        assert_eq!(first.avg_latency_us, 120);
        assert_eq!(first.max_latency_us, 150);
        assert_eq!(first.lat_p99_us, 100);

        let second = metrics.report();
        assert_eq!(second.scans_total, 2);
        assert_eq!(second.pulses_total, 2);
        assert_eq!(second.avg_latency_us, 0);
        assert_eq!(second.max_latency_us, 0);
        assert_eq!(second.lat_p99_us, 0);
    }
}
