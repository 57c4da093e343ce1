//! Request latency and error accounting.
//!
//! Samples are appended as requests complete; percentiles are computed by
//! sorting at query time rather than maintained incrementally, so
//! out-of-order completion cannot skew the ranking.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
struct MetricsState {
    request_count: u64,
    total_latency_ms: f64,
    min_latency_ms: Option<f64>,
    max_latency_ms: Option<f64>,
    error_count: u64,
    timeout_count: u64,
    latency_samples_ms: Vec<f64>,
}

/// Point-in-time view of the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests that completed with a success result. Errors and timeouts
    /// are counted separately and contribute no latency sample.
    pub request_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_count: u64,
    pub timeout_count: u64,
}

/// Thread-safe latency/error collector.
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
        }
    }

    /// Record a successful completion.
    pub fn record_completion(&self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        let mut state = self.lock();
        state.request_count += 1;
        state.total_latency_ms += ms;
        state.min_latency_ms = Some(state.min_latency_ms.map_or(ms, |m| m.min(ms)));
        state.max_latency_ms = Some(state.max_latency_ms.map_or(ms, |m| m.max(ms)));
        state.latency_samples_ms.push(ms);
    }

    pub fn record_error(&self) {
        self.lock().error_count += 1;
    }

    pub fn record_timeout(&self) {
        self.lock().timeout_count += 1;
    }

    /// Clear all counters and samples in one step.
    pub fn reset(&self) {
        *self.lock() = MetricsState::default();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let mut sorted = state.latency_samples_ms.clone();
        sorted.sort_by(f64::total_cmp);

        let avg = if state.request_count == 0 {
            0.0
        } else {
            state.total_latency_ms / state.request_count as f64
        };

        MetricsSnapshot {
            request_count: state.request_count,
            avg_latency_ms: avg,
            min_latency_ms: state.min_latency_ms.unwrap_or(0.0),
            max_latency_ms: state.max_latency_ms.unwrap_or(0.0),
            p95_latency_ms: nearest_rank(&sorted, 0.95),
            p99_latency_ms: nearest_rank(&sorted, 0.99),
            error_count: state.error_count,
            timeout_count: state.timeout_count,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over ascending samples: index = floor(n * q),
/// zero-based, clamped to the last sample. Zero when empty.
fn nearest_rank(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn empty_snapshot_is_all_zeros() {
        let snapshot = MetricsCollector::new().snapshot();
        assert_eq!(snapshot.request_count, 0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
        assert_eq!(snapshot.min_latency_ms, 0.0);
        assert_eq!(snapshot.max_latency_ms, 0.0);
        assert_eq!(snapshot.p95_latency_ms, 0.0);
        assert_eq!(snapshot.p99_latency_ms, 0.0);
    }

    #[test]
    fn running_min_max_avg() {
        let metrics = MetricsCollector::new();
        metrics.record_completion(ms(10));
        metrics.record_completion(ms(30));
        metrics.record_completion(ms(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.min_latency_ms, 10.0);
        assert_eq!(snapshot.max_latency_ms, 30.0);
        assert!((snapshot.avg_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn nearest_rank_percentiles_over_ten_samples() {
        let metrics = MetricsCollector::new();
        // 10, 20, ..., 100: index floor(10 * 0.95) = 9 for both.
        for n in 1..=10 {
            metrics.record_completion(ms(n * 10));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.p95_latency_ms, 100.0);
        assert_eq!(snapshot.p99_latency_ms, 100.0);
    }

    #[test]
    fn percentiles_ignore_insertion_order() {
        let metrics = MetricsCollector::new();
        for n in [70u64, 10, 100, 40, 20, 90, 30, 60, 50, 80] {
            metrics.record_completion(ms(n));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.p95_latency_ms, 100.0);
    }

    #[test]
    fn errors_and_timeouts_do_not_sample_latency() {
        let metrics = MetricsCollector::new();
        metrics.record_error();
        metrics.record_timeout();
        metrics.record_timeout();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 0);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.timeout_count, 2);
        assert_eq!(snapshot.p95_latency_ms, 0.0);
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = MetricsCollector::new();
        metrics.record_completion(ms(5));
        metrics.record_error();
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 0);
        assert_eq!(snapshot.error_count, 0);
        assert_eq!(snapshot.max_latency_ms, 0.0);
    }
}
