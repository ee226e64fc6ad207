/*!
 * Call outcome and latency metrics
 *
 * Counters are atomics so they can be read without locking, but every write
 * happens under the same mutex as the latency aggregates and the recent-error
 * ring. A snapshot therefore always sees counts and latencies from the same
 * set of calls.
 */

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Error messages kept by default
pub const DEFAULT_MAX_RECENT_ERRORS: usize = 10;

#[derive(Debug)]
struct Latencies {
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    recent_errors: VecDeque<String>,
}

impl Latencies {
    fn new(capacity: usize) -> Self {
        Self {
            total: Duration::ZERO,
            min: None,
            max: Duration::ZERO,
            recent_errors: VecDeque::with_capacity(capacity),
        }
    }
}

/// Records call outcomes for a client
#[derive(Debug)]
pub struct MetricsCollector {
    request_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    max_recent_errors: usize,
    latencies: Mutex<Latencies>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECENT_ERRORS)
    }
}

impl MetricsCollector {
    /// Keep at most `max_recent_errors` messages; zero falls back to the default
    pub fn new(max_recent_errors: usize) -> Self {
        let max_recent_errors = if max_recent_errors == 0 {
            DEFAULT_MAX_RECENT_ERRORS
        } else {
            max_recent_errors
        };

        Self {
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            max_recent_errors,
            latencies: Mutex::new(Latencies::new(max_recent_errors)),
        }
    }

    fn latencies(&self) -> MutexGuard<'_, Latencies> {
        self.latencies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one finished call
    pub fn record_request(&self, success: bool, latency: Duration) {
        let mut latencies = self.latencies();

        self.request_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        latencies.total = latencies.total.saturating_add(latency);
        latencies.min = Some(latencies.min.map_or(latency, |min| min.min(latency)));
        latencies.max = latencies.max.max(latency);
    }

    /// Remember an error message, dropping the oldest beyond capacity
    pub fn record_error(&self, err: &dyn Display) {
        let mut latencies = self.latencies();
        if latencies.recent_errors.len() >= self.max_recent_errors {
            latencies.recent_errors.pop_front();
        }
        latencies.recent_errors.push_back(err.to_string());
    }

    /// Most recent error messages, oldest first
    pub fn recent_errors(&self) -> Vec<String> {
        self.latencies().recent_errors.iter().cloned().collect()
    }

    pub fn stats(&self) -> MetricsSnapshot {
        let latencies = self.latencies();

        let request_count = self.request_count.load(Ordering::Relaxed);
        let success_count = self.success_count.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);

        let (success_rate, avg_latency) = if request_count > 0 {
            let divisor = u32::try_from(request_count).unwrap_or(u32::MAX);
            (success_count as f64 / request_count as f64, latencies.total / divisor)
        } else {
            (0.0, Duration::ZERO)
        };

        MetricsSnapshot {
            request_count,
            success_count,
            failure_count,
            success_rate,
            avg_latency,
            min_latency: latencies.min.unwrap_or(Duration::ZERO),
            max_latency: latencies.max,
        }
    }

    /// Zero all counters and forget recorded errors
    pub fn reset(&self) {
        let mut latencies = self.latencies();
        self.request_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        *latencies = Latencies::new(self.max_recent_errors);
    }
}

/// Point-in-time view of a [`MetricsCollector`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// 0.0 to 1.0; 0.0 when nothing was recorded
    pub success_rate: f64,
    pub avg_latency: Duration,
    /// Zero when nothing was recorded
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl MetricsSnapshot {
    /// One-line human readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} requests ({} ok, {} failed, {:.1}% success), latency avg {:?} min {:?} max {:?}",
            self.request_count,
            self.success_count,
            self.failure_count,
            self.success_rate * 100.0,
            self.avg_latency,
            self.min_latency,
            self.max_latency
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_snapshot() {
        let metrics = MetricsCollector::default();
        let stats = metrics.stats();

        assert_eq!(stats.request_count, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.avg_latency, Duration::ZERO);
        assert_eq!(stats.min_latency, Duration::ZERO);
    }

    #[test]
    fn test_aggregates() {
        let metrics = MetricsCollector::default();
        metrics.record_request(true, Duration::from_millis(10));
        metrics.record_request(true, Duration::from_millis(30));
        metrics.record_request(false, Duration::from_millis(50));
        metrics.record_request(true, Duration::from_millis(30));

        let stats = metrics.stats();
        assert_eq!(stats.request_count, 4);
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.success_rate, 0.75);
        assert_eq!(stats.avg_latency, Duration::from_millis(30));
        assert_eq!(stats.min_latency, Duration::from_millis(10));
        assert_eq!(stats.max_latency, Duration::from_millis(50));
        assert!(stats.summary().contains("75.0% success"));
    }

    #[test]
    fn test_recent_errors_bounded() {
        let metrics = MetricsCollector::new(3);
        for i in 0..5 {
            metrics.record_error(&format!("error {}", i));
        }

        assert_eq!(metrics.recent_errors(), vec!["error 2", "error 3", "error 4"]);
    }

    #[test]
    fn test_reset() {
        let metrics = MetricsCollector::default();
        metrics.record_request(false, Duration::from_millis(5));
        metrics.record_error(&"boom");
        metrics.reset();

        assert_eq!(metrics.stats(), MetricsCollector::default().stats());
        assert!(metrics.recent_errors().is_empty());
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(MetricsCollector::default());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        metrics.record_request(i % 5 != 0, Duration::from_micros(100));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let stats = metrics.stats();
        assert_eq!(stats.request_count, 1000);
        assert_eq!(stats.success_count + stats.failure_count, 1000);
        assert_eq!(stats.failure_count, 200);
    }

    #[test]
    fn test_snapshots_are_consistent_under_writes() {
        let metrics = Arc::new(MetricsCollector::default());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        metrics.record_request(i % 2 == 0, Duration::from_micros(100));
                    }
                })
            })
            .collect();

        while writers.iter().any(|writer| !writer.is_finished()) {
            let stats = metrics.stats();
            assert_eq!(stats.success_count + stats.failure_count, stats.request_count);
            if stats.request_count > 0 {
                assert_eq!(stats.avg_latency, Duration::from_micros(100));
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(metrics.stats().request_count, 2000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::default();
        metrics.record_request(true, Duration::from_millis(1));

        let json = metrics.stats().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["request_count"], 1);
        assert_eq!(value["success_rate"], 1.0);
    }
}
