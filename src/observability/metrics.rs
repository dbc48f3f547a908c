//! Thread-safe metrics collection
//!
//! Atomic counters for agent runs, polls and HTTP traffic, plus a bounded
//! window of processing times for percentile reporting.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Processing times kept for percentile calculation
const PROCESSING_TIME_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Agent runs
    items_received: AtomicU64,
    items_in_flight: AtomicU64,
    items_completed: AtomicU64,
    items_recovered: AtomicU64,
    items_failed: AtomicU64,
    items_delegated: AtomicU64,
    exceptions_recorded: AtomicU64,
    max_in_flight_reached: AtomicU64,

    // Polling
    polls_productive: AtomicU64,
    polls_empty: AtomicU64,
    polls_failed: AtomicU64,

    // HTTP receiver
    connections_accepted: AtomicU64,
    http_requests: AtomicU64,

    // Processing times in milliseconds
    processing_times: Mutex<Vec<u64>>,

    // Lifecycle
    receivers_running: AtomicU64,
    uptime_start: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();
        Self {
            items_received: AtomicU64::new(0),
            items_in_flight: AtomicU64::new(0),
            items_completed: AtomicU64::new(0),
            items_recovered: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            items_delegated: AtomicU64::new(0),
            exceptions_recorded: AtomicU64::new(0),
            max_in_flight_reached: AtomicU64::new(0),
            polls_productive: AtomicU64::new(0),
            polls_empty: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            receivers_running: AtomicU64::new(0),
            uptime_start: AtomicU64::new(now),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Agent run metrics
    pub fn item_received(&self) {
        self.items_received.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.items_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight_reached
            .fetch_max(in_flight, Ordering::Relaxed);
    }

    pub fn item_completed(&self) {
        self.items_completed.fetch_add(1, Ordering::Relaxed);
        self.item_finished();
    }

    pub fn item_recovered(&self) {
        self.items_recovered.fetch_add(1, Ordering::Relaxed);
        self.item_finished();
    }

    pub fn item_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
        self.item_finished();
    }

    pub fn item_delegated(&self) {
        self.items_delegated.fetch_add(1, Ordering::Relaxed);
        self.item_finished();
    }

    fn item_finished(&self) {
        let _ = self
            .items_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn exception_recorded(&self) {
        self.exceptions_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > PROCESSING_TIME_WINDOW {
                times.remove(0);
            }
        }
    }

    // Polling metrics
    pub fn poll_productive(&self) {
        self.polls_productive.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_empty(&self) {
        self.polls_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_failed(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    // HTTP metrics
    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_receivers_running(&self, count: u64) {
        self.receivers_running.store(count, Ordering::Relaxed);
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.items_received,
            &self.items_in_flight,
            &self.items_completed,
            &self.items_recovered,
            &self.items_failed,
            &self.items_delegated,
            &self.exceptions_recorded,
            &self.max_in_flight_reached,
            &self.polls_productive,
            &self.polls_empty,
            &self.polls_failed,
            &self.connections_accepted,
            &self.http_requests,
            &self.receivers_running,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        let now = current_timestamp();
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
    }

    /// Average and p50/p95/p99 of the processing time window
    fn processing_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_processing_time_ms, p50, p95, p99) = self.processing_time_statistics();

        MetricsSnapshot {
            items: ItemMetrics {
                items_received: self.items_received.load(Ordering::Relaxed),
                items_in_flight: self.items_in_flight.load(Ordering::Relaxed),
                items_completed: self.items_completed.load(Ordering::Relaxed),
                items_recovered: self.items_recovered.load(Ordering::Relaxed),
                items_failed: self.items_failed.load(Ordering::Relaxed),
                items_delegated: self.items_delegated.load(Ordering::Relaxed),
                exceptions_recorded: self.exceptions_recorded.load(Ordering::Relaxed),
                max_in_flight_reached: self.max_in_flight_reached.load(Ordering::Relaxed),
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                processing_time_p99_ms: p99,
            },
            polling: PollingMetrics {
                polls_productive: self.polls_productive.load(Ordering::Relaxed),
                polls_empty: self.polls_empty.load(Ordering::Relaxed),
                polls_failed: self.polls_failed.load(Ordering::Relaxed),
            },
            http: HttpMetrics {
                connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
                requests: self.http_requests.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                receivers_running: self.receivers_running.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub items: ItemMetrics,
    pub polling: PollingMetrics,
    pub http: HttpMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ItemMetrics {
    pub items_received: u64,
    pub items_in_flight: u64,
    pub items_completed: u64,
    pub items_recovered: u64,
    pub items_failed: u64,
    pub items_delegated: u64,
    pub exceptions_recorded: u64,
    pub max_in_flight_reached: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub processing_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct PollingMetrics {
    pub polls_productive: u64,
    pub polls_empty: u64,
    pub polls_failed: u64,
}

#[derive(Debug, Serialize)]
pub struct HttpMetrics {
    pub connections_accepted: u64,
    pub requests: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub receivers_running: u64,
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_item_metrics() {
        let collector = MetricsCollector::new();

        collector.item_received();
        collector.item_received();
        collector.item_completed();
        collector.item_delegated();
        collector.record_processing_time(Duration::from_millis(1500));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.items.items_received, 2);
        assert_eq!(metrics.items.items_completed, 1);
        assert_eq!(metrics.items.items_delegated, 1);
        assert_eq!(metrics.items.items_in_flight, 0);
        assert_eq!(metrics.items.max_in_flight_reached, 2);
        assert!(metrics.items.avg_processing_time_ms > 1400.0);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let collector = MetricsCollector::new();
        collector.item_failed();
        assert_eq!(collector.get_metrics().items.items_in_flight, 0);
    }

    #[test]
    fn test_poll_and_http_metrics() {
        let collector = MetricsCollector::new();

        collector.poll_productive();
        collector.poll_empty();
        collector.poll_empty();
        collector.poll_failed();
        collector.connection_accepted();
        collector.http_request();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.polling.polls_productive, 1);
        assert_eq!(metrics.polling.polls_empty, 2);
        assert_eq!(metrics.polling.polls_failed, 1);
        assert_eq!(metrics.http.connections_accepted, 1);
        assert_eq!(metrics.http.requests, 1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.item_received();
                        collector.poll_empty();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.items.items_received, 1000);
        assert_eq!(metrics.polling.polls_empty, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_processing_time_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.record_processing_time(Duration::from_millis(i));
        }

        let len = collector.processing_times.lock().unwrap().len();
        assert_eq!(len, PROCESSING_TIME_WINDOW);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();
        collector.item_received();
        collector.exception_recorded();
        collector.update_health_status(false);

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.items.items_received, 0);
        assert_eq!(metrics.items.exceptions_recorded, 0);
        assert!(metrics.lifecycle.healthy);
    }
}
