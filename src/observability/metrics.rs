//! Thread-safe metrics collection
//!
//! Atomic counters for the MQTT connection and the provisioning protocol, plus a
//! bounded window of registration durations for percentile reporting.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex for samples
pub struct MetricsCollector {
    // Connection
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connected_since: AtomicU64,

    // Publishes
    publishes_started: AtomicU64,
    publishes_acknowledged: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,

    // Provisioning
    operations_started: AtomicU64,
    responses_dispatched: AtomicU64,
    responses_dropped: AtomicU64,
    operations_cancelled: AtomicU64,
    registrations_assigned: AtomicU64,
    registrations_failed: AtomicU64,
    registration_times: Mutex<Vec<u64>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connected_since: AtomicU64::new(0),
            publishes_started: AtomicU64::new(0),
            publishes_acknowledged: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            operations_started: AtomicU64::new(0),
            responses_dispatched: AtomicU64::new(0),
            responses_dropped: AtomicU64::new(0),
            operations_cancelled: AtomicU64::new(0),
            registrations_assigned: AtomicU64::new(0),
            registrations_failed: AtomicU64::new(0),
            registration_times: Mutex::new(Vec::new()),
        }
    }

    pub fn connection_attempted(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connection_lost();
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn publish_started(&self) {
        self.publishes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_acknowledged(&self) {
        self.publishes_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_started(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_dispatched(&self) {
        self.responses_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_dropped(&self) {
        self.responses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operations_cancelled(&self, count: usize) {
        self.operations_cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn registration_finished(&self, duration: Duration, assigned: bool) {
        if assigned {
            self.registrations_assigned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.registrations_failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut times = self
            .registration_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        times.push(duration.as_millis() as u64);
        if times.len() > MAX_SAMPLES {
            times.remove(0);
        }
    }

    /// Consistent point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (registration_avg_ms, registration_p50_ms, registration_p95_ms) = {
            let times = self
                .registration_times
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if times.is_empty() {
                (0.0, 0.0, 0.0)
            } else {
                let mut sorted = times.clone();
                sorted.sort_unstable();
                let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
                (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
            }
        };

        let connected_since = self.connected_since.load(Ordering::Relaxed);
        let connection_uptime_secs = if connected_since == 0 {
            0
        } else {
            current_timestamp().saturating_sub(connected_since)
        };

        MetricsSnapshot {
            timestamp: current_timestamp(),
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_uptime_secs,
                publishes_started: self.publishes_started.load(Ordering::Relaxed),
                publishes_acknowledged: self.publishes_acknowledged.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
            },
            provisioning: ProvisioningMetrics {
                operations_started: self.operations_started.load(Ordering::Relaxed),
                responses_dispatched: self.responses_dispatched.load(Ordering::Relaxed),
                responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
                operations_cancelled: self.operations_cancelled.load(Ordering::Relaxed),
                registrations_assigned: self.registrations_assigned.load(Ordering::Relaxed),
                registrations_failed: self.registrations_failed.load(Ordering::Relaxed),
                registration_avg_ms,
                registration_p50_ms,
                registration_p95_ms,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub connection: ConnectionMetrics,
    pub provisioning: ProvisioningMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_uptime_secs: u64,
    pub publishes_started: u64,
    pub publishes_acknowledged: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningMetrics {
    pub operations_started: u64,
    pub responses_dispatched: u64,
    pub responses_dropped: u64,
    pub operations_cancelled: u64,
    pub registrations_assigned: u64,
    pub registrations_failed: u64,
    pub registration_avg_ms: f64,
    pub registration_p50_ms: f64,
    pub registration_p95_ms: f64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Nearest-rank percentile of already sorted samples
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let collector = MetricsCollector::new();
        collector.connection_attempted();
        collector.connection_attempted();
        collector.connection_failed();
        collector.connection_established();

        let snapshot = collector.snapshot();
        assert!(snapshot.connection.connected);
        assert_eq!(snapshot.connection.connection_attempts, 2);
        assert_eq!(snapshot.connection.connection_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);

        collector.connection_lost();
        assert!(!collector.snapshot().connection.connected);
    }

    #[test]
    fn test_registration_percentiles() {
        let collector = MetricsCollector::new();
        for ms in 1..=100 {
            collector.registration_finished(Duration::from_millis(ms), ms % 10 != 0);
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.provisioning.registrations_assigned, 90);
        assert_eq!(snapshot.provisioning.registrations_failed, 10);
        assert_eq!(snapshot.provisioning.registration_p50_ms, 51.0);
        assert_eq!(snapshot.provisioning.registration_p95_ms, 95.0);
        assert!((snapshot.provisioning.registration_avg_ms - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let collector = MetricsCollector::new();
        for _ in 0..(MAX_SAMPLES + 10) {
            collector.registration_finished(Duration::from_millis(5), true);
        }
        let times = collector.registration_times.lock().unwrap();
        assert_eq!(times.len(), MAX_SAMPLES);
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = MetricsCollector::new();
        collector.operations_cancelled(3);
        let json = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(json["provisioning"]["operations_cancelled"], 3);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
