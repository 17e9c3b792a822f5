//! Per-connection observability counters (SPEC_FULL.md §10.6).
//!
//! Grounded on `examples/original_source/utils/metrics/__init__.py`:
//! bytes/messages sent and received, latency samples, and a periodic
//! summary log. Observable only — never part of the protocol contract
//! (spec §4.2).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Latency samples beyond this count are dropped (oldest first), matching
/// the original's `deque(maxlen=1000)`.
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Counters tracked for a single logical connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub connection_id: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connection_errors: u64,
    pub reconnections: u64,
    latency_samples: VecDeque<f64>,
}

impl ConnectionMetrics {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            connection_errors: 0,
            reconnections: 0,
            latency_samples: VecDeque::new(),
        }
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.messages_sent += 1;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.messages_received += 1;
    }

    pub fn record_latency(&mut self, seconds: f64) {
        if self.latency_samples.len() >= MAX_LATENCY_SAMPLES {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(seconds);
    }

    pub fn record_error(&mut self) {
        self.connection_errors += 1;
    }

    pub fn record_reconnection(&mut self) {
        self.reconnections += 1;
    }

    pub fn avg_latency(&self) -> Option<f64> {
        if self.latency_samples.is_empty() {
            return None;
        }
        Some(self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64)
    }

    pub fn min_latency(&self) -> Option<f64> {
        self.latency_samples.iter().copied().fold(None, |acc, v| {
            Some(acc.map_or(v, |m: f64| m.min(v)))
        })
    }

    pub fn max_latency(&self) -> Option<f64> {
        self.latency_samples.iter().copied().fold(None, |acc, v| {
            Some(acc.map_or(v, |m: f64| m.max(v)))
        })
    }
}

/// Registry of `ConnectionMetrics` keyed by connection id, plus a
/// background task logging a periodic summary.
pub struct MetricsCollector {
    connections: Arc<Mutex<HashMap<String, ConnectionMetrics>>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            monitor_task: None,
        }
    }

    pub async fn register_connection(&self, connection_id: impl Into<String>) {
        let connection_id = connection_id.into();
        self.connections
            .lock()
            .await
            .insert(connection_id.clone(), ConnectionMetrics::new(connection_id));
    }

    pub async fn remove_connection(&self, connection_id: &str) {
        self.connections.lock().await.remove(connection_id);
    }

    pub async fn get_metrics(&self, connection_id: &str) -> Option<ConnectionMetrics> {
        self.connections.lock().await.get(connection_id).cloned()
    }

    pub async fn all_metrics(&self) -> Vec<ConnectionMetrics> {
        self.connections.lock().await.values().cloned().collect()
    }

    /// Record a heartbeat miss/send failure against a registered connection.
    /// A no-op if the connection was never registered or already removed.
    pub async fn record_error(&self, connection_id: &str) {
        if let Some(metrics) = self.connections.lock().await.get_mut(connection_id) {
            metrics.record_error();
        }
    }

    /// Record a successful reconnect (core connection or a reopened
    /// additional stream) against a registered connection.
    pub async fn record_reconnection(&self, connection_id: &str) {
        if let Some(metrics) = self.connections.lock().await.get_mut(connection_id) {
            metrics.record_reconnection();
        }
    }

    /// Start a background task that logs a throughput/latency/error
    /// summary every `interval`, in the style of the original's
    /// `PerformanceMonitor`.
    pub fn start_periodic_logging(&mut self, interval: Duration) {
        let connections = Arc::clone(&self.connections);
        self.monitor_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = connections.lock().await;
                for metrics in snapshot.values() {
                    log::info!(
                        "connection {}: sent={}B/{}msg recv={}B/{}msg avg_latency={:?} errors={}",
                        metrics.connection_id,
                        metrics.bytes_sent,
                        metrics.messages_sent,
                        metrics.bytes_received,
                        metrics.messages_received,
                        metrics.avg_latency(),
                        metrics.connection_errors,
                    );
                }
            }
        }));
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor_task.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_stats_over_samples() {
        let mut metrics = ConnectionMetrics::new("conn-1");
        for v in [0.1, 0.2, 0.3] {
            metrics.record_latency(v);
        }
        assert!((metrics.avg_latency().unwrap() - 0.2).abs() < 1e-9);
        assert!((metrics.min_latency().unwrap() - 0.1).abs() < 1e-9);
        assert!((metrics.max_latency().unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn latency_samples_capped_at_max() {
        let mut metrics = ConnectionMetrics::new("conn-1");
        for i in 0..(MAX_LATENCY_SAMPLES + 10) {
            metrics.record_latency(i as f64);
        }
        assert_eq!(metrics.latency_samples.len(), MAX_LATENCY_SAMPLES);
    }

    #[tokio::test]
    async fn collector_register_and_remove() {
        let collector = MetricsCollector::new();
        collector.register_connection("conn-a").await;
        assert!(collector.get_metrics("conn-a").await.is_some());
        collector.remove_connection("conn-a").await;
        assert!(collector.get_metrics("conn-a").await.is_none());
    }

    #[tokio::test]
    async fn record_error_and_reconnection_update_registered_connection() {
        let collector = MetricsCollector::new();
        collector.register_connection("conn-a").await;
        collector.record_error("conn-a").await;
        collector.record_error("conn-a").await;
        collector.record_reconnection("conn-a").await;

        let metrics = collector.get_metrics("conn-a").await.unwrap();
        assert_eq!(metrics.connection_errors, 2);
        assert_eq!(metrics.reconnections, 1);
    }

    #[tokio::test]
    async fn record_error_on_unregistered_connection_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_error("ghost").await;
        assert!(collector.get_metrics("ghost").await.is_none());
    }
}
