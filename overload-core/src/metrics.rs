//! Thread-safe metrics registry with sliding-window statistics.
//!
//! Monotone counters use atomics; the active-client map, the timed-sample
//! windows and the latest server resource state sit behind their own locks
//! so snapshot readers never contend with request-path writers longer than
//! necessary. All window statistics cover the last second and are recomputed
//! inside a single critical section per snapshot, so every value in one
//! snapshot corresponds to the same wall-clock instant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::clock::now_millis;
use crate::config::MetricsConfig;

/// Server resource state as pushed into the registry by the resource
/// manager every tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMetrics {
    pub active_requests: i64,
    pub queued_requests: i64,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub queue_utilization: f64,
    pub threads_utilization: f64,
    pub average_queue_time_ms: f64,
    pub max_queue_time_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct TimedSample {
    at: Instant,
    duration: Duration,
}

#[derive(Default)]
struct Windows {
    response_times: Vec<TimedSample>,
    request_latencies: Vec<TimedSample>,
    response_latencies: Vec<TimedSample>,
}

/// Tracks and computes statistics about a simulation run.
pub struct Metrics {
    cfg: MetricsConfig,

    active_clients: RwLock<HashMap<String, i64>>,

    // Client-side counters
    client_blocked: AtomicI64,
    client_sent: AtomicI64,
    client_retries: AtomicI64,
    client_successes: AtomicI64,
    client_errors: AtomicI64,

    // Network counters
    network_failed: AtomicI64,

    // Server-side counters
    server_received: AtomicI64,
    server_successes: AtomicI64,
    server_errors: AtomicI64,

    windows: Mutex<Windows>,
    resource: RwLock<ResourceMetrics>,
}

impl Metrics {
    pub fn new(cfg: MetricsConfig) -> Self {
        Self {
            cfg,
            active_clients: RwLock::new(HashMap::new()),
            client_blocked: AtomicI64::new(0),
            client_sent: AtomicI64::new(0),
            client_retries: AtomicI64::new(0),
            client_successes: AtomicI64::new(0),
            client_errors: AtomicI64::new(0),
            network_failed: AtomicI64::new(0),
            server_received: AtomicI64::new(0),
            server_successes: AtomicI64::new(0),
            server_errors: AtomicI64::new(0),
            windows: Mutex::new(Windows::default()),
            resource: RwLock::new(ResourceMetrics::default()),
        }
    }

    /// Request blocked by the client's behavior script.
    pub fn inc_client_blocked(&self) {
        self.client_blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Request handed to the network by a client.
    pub fn inc_client_sent(&self) {
        self.client_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Retry attempt (also counted as sent).
    pub fn inc_client_retries(&self) {
        self.client_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful response observed by a client.
    pub fn inc_client_successes(&self) {
        self.client_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Error response observed by a client.
    pub fn inc_client_errors(&self) {
        self.client_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Transport failure (drop, timeout, admission rejection).
    pub fn inc_network_failed(&self) {
        self.network_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Request that made it through the forward network leg.
    pub fn inc_server_received(&self) {
        self.server_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful server response.
    pub fn inc_server_successes(&self) {
        self.server_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Failed server response, including admission rejections.
    pub fn inc_server_errors(&self) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the active client count for a group.
    pub fn add_active_client(&self, group: &str) {
        let mut map = self.active_clients.write();
        *map.entry(group.to_string()).or_insert(0) += 1;
    }

    /// Decrements the active client count for a group.
    pub fn remove_active_client(&self, group: &str) {
        let mut map = self.active_clients.write();
        if let Some(count) = map.get_mut(group) {
            *count -= 1;
        }
    }

    /// Records a full client-observed response time.
    pub fn record_response_time(&self, duration: Duration) {
        let mut windows = self.windows.lock();
        push_sample(&mut windows.response_times, duration, self.cfg.capacity);
    }

    /// Records a forward-leg network latency.
    pub fn record_request_latency(&self, duration: Duration) {
        let mut windows = self.windows.lock();
        push_sample(&mut windows.request_latencies, duration, self.cfg.capacity);
    }

    /// Records a return-leg network latency.
    pub fn record_response_latency(&self, duration: Duration) {
        let mut windows = self.windows.lock();
        push_sample(&mut windows.response_latencies, duration, self.cfg.capacity);
    }

    /// Stores the latest server resource state (called by the resource
    /// manager).
    pub fn set_resource_state(&self, state: ResourceMetrics) {
        *self.resource.write() = state;
    }

    /// Returns a consistent snapshot of all metrics.
    ///
    /// Prunes each window to the configured retention and recomputes the
    /// derived statistics while holding the window lock.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.cfg.window).unwrap_or(now);

        let active_clients = self.active_clients.read().clone();
        let resource = *self.resource.read();

        let mut windows = self.windows.lock();
        let response = window_stats(&mut windows.response_times, cutoff);
        let request_latency = window_stats(&mut windows.request_latencies, cutoff);
        let response_latency = window_stats(&mut windows.response_latencies, cutoff);
        drop(windows);

        MetricsSnapshot {
            active_clients,

            client_blocked_requests: self.client_blocked.load(Ordering::Relaxed),
            client_sent_requests: self.client_sent.load(Ordering::Relaxed),
            client_retry_requests: self.client_retries.load(Ordering::Relaxed),
            client_success_responses: self.client_successes.load(Ordering::Relaxed),
            client_error_responses: self.client_errors.load(Ordering::Relaxed),

            network_failed_requests: self.network_failed.load(Ordering::Relaxed),

            server_received_requests: self.server_received.load(Ordering::Relaxed),
            server_success_responses: self.server_successes.load(Ordering::Relaxed),
            server_error_responses: self.server_errors.load(Ordering::Relaxed),

            server_cpu_utilization: resource.cpu_utilization,
            server_memory_utilization: resource.memory_utilization,
            server_active_requests: resource.active_requests,
            server_queued_requests: resource.queued_requests,
            server_queue_utilization: resource.queue_utilization,
            server_threads_utilization: resource.threads_utilization,
            server_avg_queue_time_ms: resource.average_queue_time_ms,
            server_max_queue_time_ms: resource.max_queue_time_ms,

            min_response_time: response.min_ms,
            max_response_time: response.max_ms,
            avg_response_time: response.avg_ms,
            p50_response_time: response.p50_ms,
            p80_response_time: response.p80_ms,
            p95_response_time: response.p95_ms,

            min_request_latency: request_latency.min_ms,
            max_request_latency: request_latency.max_ms,
            min_response_latency: response_latency.min_ms,
            max_response_latency: response_latency.max_ms,

            timestamp: now_millis(),
        }
    }
}

fn push_sample(samples: &mut Vec<TimedSample>, duration: Duration, capacity: usize) {
    samples.push(TimedSample {
        at: Instant::now(),
        duration,
    });
    if samples.len() > capacity {
        let excess = samples.len() - capacity;
        samples.drain(..excess);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WindowStats {
    min_ms: i64,
    max_ms: i64,
    avg_ms: i64,
    p50_ms: i64,
    p80_ms: i64,
    p95_ms: i64,
}

/// Prunes samples older than `cutoff` and computes stats over the survivors.
fn window_stats(samples: &mut Vec<TimedSample>, cutoff: Instant) -> WindowStats {
    samples.retain(|s| s.at >= cutoff);
    if samples.is_empty() {
        return WindowStats::default();
    }

    let mut sum = Duration::ZERO;
    let mut min = samples[0].duration;
    let mut max = samples[0].duration;
    let mut sorted: Vec<Duration> = Vec::with_capacity(samples.len());
    for sample in samples.iter() {
        let d = sample.duration;
        sorted.push(d);
        sum += d;
        if d < min {
            min = d;
        }
        if d > max {
            max = d;
        }
    }
    sorted.sort_unstable();

    let n = sorted.len();
    let pick = |p: f64| -> i64 {
        let idx = ((n as f64) * p) as usize;
        sorted[idx.min(n - 1)].as_millis() as i64
    };

    WindowStats {
        min_ms: min.as_millis() as i64,
        max_ms: max.as_millis() as i64,
        avg_ms: (sum / n as u32).as_millis() as i64,
        p50_ms: pick(0.5),
        p80_ms: pick(0.8),
        p95_ms: pick(0.95),
    }
}

/// Flat metrics snapshot, serialized with the wire field names consumed by
/// the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(rename = "active_clients")]
    pub active_clients: HashMap<String, i64>,

    #[serde(rename = "client_blocked_req")]
    pub client_blocked_requests: i64,
    #[serde(rename = "client_sent_req")]
    pub client_sent_requests: i64,
    #[serde(rename = "client_retry_req")]
    pub client_retry_requests: i64,
    #[serde(rename = "client_success_resp")]
    pub client_success_responses: i64,
    #[serde(rename = "client_error_resp")]
    pub client_error_responses: i64,

    #[serde(rename = "network_failed_reqs")]
    pub network_failed_requests: i64,

    #[serde(rename = "server_received_req")]
    pub server_received_requests: i64,
    #[serde(rename = "server_success_resp")]
    pub server_success_responses: i64,
    #[serde(rename = "server_error_resp")]
    pub server_error_responses: i64,

    #[serde(rename = "server_cpu_utilization")]
    pub server_cpu_utilization: f64,
    #[serde(rename = "server_memory_utilization")]
    pub server_memory_utilization: f64,
    #[serde(rename = "server_active_requests")]
    pub server_active_requests: i64,
    #[serde(rename = "server_queued_requests")]
    pub server_queued_requests: i64,
    #[serde(rename = "server_queue_utilization")]
    pub server_queue_utilization: f64,
    #[serde(rename = "server_threads_utilization")]
    pub server_threads_utilization: f64,
    #[serde(rename = "server_avg_queue_time_ms")]
    pub server_avg_queue_time_ms: f64,
    #[serde(rename = "server_max_queue_time_ms")]
    pub server_max_queue_time_ms: f64,

    #[serde(rename = "min_response_time")]
    pub min_response_time: i64,
    #[serde(rename = "max_response_time")]
    pub max_response_time: i64,
    #[serde(rename = "avg_response_time")]
    pub avg_response_time: i64,
    #[serde(rename = "p50_response_time")]
    pub p50_response_time: i64,
    #[serde(rename = "p80_response_time")]
    pub p80_response_time: i64,
    #[serde(rename = "p95_response_time")]
    pub p95_response_time: i64,

    #[serde(rename = "min_request_latency")]
    pub min_request_latency: i64,
    #[serde(rename = "max_request_latency")]
    pub max_request_latency: i64,
    #[serde(rename = "min_response_latency")]
    pub min_response_latency: i64,
    #[serde(rename = "max_response_latency")]
    pub max_response_latency: i64,

    /// Snapshot wall-clock time in epoch milliseconds
    #[serde(rename = "timestamp")]
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(MetricsConfig::default())
    }

    #[test]
    fn counters_accumulate() {
        let m = metrics();
        for _ in 0..5 {
            m.inc_client_sent();
            m.inc_client_successes();
        }
        m.inc_client_blocked();

        let snap = m.snapshot();
        assert_eq!(snap.client_sent_requests, 5);
        assert_eq!(snap.client_success_responses, 5);
        assert_eq!(snap.client_retry_requests, 0);
        assert_eq!(snap.client_blocked_requests, 1);
    }

    #[test]
    fn active_clients_track_per_group() {
        let m = metrics();
        m.add_active_client("a");
        m.add_active_client("a");
        m.add_active_client("b");
        m.remove_active_client("a");

        let snap = m.snapshot();
        assert_eq!(snap.active_clients.get("a"), Some(&1));
        assert_eq!(snap.active_clients.get("b"), Some(&1));
    }

    #[test]
    fn window_prunes_stale_samples() {
        let m = metrics();
        m.record_response_time(Duration::from_millis(42));
        m.record_request_latency(Duration::from_millis(10));
        m.record_response_latency(Duration::from_millis(12));

        let fresh = m.snapshot();
        assert_eq!(fresh.max_response_time, 42);
        assert_eq!(fresh.max_request_latency, 10);

        std::thread::sleep(Duration::from_millis(1100));

        let stale = m.snapshot();
        assert_eq!(stale.min_response_time, 0);
        assert_eq!(stale.max_response_time, 0);
        assert_eq!(stale.avg_response_time, 0);
        assert_eq!(stale.p95_response_time, 0);
        assert_eq!(stale.max_request_latency, 0);
        assert_eq!(stale.max_response_latency, 0);
    }

    #[test]
    fn percentiles_are_ordered() {
        let m = metrics();
        for ms in 1..=100u64 {
            m.record_response_time(Duration::from_millis(ms));
        }

        let snap = m.snapshot();
        assert!(snap.min_response_time <= snap.p50_response_time);
        assert!(snap.p50_response_time <= snap.p80_response_time);
        assert!(snap.p80_response_time <= snap.p95_response_time);
        assert!(snap.p95_response_time <= snap.max_response_time);
        assert_eq!(snap.min_response_time, 1);
        assert_eq!(snap.max_response_time, 100);
    }

    #[test]
    fn percentile_index_floors_and_clamps() {
        let m = metrics();
        m.record_response_time(Duration::from_millis(10));
        m.record_response_time(Duration::from_millis(20));

        // n=2: p50 index = floor(2*0.5) = 1, p95 index = floor(2*0.95) = 1
        let snap = m.snapshot();
        assert_eq!(snap.p50_response_time, 20);
        assert_eq!(snap.p95_response_time, 20);
    }

    #[test]
    fn snapshot_serializes_to_flat_map() {
        let m = metrics();
        m.inc_client_sent();
        let value = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(value["client_sent_req"], 1);
        assert!(value["timestamp"].as_i64().unwrap() > 0);
        assert!(value["active_clients"].is_object());
    }
}
