use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics collector for the application.
///
/// Tracks request outcomes, per-stage durations, and tagging volume.
/// Thread-safe and can be shared across the application.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Request metrics
    requests_total: AtomicUsize,
    requests_success: AtomicUsize,
    requests_failed: AtomicUsize,
    request_latency_ms: RwLock<Vec<u64>>,

    // Stage metrics
    detection_duration_ms: RwLock<Vec<u64>>,
    tagging_duration_ms: RwLock<Vec<u64>>,
    upscale_duration_ms: RwLock<Vec<u64>>,
    composite_duration_ms: RwLock<Vec<u64>>,

    // Tagging volume
    tags_generated_total: AtomicU64,
    subjects_composited_total: AtomicUsize,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    // Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                requests_success: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                request_latency_ms: RwLock::new(Vec::new()),
                detection_duration_ms: RwLock::new(Vec::new()),
                tagging_duration_ms: RwLock::new(Vec::new()),
                upscale_duration_ms: RwLock::new(Vec::new()),
                composite_duration_ms: RwLock::new(Vec::new()),
                tags_generated_total: AtomicU64::new(0),
                subjects_composited_total: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Request metrics
    pub fn record_request(&self, success: bool, duration: Duration) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.request_latency_ms.write().push(duration.as_millis() as u64);
    }

    // Stage metrics
    pub fn record_detection_duration(&self, duration: Duration) {
        self.inner.detection_duration_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_tagging_duration(&self, duration: Duration) {
        self.inner.tagging_duration_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_upscale_duration(&self, duration: Duration) {
        self.inner.upscale_duration_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_composite_duration(&self, duration: Duration) {
        self.inner.composite_duration_ms.write().push(duration.as_millis() as u64);
    }

    // Tagging volume
    pub fn record_tags_generated(&self, count: usize) {
        self.inner.tags_generated_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_subject_composited(&self) {
        self.inner.subjects_composited_total.fetch_add(1, Ordering::Relaxed);
    }

    // Endpoint metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner.endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let request_latency = self.inner.request_latency_ms.read();
        let request_latency_avg = avg(&request_latency);
        let request_latency_p50 = percentile(&request_latency, 0.5);
        let request_latency_p95 = percentile(&request_latency, 0.95);
        let request_latency_p99 = percentile(&request_latency, 0.99);
        drop(request_latency);

        let detection_durations = self.inner.detection_duration_ms.read();
        let detection_avg = avg(&detection_durations);
        drop(detection_durations);

        let tagging_durations = self.inner.tagging_duration_ms.read();
        let tagging_avg = avg(&tagging_durations);
        drop(tagging_durations);

        let upscale_durations = self.inner.upscale_duration_ms.read();
        let upscale_avg = avg(&upscale_durations);
        drop(upscale_durations);

        let composite_durations = self.inner.composite_duration_ms.read();
        let composite_avg = avg(&composite_durations);
        drop(composite_durations);

        let endpoint_requests = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_success: self.inner.requests_success.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            request_latency_avg_ms: request_latency_avg,
            request_latency_p50_ms: request_latency_p50,
            request_latency_p95_ms: request_latency_p95,
            request_latency_p99_ms: request_latency_p99,
            detection_avg_ms: detection_avg,
            tagging_avg_ms: tagging_avg,
            upscale_avg_ms: upscale_avg,
            composite_avg_ms: composite_avg,
            tags_generated_total: self.inner.tags_generated_total.load(Ordering::Relaxed),
            subjects_composited_total: self.inner.subjects_composited_total.load(Ordering::Relaxed),
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP requests_total Total number of processing requests
# TYPE requests_total counter
requests_total {{}} {}

# HELP requests_success Number of successful requests
# TYPE requests_success counter
requests_success {{}} {}

# HELP requests_failed Number of failed requests
# TYPE requests_failed counter
requests_failed {{}} {}

# HELP request_latency_avg_ms Average request latency in milliseconds
# TYPE request_latency_avg_ms gauge
request_latency_avg_ms {{}} {}

# HELP request_latency_p95_ms 95th percentile request latency in milliseconds
# TYPE request_latency_p95_ms gauge
request_latency_p95_ms {{}} {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms {{stage="detection"}} {}
stage_avg_duration_ms {{stage="tagging"}} {}
stage_avg_duration_ms {{stage="upscale"}} {}
stage_avg_duration_ms {{stage="composite"}} {}

# HELP tags_generated_total Total tags emitted across all requests
# TYPE tags_generated_total counter
tags_generated_total {{}} {}

# HELP subjects_composited_total Requests where a subject region was pasted
# TYPE subjects_composited_total counter
subjects_composited_total {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.requests_total,
            snapshot.requests_success,
            snapshot.requests_failed,
            snapshot.request_latency_avg_ms,
            snapshot.request_latency_p95_ms,
            snapshot.detection_avg_ms,
            snapshot.tagging_avg_ms,
            snapshot.upscale_avg_ms,
            snapshot.composite_avg_ms,
            snapshot.tags_generated_total,
            snapshot.subjects_composited_total,
            snapshot.uptime_seconds,
        );

        if !snapshot.endpoint_requests.is_empty() {
            out.push_str("\n# HELP endpoint_requests_total Requests per endpoint\n");
            out.push_str("# TYPE endpoint_requests_total counter\n");
            for (endpoint, count) in &snapshot.endpoint_requests {
                out.push_str(&format!(
                    "endpoint_requests_total {{endpoint=\"{}\"}} {}\n",
                    endpoint, count
                ));
            }
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_success: usize,
    pub requests_failed: usize,
    pub request_latency_avg_ms: u64,
    pub request_latency_p50_ms: u64,
    pub request_latency_p95_ms: u64,
    pub request_latency_p99_ms: u64,
    pub detection_avg_ms: u64,
    pub tagging_avg_ms: u64,
    pub upscale_avg_ms: u64,
    pub composite_avg_ms: u64,
    pub tags_generated_total: u64,
    pub subjects_composited_total: usize,
    // BTreeMap keeps the rendered order stable
    pub endpoint_requests: BTreeMap<String, usize>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_request(true, Duration::from_millis(100));
        metrics.record_request(false, Duration::from_millis(50));
        metrics.record_tags_generated(7);
        metrics.record_subject_composited();
        metrics.record_detection_duration(Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.request_latency_avg_ms, 75);
        assert_eq!(snapshot.tags_generated_total, 7);
        assert_eq!(snapshot.subjects_composited_total, 1);
        assert_eq!(snapshot.detection_avg_ms, 20);
    }

    #[test]
    fn test_endpoint_counters() {
        let metrics = Metrics::new();
        metrics.record_endpoint_request("/process");
        metrics.record_endpoint_request("/process");
        metrics.record_endpoint_request("/suggested-tags");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.endpoint_requests.get("/process"), Some(&2));
        assert_eq!(snapshot.endpoint_requests.get("/suggested-tags"), Some(&1));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_request(true, Duration::from_millis(100));
        metrics.record_endpoint_request("/process");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("requests_total {} 1"));
        assert!(prometheus.contains("stage_avg_duration_ms {stage=\"detection\"}"));
        assert!(prometheus.contains("endpoint_requests_total {endpoint=\"/process\"} 1"));
    }

    #[test]
    fn test_percentile_empty_and_single() {
        assert_eq!(percentile(&[], 0.95), 0);
        assert_eq!(percentile(&[42], 0.5), 42);
        assert_eq!(percentile(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 0.5), 5);
    }
}
