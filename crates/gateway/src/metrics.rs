use std::sync::Arc;
use std::time::Instant;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

// Log-scale ladder used when the configuration supplies no bucket hints.
const DEFAULT_BUCKETS: [f64; 16] = [
    0.001, 0.002, 0.003, 0.005, 0.010, 0.018, 0.030, 0.055, 0.100, 0.180, 0.300, 0.550, 1.0, 1.8,
    3.0, 5.0,
];

const LABELS: [&str; 3] = ["method", "path", "scope"];

/// Request metrics: an error counter and a latency histogram, both keyed
/// by `{method, path, scope}` and namespaced by the service name.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    error_count: IntCounterVec,
    request_latency: HistogramVec,
}

impl Metrics {
    pub fn new(service: &str, buckets: Vec<f64>) -> Metrics {
        let namespace = service.replace('-', "_");
        let buckets = if buckets.is_empty() {
            DEFAULT_BUCKETS.to_vec()
        } else {
            buckets
        };

        let registry = Registry::new();

        let error_count = IntCounterVec::new(
            Opts::new("error_count", "Error count per service/scope.").namespace(namespace.clone()),
            &LABELS,
        )
        .expect("create error_count");

        let request_latency = HistogramVec::new(
            HistogramOpts::new("request_latency", "Total duration of request in seconds.")
                .namespace(namespace)
                .buckets(buckets),
            &LABELS,
        )
        .expect("create request_latency");

        let _ = registry.register(Box::new(error_count.clone()));
        let _ = registry.register(Box::new(request_latency.clone()));

        Metrics {
            inner: Arc::new(Inner {
                registry,
                error_count,
                request_latency,
            }),
        }
    }

    /// Record latency since `begin` and bump the error counter when the
    /// scoped operation failed.
    pub fn score(&self, method: &str, path: &str, scope: &str, begin: Instant, failed: bool) {
        let labels = [method, path, scope];
        if failed {
            self.inner.error_count.with_label_values(&labels).inc();
        }
        self.inner
            .request_latency
            .with_label_values(&labels)
            .observe(begin.elapsed().as_secs_f64());
    }

    pub fn render(&self) -> Result<(Vec<u8>, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}

/// Resolve the configured bucket hints into a concrete ladder: an explicit
/// list wins, then a linear `start/width/count` sequence, then the default.
pub fn bucket_ladder(buckets: &[f64], start: f64, width: f64, count: usize) -> Vec<f64> {
    if !buckets.is_empty() {
        return buckets.to_vec();
    }
    if count > 0 && width > 0.0 {
        return (0..count).map(|i| start + width * i as f64).collect();
    }
    Vec::new()
}
