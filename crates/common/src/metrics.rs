//! Metrics collection for TensorServe
//!
//! Prometheus metrics for the serving path. Exporter wiring lives outside
//! the core; `MetricsRegistry::gather` renders the text exposition.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Metrics registry for TensorServe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub batching: BatchingMetrics,
    pub pool: PoolMetrics,
    enabled: Arc<AtomicBool>,
}

/// Data-plane metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of inference requests
    pub requests_total: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Responses served from the cache
    pub cache_hits: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,
}

/// Adaptive batching metrics
#[derive(Debug, Clone)]
pub struct BatchingMetrics {
    /// Batch size distribution
    pub batch_size: Histogram,

    /// Batches closed, labelled by what closed them ("size" / "timer" / "flush")
    pub batches_closed: IntCounterVec,

    /// Time a request spent waiting for its batch to close
    pub queue_time: Histogram,
}

/// Worker pool metrics
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Worker call duration
    pub worker_duration: Histogram,

    /// Time spent waiting for an idle worker
    pub worker_wait: Histogram,

    /// Workers replaced after a fault
    pub worker_replacements: IntCounter,

    /// Dispatches rejected because no worker became idle
    pub workers_unavailable: IntCounter,

    /// Non-stopped workers across all models
    pub live_workers: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new(
            "inference_requests_total",
            "Total number of inference requests",
        )
        .unwrap();

        let requests_failed = IntCounter::new(
            "inference_requests_failed_total",
            "Total number of failed inference requests",
        )
        .unwrap();

        let cache_hits = IntCounter::new(
            "inference_cache_hits_total",
            "Responses served from the response cache",
        )
        .unwrap();

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "inference_request_duration_seconds",
                "Inference request duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .unwrap();

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Batch size distribution")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        )
        .unwrap();

        let batches_closed = IntCounterVec::new(
            Opts::new("batches_closed_total", "Batches closed by trigger"),
            &["trigger"],
        )
        .unwrap();

        let queue_time = Histogram::with_opts(
            HistogramOpts::new(
                "batch_queue_time_seconds",
                "Time requests spend in an open batch",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5]),
        )
        .unwrap();

        let worker_duration = Histogram::with_opts(
            HistogramOpts::new(
                "worker_call_duration_seconds",
                "Execution worker call duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]),
        )
        .unwrap();

        let worker_wait = Histogram::with_opts(
            HistogramOpts::new(
                "worker_wait_seconds",
                "Time dispatches wait for an idle worker",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        let worker_replacements = IntCounter::new(
            "worker_replacements_total",
            "Workers replaced after an unrecoverable fault",
        )
        .unwrap();

        let workers_unavailable = IntCounter::new(
            "worker_unavailable_total",
            "Dispatches rejected because no worker became idle",
        )
        .unwrap();

        let live_workers = IntGauge::new("live_workers", "Current number of non-stopped workers").unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(cache_hits.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();

        registry.register(Box::new(batch_size.clone())).unwrap();
        registry.register(Box::new(batches_closed.clone())).unwrap();
        registry.register(Box::new(queue_time.clone())).unwrap();

        registry.register(Box::new(worker_duration.clone())).unwrap();
        registry.register(Box::new(worker_wait.clone())).unwrap();
        registry.register(Box::new(worker_replacements.clone())).unwrap();
        registry.register(Box::new(workers_unavailable.clone())).unwrap();
        registry.register(Box::new(live_workers.clone())).unwrap();

        MetricsRegistry {
            registry,
            inference: InferenceMetrics {
                requests_total,
                requests_failed,
                cache_hits,
                request_duration,
            },
            batching: BatchingMetrics {
                batch_size,
                batches_closed,
                queue_time,
            },
            pool: PoolMetrics {
                worker_duration,
                worker_wait,
                worker_replacements,
                workers_unavailable,
                live_workers,
            },
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Turn recording on or off; `record` becomes a no-op while off
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Run `update` against the metrics if recording is enabled
    pub fn record(&self, update: impl FnOnce(&Self)) {
        if self.is_enabled() {
            update(self);
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.inference.requests_total.inc();
        metrics.batching.batches_closed.with_label_values(&["size"]).inc();
        metrics.pool.live_workers.set(4);

        let output = metrics.gather();
        assert!(output.contains("inference_requests_total"));
        assert!(output.contains("batches_closed_total"));
        assert!(output.contains("live_workers 4"));
    }

    #[test]
    fn test_disabled_metrics_are_not_recorded() {
        let metrics = MetricsRegistry::new();
        metrics.record(|m| m.inference.requests_total.inc());

        metrics.set_enabled(false);
        assert!(!metrics.is_enabled());
        metrics.record(|m| m.inference.requests_total.inc());
        metrics.record(|m| m.pool.live_workers.inc());

        assert_eq!(metrics.inference.requests_total.get(), 1);
        assert_eq!(metrics.pool.live_workers.get(), 0);
    }
}
