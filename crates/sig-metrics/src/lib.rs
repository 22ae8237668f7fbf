//! Process-wide Prometheus registry (spec.md §6, SPEC_FULL.md §4.8).
//!
//! One [`GatewayMetrics`] is created per process and shared by every
//! session actor, the insight manager, and the `/metrics` handler. All
//! series are registered up front so `encode` never has to guard against a
//! missing metric.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use sig_insight::InsightMetricsSink;

/// Batch outcome label for `stream_batches_total{status}`.
#[derive(Debug, Clone, Copy)]
pub enum BatchStatus {
    Success,
    WorkerTransient,
    WorkerUnavailable,
}

impl BatchStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::WorkerTransient => "worker_transient",
            BatchStatus::WorkerUnavailable => "worker_unavailable",
        }
    }
}

pub struct GatewayMetrics {
    registry: Registry,
    stream_sessions_active: IntGauge,
    stream_batches_total: IntCounterVec,
    stream_batch_duration_seconds: Histogram,
    insight_queue_size: IntGauge,
    insight_job_wait_seconds: Histogram,
    insight_job_duration_seconds: Histogram,
    insight_job_failures_total: IntCounterVec,
    worker_affinity_breaks_total: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let stream_sessions_active = IntGauge::new(
            "stream_sessions_active",
            "Number of live streaming ASR sessions.",
        )
        .unwrap();
        let stream_batches_total = IntCounterVec::new(
            Opts::new("stream_batches_total", "Audio batches flushed to a worker."),
            &["status"],
        )
        .unwrap();
        let stream_batch_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "stream_batch_duration_seconds",
            "Audio duration, in seconds, covered by each flushed batch.",
        ))
        .unwrap();
        let insight_queue_size =
            IntGauge::new("insight_queue_size", "Current depth of the insight job queue.").unwrap();
        let insight_job_wait_seconds = Histogram::with_opts(HistogramOpts::new(
            "insight_job_wait_seconds",
            "Time an insight job spent queued before a worker picked it up.",
        ))
        .unwrap();
        let insight_job_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "insight_job_duration_seconds",
            "Wall-clock time an insight worker spent running a job.",
        ))
        .unwrap();
        let insight_job_failures_total = IntCounterVec::new(
            Opts::new(
                "insight_job_failures_total",
                "Insight jobs that did not produce an event.",
            ),
            &["reason"],
        )
        .unwrap();
        let worker_affinity_breaks_total = IntCounter::new(
            "worker_affinity_breaks_total",
            "Transcription requests that had to fall back off the affinity-bound worker.",
        )
        .unwrap();

        registry
            .register(Box::new(stream_sessions_active.clone()))
            .unwrap();
        registry
            .register(Box::new(stream_batches_total.clone()))
            .unwrap();
        registry
            .register(Box::new(stream_batch_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(insight_queue_size.clone()))
            .unwrap();
        registry
            .register(Box::new(insight_job_wait_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(insight_job_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(insight_job_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(worker_affinity_breaks_total.clone()))
            .unwrap();

        Self {
            registry,
            stream_sessions_active,
            stream_batches_total,
            stream_batch_duration_seconds,
            insight_queue_size,
            insight_job_wait_seconds,
            insight_job_duration_seconds,
            insight_job_failures_total,
            worker_affinity_breaks_total,
        }
    }

    pub fn session_started(&self) {
        self.stream_sessions_active.inc();
    }

    pub fn session_ended(&self) {
        self.stream_sessions_active.dec();
    }

    pub fn record_batch(&self, status: BatchStatus, duration_seconds: f64) {
        self.stream_batches_total
            .with_label_values(&[status.as_str()])
            .inc();
        if matches!(status, BatchStatus::Success) {
            self.stream_batch_duration_seconds.observe(duration_seconds);
        }
    }

    pub fn record_affinity_break(&self) {
        self.worker_affinity_breaks_total.inc();
    }

    /// Prometheus text exposition for `GET /metrics`.
    pub fn encode(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .expect("prometheus text encoding is infallible for well-formed metrics");
        String::from_utf8(buffer).expect("prometheus text encoder emits valid utf-8")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InsightMetricsSink for GatewayMetrics {
    fn record_queue_size(&self, size: usize) {
        self.insight_queue_size.set(size as i64);
    }

    fn record_wait_seconds(&self, seconds: f64) {
        self.insight_job_wait_seconds.observe(seconds);
    }

    fn record_job_duration_seconds(&self, seconds: f64) {
        self.insight_job_duration_seconds.observe(seconds);
    }

    fn record_failure(&self, reason: &'static str) {
        self.insight_job_failures_total
            .with_label_values(&[reason])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_gauge_tracks_start_and_end() {
        let metrics = GatewayMetrics::new();
        metrics.session_started();
        metrics.session_started();
        metrics.session_ended();
        assert_eq!(metrics.stream_sessions_active.get(), 1);
    }

    #[test]
    fn encode_includes_every_declared_series() {
        let metrics = GatewayMetrics::new();
        metrics.session_started();
        metrics.record_batch(BatchStatus::Success, 5.0);
        metrics.record_failure("queue_full");
        metrics.record_affinity_break();

        let text = metrics.encode();
        assert!(text.contains("stream_sessions_active"));
        assert!(text.contains("stream_batches_total"));
        assert!(text.contains("stream_batch_duration_seconds"));
        assert!(text.contains("insight_queue_size"));
        assert!(text.contains("insight_job_wait_seconds"));
        assert!(text.contains("insight_job_duration_seconds"));
        assert!(text.contains("insight_job_failures_total"));
        assert!(text.contains("worker_affinity_breaks_total"));
    }

    #[test]
    fn failure_reasons_are_labeled_independently() {
        let metrics = GatewayMetrics::new();
        metrics.record_failure("queue_full");
        metrics.record_failure("queue_full");
        metrics.record_failure("tenant_cap");
        let text = metrics.encode();
        assert!(text.contains("reason=\"queue_full\""));
        assert!(text.contains("reason=\"tenant_cap\""));
    }
}
