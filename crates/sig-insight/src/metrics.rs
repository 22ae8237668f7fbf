/// Hook the insight manager reports through; kept as a trait so this crate
/// never depends on `sig-metrics` directly. `apps/sig-server` wires the
/// `prometheus::Registry`-backed implementation in.
pub trait InsightMetricsSink: Send + Sync {
    fn record_queue_size(&self, size: usize);
    fn record_wait_seconds(&self, seconds: f64);
    fn record_job_duration_seconds(&self, seconds: f64);
    fn record_failure(&self, reason: &'static str);
}

/// Used in tests and anywhere metrics wiring is genuinely optional.
pub struct NoopMetricsSink;

impl InsightMetricsSink for NoopMetricsSink {
    fn record_queue_size(&self, _size: usize) {}
    fn record_wait_seconds(&self, _seconds: f64) {}
    fn record_job_duration_seconds(&self, _seconds: f64) {}
    fn record_failure(&self, _reason: &'static str) {}
}
