// sabt-metrics: Metric families for the allocation and export pipeline
//
// There is no process-global registry. Every `ServiceMetrics` owns its own
// `prometheus::Registry` under a namespace, so two deployments (or two
// tests) can use the same family names without collision.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Result type for metrics construction
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Metrics errors
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

const REQUEST_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0];
const MIDDLEWARE_LATENCY_BUCKETS: &[f64] = &[0.001, 0.01, 0.05, 0.1];
const EXPORTER_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.2, 0.5];
const RETRY_BACKOFF_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Every metric family the service emits
///
/// Mirrors the request path (request/rate-limit/idempotency/auth), the
/// exporter and job runner, signed downloads, retries, and allocation.
pub struct ServiceMetrics {
    registry: Registry,

    pub request_total: IntCounterVec,
    pub request_latency_seconds: Histogram,

    pub rate_limit_decision_total: IntCounterVec,
    pub rate_limit_latency_seconds: Histogram,

    pub idempotency_hits_total: IntCounterVec,
    pub idempotency_replays_total: IntCounter,
    pub idempotency_latency_seconds: Histogram,

    pub auth_latency_seconds: Histogram,
    pub auth_ok_total: IntCounterVec,
    pub auth_fail_total: IntCounterVec,

    pub readiness_checks: IntCounterVec,

    pub exporter_duration_seconds: HistogramVec,
    pub exporter_bytes_total: IntCounterVec,
    pub export_jobs_total: IntCounterVec,
    pub export_rows_total: IntCounterVec,
    pub export_errors_total: IntCounterVec,

    pub download_signed_total: IntCounterVec,
    pub token_rotation_total: IntCounterVec,

    pub retry_attempts_total: IntCounterVec,
    pub retry_exhaustion_total: IntCounterVec,
    pub retry_backoff_seconds: HistogramVec,

    pub allocation_no_candidate_total: IntCounter,
}

fn counter_vec(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
    labels: &[&str],
) -> MetricsResult<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help).namespace(namespace.to_string()), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn counter(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
) -> MetricsResult<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(namespace.to_string()))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn histogram(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
    buckets: &[f64],
) -> MetricsResult<Histogram> {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(namespace.to_string())
            .buckets(buckets.to_vec()),
    )?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

fn histogram_vec(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
    buckets: &[f64],
    labels: &[&str],
) -> MetricsResult<HistogramVec> {
    let vec = HistogramVec::new(
        HistogramOpts::new(name, help)
            .namespace(namespace.to_string())
            .buckets(buckets.to_vec()),
        labels,
    )?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl ServiceMetrics {
    /// Build the full family set under `namespace`
    pub fn new(namespace: &str) -> MetricsResult<Self> {
        let registry = Registry::new();

        Ok(Self {
            request_total: counter_vec(
                &registry,
                namespace,
                "request_total",
                "Total processed requests",
                &["method", "path", "status"],
            )?,
            request_latency_seconds: histogram(
                &registry,
                namespace,
                "request_latency_seconds",
                "HTTP request latency seconds",
                REQUEST_LATENCY_BUCKETS,
            )?,
            rate_limit_decision_total: counter_vec(
                &registry,
                namespace,
                "rate_limit_decision_total",
                "Rate limit decisions",
                &["decision"],
            )?,
            rate_limit_latency_seconds: histogram(
                &registry,
                namespace,
                "rate_limit_latency_seconds",
                "Rate limit middleware latency",
                MIDDLEWARE_LATENCY_BUCKETS,
            )?,
            idempotency_hits_total: counter_vec(
                &registry,
                namespace,
                "idempotency_hits_total",
                "Idempotency hit/miss decisions",
                &["outcome"],
            )?,
            idempotency_replays_total: counter(
                &registry,
                namespace,
                "idempotency_replays_total",
                "Idempotent replay responses",
            )?,
            idempotency_latency_seconds: histogram(
                &registry,
                namespace,
                "idempotency_latency_seconds",
                "Idempotency middleware latency",
                MIDDLEWARE_LATENCY_BUCKETS,
            )?,
            auth_latency_seconds: histogram(
                &registry,
                namespace,
                "auth_latency_seconds",
                "Auth middleware latency",
                MIDDLEWARE_LATENCY_BUCKETS,
            )?,
            auth_ok_total: counter_vec(
                &registry,
                namespace,
                "auth_ok_total",
                "Authentication success count",
                &["role"],
            )?,
            auth_fail_total: counter_vec(
                &registry,
                namespace,
                "auth_fail_total",
                "Authentication failures",
                &["reason"],
            )?,
            readiness_checks: counter_vec(
                &registry,
                namespace,
                "readiness_checks",
                "Readiness check results",
                &["component", "status"],
            )?,
            exporter_duration_seconds: histogram_vec(
                &registry,
                namespace,
                "exporter_duration_seconds",
                "Export phase wallclock seconds",
                EXPORTER_DURATION_BUCKETS,
                &["phase"],
            )?,
            exporter_bytes_total: counter_vec(
                &registry,
                namespace,
                "exporter_bytes_total",
                "Total bytes written by the exporter",
                &["format"],
            )?,
            export_jobs_total: counter_vec(
                &registry,
                namespace,
                "export_jobs_total",
                "Export job terminal states",
                &["status"],
            )?,
            export_rows_total: counter_vec(
                &registry,
                namespace,
                "export_rows_total",
                "Rows written per output format",
                &["format"],
            )?,
            export_errors_total: counter_vec(
                &registry,
                namespace,
                "export_errors_total",
                "Export errors by classification",
                &["type"],
            )?,
            download_signed_total: counter_vec(
                &registry,
                namespace,
                "download_signed_total",
                "Signed download events",
                &["outcome"],
            )?,
            token_rotation_total: counter_vec(
                &registry,
                namespace,
                "token_rotation_total",
                "Signing key rotation actions",
                &["event"],
            )?,
            retry_attempts_total: counter_vec(
                &registry,
                namespace,
                "retry_attempts_total",
                "Retry attempts per operation and outcome",
                &["op", "outcome"],
            )?,
            retry_exhaustion_total: counter_vec(
                &registry,
                namespace,
                "retry_exhaustion_total",
                "Retries exhausted per operation",
                &["op"],
            )?,
            retry_backoff_seconds: histogram_vec(
                &registry,
                namespace,
                "retry_backoff_seconds",
                "Retry backoff durations in seconds",
                RETRY_BACKOFF_BUCKETS,
                &["op"],
            )?,
            allocation_no_candidate_total: counter(
                &registry,
                namespace,
                "allocation_no_candidate_total",
                "Students with no eligible mentor",
            )?,
            registry,
        })
    }

    /// Prometheus text exposition of this registry
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Zero the counter families between tests.
    ///
    /// Histogram observations cannot be reset in place; tests that assert on
    /// histograms build a fresh instance instead.
    pub fn reset(&self) {
        self.request_total.reset();
        self.rate_limit_decision_total.reset();
        self.idempotency_hits_total.reset();
        self.idempotency_replays_total.reset();
        self.auth_ok_total.reset();
        self.auth_fail_total.reset();
        self.readiness_checks.reset();
        self.exporter_bytes_total.reset();
        self.export_jobs_total.reset();
        self.export_rows_total.reset();
        self.export_errors_total.reset();
        self.download_signed_total.reset();
        self.token_rotation_total.reset();
        self.retry_attempts_total.reset();
        self.retry_exhaustion_total.reset();
        self.allocation_no_candidate_total.reset();
    }
}
