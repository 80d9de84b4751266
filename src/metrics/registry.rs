use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for store round-trips (seconds).
const STORE_OP_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
];

/// Histogram bucket boundaries for coordinator sleeps (seconds).
const SLEEP_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 600.0, 3600.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup before any
    /// `counter!` / `gauge!` / `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "limiter_store_op_duration_seconds".to_string(),
                ),
                STORE_OP_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "limiter_sleep_duration_seconds".to_string(),
                ),
                SLEEP_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // acquire path
        describe_counter!(
            "limiter_acquire_total",
            Unit::Count,
            "Terminal acquire outcomes by status"
        );
        describe_histogram!(
            "limiter_sleep_duration_seconds",
            Unit::Seconds,
            "Coordinator sleeps between admission retries"
        );

        // storage
        describe_histogram!(
            "limiter_store_op_duration_seconds",
            Unit::Seconds,
            "Timestamp-store operation duration"
        );
        describe_counter!(
            "limiter_store_errors_total",
            Unit::Count,
            "Timestamp-store operations that failed"
        );
        describe_gauge!(
            "limiter_series_keys",
            Unit::Count,
            "Series currently tracked by the store"
        );

        // manager
        describe_counter!(
            "limiter_rollback_failures_total",
            Unit::Count,
            "Rollback removals that failed after a partial admit"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
