//! Metrics and observability utilities
//!
//! Prometheus metrics for the webhook path, the registration engine and
//! backfill batches. Recording is a no-op until a recorder is installed.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all StoryForge metrics
pub const METRICS_PREFIX: &str = "storyforge";

/// Buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
];

/// Buckets for registration calls; chain confirmation dominates
pub const REGISTRATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        format!("{}_webhook_notifications_total", METRICS_PREFIX),
        Unit::Count,
        "Training notifications received, by status and reconcile outcome"
    );

    describe_counter!(
        format!("{}_registrations_total", METRICS_PREFIX),
        Unit::Count,
        "Derivative registration attempts by outcome"
    );

    describe_histogram!(
        format!("{}_registration_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Latency of external registration calls"
    );

    describe_counter!(
        format!("{}_parent_truncations_total", METRICS_PREFIX),
        Unit::Count,
        "Registrations whose parent set was cut to the ceiling"
    );

    describe_counter!(
        format!("{}_backfill_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Jobs processed by backfill batches, by outcome"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_notification(status: &str, outcome: &str) {
    counter!(
        format!("{}_webhook_notifications_total", METRICS_PREFIX),
        "status" => status.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one registration attempt. `duration_secs` is `None` when no
/// external call was made.
pub fn record_registration(outcome: &str, duration_secs: Option<f64>) {
    counter!(
        format!("{}_registrations_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    if let Some(duration) = duration_secs {
        histogram!(format!("{}_registration_duration_seconds", METRICS_PREFIX)).record(duration);
    }
}

pub fn record_parent_truncation() {
    counter!(format!("{}_parent_truncations_total", METRICS_PREFIX)).increment(1);
}

pub fn record_backfill_job(outcome: &str) {
    counter!(
        format!("{}_backfill_jobs_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [LATENCY_BUCKETS, REGISTRATION_BUCKETS] {
            assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_recording_without_recorder() {
        let metrics = RequestMetrics::start("POST", "/v1/webhooks/replicate");
        metrics.finish(200);
        record_notification("succeeded", "applied");
        record_registration("registered", Some(1.5));
        record_parent_truncation();
        record_backfill_job("failed");
    }
}
