//! Prometheus metrics for the consumer, publisher and job pipeline

use crate::ScreenshotStatus;
use metrics::{
    describe_counter, describe_histogram, histogram, increment_counter, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::info;

pub const RECONNECTS: &str = "snapshot_worker_consumer_reconnects_total";
pub const DELIVERIES: &str = "snapshot_worker_deliveries_total";
pub const PUBLISH_FAILURES: &str = "snapshot_worker_publish_failures_total";
pub const PUBLISH_RETRIES: &str = "snapshot_worker_publish_retries_total";
pub const JOBS: &str = "snapshot_worker_jobs_total";
pub const JOB_DURATION: &str = "snapshot_worker_job_duration_seconds";
pub const COMPOSITE_SIZE: &str = "snapshot_worker_composite_bytes";

pub fn describe_metrics() {
    describe_counter!(RECONNECTS, "Consumer sessions re-established after a loss");
    describe_counter!(DELIVERIES, "Deliveries by outcome (acked, rejected, dropped)");
    describe_counter!(PUBLISH_FAILURES, "Publish calls that failed or timed out");
    describe_counter!(PUBLISH_RETRIES, "Result publishes retried after a failure");
    describe_counter!(JOBS, "Finished jobs by terminal status");
    describe_histogram!(JOB_DURATION, Unit::Seconds, "Time from job receipt to result");
    describe_histogram!(COMPOSITE_SIZE, Unit::Bytes, "Encoded composite screenshot size");
}

pub fn record_reconnect() {
    increment_counter!(RECONNECTS);
}

pub fn record_delivery(outcome: &'static str) {
    increment_counter!(DELIVERIES, "outcome" => outcome);
}

pub fn record_publish_failure() {
    increment_counter!(PUBLISH_FAILURES);
}

pub fn record_publish_retry() {
    increment_counter!(PUBLISH_RETRIES);
}

pub fn record_job(status: ScreenshotStatus, duration: Duration) {
    increment_counter!(JOBS, "status" => status.as_str());
    histogram!(JOB_DURATION, duration.as_secs_f64());
}

pub fn record_composite_size(bytes: usize) {
    histogram!(COMPOSITE_SIZE, bytes as f64);
}

/// Serve `/metrics` on `0.0.0.0:{port}`. Must run inside a tokio runtime.
pub fn install_prometheus_exporter(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_reconnect();
        record_delivery("acked");
        record_publish_failure();
        record_publish_retry();
        record_job(ScreenshotStatus::Success, Duration::from_millis(250));
        record_composite_size(4096);
    }
}
