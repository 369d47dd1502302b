//! Prometheus metrics for the hycore daemon.
//!
//! Exposed at `GET /metrics` in Prometheus text format.
//!
//! - `hycore_lifecycle_operations_total` - lifecycle operations (labels: operation, result)
//! - `hycore_status_transitions_total` - status changes (labels: to)
//! - `hycore_log_subscribers` - live log subscribers across all worlds
//! - `hycore_http_requests_total` - HTTP requests (labels: method, status)

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder.
///
/// Installing twice is harmless: the second call returns the first handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    Ok(handle)
}

/// Gets the global Prometheus handle.
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

fn register_metrics() {
    describe_counter!(
        "hycore_lifecycle_operations_total",
        "Total world lifecycle operations by outcome"
    );
    describe_counter!(
        "hycore_status_transitions_total",
        "Total world status transitions by target status"
    );
    describe_gauge!(
        "hycore_log_subscribers",
        "Live log stream subscribers across all worlds"
    );
    describe_counter!("hycore_http_requests_total", "Total number of HTTP requests");
}

/// Records a finished lifecycle operation (`create`, `start`, `stop`, ...).
pub fn record_operation(operation: &'static str, success: bool) {
    counter!(
        "hycore_lifecycle_operations_total",
        "operation" => operation,
        "result" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// Records a status transition.
pub fn record_transition(to: &'static str) {
    counter!("hycore_status_transitions_total", "to" => to).increment(1);
}

pub fn subscriber_added() {
    gauge!("hycore_log_subscribers").increment(1.0);
}

pub fn subscriber_removed() {
    gauge!("hycore_log_subscribers").decrement(1.0);
}

/// Records an HTTP request.
pub fn record_http_request(method: &str, status: u16) {
    counter!(
        "hycore_http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
