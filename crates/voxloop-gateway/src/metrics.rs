//! Prometheus metrics recording and endpoint.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Record one pipeline operation with its duration and outcome.
pub fn record_operation(operation: &str, duration_secs: f64, error: Option<&str>) {
    let labels = [("operation", operation.to_string())];
    metrics::counter!("pipeline_operations_total", &labels).increment(1);
    metrics::histogram!("pipeline_operation_duration_seconds", &labels).record(duration_secs);
    if let Some(code) = error {
        record_error(code);
    }
}

/// Record an error by its wire code.
pub fn record_error(code: &str) {
    let labels = [("code", code.to_string())];
    metrics::counter!("pipeline_errors_total", &labels).increment(1);
}

pub fn set_active_sessions(count: usize) {
    metrics::gauge!("sessions_active").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process, so this is the only test installing one.
        let handle = install_prometheus_recorder().unwrap();
        record_operation("transcribe", 0.25, Some("transcription_error"));
        set_active_sessions(3);
        let output = handle.render();
        assert!(output.contains("pipeline_operations_total"));
        assert!(output.contains("sessions_active"));
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_operation("dialogue", 0.1, None);
        record_error("session_busy");
    }
}
