//! Gateway shared state.

use std::sync::Arc;
use std::time::Instant;

use voxloop_core::config::Config;
use voxloop_core::error::Result;
use voxloop_core::session::SessionId;
use voxloop_pipeline::PipelineController;

/// Shared state handed to every handler.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub pipeline: Arc<PipelineController>,
    /// Session served by the device-compatible routes.
    pub default_session: SessionId,
    pub started_at: Instant,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, pipeline: Arc<PipelineController>) -> Self {
        let default_session = SessionId::new(config.default_session());
        Self {
            config,
            pipeline,
            default_session,
            started_at: Instant::now(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Record the outcome of a pipeline operation.
pub(crate) fn observe<T>(operation: &'static str, start: Instant, result: &Result<T>) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_operation(
        operation,
        start.elapsed().as_secs_f64(),
        result.as_ref().err().map(|e| e.code()),
    );
    #[cfg(not(feature = "metrics"))]
    let _ = (operation, start, result);
}

/// Publish the live session count.
pub(crate) async fn track_sessions(state: &GatewayState) {
    #[cfg(feature = "metrics")]
    crate::metrics::set_active_sessions(state.pipeline.session_count().await);
    #[cfg(not(feature = "metrics"))]
    let _ = state;
}
