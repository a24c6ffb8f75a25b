//! Prometheus metrics for the alerting pipeline.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::AppState;

pub const ALERTING_RESULT_TOTAL: &str = "alerting_result_total";
pub const ALERTING_NOTIFICATION_SENT_TOTAL: &str = "alerting_notification_sent_total";
pub const ALERTING_NOTIFICATION_FAILED_TOTAL: &str = "alerting_notification_failed_total";
pub const ALERTING_RENDER_FAILED_TOTAL: &str = "alerting_render_failed_total";

/// Install the global recorder. Call once at startup.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        ALERTING_RESULT_TOTAL,
        "Alert evaluation results by final state"
    );
    describe_counter!(
        ALERTING_NOTIFICATION_SENT_TOTAL,
        "Notification deliveries attempted, by notifier type"
    );
    describe_counter!(
        ALERTING_NOTIFICATION_FAILED_TOTAL,
        "Notification deliveries that failed, by notifier type"
    );
    describe_counter!(
        ALERTING_RENDER_FAILED_TOTAL,
        "Panel image renders that failed"
    );

    Ok(handle)
}

/// GET /metrics
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics not initialized".to_string(),
        ),
    }
}
