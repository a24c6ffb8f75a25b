pub mod alerting;
pub mod config;
pub mod config_db;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod provisioning;
pub mod rendering;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use alerting::engine::AlertEngine;
use alerting::notification_service::NotificationService;
use config_db::ConfigDb;
use rendering::RenderingService;

#[derive(Clone)]
pub struct AppState {
    pub config_db: Arc<ConfigDb>,
    pub notifications: Arc<NotificationService>,
    pub renderer: Arc<RenderingService>,
    pub engine: AlertEngine,
    pub metrics_handle: Option<PrometheusHandle>,
}
