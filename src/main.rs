use axum::{Router, routing::get, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use rush_alerting::AppState;
use rush_alerting::alerting::engine::{self, EngineSettings};
use rush_alerting::alerting::notification_service::NotificationService;
use rush_alerting::alerting::registry::{NotifierDeps, NotifierRegistry};
use rush_alerting::alerting::result_handler::ResultHandler;
use rush_alerting::alerting::sender::{HttpWebhookSender, SmtpMailer};
use rush_alerting::config::Config;
use rush_alerting::config_db::ConfigDb;
use rush_alerting::handlers;
use rush_alerting::metrics::{init_metrics, metrics_endpoint};
use rush_alerting::provisioning;
use rush_alerting::rendering::{self, RenderingService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("rush_alerting=debug,tower_http=debug")
        }))
        .init();

    let config_path = std::env::var("RUSH_ALERTING_CONFIG")
        .unwrap_or_else(|_| "rush-alerting.toml".to_string());
    let mut config = Config::load(&config_path)?;
    config.apply_env();

    let metrics_handle = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("metrics recorder not installed: {e}");
            None
        }
    };

    let config_db = Arc::new(ConfigDb::open(&config.database.path)?);
    tracing::info!("config db opened at {}", config.database.path);

    let cancel = CancellationToken::new();

    let mailer = SmtpMailer::new(&config.smtp)?;
    let deps = NotifierDeps {
        email: Arc::new(mailer),
        webhook: Arc::new(HttpWebhookSender::new(
            config.alerting.notification_timeout(),
        )?),
        app_url: config.server.app_url.clone(),
    };
    let registry = Arc::new(NotifierRegistry::with_builtin(deps));

    if let Some(dir) = &config.provisioning.notifiers_path {
        provisioning::provision_notifiers(dir, &config_db, &registry)?;
    }

    let renderer = Arc::new(RenderingService::new(&config.rendering, cancel.clone())?);
    rendering::spawn_image_cleanup(
        config.rendering.image_dir.clone(),
        config.rendering.image_max_age(),
        config.rendering.image_cleanup_interval(),
        cancel.clone(),
    );
    let notifications = Arc::new(NotificationService::new(
        config_db.clone(),
        registry,
        renderer.clone(),
        config.alerting.notification_timeout(),
    ));
    let handler = Arc::new(ResultHandler::new(
        config_db.clone(),
        config_db.clone(),
        notifications.clone(),
    ));

    let engine = engine::spawn_alert_engine(
        config_db.clone(),
        handler,
        EngineSettings {
            app_url: config.server.app_url.clone(),
            evaluation_timeout: config.alerting.evaluation_timeout(),
            queue_capacity: config.alerting.queue_capacity,
        },
        cancel.clone(),
    );

    let state = AppState {
        config_db,
        notifications,
        renderer,
        engine,
        metrics_handle,
    };

    let app = Router::new()
        // Notifier types
        .route(
            "/api/v1/alert-notifiers",
            get(handlers::notifications::list_notifiers),
        )
        // Notifications
        .route(
            "/api/v1/alert-notifications",
            get(handlers::notifications::list_notifications)
                .post(handlers::notifications::create_notification),
        )
        .route(
            "/api/v1/alert-notifications/test",
            post(handlers::notifications::test_notification),
        )
        .route(
            "/api/v1/alert-notifications/{id}",
            get(handlers::notifications::get_notification)
                .put(handlers::notifications::update_notification)
                .delete(handlers::notifications::delete_notification),
        )
        // Alert rules
        .route(
            "/api/v1/alerts",
            get(handlers::alerts::list_alerts).post(handlers::alerts::create_alert),
        )
        .route(
            "/api/v1/alerts/{id}",
            get(handlers::alerts::get_alert).delete(handlers::alerts::delete_alert),
        )
        .route("/api/v1/alerts/{id}/pause", post(handlers::alerts::pause_alert))
        .route(
            "/api/v1/alerts/{id}/results",
            post(handlers::alerts::submit_result),
        )
        // Annotations
        .route(
            "/api/v1/annotations",
            get(handlers::annotations::list_annotations),
        )
        // Health and metrics
        .route("/healthz", get(handlers::health::healthz))
        .route("/metrics", get(metrics_endpoint))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    tracing::info!("rush-alerting listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
