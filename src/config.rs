use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rendering::plugin_mode::PluginSettings;

/// Top-level config loaded from `rush-alerting.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Public root url of the dashboard UI, used in notification links.
    #[serde(default = "default_app_url")]
    pub app_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            app_url: default_app_url(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_app_url() -> String {
    "http://localhost:3000/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "./rush_alerting.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    #[serde(default = "default_smtp_from")]
    pub from: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_smtp_port(),
            user: None,
            pass: None,
            from: default_smtp_from(),
        }
    }
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_from() -> String {
    "alerts@localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    /// Upper bound for handling one evaluation result, notifications included.
    #[serde(default = "default_30")]
    pub evaluation_timeout_secs: u64,
    /// Upper bound for a single notifier delivery.
    #[serde(default = "default_30")]
    pub notification_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            evaluation_timeout_secs: 30,
            notification_timeout_secs: 30,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl AlertingConfig {
    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }
}

fn default_30() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderingConfig {
    /// Remote renderer endpoint. Takes precedence over `plugin_path`.
    pub renderer_url: Option<String>,
    /// Root url the renderer uses to load panels.
    #[serde(default = "default_app_url")]
    pub callback_url: String,
    /// Renderer plugin executable, supervised by this service.
    pub plugin_path: Option<PathBuf>,
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Rendered images older than this are deleted.
    #[serde(default = "default_image_max_age_secs")]
    pub image_max_age_secs: u64,
    #[serde(default = "default_image_cleanup_interval_secs")]
    pub image_cleanup_interval_secs: u64,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            renderer_url: None,
            callback_url: default_app_url(),
            plugin_path: None,
            image_dir: default_image_dir(),
            domain: default_domain(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            startup_timeout_secs: default_startup_timeout_secs(),
            image_max_age_secs: default_image_max_age_secs(),
            image_cleanup_interval_secs: default_image_cleanup_interval_secs(),
        }
    }
}

impl RenderingConfig {
    pub fn plugin_settings(&self) -> PluginSettings {
        PluginSettings {
            path: self.plugin_path.clone().unwrap_or_default(),
            max_restarts: self.max_restarts,
            restart_backoff: Duration::from_millis(self.restart_backoff_ms),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            stable_after: Duration::from_secs(60),
        }
    }

    pub fn image_max_age(&self) -> Duration {
        Duration::from_secs(self.image_max_age_secs)
    }

    pub fn image_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.image_cleanup_interval_secs.max(1))
    }
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("./data/png")
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_backoff_ms() -> u64 {
    1000
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_image_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_image_cleanup_interval_secs() -> u64 {
    10 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Directory of notifier YAML files. Unset disables provisioning.
    #[serde(default = "default_notifiers_path")]
    pub notifiers_path: Option<PathBuf>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            notifiers_path: default_notifiers_path(),
        }
    }
}

fn default_notifiers_path() -> Option<PathBuf> {
    Some(PathBuf::from("./provisioning/notifiers"))
}

impl Config {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            Self::default()
        } else {
            let contents = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&contents)?;
            tracing::info!("loaded config from {}", path.display());
            config
        };
        config.normalize();
        Ok(config)
    }

    /// Environment variables override file settings.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("RUSH_ALERTING_DB") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("RUSH_ALERTING_LISTEN") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = std::env::var("RUSH_APP_URL") {
            self.server.app_url = v;
        }
        if let Ok(v) = std::env::var("RUSH_SMTP_HOST") {
            self.smtp.host = Some(v);
        }
        if let Some(port) = std::env::var("RUSH_SMTP_PORT").ok().and_then(|p| p.parse().ok()) {
            self.smtp.port = port;
        }
        if let Ok(v) = std::env::var("RUSH_SMTP_USER") {
            self.smtp.user = Some(v);
        }
        if let Ok(v) = std::env::var("RUSH_SMTP_PASS") {
            self.smtp.pass = Some(v);
        }
        if let Ok(v) = std::env::var("RUSH_SMTP_FROM") {
            self.smtp.from = v;
        }
        if let Ok(v) = std::env::var("RUSH_RENDERER_URL") {
            self.rendering.renderer_url = Some(v);
        }
        self.normalize();
    }

    /// Link building assumes root urls end in a slash.
    fn normalize(&mut self) {
        for url in [&mut self.server.app_url, &mut self.rendering.callback_url] {
            if !url.ends_with('/') {
                url.push('/');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let config = Config::load("/nonexistent/rush-alerting.toml").unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.alerting.evaluation_timeout(), Duration::from_secs(30));
        assert!(config.rendering.renderer_url.is_none());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rush-alerting.toml");
        std::fs::write(
            &path,
            r#"
[server]
app_url = "https://grafana.example.com"

[smtp]
host = "smtp.example.com"

[alerting]
notification_timeout_secs = 5

[rendering]
renderer_url = "http://renderer:8081/render"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.app_url, "https://grafana.example.com/");
        assert_eq!(config.smtp.host.as_deref(), Some("smtp.example.com"));
        assert_eq!(config.smtp.from, "alerts@localhost");
        assert_eq!(config.alerting.notification_timeout(), Duration::from_secs(5));
        assert_eq!(config.alerting.evaluation_timeout_secs, 30);
        assert_eq!(config.rendering.max_restarts, 5);
        assert_eq!(config.rendering.image_max_age(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.rendering.image_cleanup_interval(), Duration::from_secs(600));
    }
}
