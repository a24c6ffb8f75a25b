//! Panel image rendering for notifications.
//!
//! Two transports: a remote HTTP renderer, or a renderer plugin process that
//! this service supervises. With neither configured every render fails with
//! [`RenderError::NoRenderer`].

pub mod http_mode;
pub mod plugin_mode;

use rand::Rng;
use rand::distr::Alphanumeric;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RenderingConfig;
use http_mode::HttpRenderer;
use plugin_mode::{PluginRenderer, PluginStatus};

#[derive(Debug, Clone)]
pub struct RenderOpts {
    pub width: u32,
    pub height: u32,
    pub timeout: Duration,
    /// Path of the page to render, relative to the callback url.
    pub path: String,
    pub encoding: String,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct RenderResult {
    pub file_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("rendering timed out")]
    Timeout,
    #[error("no renderer plugin found and no external render server configured")]
    NoRenderer,
    #[error("renderer plugin is unavailable: {0}")]
    Degraded(String),
    #[error("invalid renderer url: {0}")]
    InvalidUrl(String),
    #[error("failed to send request to remote rendering service: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote rendering request failed: {0}")]
    Status(u16),
    #[error("failed to save rendered image: {0}")]
    Io(#[from] std::io::Error),
}

enum RenderMode {
    Http(HttpRenderer),
    Plugin(PluginRenderer),
    Disabled,
}

pub struct RenderingService {
    mode: RenderMode,
    image_dir: PathBuf,
    callback_url: String,
    domain: String,
}

impl RenderingService {
    /// Pick the transport from config. A configured renderer url wins over a plugin.
    pub fn new(cfg: &RenderingConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let mode = if let Some(url) = cfg.renderer_url.as_deref().filter(|u| !u.is_empty()) {
            tracing::info!(renderer_url = %url, "using remote rendering service");
            RenderMode::Http(HttpRenderer::new(url)?)
        } else if let Some(path) = &cfg.plugin_path {
            tracing::info!(plugin = %path.display(), "starting renderer plugin");
            RenderMode::Plugin(plugin_mode::spawn(cfg.plugin_settings(), cancel))
        } else {
            tracing::info!("no renderer configured, notification images are disabled");
            RenderMode::Disabled
        };

        if !matches!(mode, RenderMode::Disabled) {
            std::fs::create_dir_all(&cfg.image_dir)?;
        }

        Ok(Self {
            mode,
            image_dir: cfg.image_dir.clone(),
            callback_url: cfg.callback_url.clone(),
            domain: cfg.domain.clone(),
        })
    }

    pub fn disabled() -> Self {
        Self {
            mode: RenderMode::Disabled,
            image_dir: PathBuf::new(),
            callback_url: String::new(),
            domain: String::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        match &self.mode {
            RenderMode::Http(_) => true,
            RenderMode::Plugin(p) => p.is_usable(),
            RenderMode::Disabled => false,
        }
    }

    /// Renderer mode and plugin status as reported by `/healthz`.
    pub fn health(&self) -> serde_json::Value {
        use serde_json::json;

        match &self.mode {
            RenderMode::Http(_) => json!({ "mode": "http", "available": true }),
            RenderMode::Plugin(p) => match p.status() {
                PluginStatus::Starting => {
                    json!({ "mode": "plugin", "available": true, "status": "starting" })
                }
                PluginStatus::Running { addr } => {
                    json!({ "mode": "plugin", "available": true, "status": "running", "addr": addr })
                }
                PluginStatus::Degraded { reason } => {
                    json!({ "mode": "plugin", "available": false, "status": "degraded", "reason": reason })
                }
                PluginStatus::Stopped => {
                    json!({ "mode": "plugin", "available": false, "status": "stopped" })
                }
            },
            RenderMode::Disabled => json!({ "mode": "disabled", "available": false }),
        }
    }

    pub async fn render(&self, opts: &RenderOpts) -> Result<RenderResult, RenderError> {
        let params = RenderParams {
            url: format!("{}{}&render=1", self.callback_url, opts.path),
            render_key: render_key(),
            width: opts.width,
            height: opts.height,
            domain: self.domain.clone(),
            timezone: iso_time_offset_to_posix_tz(&opts.timezone),
            encoding: opts.encoding.clone(),
            timeout_secs: opts.timeout.as_secs(),
        };
        let file_path = new_image_path(&self.image_dir);

        match &self.mode {
            RenderMode::Http(r) => r.render(&params, opts.timeout, &file_path).await?,
            RenderMode::Plugin(p) => p.render(&params, opts.timeout, &file_path).await?,
            RenderMode::Disabled => return Err(RenderError::NoRenderer),
        }
        Ok(RenderResult { file_path })
    }
}

/// Query parameters understood by the renderer.
#[derive(Debug, Clone)]
pub struct RenderParams {
    pub url: String,
    pub render_key: String,
    pub width: u32,
    pub height: u32,
    pub domain: String,
    pub timezone: String,
    pub encoding: String,
    pub timeout_secs: u64,
}

impl RenderParams {
    pub fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("url", self.url.clone()),
            ("renderKey", self.render_key.clone()),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
            ("domain", self.domain.clone()),
            ("timezone", self.timezone.clone()),
            ("encoding", self.encoding.clone()),
            ("timeout", self.timeout_secs.to_string()),
        ]
    }
}

fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn render_key() -> String {
    random_string(32)
}

fn new_image_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.png", random_string(20)))
}

/// Delete files in `dir` last modified more than `max_age` ago. A missing
/// directory counts as empty.
pub async fn remove_expired_images(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        if meta.modified().is_ok_and(|m| m < cutoff) {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), "failed to delete rendered image: {e}")
                }
            }
        }
    }
    Ok(removed)
}

/// Periodically prune old rendered images until `cancel` fires.
pub fn spawn_image_cleanup(
    dir: PathBuf,
    max_age: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match remove_expired_images(&dir, max_age).await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(removed = n, dir = %dir.display(), "removed expired rendered images"),
                        Err(e) => tracing::error!(dir = %dir.display(), "image cleanup failed: {e}"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

/// ISO offsets and POSIX TZ strings use opposite signs.
pub fn iso_time_offset_to_posix_tz(iso_offset: &str) -> String {
    if let Some(rest) = iso_offset.strip_prefix("UTC+") {
        return format!("UTC-{rest}");
    }
    if let Some(rest) = iso_offset.strip_prefix("UTC-") {
        return format!("UTC+{rest}");
    }
    iso_offset.to_string()
}
