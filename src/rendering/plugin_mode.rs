//! Supervised renderer plugin process.
//!
//! The plugin prints a handshake line `CORE|APP|NETWORK|ADDR|PROTOCOL` on
//! stdout once it is listening, e.g. `1|1|tcp|127.0.0.1:40123|http`. Renders
//! are then plain HTTP requests to `http://ADDR/render`.
//!
//! The supervisor waits on the child's exit instead of polling it, restarts
//! with exponential backoff, and gives up after `max_restarts` consecutive
//! short-lived runs, at which point the status becomes `Degraded`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::http_mode::fetch_to_file;
use super::{RenderError, RenderParams};

pub const CORE_PROTOCOL_VERSION: &str = "1";
pub const APP_PROTOCOL_VERSION: &str = "1";
pub const MAGIC_COOKIE_KEY: &str = "RUSH_PLUGIN_TYPE";
pub const MAGIC_COOKIE_VALUE: &str = "renderer";

#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub path: PathBuf,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub startup_timeout: Duration,
    /// A run at least this long resets the failure count.
    pub stable_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Starting,
    Running { addr: String },
    Degraded { reason: String },
    Stopped,
}

pub struct PluginRenderer {
    status: watch::Receiver<PluginStatus>,
    client: reqwest::Client,
}

pub fn spawn(settings: PluginSettings, cancel: CancellationToken) -> PluginRenderer {
    let (tx, rx) = watch::channel(PluginStatus::Starting);
    tokio::spawn(supervise(settings, tx, cancel));
    PluginRenderer {
        status: rx,
        client: reqwest::Client::new(),
    }
}

impl PluginRenderer {
    pub fn status(&self) -> PluginStatus {
        self.status.borrow().clone()
    }

    pub fn is_usable(&self) -> bool {
        matches!(
            *self.status.borrow(),
            PluginStatus::Starting | PluginStatus::Running { .. }
        )
    }

    pub async fn render(
        &self,
        params: &RenderParams,
        timeout: Duration,
        file_path: &Path,
    ) -> Result<(), RenderError> {
        let mut rx = self.status.clone();
        let status = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| !matches!(s, PluginStatus::Starting)),
        )
        .await
        .map_err(|_| RenderError::Timeout)?
        .map(|s| (*s).clone())
        .map_err(|_| RenderError::NoRenderer)?;

        match status {
            PluginStatus::Running { addr } => {
                let url = reqwest::Url::parse(&format!("http://{addr}/render"))
                    .map_err(|e| RenderError::InvalidUrl(e.to_string()))?;
                fetch_to_file(&self.client, url, params, timeout, file_path).await
            }
            PluginStatus::Degraded { reason } => Err(RenderError::Degraded(reason)),
            PluginStatus::Starting | PluginStatus::Stopped => Err(RenderError::NoRenderer),
        }
    }
}

/// Parse a handshake line into the plugin's listen address.
pub fn parse_handshake(line: &str) -> anyhow::Result<String> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() != 5 {
        anyhow::bail!("malformed plugin handshake: {line:?}");
    }
    if parts[0] != CORE_PROTOCOL_VERSION {
        anyhow::bail!("unsupported core protocol version {}", parts[0]);
    }
    if parts[1] != APP_PROTOCOL_VERSION {
        anyhow::bail!("unsupported app protocol version {}", parts[1]);
    }
    if parts[2] != "tcp" {
        anyhow::bail!("unsupported network {}", parts[2]);
    }
    if parts[4] != "http" {
        anyhow::bail!("unsupported protocol {}", parts[4]);
    }
    if parts[3].is_empty() {
        anyhow::bail!("plugin handshake has no address");
    }
    Ok(parts[3].to_string())
}

fn backoff(base: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(Duration::from_secs(60))
}

async fn start_plugin(settings: &PluginSettings) -> anyhow::Result<(Child, String)> {
    let mut child = Command::new(&settings.path)
        .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("plugin stdout not captured"))?;
    let mut lines = BufReader::new(stdout).lines();

    let line = match tokio::time::timeout(settings.startup_timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => anyhow::bail!("plugin exited before handshake"),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => anyhow::bail!("plugin handshake timed out"),
    };
    let addr = parse_handshake(&line)?;

    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "rush_alerting::renderer_plugin", "{line}");
        }
    });
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr));
    }

    Ok((child, addr))
}

async fn forward_output(stream: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "rush_alerting::renderer_plugin", "{line}");
    }
}

async fn supervise(
    settings: PluginSettings,
    tx: watch::Sender<PluginStatus>,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            tx.send_replace(PluginStatus::Stopped);
            return;
        }

        tx.send_replace(PluginStatus::Starting);
        let failure = match start_plugin(&settings).await {
            Ok((mut child, addr)) => {
                tracing::info!(addr = %addr, "renderer plugin started");
                tx.send_replace(PluginStatus::Running { addr });
                let started = Instant::now();

                tokio::select! {
                    exit = child.wait() => {
                        let uptime = started.elapsed();
                        tracing::warn!(?exit, ?uptime, "renderer plugin exited, restarting");
                        if uptime >= settings.stable_after {
                            failures = 0;
                        }
                        format!("plugin exited: {exit:?}")
                    }
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(error = %e, "failed to kill renderer plugin");
                        }
                        tx.send_replace(PluginStatus::Stopped);
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start renderer plugin");
                e.to_string()
            }
        };

        failures += 1;
        if failures > settings.max_restarts {
            tracing::error!(failures, reason = %failure, "renderer plugin keeps failing, giving up");
            tx.send_replace(PluginStatus::Degraded { reason: failure });
            return;
        }

        let delay = backoff(settings.restart_backoff, failures);
        tracing::debug!(?delay, failures, "restarting renderer plugin");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                tx.send_replace(PluginStatus::Stopped);
                return;
            }
        }
    }
}
