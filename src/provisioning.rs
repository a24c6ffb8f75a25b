//! File-based provisioning of alert notifications.
//!
//! Every `*.yaml` / `*.yml` file in the configured directory may list
//! `notifiers` to create or update and `delete_notifiers` to remove:
//!
//! ```yaml
//! notifiers:
//!   - name: ops-webhook
//!     type: webhook
//!     uid: ops-hook
//!     org_id: 1
//!     is_default: true
//!     settings:
//!       url: http://hooks.internal/alerts
//! delete_notifiers:
//!   - name: old-email
//!     uid: old-email
//! ```

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::alerting::registry::NotifierRegistry;
use crate::config_db::ConfigDb;
use crate::models::notification::{AlertNotification, NotificationRequest};

#[derive(Debug, Default, Deserialize)]
pub struct NotificationsFile {
    #[serde(default)]
    pub notifiers: Vec<NotifierFromConfig>,
    #[serde(default)]
    pub delete_notifiers: Vec<DeleteNotifierConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierFromConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub notifier_type: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub org_id: i64,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub send_reminder: bool,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub disable_resolve_message: bool,
    #[serde(default = "empty_settings")]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteNotifierConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub org_id: i64,
    #[serde(default)]
    pub org_name: String,
}

fn empty_settings() -> serde_json::Value {
    serde_json::json!({})
}

impl NotifierFromConfig {
    fn to_notification(&self) -> anyhow::Result<AlertNotification> {
        NotificationRequest {
            uid: Some(self.uid.clone()),
            org_id: self.org_id,
            name: self.name.clone(),
            notifier_type: self.notifier_type.clone(),
            is_default: self.is_default,
            send_reminder: self.send_reminder,
            frequency: self.frequency.clone(),
            disable_resolve_message: self.disable_resolve_message,
            settings: self.settings.clone(),
        }
        .into_notification(0)
    }
}

/// Read every notifier file in `dir`. A missing directory yields nothing.
pub fn read_notifier_files(dir: &Path) -> anyhow::Result<Vec<NotificationsFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %dir.display(), "notifier provisioning directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: NotificationsFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        tracing::debug!(
            path = %path.display(),
            notifiers = file.notifiers.len(),
            deletes = file.delete_notifiers.len(),
            "read notifier provisioning file"
        );
        files.push(file);
    }
    Ok(files)
}

/// Normalize org ids and check every entry. All problems are reported in one error.
pub fn validate(files: &mut [NotificationsFile], registry: &NotifierRegistry) -> anyhow::Result<()> {
    let mut errors = Vec::new();

    for file in files.iter_mut() {
        for (i, n) in file.notifiers.iter_mut().enumerate() {
            if n.org_id < 1 {
                n.org_id = 1;
            }
            if !n.org_name.is_empty() {
                tracing::warn!(notifier = %n.name, org_name = %n.org_name, "org_name is not supported, using org_id {}", n.org_id);
            }
            if n.name.is_empty() {
                errors.push(format!("notifiers[{i}]: notifier name is required"));
            }
            if n.uid.is_empty() {
                errors.push(format!("notifiers[{i}]: notifier uid is required"));
            }
            if n.name.is_empty() || n.uid.is_empty() {
                continue;
            }

            match n.to_notification() {
                Ok(model) => {
                    if let Err(e) = registry.init_notifier(&model) {
                        errors.push(format!("notifier {}: {e}", n.name));
                    }
                }
                Err(e) => errors.push(format!("notifier {}: {e}", n.name)),
            }
        }

        for (i, d) in file.delete_notifiers.iter_mut().enumerate() {
            if d.org_id < 1 {
                d.org_id = 1;
            }
            if d.name.is_empty() && d.uid.is_empty() {
                errors.push(format!("delete_notifiers[{i}]: name or uid is required"));
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("invalid notifier provisioning: {}", errors.join("; "));
    }
    Ok(())
}

/// Deletes run before upserts across all files.
pub fn apply(db: &ConfigDb, files: &[NotificationsFile]) -> anyhow::Result<()> {
    for d in files.iter().flat_map(|f| &f.delete_notifiers) {
        let deleted = if !d.uid.is_empty() {
            db.delete_notification_by_uid(d.org_id, &d.uid)?
        } else {
            match db
                .list_notifications(d.org_id)?
                .into_iter()
                .find(|n| n.name == d.name)
            {
                Some(n) => db.delete_notification(n.id)?,
                None => false,
            }
        };
        if deleted {
            tracing::info!(name = %d.name, uid = %d.uid, "deleted provisioned notifier");
        }
    }

    for n in files.iter().flat_map(|f| &f.notifiers) {
        let model = n.to_notification()?;
        let id = db
            .upsert_notification_by_uid(&model)
            .with_context(|| format!("saving notifier {}", n.name))?;
        tracing::info!(id, name = %n.name, uid = %n.uid, "provisioned notifier");
    }
    Ok(())
}

pub fn provision_notifiers(
    dir: &Path,
    db: &ConfigDb,
    registry: &NotifierRegistry,
) -> anyhow::Result<()> {
    let mut files = read_notifier_files(dir)?;
    validate(&mut files, registry)?;
    apply(db, &files)
}
