use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A configured notification channel.
#[derive(Debug, Clone, Serialize)]
pub struct AlertNotification {
    pub id: i64,
    pub uid: String,
    pub org_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub notifier_type: String,
    pub is_default: bool,
    pub send_reminder: bool,
    #[serde(with = "duration_secs")]
    pub frequency: Duration,
    pub disable_resolve_message: bool,
    pub settings: serde_json::Value,
}

impl AlertNotification {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn setting_bool(&self, key: &str, default: bool) -> bool {
        match self.settings.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStateType {
    Unknown,
    Pending,
    Completed,
}

impl NotificationStateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStateType::Unknown => "unknown",
            NotificationStateType::Pending => "pending",
            NotificationStateType::Completed => "completed",
        }
    }
}

impl fmt::Display for NotificationStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStateType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(NotificationStateType::Unknown),
            "pending" => Ok(NotificationStateType::Pending),
            "completed" => Ok(NotificationStateType::Completed),
            other => anyhow::bail!("unknown notification state: {other}"),
        }
    }
}

/// Per (org, alert, notifier) delivery record used to de-duplicate
/// notifications between instances evaluating the same rule.
#[derive(Debug, Clone, Serialize)]
pub struct AlertNotificationState {
    pub id: i64,
    pub org_id: i64,
    pub alert_id: i64,
    pub notifier_id: i64,
    pub state: NotificationStateType,
    pub version: i64,
    /// Unix seconds of the last transition; 0 when never sent.
    pub updated_at: i64,
    pub alert_rule_state_updated_version: i64,
}

#[derive(Debug, Clone)]
pub struct SetNotificationPendingCommand {
    pub id: i64,
    pub version: i64,
    pub alert_rule_state_updated_version: i64,
}

/// Request body shared by create, update and test.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRequest {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default = "crate::models::alert::default_org_id")]
    pub org_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub notifier_type: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub send_reminder: bool,
    /// Reminder interval, e.g. `"15m"`.
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub disable_resolve_message: bool,
    #[serde(default = "empty_settings")]
    pub settings: serde_json::Value,
}

fn empty_settings() -> serde_json::Value {
    serde_json::json!({})
}

impl NotificationRequest {
    /// Resolve into an unsaved notification. Reminders require a frequency.
    pub fn into_notification(self, id: i64) -> anyhow::Result<AlertNotification> {
        let frequency = match self.frequency.as_deref().map(str::trim) {
            Some(f) if !f.is_empty() => humantime::parse_duration(f)
                .map_err(|e| anyhow::anyhow!("invalid frequency {f:?}: {e}"))?,
            _ if self.send_reminder => anyhow::bail!("notification frequency not specified"),
            _ => Duration::ZERO,
        };
        let uid = self
            .uid
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..9].to_string());
        Ok(AlertNotification {
            id,
            uid,
            org_id: self.org_id,
            name: self.name,
            notifier_type: self.notifier_type,
            is_default: self.is_default,
            send_reminder: self.send_reminder,
            frequency,
            disable_resolve_message: self.disable_resolve_message,
            settings: self.settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(send_reminder: bool, frequency: Option<&str>) -> NotificationRequest {
        NotificationRequest {
            uid: None,
            org_id: 1,
            name: "ops".into(),
            notifier_type: "email".into(),
            is_default: false,
            send_reminder,
            frequency: frequency.map(String::from),
            disable_resolve_message: false,
            settings: serde_json::json!({"addresses": "ops@example.com"}),
        }
    }

    #[test]
    fn test_reminder_requires_frequency() {
        assert!(request(true, None).into_notification(0).is_err());
        let n = request(true, Some("15m")).into_notification(0).unwrap();
        assert_eq!(n.frequency, Duration::from_secs(900));
        assert_eq!(n.uid.len(), 9);
    }

    #[test]
    fn test_invalid_frequency() {
        assert!(request(false, Some("soon")).into_notification(0).is_err());
    }

    #[test]
    fn test_setting_bool_accepts_strings() {
        let mut n = request(false, None).into_notification(0).unwrap();
        n.settings = serde_json::json!({"uploadImage": "false", "singleEmail": true});
        assert!(!n.setting_bool("uploadImage", true));
        assert!(n.setting_bool("singleEmail", false));
        assert!(n.setting_bool("missing", true));
    }
}
