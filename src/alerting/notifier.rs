use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use crate::alerting::eval_context::EvalContext;
use crate::models::alert::AlertState;
use crate::models::notification::{
    AlertNotification, AlertNotificationState, NotificationStateType,
};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request to {url} failed: {source}")]
    Webhook {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("webhook {url} responded with status {status}")]
    WebhookStatus { url: String, status: u16 },
    #[error("invalid http method: {0}")]
    InvalidMethod(String),
    #[error("SMTP is not configured")]
    SmtpNotConfigured,
    #[error("failed to build email: {0}")]
    Email(String),
    #[error("failed to send email: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("failed to render email template: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A channel-specific delivery mechanism.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn base(&self) -> &NotifierBase;

    /// Per-type suppression policy. Defaults to the shared base policy.
    fn should_notify(&self, ctx: &EvalContext, state: &AlertNotificationState) -> bool {
        self.base().should_notify(ctx, state)
    }

    /// Render the payload and deliver it. Must not mutate the context.
    async fn notify(&self, ctx: &EvalContext) -> Result<(), NotifyError>;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn notifier_type(&self) -> &str {
        &self.base().notifier_type
    }

    fn notifier_id(&self) -> i64 {
        self.base().id
    }

    fn is_default(&self) -> bool {
        self.base().is_default
    }

    fn needs_image(&self) -> bool {
        self.base().upload_image
    }
}

impl std::fmt::Debug for dyn Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("name", &self.name())
            .field("type", &self.notifier_type())
            .field("id", &self.notifier_id())
            .finish()
    }
}

/// Settings common to every notifier.
#[derive(Debug, Clone)]
pub struct NotifierBase {
    pub id: i64,
    pub uid: String,
    pub name: String,
    pub notifier_type: String,
    pub is_default: bool,
    pub upload_image: bool,
    pub send_reminder: bool,
    pub disable_resolve_message: bool,
    pub frequency: Duration,
}

impl NotifierBase {
    pub fn new(model: &AlertNotification) -> Self {
        Self {
            id: model.id,
            uid: model.uid.clone(),
            name: model.name.clone(),
            notifier_type: model.notifier_type.clone(),
            is_default: model.is_default,
            upload_image: model.setting_bool("uploadImage", true),
            send_reminder: model.send_reminder,
            disable_resolve_message: model.disable_resolve_message,
            frequency: model.frequency,
        }
    }

    pub fn should_notify(&self, ctx: &EvalContext, state: &AlertNotificationState) -> bool {
        let prev = ctx.prev_alert_state;
        let new = ctx.current_state();
        let now = Utc::now().timestamp();

        if prev == new {
            if !self.send_reminder {
                return false;
            }
            let next_reminder = state.updated_at + self.frequency.as_secs() as i64;
            if state.updated_at != 0 && next_reminder > now {
                return false;
            }
            if new.is_ok_or_pending() {
                return false;
            }
        }

        // Becoming ok or pending out of no data is not news.
        if prev == AlertState::NoData && new.is_ok_or_pending() {
            return false;
        }
        if prev == AlertState::Pending && new == AlertState::Ok {
            return false;
        }
        if prev == AlertState::Ok && new == AlertState::Pending {
            return false;
        }

        // Another sender claimed this notification within the last minute.
        if state.state == NotificationStateType::Pending && state.updated_at + 60 > now {
            return false;
        }

        if new == AlertState::Ok && self.disable_resolve_message {
            return false;
        }

        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerting::eval_context::tests::transition;

    pub(crate) fn notification(notifier_type: &str, settings: serde_json::Value) -> AlertNotification {
        AlertNotification {
            id: 11,
            uid: "ops".into(),
            org_id: 1,
            name: "ops channel".into(),
            notifier_type: notifier_type.into(),
            is_default: false,
            send_reminder: false,
            frequency: Duration::ZERO,
            disable_resolve_message: false,
            settings,
        }
    }

    pub(crate) fn fresh_state() -> AlertNotificationState {
        AlertNotificationState {
            id: 1,
            org_id: 1,
            alert_id: 7,
            notifier_id: 11,
            state: NotificationStateType::Unknown,
            version: 0,
            updated_at: 0,
            alert_rule_state_updated_version: 0,
        }
    }

    fn base() -> NotifierBase {
        NotifierBase::new(&notification("webhook", serde_json::json!({})))
    }

    #[test]
    fn test_notifies_on_state_change() {
        let b = base();
        let s = fresh_state();
        assert!(b.should_notify(&transition(AlertState::Ok, AlertState::Alerting), &s));
        assert!(b.should_notify(&transition(AlertState::Alerting, AlertState::Ok), &s));
        assert!(b.should_notify(&transition(AlertState::Ok, AlertState::NoData), &s));
        assert!(b.should_notify(&transition(AlertState::Pending, AlertState::Alerting), &s));
    }

    #[test]
    fn test_suppressed_transitions() {
        let b = base();
        let s = fresh_state();
        assert!(!b.should_notify(&transition(AlertState::Alerting, AlertState::Alerting), &s));
        assert!(!b.should_notify(&transition(AlertState::Pending, AlertState::Ok), &s));
        assert!(!b.should_notify(&transition(AlertState::Ok, AlertState::Pending), &s));
        assert!(!b.should_notify(&transition(AlertState::NoData, AlertState::Ok), &s));
        assert!(!b.should_notify(&transition(AlertState::NoData, AlertState::Pending), &s));
    }

    #[test]
    fn test_reminders_respect_frequency() {
        let mut b = base();
        b.send_reminder = true;
        b.frequency = Duration::from_secs(600);
        let ctx = transition(AlertState::Alerting, AlertState::Alerting);

        let mut s = fresh_state();
        s.state = NotificationStateType::Completed;
        assert!(b.should_notify(&ctx, &s), "never sent before");

        s.updated_at = Utc::now().timestamp() - 60;
        assert!(!b.should_notify(&ctx, &s), "inside the reminder interval");

        s.updated_at = Utc::now().timestamp() - 601;
        assert!(b.should_notify(&ctx, &s));

        let ok = transition(AlertState::Ok, AlertState::Ok);
        assert!(!b.should_notify(&ok, &s), "no reminders for ok");
    }

    #[test]
    fn test_recent_pending_state_blocks() {
        let b = base();
        let ctx = transition(AlertState::Ok, AlertState::Alerting);
        let mut s = fresh_state();
        s.state = NotificationStateType::Pending;
        s.updated_at = Utc::now().timestamp() - 10;
        assert!(!b.should_notify(&ctx, &s));

        s.updated_at = Utc::now().timestamp() - 120;
        assert!(b.should_notify(&ctx, &s));
    }

    #[test]
    fn test_disable_resolve_message() {
        let mut b = base();
        b.disable_resolve_message = true;
        let s = fresh_state();
        assert!(!b.should_notify(&transition(AlertState::Alerting, AlertState::Ok), &s));
        assert!(b.should_notify(&transition(AlertState::Ok, AlertState::Alerting), &s));
    }

    #[test]
    fn test_upload_image_setting() {
        let b = NotifierBase::new(&notification("email", serde_json::json!({"uploadImage": false})));
        assert!(!b.upload_image);
        assert!(base().upload_image);
    }
}
