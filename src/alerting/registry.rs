//! Notifier types keyed by their type tag.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::alerting::notifier::Notifier;
use crate::alerting::notifiers;
use crate::alerting::sender::{EmailSender, WebhookSender};
use crate::models::notification::AlertNotification;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported notification type: {0}")]
    UnsupportedType(String),
    #[error("could not find {setting} in {notifier} settings")]
    MissingSetting {
        notifier: &'static str,
        setting: &'static str,
    },
    #[error("invalid {setting} setting: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },
}

/// Transports handed to notifier factories.
#[derive(Clone)]
pub struct NotifierDeps {
    pub email: Arc<dyn EmailSender>,
    pub webhook: Arc<dyn WebhookSender>,
    pub app_url: String,
}

pub type NotifierFactory =
    fn(&AlertNotification, &NotifierDeps) -> Result<Box<dyn Notifier>, ValidationError>;

#[derive(Clone, Serialize)]
pub struct NotifierPlugin {
    #[serde(rename = "type")]
    pub notifier_type: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    pub factory: NotifierFactory,
}

pub struct NotifierRegistry {
    plugins: BTreeMap<&'static str, NotifierPlugin>,
    deps: NotifierDeps,
}

impl NotifierRegistry {
    pub fn new(deps: NotifierDeps) -> Self {
        Self {
            plugins: BTreeMap::new(),
            deps,
        }
    }

    /// Registry with every built-in notifier type.
    pub fn with_builtin(deps: NotifierDeps) -> Self {
        let mut registry = Self::new(deps);
        registry.register(notifiers::email::plugin());
        registry.register(notifiers::alertmanager::plugin());
        registry.register(notifiers::webhook::plugin());
        registry
    }

    pub fn register(&mut self, plugin: NotifierPlugin) {
        self.plugins.insert(plugin.notifier_type, plugin);
    }

    pub fn plugins(&self) -> Vec<NotifierPlugin> {
        self.plugins.values().cloned().collect()
    }

    pub fn init_notifier(
        &self,
        model: &AlertNotification,
    ) -> Result<Arc<dyn Notifier>, ValidationError> {
        let plugin = self
            .plugins
            .get(model.notifier_type.as_str())
            .ok_or_else(|| ValidationError::UnsupportedType(model.notifier_type.clone()))?;
        Ok(Arc::from((plugin.factory)(model, &self.deps)?))
    }

    pub fn deps(&self) -> &NotifierDeps {
        &self.deps
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerting::notifier::NotifyError;
    use crate::alerting::notifier::tests::notification;
    use crate::alerting::sender::{EmailMessage, WebhookRequest};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every outbound call; optionally fails them.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub webhooks: Mutex<Vec<WebhookRequest>>,
        pub emails: Mutex<Vec<EmailMessage>>,
        pub fail: bool,
    }

    #[async_trait]
    impl WebhookSender for RecordingSender {
        async fn send_webhook(&self, req: WebhookRequest) -> Result<(), NotifyError> {
            let url = req.url.clone();
            self.webhooks.lock().push(req);
            if self.fail {
                return Err(NotifyError::WebhookStatus { url, status: 500 });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send_email(&self, msg: EmailMessage) -> Result<(), NotifyError> {
            self.emails.lock().push(msg);
            if self.fail {
                return Err(NotifyError::SmtpNotConfigured);
            }
            Ok(())
        }
    }

    pub(crate) fn deps(sender: Arc<RecordingSender>) -> NotifierDeps {
        NotifierDeps {
            email: sender.clone(),
            webhook: sender,
            app_url: "http://localhost:3000/".into(),
        }
    }

    #[test]
    fn test_builtin_types() {
        let registry = NotifierRegistry::with_builtin(deps(Arc::default()));
        let types: Vec<_> = registry.plugins().iter().map(|p| p.notifier_type).collect();
        assert_eq!(types, vec!["email", "prometheus-alertmanager", "webhook"]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let registry = NotifierRegistry::with_builtin(deps(Arc::default()));
        let err = registry
            .init_notifier(&notification("pagerduty", serde_json::json!({})))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedType("pagerduty".into()));
    }

    #[test]
    fn test_missing_required_settings() {
        let registry = NotifierRegistry::with_builtin(deps(Arc::default()));
        for (kind, setting) in [
            ("email", "addresses"),
            ("prometheus-alertmanager", "url"),
            ("webhook", "url"),
        ] {
            let err = registry
                .init_notifier(&notification(kind, serde_json::json!({setting: ""})))
                .unwrap_err();
            assert!(
                matches!(err, ValidationError::MissingSetting { setting: s, .. } if s == setting),
                "{kind}: {err}"
            );
        }
    }

    #[test]
    fn test_init_notifier_keeps_identity() {
        let registry = NotifierRegistry::with_builtin(deps(Arc::default()));
        let n = registry
            .init_notifier(&notification(
                "webhook",
                serde_json::json!({"url": "http://hooks.local/alert"}),
            ))
            .unwrap();
        assert_eq!(n.notifier_type(), "webhook");
        assert_eq!(n.notifier_id(), 11);
        assert_eq!(n.name(), "ops channel");
    }
}
