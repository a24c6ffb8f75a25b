//! Decides which notifiers fire for an evaluation and delivers to them.
//!
//! Every delivery is bracketed by the notification state record: it is moved
//! to `pending` before sending and to `completed` afterwards. When several
//! instances evaluate the same rule only the one that wins the pending write
//! sends.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::alerting::eval_context::EvalContext;
use crate::alerting::notifier::{Notifier, NotifyError};
use crate::alerting::registry::{NotifierRegistry, ValidationError};
use crate::alerting::store::{NotificationStateError, NotificationStore};
use crate::metrics::{
    ALERTING_NOTIFICATION_FAILED_TOTAL, ALERTING_NOTIFICATION_SENT_TOTAL,
    ALERTING_RENDER_FAILED_TOTAL,
};
use crate::models::alert::{AlertRule, AlertState, EvalMatch, ExecutionErrorOption, NoDataOption};
use crate::models::notification::{
    AlertNotification, AlertNotificationState, SetNotificationPendingCommand,
};
use crate::rendering::{RenderError, RenderOpts, RenderingService};

const IMAGE_WIDTH: u32 = 1000;
const IMAGE_HEIGHT: u32 = 500;

/// Seam between the result handler and notification delivery.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Deliver to every notifier that should hear about this evaluation.
    /// Failures are logged and never returned.
    async fn send_if_needed(&self, ctx: &mut EvalContext);
}

#[derive(Debug, thiserror::Error)]
pub enum SendTestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("test notification timed out")]
    Timeout,
}

struct NotifierState {
    notifier: Arc<dyn Notifier>,
    state: AlertNotificationState,
}

pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    registry: Arc<NotifierRegistry>,
    renderer: Arc<RenderingService>,
    notification_timeout: Duration,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<NotifierRegistry>,
        renderer: Arc<RenderingService>,
        notification_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            renderer,
            notification_timeout,
        }
    }

    pub fn registry(&self) -> &NotifierRegistry {
        &self.registry
    }

    /// Send a synthetic alert through an unsaved notification config.
    /// Skips the suppression policy and state bookkeeping.
    pub async fn send_test(&self, model: &AlertNotification) -> Result<(), SendTestError> {
        let notifier = self.registry.init_notifier(model)?;
        let ctx = test_notification_context(&self.registry.deps().app_url);
        tracing::info!(
            notifier = notifier.name(),
            notifier_type = notifier.notifier_type(),
            "sending test notification"
        );
        tokio::time::timeout(self.notification_timeout, notifier.notify(&ctx))
            .await
            .map_err(|_| SendTestError::Timeout)??;
        Ok(())
    }

    fn notifiers_to_send(&self, ctx: &EvalContext) -> Vec<NotifierState> {
        let rule = &ctx.rule;
        let models = match self.store.notifications_to_send(rule.org_id, &rule.notifications) {
            Ok(models) => models,
            Err(e) => {
                tracing::error!(rule_id = rule.id, "failed to load alert notifications: {e}");
                return Vec::new();
            }
        };

        let mut result = Vec::with_capacity(models.len());
        for model in models {
            let notifier = match self.registry.init_notifier(&model) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(notification = %model.name, uid = %model.uid, "could not create notifier: {e}");
                    continue;
                }
            };

            let state = match self.store.get_or_create_notification_state(
                rule.org_id,
                rule.id,
                notifier.notifier_id(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(notifier = notifier.name(), "could not get notification state: {e}");
                    continue;
                }
            };

            if notifier.should_notify(ctx, &state) {
                result.push(NotifierState { notifier, state });
            }
        }
        result
    }

    async fn render_image(&self, ctx: &mut EvalContext) -> Result<(), RenderError> {
        let opts = RenderOpts {
            width: IMAGE_WIDTH,
            height: IMAGE_HEIGHT,
            timeout: self.notification_timeout / 2,
            path: ctx.panel_render_path(),
            encoding: String::new(),
            timezone: String::new(),
        };
        let result = self.renderer.render(&opts).await?;
        tracing::debug!(path = %result.file_path.display(), "rendered alert panel image");
        ctx.image_on_disk_path = Some(result.file_path);
        Ok(())
    }

    async fn send_notification(&self, ctx: &EvalContext, target: NotifierState) {
        let NotifierState { notifier, state } = target;
        let mut version = state.version;

        if !ctx.is_test_run {
            let cmd = SetNotificationPendingCommand {
                id: state.id,
                version: state.version,
                alert_rule_state_updated_version: ctx.rule.state_changes,
            };
            match self.store.set_notification_state_pending(&cmd) {
                Ok(v) => version = v,
                Err(NotificationStateError::VersionConflict) => {
                    tracing::debug!(
                        notifier = notifier.name(),
                        rule_id = ctx.rule.id,
                        "notification already claimed by another sender"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(notifier = notifier.name(), "failed to set notification state to pending: {e}");
                    return;
                }
            }
        }

        let notifier_type = notifier.notifier_type().to_string();
        metrics::counter!(ALERTING_NOTIFICATION_SENT_TOTAL, "type" => notifier_type.clone()).increment(1);
        tracing::debug!(
            notifier = notifier.name(),
            rule_id = ctx.rule.id,
            state = %ctx.current_state(),
            "sending notification"
        );

        let outcome = tokio::time::timeout(self.notification_timeout, notifier.notify(ctx)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("notification timed out".to_string()),
        };
        if let Some(reason) = failure {
            metrics::counter!(ALERTING_NOTIFICATION_FAILED_TOTAL, "type" => notifier_type).increment(1);
            tracing::error!(
                notifier = notifier.name(),
                rule_id = ctx.rule.id,
                "failed to send alert notification: {reason}"
            );
        }

        if ctx.is_test_run {
            return;
        }
        if let Err(e) = self.store.set_notification_state_complete(state.id, version) {
            tracing::error!(notifier = notifier.name(), "failed to set notification state to completed: {e}");
        }
    }
}

#[async_trait]
impl NotificationDispatcher for NotificationService {
    async fn send_if_needed(&self, ctx: &mut EvalContext) {
        let targets = self.notifiers_to_send(ctx);
        if targets.is_empty() {
            return;
        }

        let wants_image = targets.iter().any(|t| t.notifier.needs_image());
        if wants_image && self.renderer.is_available() && !ctx.rule.dashboard_uid.is_empty() {
            if let Err(e) = self.render_image(ctx).await {
                metrics::counter!(ALERTING_RENDER_FAILED_TOTAL).increment(1);
                tracing::warn!(rule_id = ctx.rule.id, "failed to render alert panel image: {e}");
            }
        }

        let ctx = &*ctx;
        join_all(targets.into_iter().map(|t| self.send_notification(ctx, t))).await;
    }
}

fn test_notification_context(app_url: &str) -> EvalContext {
    let rule = AlertRule {
        id: 0,
        org_id: 0,
        dashboard_id: 0,
        dashboard_uid: String::new(),
        dashboard_slug: String::new(),
        panel_id: 0,
        name: "Test notification".into(),
        message: "Someone is testing the alert notification.".into(),
        state: AlertState::Alerting,
        paused: false,
        for_secs: 0,
        no_data_state: NoDataOption::default(),
        execution_error_state: ExecutionErrorOption::default(),
        notifications: Vec::new(),
        alert_rule_tags: Vec::new(),
        state_changes: 0,
        last_state_change: chrono::Utc::now(),
    };
    let mut ctx = EvalContext::new(rule, app_url);
    ctx.prev_alert_state = AlertState::Ok;
    ctx.is_test_run = true;
    ctx.firing = true;
    ctx.eval_matches = vec![
        EvalMatch {
            metric: "High value".into(),
            tags: BTreeMap::new(),
            value: Some(100.0),
        },
        EvalMatch {
            metric: "Higher Value".into(),
            tags: BTreeMap::new(),
            value: Some(200.0),
        },
    ];
    ctx
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerting::eval_context::tests::transition;
    use crate::alerting::registry::tests::{RecordingSender, deps};
    use crate::alerting::sender::{WebhookRequest, WebhookSender};
    use crate::models::notification::NotificationStateType;
    use parking_lot::Mutex;

    /// In-memory notification store that records state transitions.
    #[derive(Default)]
    pub(crate) struct SpyStore {
        pub notifications: Vec<AlertNotification>,
        pub conflict: bool,
        pub pending: Mutex<Vec<SetNotificationPendingCommand>>,
        pub completed: Mutex<Vec<(i64, i64)>>,
    }

    impl NotificationStore for SpyStore {
        fn notifications_to_send(
            &self,
            _org_id: i64,
            uids: &[String],
        ) -> anyhow::Result<Vec<AlertNotification>> {
            Ok(self
                .notifications
                .iter()
                .filter(|n| n.is_default || uids.contains(&n.uid))
                .cloned()
                .collect())
        }

        fn get_or_create_notification_state(
            &self,
            org_id: i64,
            alert_id: i64,
            notifier_id: i64,
        ) -> anyhow::Result<AlertNotificationState> {
            Ok(AlertNotificationState {
                id: notifier_id * 100,
                org_id,
                alert_id,
                notifier_id,
                state: NotificationStateType::Completed,
                version: 3,
                updated_at: 0,
                alert_rule_state_updated_version: 0,
            })
        }

        fn set_notification_state_pending(
            &self,
            cmd: &SetNotificationPendingCommand,
        ) -> Result<i64, NotificationStateError> {
            if self.conflict {
                return Err(NotificationStateError::VersionConflict);
            }
            self.pending.lock().push(cmd.clone());
            Ok(cmd.version + 1)
        }

        fn set_notification_state_complete(
            &self,
            id: i64,
            version: i64,
        ) -> Result<(), NotificationStateError> {
            self.completed.lock().push((id, version));
            Ok(())
        }
    }

    /// Fails every webhook whose url contains "broken".
    #[derive(Default)]
    struct FlakySender {
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WebhookSender for FlakySender {
        async fn send_webhook(&self, req: WebhookRequest) -> Result<(), NotifyError> {
            if req.url.contains("broken") {
                return Err(NotifyError::WebhookStatus {
                    url: req.url,
                    status: 502,
                });
            }
            self.delivered.lock().push(req.url);
            Ok(())
        }
    }

    pub(crate) fn webhook(id: i64, uid: &str, url: &str) -> AlertNotification {
        AlertNotification {
            id,
            uid: uid.into(),
            org_id: 1,
            name: format!("{uid} hook"),
            notifier_type: "webhook".into(),
            is_default: false,
            send_reminder: false,
            frequency: Duration::ZERO,
            disable_resolve_message: false,
            settings: serde_json::json!({"url": url, "uploadImage": false}),
        }
    }

    fn service(store: Arc<SpyStore>, sender: Arc<RecordingSender>) -> NotificationService {
        NotificationService::new(
            store,
            Arc::new(NotifierRegistry::with_builtin(deps(sender))),
            Arc::new(RenderingService::disabled()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_sends_and_records_state() {
        let store = Arc::new(SpyStore {
            notifications: vec![webhook(11, "ops", "http://hooks.local/ops")],
            ..Default::default()
        });
        let sender = Arc::new(RecordingSender::default());
        let svc = service(store.clone(), sender.clone());

        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        svc.send_if_needed(&mut ctx).await;

        assert_eq!(sender.webhooks.lock().len(), 1);
        let pending = store.pending.lock();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 1100);
        assert_eq!(pending[0].version, 3);
        assert_eq!(pending[0].alert_rule_state_updated_version, ctx.rule.state_changes);
        assert_eq!(*store.completed.lock(), vec![(1100, 4)]);
    }

    #[tokio::test]
    async fn test_version_conflict_skips_delivery() {
        let store = Arc::new(SpyStore {
            notifications: vec![webhook(11, "ops", "http://hooks.local/ops")],
            conflict: true,
            ..Default::default()
        });
        let sender = Arc::new(RecordingSender::default());
        let svc = service(store.clone(), sender.clone());

        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        svc.send_if_needed(&mut ctx).await;

        assert!(sender.webhooks.lock().is_empty());
        assert!(store.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_notifier_does_not_block_others() {
        let store = Arc::new(SpyStore {
            notifications: vec![
                webhook(11, "ops", "http://broken.local/ops"),
                webhook(12, "dev", "http://hooks.local/dev"),
            ],
            ..Default::default()
        });
        let flaky = Arc::new(FlakySender::default());
        let registry = NotifierRegistry::with_builtin(crate::alerting::registry::NotifierDeps {
            email: Arc::new(RecordingSender::default()),
            webhook: flaky.clone(),
            app_url: "http://localhost:3000/".into(),
        });
        let svc = NotificationService::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(RenderingService::disabled()),
            Duration::from_secs(5),
        );

        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        ctx.rule.notifications = vec!["ops".into(), "dev".into()];
        svc.send_if_needed(&mut ctx).await;

        assert_eq!(*flaky.delivered.lock(), vec!["http://hooks.local/dev".to_string()]);
        // Both deliveries are still marked completed.
        assert_eq!(store.completed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_notifier_is_skipped() {
        let mut broken = webhook(11, "ops", "");
        broken.settings = serde_json::json!({});
        let store = Arc::new(SpyStore {
            notifications: vec![broken, webhook(12, "dev", "http://hooks.local/dev")],
            ..Default::default()
        });
        let sender = Arc::new(RecordingSender::default());
        let svc = service(store, sender.clone());

        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        ctx.rule.notifications = vec!["ops".into(), "dev".into()];
        svc.send_if_needed(&mut ctx).await;

        let sent = sender.webhooks.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "http://hooks.local/dev");
    }

    #[tokio::test]
    async fn test_suppressed_by_policy() {
        let store = Arc::new(SpyStore {
            notifications: vec![webhook(11, "ops", "http://hooks.local/ops")],
            ..Default::default()
        });
        let sender = Arc::new(RecordingSender::default());
        let svc = service(store.clone(), sender.clone());

        let mut ctx = transition(AlertState::Pending, AlertState::Ok);
        svc.send_if_needed(&mut ctx).await;

        assert!(sender.webhooks.lock().is_empty());
        assert!(store.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_default_notifications_included() {
        let mut default = webhook(12, "pager", "http://hooks.local/pager");
        default.is_default = true;
        let store = Arc::new(SpyStore {
            notifications: vec![default],
            ..Default::default()
        });
        let sender = Arc::new(RecordingSender::default());
        let svc = service(store, sender.clone());

        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        ctx.rule.notifications.clear();
        svc.send_if_needed(&mut ctx).await;

        assert_eq!(sender.webhooks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_test_run_skips_bookkeeping() {
        let store = Arc::new(SpyStore {
            notifications: vec![webhook(11, "ops", "http://hooks.local/ops")],
            ..Default::default()
        });
        let sender = Arc::new(RecordingSender::default());
        let svc = service(store.clone(), sender.clone());

        let mut ctx = transition(AlertState::Ok, AlertState::Alerting);
        ctx.is_test_run = true;
        svc.send_if_needed(&mut ctx).await;

        assert_eq!(sender.webhooks.lock().len(), 1);
        assert!(store.pending.lock().is_empty());
        assert!(store.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_test_notification() {
        let sender = Arc::new(RecordingSender::default());
        let svc = service(Arc::new(SpyStore::default()), sender.clone());

        svc.send_test(&webhook(0, "new", "http://hooks.local/new"))
            .await
            .unwrap();
        let sent = sender.webhooks.lock();
        assert_eq!(sent.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&sent[0].body).unwrap();
        assert_eq!(body["ruleName"], "Test notification");
        assert_eq!(body["state"], "alerting");
        assert_eq!(body["evalMatches"].as_array().unwrap().len(), 2);
        drop(sent);

        let mut unknown = webhook(0, "x", "http://hooks.local/x");
        unknown.notifier_type = "carrier-pigeon".into();
        assert!(matches!(
            svc.send_test(&unknown).await,
            Err(SendTestError::Validation(ValidationError::UnsupportedType(_)))
        ));
    }
}
