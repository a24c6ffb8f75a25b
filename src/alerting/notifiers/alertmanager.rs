use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use crate::alerting::eval_context::EvalContext;
use crate::alerting::notifier::{Notifier, NotifierBase, NotifyError};
use crate::alerting::registry::{NotifierDeps, NotifierPlugin, ValidationError};
use crate::alerting::sender::{WebhookRequest, WebhookSender};
use crate::models::alert::{AlertState, EvalMatch};
use crate::models::notification::{AlertNotification, AlertNotificationState};

/// Characters that are not valid in a Prometheus label name.
static LABEL_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_]").expect("valid label name regex"));

pub fn plugin() -> NotifierPlugin {
    NotifierPlugin {
        notifier_type: "prometheus-alertmanager",
        name: "Prometheus Alertmanager",
        description: "Sends alerts to Prometheus Alertmanager",
        factory: new_alertmanager_notifier,
    }
}

pub struct AlertmanagerNotifier {
    base: NotifierBase,
    pub url: String,
    sender: Arc<dyn WebhookSender>,
}

fn new_alertmanager_notifier(
    model: &AlertNotification,
    deps: &NotifierDeps,
) -> Result<Box<dyn Notifier>, ValidationError> {
    let url = model.setting_str("url").unwrap_or_default().trim();
    if url.is_empty() {
        return Err(ValidationError::MissingSetting {
            notifier: "prometheus-alertmanager",
            setting: "url",
        });
    }

    Ok(Box::new(AlertmanagerNotifier {
        base: NotifierBase::new(model),
        url: url.trim_end_matches('/').to_string(),
        sender: deps.webhook.clone(),
    }))
}

pub fn sanitize_label_name(input: &str) -> String {
    LABEL_NAME_PATTERN.replace_all(input, "_").into_owned()
}

impl AlertmanagerNotifier {
    fn create_alert(&self, ctx: &EvalContext, m: Option<&EvalMatch>, rule_url: &str) -> Value {
        let mut alert = Map::new();
        alert.insert(
            "startsAt".into(),
            json!(ctx.start_time.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        if ctx.current_state() == AlertState::Ok {
            alert.insert(
                "endsAt".into(),
                json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        alert.insert("generatorURL".into(), json!(rule_url));

        let mut annotations = Map::new();
        annotations.insert("summary".into(), json!(ctx.rule.name));
        let mut description = ctx.rule.message.clone();
        if let Some(err) = &ctx.error {
            if !description.is_empty() {
                description.push('\n');
            }
            description.push_str("Error: ");
            description.push_str(err);
        }
        if !description.is_empty() {
            annotations.insert("description".into(), json!(description));
        }
        if let Some(url) = ctx.image_public_url.as_deref().filter(|u| !u.is_empty()) {
            annotations.insert("image".into(), json!(url));
        }
        alert.insert("annotations".into(), Value::Object(annotations));

        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        if let Some(m) = m {
            if m.tags.is_empty() {
                labels.insert("metric".into(), m.metric.clone());
            } else {
                for (k, v) in &m.tags {
                    labels.insert(sanitize_label_name(k), v.clone());
                }
            }
        }
        for tag in &ctx.rule.alert_rule_tags {
            labels.insert(tag.key.clone(), tag.value.clone());
        }
        labels.insert("alertname".into(), ctx.rule.name.clone());
        alert.insert("labels".into(), json!(labels));

        Value::Object(alert)
    }

    /// One alert per matching series, or a single one on execution error / no data.
    pub fn build_alerts(&self, ctx: &EvalContext) -> Vec<Value> {
        let rule_url = ctx.rule_url();
        if ctx.eval_matches.is_empty() {
            return vec![self.create_alert(ctx, None, &rule_url)];
        }
        ctx.eval_matches
            .iter()
            .map(|m| self.create_alert(ctx, Some(m), &rule_url))
            .collect()
    }
}

#[async_trait]
impl Notifier for AlertmanagerNotifier {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    fn should_notify(&self, ctx: &EvalContext, _state: &AlertNotificationState) -> bool {
        let prev = ctx.prev_alert_state;
        let new = ctx.current_state();
        tracing::debug!(rule_id = ctx.rule.id, state = %new, previous_state = %prev, "should notify");

        // A rule that never fired has nothing to resolve.
        if prev == AlertState::Pending && new == AlertState::Ok {
            return false;
        }
        // Resolve before Alertmanager's own timeout does.
        if prev == AlertState::Alerting && new == AlertState::Ok {
            return true;
        }
        new == AlertState::Alerting
    }

    async fn notify(&self, ctx: &EvalContext) -> Result<(), NotifyError> {
        tracing::info!(rule_id = ctx.rule.id, notification = %self.base.name, "sending alertmanager alert");

        let body = serde_json::to_string(&self.build_alerts(ctx))?;
        let req = WebhookRequest::post_json(format!("{}/api/v1/alerts", self.url), body);
        if let Err(e) = self.sender.send_webhook(req).await {
            tracing::error!(error = %e, alertmanager = %self.base.name, "failed to send alertmanager alert");
            return Err(e);
        }
        Ok(())
    }
}
