use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::alerting::eval_context::EvalContext;
use crate::alerting::notifier::{Notifier, NotifierBase, NotifyError};
use crate::alerting::registry::{NotifierDeps, NotifierPlugin, ValidationError};
use crate::alerting::sender::{WebhookRequest, WebhookSender};
use crate::models::alert::{AlertState, EvalMatch};
use crate::models::notification::AlertNotification;

pub fn plugin() -> NotifierPlugin {
    NotifierPlugin {
        notifier_type: "webhook",
        name: "Webhook",
        description: "Sends HTTP POST or PUT requests to a URL",
        factory: new_webhook_notifier,
    }
}

pub struct WebhookNotifier {
    base: NotifierBase,
    pub url: String,
    http_method: String,
    user: Option<String>,
    password: Option<String>,
    sender: Arc<dyn WebhookSender>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    title: String,
    rule_id: i64,
    rule_name: &'a str,
    state: AlertState,
    eval_matches: &'a [EvalMatch],
    org_id: i64,
    dashboard_id: i64,
    panel_id: i64,
    tags: BTreeMap<&'a str, &'a str>,
    rule_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn new_webhook_notifier(
    model: &AlertNotification,
    deps: &NotifierDeps,
) -> Result<Box<dyn Notifier>, ValidationError> {
    let url = model.setting_str("url").unwrap_or_default().trim();
    if url.is_empty() {
        return Err(ValidationError::MissingSetting {
            notifier: "webhook",
            setting: "url",
        });
    }

    let http_method = model
        .setting_str("httpMethod")
        .filter(|m| !m.is_empty())
        .unwrap_or("POST")
        .to_uppercase();
    if http_method != "POST" && http_method != "PUT" {
        return Err(ValidationError::InvalidSetting {
            setting: "httpMethod",
            reason: format!("{http_method} is not one of POST, PUT"),
        });
    }

    Ok(Box::new(WebhookNotifier {
        base: NotifierBase::new(model),
        url: url.to_string(),
        http_method,
        user: model.setting_str("username").map(String::from),
        password: model.setting_str("password").map(String::from),
        sender: deps.webhook.clone(),
    }))
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    async fn notify(&self, ctx: &EvalContext) -> Result<(), NotifyError> {
        tracing::info!(rule_id = ctx.rule.id, notification = %self.base.name, "sending webhook");

        let body = WebhookBody {
            title: ctx.notification_title(),
            rule_id: ctx.rule.id,
            rule_name: &ctx.rule.name,
            state: ctx.current_state(),
            eval_matches: &ctx.eval_matches,
            org_id: ctx.rule.org_id,
            dashboard_id: ctx.rule.dashboard_id,
            panel_id: ctx.rule.panel_id,
            tags: ctx
                .rule
                .alert_rule_tags
                .iter()
                .map(|t| (t.key.as_str(), t.value.as_str()))
                .collect(),
            rule_url: ctx.rule_url(),
            image_url: ctx.image_public_url.as_deref().filter(|u| !u.is_empty()),
            message: Some(ctx.rule.message.as_str()).filter(|m| !m.is_empty()),
            error: ctx.error.as_deref(),
        };

        let req = WebhookRequest {
            method: self.http_method.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            ..WebhookRequest::post_json(self.url.clone(), serde_json::to_string(&body)?)
        };
        if let Err(e) = self.sender.send_webhook(req).await {
            tracing::error!(error = %e, webhook = %self.base.name, "failed to send webhook");
            return Err(e);
        }
        Ok(())
    }
}
