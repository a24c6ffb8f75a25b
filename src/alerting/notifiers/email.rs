use async_trait::async_trait;
use std::sync::Arc;

use crate::alerting::eval_context::EvalContext;
use crate::alerting::notifier::{Notifier, NotifierBase, NotifyError};
use crate::alerting::registry::{NotifierDeps, NotifierPlugin, ValidationError};
use crate::alerting::sender::{ALERT_NOTIFICATION_TEMPLATE, EmailMessage, EmailSender};
use crate::models::notification::AlertNotification;

pub fn plugin() -> NotifierPlugin {
    NotifierPlugin {
        notifier_type: "email",
        name: "Email",
        description: "Sends notifications using the server's SMTP settings",
        factory: new_email_notifier,
    }
}

/// Sends alert notifications over email.
pub struct EmailNotifier {
    base: NotifierBase,
    pub addresses: Vec<String>,
    single_email: bool,
    app_url: String,
    sender: Arc<dyn EmailSender>,
}

fn new_email_notifier(
    model: &AlertNotification,
    deps: &NotifierDeps,
) -> Result<Box<dyn Notifier>, ValidationError> {
    let addresses = parse_addresses(model.setting_str("addresses").unwrap_or_default());
    if addresses.is_empty() {
        return Err(ValidationError::MissingSetting {
            notifier: "email",
            setting: "addresses",
        });
    }

    Ok(Box::new(EmailNotifier {
        base: NotifierBase::new(model),
        addresses,
        single_email: model.setting_bool("singleEmail", false),
        app_url: deps.app_url.clone(),
        sender: deps.email.clone(),
    }))
}

/// Split on `,`, `;` and newlines, dropping empty entries.
pub fn parse_addresses(input: &str) -> Vec<String> {
    input
        .split([',', ';', '\n'])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

impl EmailNotifier {
    fn build_message(&self, ctx: &EvalContext, to: Vec<String>) -> EmailMessage {
        let title = ctx.notification_title();
        let mut data = serde_json::json!({
            "Title": title,
            "State": ctx.current_state(),
            "Name": ctx.rule.name,
            "StateModel": ctx.state_model(),
            "Message": ctx.rule.message,
            "Error": ctx.error.clone().unwrap_or_default(),
            "RuleUrl": ctx.rule_url(),
            "ImageLink": "",
            "EmbeddedImage": "",
            "AlertPageUrl": format!("{}alerting", self.app_url),
            "EvalMatches": ctx.eval_matches,
        });
        let mut embedded_files = Vec::new();

        if let Some(url) = ctx.image_public_url.as_deref().filter(|u| !u.is_empty()) {
            data["ImageLink"] = serde_json::Value::String(url.to_string());
        } else if let Some(path) = &ctx.image_on_disk_path {
            // A missing render is not worth failing the notification over.
            if std::fs::metadata(path).is_ok() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                data["EmbeddedImage"] = serde_json::Value::String(name);
                embedded_files.push(path.clone());
            }
        }

        EmailMessage {
            to,
            subject: title,
            template: ALERT_NOTIFICATION_TEMPLATE,
            data,
            embedded_files,
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn base(&self) -> &NotifierBase {
        &self.base
    }

    async fn notify(&self, ctx: &EvalContext) -> Result<(), NotifyError> {
        tracing::info!(addresses = ?self.addresses, rule_id = ctx.rule.id, "sending alert notification email");

        let batches: Vec<Vec<String>> = if self.single_email {
            vec![self.addresses.clone()]
        } else {
            self.addresses.iter().map(|a| vec![a.clone()]).collect()
        };

        for to in batches {
            let msg = self.build_message(ctx, to);
            if let Err(e) = self.sender.send_email(msg).await {
                tracing::error!(error = %e, notifier = %self.base.name, "failed to send alert notification email");
                return Err(e);
            }
        }
        Ok(())
    }
}
