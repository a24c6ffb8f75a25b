//! Outbound transports shared by all notifiers.

use async_trait::async_trait;
use handlebars::Handlebars;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use std::path::PathBuf;
use std::time::Duration;

use crate::alerting::notifier::NotifyError;
use crate::config::SmtpConfig;

pub const ALERT_NOTIFICATION_TEMPLATE: &str = "alert_notification.html";

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub body: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
}

impl WebhookRequest {
    pub fn post_json(url: impl Into<String>, body: String) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            body,
            user: None,
            password: None,
            headers: Vec::new(),
            content_type: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub template: &'static str,
    pub data: serde_json::Value,
    /// Files attached inline; referenced from the body by file name.
    pub embedded_files: Vec<PathBuf>,
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send_webhook(&self, req: WebhookRequest) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, msg: EmailMessage) -> Result<(), NotifyError>;
}

pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send_webhook(&self, req: WebhookRequest) -> Result<(), NotifyError> {
        let method = reqwest::Method::from_bytes(req.method.to_uppercase().as_bytes())
            .map_err(|_| NotifyError::InvalidMethod(req.method.clone()))?;
        let content_type = req
            .content_type
            .unwrap_or_else(|| "application/json".to_string());

        let mut builder = self
            .client
            .request(method, &req.url)
            .header(USER_AGENT, "rush-alerting")
            .header(CONTENT_TYPE, content_type)
            .body(req.body);
        if let Some(user) = req.user.filter(|u| !u.is_empty()) {
            builder = builder.basic_auth(user, req.password);
        }
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await.map_err(|source| NotifyError::Webhook {
            url: req.url.clone(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(url = %req.url, status = status.as_u16(), body = %body, "webhook failed");
            return Err(NotifyError::WebhookStatus {
                url: req.url,
                status: status.as_u16(),
            });
        }
        tracing::debug!(url = %req.url, status = status.as_u16(), "webhook succeeded");
        Ok(())
    }
}

/// SMTP delivery of templated emails.
pub struct SmtpMailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
    templates: Handlebars<'static>,
}

impl SmtpMailer {
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<Self> {
        let transport = build_smtp_transport(cfg);
        if transport.is_some() {
            tracing::info!("SMTP configured for email notifications");
        }
        Ok(Self {
            transport,
            from: cfg.from.clone(),
            templates: email_templates()?,
        })
    }

    fn build_message(&self, msg: &EmailMessage, to: &[String]) -> Result<Message, NotifyError> {
        let body = self.templates.render(msg.template, &msg.data)?;

        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| NotifyError::Email(format!("invalid from address {}: {e}", self.from)))?;
        let mut builder = Message::builder().from(from).subject(msg.subject.clone());
        for addr in to {
            let mailbox: Mailbox = addr
                .parse()
                .map_err(|e| NotifyError::Email(format!("invalid address {addr}: {e}")))?;
            builder = builder.to(mailbox);
        }

        let mut related = MultiPart::related().singlepart(SinglePart::html(body));
        for path in &msg.embedded_files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let bytes = std::fs::read(path)
                .map_err(|e| NotifyError::Email(format!("reading {}: {e}", path.display())))?;
            related = related.singlepart(Attachment::new_inline(name).body(bytes, image_content_type(path)));
        }

        builder
            .multipart(related)
            .map_err(|e| NotifyError::Email(e.to_string()))
    }
}

#[async_trait]
impl EmailSender for SmtpMailer {
    async fn send_email(&self, msg: EmailMessage) -> Result<(), NotifyError> {
        let transport = self.transport.as_ref().ok_or(NotifyError::SmtpNotConfigured)?;
        let email = self.build_message(&msg, &msg.to)?;
        transport.send(email).await?;
        Ok(())
    }
}

fn build_smtp_transport(cfg: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

fn image_content_type(path: &std::path::Path) -> ContentType {
    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "image/png",
    };
    ContentType::parse(mime).unwrap_or(ContentType::TEXT_PLAIN)
}

pub fn email_templates() -> anyhow::Result<Handlebars<'static>> {
    use anyhow::Context;

    let mut registry = Handlebars::new();
    registry
        .register_template_string(
            ALERT_NOTIFICATION_TEMPLATE,
            r#"<html>
<body style="font-family: sans-serif;">
<h2 style="color: {{StateModel.color}};">{{Title}}</h2>
{{#if Message}}<p>{{Message}}</p>{{/if}}
{{#if Error}}<p><strong>Error:</strong> {{Error}}</p>{{/if}}
{{#if EvalMatches}}
<table>
  <tr><th align="left">Metric</th><th align="left">Value</th></tr>
  {{#each EvalMatches}}<tr><td>{{metric}}</td><td>{{value}}</td></tr>
  {{/each}}
</table>
{{/if}}
{{#if ImageLink}}<p><img src="{{ImageLink}}" style="max-width: 100%;"></p>{{/if}}
{{#if EmbeddedImage}}<p><img src="cid:{{EmbeddedImage}}" style="max-width: 100%;"></p>{{/if}}
<p><a href="{{RuleUrl}}">View your alert rule</a> | <a href="{{AlertPageUrl}}">Go to the alerts page</a></p>
</body>
</html>"#,
        )
        .context("registering alert_notification template")?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_template_renders() {
        let registry = email_templates().unwrap();
        let html = registry
            .render(
                ALERT_NOTIFICATION_TEMPLATE,
                &serde_json::json!({
                    "Title": "[Alerting] High latency",
                    "StateModel": {"color": "#D63232", "text": "Alerting"},
                    "Message": "p99 above budget",
                    "Error": "",
                    "RuleUrl": "http://localhost/d/abc",
                    "AlertPageUrl": "http://localhost/alerting",
                    "ImageLink": "",
                    "EmbeddedImage": "panel.png",
                    "EvalMatches": [{"metric": "api", "tags": {}, "value": 2.5}],
                }),
            )
            .unwrap();
        assert!(html.contains("[Alerting] High latency"));
        assert!(html.contains("cid:panel.png"));
        assert!(html.contains("<td>api</td><td>2.5</td>"));
        assert!(!html.contains("Error:"));
    }

    #[tokio::test]
    async fn test_mailer_without_host_reports_not_configured() {
        let mailer = SmtpMailer::new(&SmtpConfig::default()).unwrap();
        let err = mailer
            .send_email(EmailMessage {
                to: vec!["ops@example.com".into()],
                subject: "s".into(),
                template: ALERT_NOTIFICATION_TEMPLATE,
                data: serde_json::json!({}),
                embedded_files: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::SmtpNotConfigured));
    }

    #[test]
    fn test_build_message_with_embedded_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("panel.png");
        std::fs::write(&image, b"\x89PNG").unwrap();

        let mailer = SmtpMailer::new(&SmtpConfig::default()).unwrap();
        let msg = EmailMessage {
            to: vec!["a@example.com".into(), "b@example.com".into()],
            subject: "[OK] High latency".into(),
            template: ALERT_NOTIFICATION_TEMPLATE,
            data: serde_json::json!({"Title": "[OK] High latency", "EmbeddedImage": "panel.png"}),
            embedded_files: vec![image],
        };
        let message = mailer.build_message(&msg, &msg.to).unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(raw.contains("a@example.com"));
        assert!(raw.contains("b@example.com"));
        assert!(raw.contains("Content-ID: <panel.png>"));
    }
}
