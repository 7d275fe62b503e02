//! Notification email delivery.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::Job;
use crate::worker::{JobContext, JobHandler};

const APPLICANT_TEMPLATE: &str = r#"<html><body>
<p>Dear {{recipient_name}},</p>
<h2>{{title}}</h2>
<p>{{message}}</p>
<p>Reference: {{related_entity_id}}</p>
<p><a href="{{action_url}}">{{action}}</a></p>
<p>{{company_name}}</p>
</body></html>"#;

const STAFF_TEMPLATE: &str = r#"<html><body>
<p>Hello {{recipient_name}},</p>
<h2>{{title}}</h2>
<p>Priority: {{priority}}</p>
<p>{{message}}</p>
<p>Required action: {{action}}</p>
<p><a href="{{action_url}}">View details</a></p>
<p>{{company_name}}</p>
</body></html>"#;

/// Payload of a notification email job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEmailJob {
    #[serde(default)]
    pub notification_id: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub email_data: EmailData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailData {
    pub recipient_email: String,
    #[serde(default)]
    pub recipient_name: String,
    /// `APPLICANT`, `STAFF`, anything else gets the generic subject
    #[serde(default)]
    pub notification_type: String,
    #[serde(default)]
    pub notification_data: NotificationData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub title: Option<String>,
    pub message: Option<String>,
    pub related_entity_id: Option<String>,
    pub priority: Option<String>,
    pub action: Option<String>,
    pub action_url: Option<String>,
}

/// A rendered email ready to hand to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// SMTP relay transport.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpTransport {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        from: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .with_context(|| format!("invalid SMTP relay {host}"))?
            .port(port);
        if let (Some(username), Some(password)) = (username, password) {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(Self {
            mailer: builder.build(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.from.parse().context("invalid from address")?)
            .to(message.to.parse().context("invalid recipient address")?)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_HTML)
            .body(message.html.clone())?;
        self.mailer.send(email).await?;
        Ok(())
    }
}

pub struct NotificationEmailHandler {
    transport: Arc<dyn EmailTransport>,
    company_name: String,
}

impl NotificationEmailHandler {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self {
            transport,
            company_name: "TAFTA".to_string(),
        }
    }

    pub fn with_company_name(mut self, name: impl Into<String>) -> Self {
        self.company_name = name.into();
        self
    }

    pub fn render(&self, data: &EmailData) -> EmailMessage {
        let (subject, template) = match data.notification_type.as_str() {
            "APPLICANT" => ("TAFTA Notification", APPLICANT_TEMPLATE),
            "STAFF" => ("Staff Alert Notification", STAFF_TEMPLATE),
            _ => ("Notification Update", APPLICANT_TEMPLATE),
        };
        let fields = &data.notification_data;
        let values = [
            ("company_name", self.company_name.as_str()),
            ("recipient_name", data.recipient_name.as_str()),
            ("related_entity_id", fields.related_entity_id.as_deref().unwrap_or("")),
            ("title", fields.title.as_deref().unwrap_or("")),
            ("message", fields.message.as_deref().unwrap_or("")),
            ("priority", fields.priority.as_deref().unwrap_or("Normal")),
            ("action", fields.action.as_deref().unwrap_or("Please review")),
            ("action_url", fields.action_url.as_deref().unwrap_or("#")),
        ];

        let mut html = template.to_string();
        for (key, value) in values {
            html = html.replace(&format!("{{{{{key}}}}}"), &escape_html(value));
        }

        EmailMessage {
            to: data.recipient_email.clone(),
            subject: subject.to_string(),
            html,
        }
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl JobHandler for NotificationEmailHandler {
    async fn handle(&self, job: &Job, _ctx: &JobContext) -> anyhow::Result<Value> {
        let payload: NotificationEmailJob = serde_json::from_value(job.payload.clone())
            .context("invalid notification email payload")?;
        tracing::debug!(
            job_id = %job.id,
            notification_id = ?payload.notification_id,
            recipient_id = ?payload.recipient_id,
            "Processing email job"
        );

        let message = self.render(&payload.email_data);
        self.transport
            .send(&message)
            .await
            .with_context(|| format!("failed to send email to {}", message.to))?;
        tracing::info!(job_id = %job.id, recipient = %message.to, "Notification email sent");

        Ok(json!({
            "success": true,
            "messageId": job.id,
            "recipientEmail": message.to,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::Queue;
    use crate::store::MemoryJobStore;
    use crate::types::JobOptions;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl EmailTransport for Outbox {
        async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn data(notification_type: &str) -> EmailData {
        EmailData {
            recipient_email: "ada@example.com".into(),
            recipient_name: "Ada <Admin>".into(),
            notification_type: notification_type.into(),
            notification_data: NotificationData {
                title: Some("Application approved".into()),
                message: Some("Welcome to the cohort".into()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_subject_by_notification_type() {
        let handler = NotificationEmailHandler::new(Arc::new(Outbox::default()));
        assert_eq!(handler.render(&data("APPLICANT")).subject, "TAFTA Notification");
        assert_eq!(handler.render(&data("STAFF")).subject, "Staff Alert Notification");
        assert_eq!(handler.render(&data("OTHER")).subject, "Notification Update");
    }

    #[test]
    fn test_render_fills_defaults_and_escapes() {
        let handler =
            NotificationEmailHandler::new(Arc::new(Outbox::default())).with_company_name("Acme");
        let staff = handler.render(&data("STAFF"));
        assert!(staff.html.contains("Hello Ada &lt;Admin&gt;,"));
        assert!(staff.html.contains("Priority: Normal"));
        assert!(staff.html.contains("Required action: Please review"));
        assert!(staff.html.contains(r##"href="#""##));
        assert!(staff.html.contains("Acme"));
        assert!(!staff.html.contains("{{"));
    }

    #[tokio::test]
    async fn test_handle_sends_and_returns_message_id() {
        let outbox = Arc::new(Outbox::default());
        let handler = NotificationEmailHandler::new(outbox.clone());
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::new(QueueConfig::notification_email(), store.clone());
        let enqueued = queue
            .add(
                "send",
                json!({
                    "notificationId": "n-1",
                    "recipientId": "u-1",
                    "emailData": {
                        "recipientEmail": "ada@example.com",
                        "recipientName": "Ada",
                        "notificationType": "APPLICANT",
                        "notificationData": {"title": "Hi", "message": "Hello"}
                    }
                }),
                JobOptions::with_id("email-1"),
            )
            .await
            .unwrap();
        let ctx = JobContext::new(store, &enqueued.job);

        let result = handler.handle(&enqueued.job, &ctx).await.unwrap();
        assert_eq!(
            result,
            json!({"success": true, "messageId": "email-1", "recipientEmail": "ada@example.com"})
        );
        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "TAFTA Notification");
    }

    #[tokio::test]
    async fn test_invalid_payload_is_an_error() {
        let handler = NotificationEmailHandler::new(Arc::new(Outbox::default()));
        let store = Arc::new(MemoryJobStore::new());
        let queue = Queue::new(QueueConfig::notification_email(), store.clone());
        let enqueued = queue
            .add("send", json!({"notificationId": "n-1"}), JobOptions::default())
            .await
            .unwrap();
        let ctx = JobContext::new(store, &enqueued.job);
        assert!(handler.handle(&enqueued.job, &ctx).await.is_err());
    }
}
