use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    /// Clarifying questions are waiting for the owner.
    InquiryReady,
    /// The assessment report is available.
    AssessmentComplete,
    /// Retries are exhausted; an operator must look at the run.
    Escalation,
}

impl NotificationTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InquiryReady => "inquiry_ready",
            Self::AssessmentComplete => "assessment_complete",
            Self::Escalation => "escalation",
        }
    }
}

/// Best-effort notification collaborator. Returns whether delivery succeeded;
/// callers log a `false` and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, template: NotificationTemplate, run_id: &str) -> bool;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, template: NotificationTemplate, run_id: &str) -> bool {
        tracing::info!(recipient, template = template.as_str(), run_id, "notification");
        true
    }
}

/// Posts notifications as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    template: NotificationTemplate,
    run_id: &'a str,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build webhook client: {}", e))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, recipient: &str, template: NotificationTemplate, run_id: &str) -> bool {
        let payload = WebhookPayload {
            recipient,
            template,
            run_id,
        };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(run_id, template = template.as_str(), status = %resp.status(), "notification webhook refused");
                false
            }
            Err(e) => {
                tracing::warn!(run_id, template = template.as_str(), error = %e, "notification webhook unreachable");
                false
            }
        }
    }
}
