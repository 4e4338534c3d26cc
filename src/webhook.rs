use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::WebhookConfig;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

/// Posts short notices to chat webhooks. Delivery is best effort: failures
/// are logged and never reach the caller.
pub struct Notifier {
    client: Client,
    config: WebhookConfig,
}

impl Notifier {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("Newsletter/1.0 (Webhook)")
            .build()?;

        Ok(Self { client, config })
    }

    pub async fn writer_applied(&self, name: &str, email: &str, reasoning: &str) {
        let content = format!(
            "{} with email {} requested to join the newsletter. Reasoning: {}",
            name, email, reasoning
        );
        self.post(self.config.writer_application.as_deref(), &content)
            .await;
    }

    pub async fn user_registered(&self, email: &str) {
        let content = format!("{} registered for the newsletter", email);
        self.post(self.config.registration.as_deref(), &content).await;
    }

    async fn post(&self, url: Option<&str>, content: &str) {
        let Some(url) = url else {
            debug!("No webhook configured, skipping notification");
            return;
        };

        let result = self
            .client
            .post(url)
            .json(&WebhookPayload { content })
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(e) = result {
            warn!("Webhook notification to {} failed: {}", url, e);
        }
    }
}
