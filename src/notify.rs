//! Best-effort Discord webhook notifications.
//!
//! A notification failure never interrupts the Trading Loop: every error
//! path here ends in a `warn!` log, not a propagated `Result`.

use std::time::Duration;

use tracing::warn;

pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Notifier { client, webhook_url }
    }

    /// Post `content` to the configured webhook. A no-op when no webhook is
    /// configured.
    pub async fn send(&self, content: &str) {
        let Some(url) = self.webhook_url.as_deref() else {
            return;
        };

        let result = self
            .client
            .post(url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(%status, %body, "discord webhook rejected the message");
            }
            Err(e) => warn!(error = %e, "discord webhook request failed"),
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_webhook_is_a_noop() {
        let notifier = Notifier::new(None);
        notifier.send("hello").await;
    }
}
