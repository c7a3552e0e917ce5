use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

/// Delivers human-readable status text to a channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, text: &str) -> Result<()>;
}

/// Posts to a Slack incoming webhook.
pub struct SlackWebhook {
    pub webhook_url: String,
    pub username: String,
    pub icon_url: String,
    client: Client,
    timeout: Duration,
}

impl SlackWebhook {
    pub fn new(webhook_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            username: username.into(),
            icon_url: String::new(),
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_icon_url(mut self, icon_url: impl Into<String>) -> Self {
        self.icon_url = icon_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn payload(&self, channel: &str, text: &str) -> serde_json::Value {
        let mut body = json!({
            "channel": channel,
            "username": self.username,
            "text": text,
        });
        if !self.icon_url.is_empty() {
            body["icon_url"] = json!(self.icon_url);
        }
        body
    }
}

#[async_trait]
impl Notifier for SlackWebhook {
    async fn notify(&self, channel: &str, text: &str) -> Result<()> {
        for chunk in split_text(text, 4000) {
            let resp = self
                .client
                .post(&self.webhook_url)
                .json(&self.payload(channel, &chunk))
                .timeout(self.timeout)
                .send()
                .await
                .context("slack webhook request")?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow!("slack webhook returned {status}: {body}"));
            }
        }
        Ok(())
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, text: &str) -> Result<()> {
        info!(channel = %channel, "notify: {text}");
        Ok(())
    }
}

/// Split on newlines so each chunk stays under `limit` bytes.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.len() > limit {
        let mut boundary = limit;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let cut = match remaining[..boundary].rfind('\n') {
            Some(0) | None => boundary,
            Some(i) => i,
        };
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start_matches('\n');
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}
