//! User notifications.
//!
//! Delivery is fire-and-forget: a failed send is logged and never reaches
//! back into the pipeline that produced the message.

pub mod messages;

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: &str, message: &str) -> anyhow::Result<()>;
}

/// Send and swallow the error.
pub async fn deliver(notifier: &dyn Notifier, user_id: &str, message: &str) {
    if let Err(e) = notifier.send(user_id, message).await {
        warn!(user_id = user_id, error = %e, "notification failed");
    }
}

/// Telegram Bot API. The user id is the chat id.
pub struct TelegramNotifier {
    token: String,
    http: Client,
}

impl TelegramNotifier {
    pub fn new(token: String) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self { token, http })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, user_id: &str, message: &str) -> anyhow::Result<()> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API, self.token);
        let body = serde_json::json!({
            "chat_id": user_id,
            "text": message,
            "disable_web_page_preview": true,
        });

        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram sendMessage returned {}: {}", status, text);
        }
        Ok(())
    }
}

/// Writes messages to the log. Used when no bot token is configured.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, user_id: &str, message: &str) -> anyhow::Result<()> {
        info!(user_id = user_id, message = message, "user notification");
        Ok(())
    }
}
