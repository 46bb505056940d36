use crate::config::NotifierConfig;
use crate::error::NotifyError;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::Notifier;

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str, chat_id: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    pub fn from_config(config: &NotifierConfig) -> Result<Self> {
        let token = config.bot_token.as_deref().filter(|t| !t.trim().is_empty());
        let chat_id = config.chat_id.as_deref().filter(|c| !c.trim().is_empty());
        let (Some(token), Some(chat_id)) = (token, chat_id) else {
            bail!(
                "Telegram configuration is missing. Set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID \
                 (or IPO_ALERT__NOTIFIER__BOT_TOKEN / IPO_ALERT__NOTIFIER__CHAT_ID)"
            );
        };
        Self::new(&config.api_base, token, chat_id, Duration::from_secs(config.timeout_secs))
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token)
    }

    /// Strip the token from anything reqwest echoes back (it embeds the URL).
    fn redact(&self, s: impl std::fmt::Display) -> String {
        s.to_string().replace(&self.token, "<redacted>")
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "Markdown",
            disable_web_page_preview: false,
        };

        let resp = self
            .client
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::DeliveryFailed(self.redact(e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| NotifyError::DeliveryFailed(self.redact(e)))?;

        classify_response(status, &body)?;
        debug!("Telegram accepted message ({} chars)", message.chars().count());
        Ok(())
    }
}

/// Delivery succeeded only on a 2xx status carrying `"ok": true`.
fn classify_response(status: StatusCode, body: &str) -> Result<(), NotifyError> {
    match serde_json::from_str::<ApiResponse>(body).ok() {
        Some(ApiResponse { ok: true, .. }) if status.is_success() => Ok(()),
        Some(ApiResponse { description, .. }) => Err(NotifyError::DeliveryFailed(format!(
            "Telegram HTTP {}: {}",
            status,
            description.unwrap_or_else(|| "no description".to_string())
        ))),
        None => Err(NotifyError::DeliveryFailed(format!(
            "Telegram HTTP {} with unreadable body",
            status
        ))),
    }
}
