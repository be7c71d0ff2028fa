use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Notifier;
use crate::errors::DeliveryFailed;
use crate::format::{FormattedMessage, ReadMoreButton};

pub const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct TelegramNotifier {
    api_base: String,
    token: String,
    chat_id: String,
    client: Client,
    timeout: Duration,
    max_attempts: u8,
}

impl TelegramNotifier {
    pub fn new(client: Client, token: String, chat_id: String) -> Self {
        Self {
            api_base: TELEGRAM_API.to_string(),
            token,
            chat_id,
            client,
            timeout: Duration::from_secs(15),
            max_attempts: 1,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Attempts per message. Only rate limits and connection failures are
    /// retried; any other answer from Telegram is final.
    pub fn with_retries(mut self, attempts: u8) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token)
    }
}

#[derive(Serialize)]
struct InlineButton<'a> {
    text: &'a str,
    url: &'a str,
}

#[derive(Serialize)]
struct InlineKeyboard<'a> {
    inline_keyboard: Vec<Vec<InlineButton<'a>>>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard<'a>>,
}

#[derive(Deserialize, Default)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

fn payload<'a>(
    chat_id: &'a str,
    message: &'a FormattedMessage,
    button: Option<&'a ReadMoreButton>,
) -> SendMessage<'a> {
    SendMessage {
        chat_id,
        text: &message.text,
        parse_mode: "HTML",
        disable_web_page_preview: true,
        reply_markup: button.map(|b| InlineKeyboard {
            inline_keyboard: vec![vec![InlineButton {
                text: &b.label,
                url: &b.url,
            }]],
        }),
    }
}

fn backoff(attempt: u8) -> Duration {
    Duration::from_millis(500u64 << (attempt.saturating_sub(1)).min(6))
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(
        &self,
        message: &FormattedMessage,
        button: Option<&ReadMoreButton>,
    ) -> Result<(), DeliveryFailed> {
        let body = payload(&self.chat_id, message, button);
        let url = self.endpoint();

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    let status = rsp.status();
                    let api: ApiResponse = rsp.json().await.unwrap_or_default();
                    if status.is_success() && api.ok {
                        return Ok(());
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_attempts {
                        let wait = api
                            .parameters
                            .and_then(|p| p.retry_after)
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| backoff(attempt));
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(DeliveryFailed::new(format!(
                        "telegram {}: {}",
                        status,
                        api.description.unwrap_or_else(|| "no description".to_string())
                    )));
                }
                // Nothing reached Telegram, so a retry cannot double-post.
                Err(e) if e.is_connect() && attempt < self.max_attempts => {
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                Err(e) => {
                    // never echo the URL: it carries the bot token
                    return Err(DeliveryFailed::new(format!(
                        "telegram request failed: {}",
                        e.without_url()
                    )));
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_message;

    #[test]
    fn payload_has_html_mode_and_one_button() {
        let msg = format_message("L", "T", "B", "https://pubmed.ncbi.nlm.nih.gov/1/", 100);
        let btn = msg.button("Read full article");
        let v = serde_json::to_value(payload("-100123", &msg, btn.as_ref())).unwrap();
        assert_eq!(v["chat_id"], "-100123");
        assert_eq!(v["parse_mode"], "HTML");
        assert_eq!(v["disable_web_page_preview"], true);
        assert_eq!(
            v["reply_markup"]["inline_keyboard"][0][0]["url"],
            "https://pubmed.ncbi.nlm.nih.gov/1/"
        );
        assert_eq!(
            v["reply_markup"]["inline_keyboard"][0][0]["text"],
            "Read full article"
        );
    }

    #[test]
    fn payload_without_button_omits_markup() {
        let msg = format_message("L", "T", "B", "", 100);
        let v = serde_json::to_value(payload("1", &msg, None)).unwrap();
        assert!(v.get("reply_markup").is_none());
    }

    #[test]
    fn backoff_grows_and_saturates() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(1000));
        assert_eq!(backoff(200), Duration::from_millis(500 << 6));
    }

    #[test]
    fn endpoint_embeds_token() {
        let n = TelegramNotifier::new(Client::new(), "T0K".into(), "1".into())
            .with_api_base("http://localhost:8081/");
        assert_eq!(n.endpoint(), "http://localhost:8081/botT0K/sendMessage");
    }
}
