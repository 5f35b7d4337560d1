use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode, Recipient};
use teloxide::{ApiError, RequestError};
use tracing::debug;
use url::Url;

use crate::config::TelegramConfig;
use crate::error::SendFailure;
use crate::platform::ChatApi;

/// Bot API client bound to a single destination chat
pub struct TelegramApi {
    bot: Bot,
    recipient: Recipient,
}

impl TelegramApi {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot: Bot::new(&config.bot_token),
            recipient: config.chat_id.recipient(),
        }
    }
}

/// Descriptions the Bot API sends with 5xx responses
const SERVER_ERRORS: &[&str] = &[
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

/// Map a Bot API error onto the retry taxonomy.
fn classify(err: RequestError) -> SendFailure {
    match err {
        RequestError::RetryAfter(seconds) => SendFailure::Throttled {
            retry_after: Some(seconds.duration()),
        },
        RequestError::Api(ApiError::Unknown(description)) if is_server_error(&description) => {
            SendFailure::Transient(description)
        }
        RequestError::Api(api) => SendFailure::Permanent(api.to_string()),
        RequestError::MigrateToChatId(chat) => {
            SendFailure::Permanent(format!("chat migrated to {}", chat))
        }
        other => SendFailure::Transient(other.to_string()),
    }
}

fn is_server_error(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    SERVER_ERRORS.iter().any(|known| description.contains(known))
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn send_text(&self, text: &str) -> Result<(), SendFailure> {
        let sent = self
            .bot
            .send_message(self.recipient.clone(), text)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(classify)?;
        debug!("Telegram accepted message {}", sent.id.0);
        Ok(())
    }

    async fn send_photo(&self, url: &str, caption: &str) -> Result<(), SendFailure> {
        let url = Url::parse(url)
            .map_err(|e| SendFailure::Permanent(format!("invalid photo url {}: {}", url, e)))?;
        let sent = self
            .bot
            .send_photo(self.recipient.clone(), InputFile::url(url))
            .caption(caption)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(classify)?;
        debug!("Telegram accepted photo {}", sent.id.0);
        Ok(())
    }

    async fn verify(&self) -> Result<String, SendFailure> {
        let me = self.bot.get_me().await.map_err(classify)?;
        Ok(me.user.username.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use teloxide::types::Seconds;

    #[test]
    fn test_classify_bot_api_errors() {
        assert_eq!(
            classify(RequestError::RetryAfter(Seconds::from_seconds(3))),
            SendFailure::Throttled {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(matches!(
            classify(RequestError::Api(ApiError::BotBlocked)),
            SendFailure::Permanent(_)
        ));
        assert!(matches!(
            classify(RequestError::MigrateToChatId(ChatId(-10042))),
            SendFailure::Permanent(_)
        ));
        assert!(matches!(
            classify(RequestError::Api(ApiError::Unknown("Bad Request: chat not found".into()))),
            SendFailure::Permanent(_)
        ));
    }

    #[test]
    fn test_server_errors_are_retryable() {
        for description in [
            "Internal Server Error",
            "Bad Gateway",
            "Service Unavailable",
            "Gateway Timeout",
        ] {
            assert_eq!(
                classify(RequestError::Api(ApiError::Unknown(description.to_string()))),
                SendFailure::Transient(description.to_string())
            );
        }
    }
}
