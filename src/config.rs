use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use teloxide::types::{ChatId, Recipient};

use crate::error::ConfigError;

/// Env var that points at a TOML config file when no CLI argument is given.
pub const CONFIG_PATH_ENV: &str = "FEEDGRAM_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_url")]
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` on the upgrade request
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Frame sent right after the upgrade; the first frame received back acknowledges it
    #[serde(default)]
    pub subscribe_message: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_miss_factor")]
    pub heartbeat_miss_factor: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
}

/// Telegram chat target: a numeric chat id or a `@channel` username.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ChatTarget {
    Id(i64),
    Name(String),
}

impl Default for ChatTarget {
    fn default() -> Self {
        ChatTarget::Name(String::new())
    }
}

impl ChatTarget {
    pub fn is_empty(&self) -> bool {
        matches!(self, ChatTarget::Name(name) if name.trim().is_empty())
    }

    /// Numeric strings (as they arrive from env vars) are treated as chat ids.
    pub fn recipient(&self) -> Recipient {
        match self {
            ChatTarget::Id(id) => Recipient::Id(ChatId(*id)),
            ChatTarget::Name(name) => match name.trim().parse::<i64>() {
                Ok(id) => Recipient::Id(ChatId(id)),
                Err(_) => Recipient::ChannelUsername(name.trim().to_string()),
            },
        }
    }
}

impl std::fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatTarget::Id(id) => write!(f, "{}", id),
            ChatTarget::Name(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: ChatTarget,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_truncation_marker")]
    pub truncation_marker: String,
    /// Posts with media go out as a photo with the text as its caption
    #[serde(default = "default_true")]
    pub send_media_as_photo: bool,
    #[serde(default = "default_max_caption_length")]
    pub max_caption_length: usize,
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
    #[serde(default = "default_dedupe_retention_secs")]
    pub dedupe_retention_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliveryConfig {
    /// Minimum spacing between two Bot API calls
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,
    /// A batch must be sendable within this window at the configured spacing
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Wait used when a 429 response carries no retry hint
    #[serde(default = "default_throttle_wait_ms")]
    pub throttle_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_stats_cron")]
    pub stats_cron: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_stream_url() -> String {
    "wss://api.utrack.club/ws".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_miss_factor() -> u32 {
    3
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_multiplier() -> f64 {
    2.0
}

fn default_reconnect_jitter() -> f64 {
    0.2
}

fn default_stable_after_secs() -> u64 {
    60
}

fn default_max_message_length() -> usize {
    4096
}

fn default_truncation_marker() -> String {
    "\n…[truncated]".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_caption_length() -> usize {
    1024
}

fn default_dedupe_capacity() -> usize {
    10_000
}

fn default_dedupe_retention_secs() -> u64 {
    600
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_max_wait_ms() -> u64 {
    1_000
}

fn default_rate_limit_interval_ms() -> u64 {
    1_000
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    8_000
}

fn default_throttle_wait_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_stats_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_log_level() -> String {
    "info,feedgram=debug".to_string()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            auth_token: None,
            headers: HashMap::new(),
            subscribe_message: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_factor: default_heartbeat_miss_factor(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_jitter: default_reconnect_jitter(),
            stable_after_secs: default_stable_after_secs(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            truncation_marker: default_truncation_marker(),
            send_media_as_photo: default_true(),
            max_caption_length: default_max_caption_length(),
            dedupe_capacity: default_dedupe_capacity(),
            dedupe_retention_secs: default_dedupe_retention_secs(),
            batch_size: default_batch_size(),
            batch_max_wait_ms: default_batch_max_wait_ms(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            rate_limit_interval_ms: default_rate_limit_interval_ms(),
            rate_window_secs: default_rate_window_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            throttle_wait_ms: default_throttle_wait_ms(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stats_cron: default_stats_cron(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence longer than this marks the connection as degraded.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_miss_factor.max(1)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }
}

impl ProcessorConfig {
    pub fn dedupe_retention(&self) -> Duration {
        Duration::from_secs(self.dedupe_retention_secs)
    }

    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }
}

impl DeliveryConfig {
    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }

    pub fn throttle_wait(&self) -> Duration {
        Duration::from_millis(self.throttle_wait_ms)
    }

    /// Largest batch whose estimated send time fits the rate window.
    pub fn max_batch_for_window(&self) -> usize {
        if self.rate_limit_interval_ms == 0 {
            return usize::MAX;
        }
        let fits = (self.rate_window_secs * 1_000) / self.rate_limit_interval_ms;
        (fits as usize).max(1)
    }
}

impl RuntimeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Maps the forwarder's historical env var names onto config keys.
fn legacy_env_key(key: &str) -> &'static str {
    if key.eq_ignore_ascii_case("WSS_URL") {
        "stream.url"
    } else if key.eq_ignore_ascii_case("TELEGRAM_BOT_TOKEN") {
        "telegram.bot_token"
    } else {
        "telegram.chat_id"
    }
}

impl Config {
    /// Load configuration: defaults, then the optional TOML file, then env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::LoadError(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment
            .merge(Env::prefixed("FEEDGRAM_").split("__"))
            .merge(
                Env::raw()
                    .only(&["WSS_URL", "TELEGRAM_BOT_TOKEN", "TELEGRAM_CHAT_ID"])
                    .map(|key| legacy_env_key(key.as_str()).into()),
            );

        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the forwarder cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingConfig("telegram.bot_token".to_string()));
        }
        if self.telegram.chat_id.is_empty() {
            return Err(ConfigError::MissingConfig("telegram.chat_id".to_string()));
        }
        if self.stream.url.trim().is_empty() {
            return Err(ConfigError::MissingConfig("stream.url".to_string()));
        }
        if !(self.stream.url.starts_with("ws://") || self.stream.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "stream.url must be a ws:// or wss:// URL, got {}",
                self.stream.url
            )));
        }
        if self.stream.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "stream.heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.stream.reconnect_base_ms == 0
            || self.stream.reconnect_base_ms > self.stream.reconnect_max_ms
        {
            return Err(ConfigError::InvalidValue(format!(
                "stream.reconnect_base_ms ({}) must be positive and not exceed reconnect_max_ms ({})",
                self.stream.reconnect_base_ms, self.stream.reconnect_max_ms
            )));
        }
        if self.stream.reconnect_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "stream.reconnect_multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.stream.reconnect_jitter) {
            return Err(ConfigError::InvalidValue(
                "stream.reconnect_jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        let marker_len = self.processor.truncation_marker.chars().count();
        if marker_len >= self.processor.max_message_length {
            return Err(ConfigError::InvalidValue(
                "processor.truncation_marker must be shorter than max_message_length".to_string(),
            ));
        }
        if self.processor.send_media_as_photo && marker_len >= self.processor.max_caption_length {
            return Err(ConfigError::InvalidValue(
                "processor.truncation_marker must be shorter than max_caption_length".to_string(),
            ));
        }
        if self.processor.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "processor.batch_size must be positive".to_string(),
            ));
        }
        if self.processor.dedupe_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "processor.dedupe_capacity must be positive".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "delivery.max_attempts must be positive".to_string(),
            ));
        }
        if self.runtime.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "runtime.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Batch size after applying the rate window cap.
    pub fn effective_batch_size(&self) -> usize {
        self.processor
            .batch_size
            .min(self.delivery.max_batch_for_window())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.telegram.bot_token = "123:abc".to_string();
        config.telegram.chat_id = ChatTarget::Id(-100123);
        config
    }

    #[test]
    fn test_defaults_are_valid_once_credentials_set() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_bot_token_is_rejected() {
        let mut config = valid_config();
        config.telegram.bot_token.clear();
        match config.validate() {
            Err(ConfigError::MissingConfig(key)) => assert_eq!(key, "telegram.bot_token"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_chat_id_is_rejected() {
        let mut config = valid_config();
        config.telegram.chat_id = ChatTarget::Name("  ".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_non_websocket_url_is_rejected() {
        let mut config = valid_config();
        config.stream.url = "https://example.com/feed".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_marker_must_fit_in_caption() {
        let mut config = valid_config();
        config.processor.max_caption_length = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));

        config.processor.send_media_as_photo = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chat_target_recipient() {
        assert_eq!(
            ChatTarget::Name("-100500".to_string()).recipient(),
            Recipient::Id(ChatId(-100500))
        );
        assert_eq!(
            ChatTarget::Name("@feed_channel".to_string()).recipient(),
            Recipient::ChannelUsername("@feed_channel".to_string())
        );
        assert_eq!(ChatTarget::Id(42).recipient(), Recipient::Id(ChatId(42)));
    }

    #[test]
    fn test_effective_batch_size_respects_rate_window() {
        let mut config = valid_config();
        config.processor.batch_size = 100;
        config.delivery.rate_limit_interval_ms = 1_000;
        config.delivery.rate_window_secs = 30;
        assert_eq!(config.effective_batch_size(), 30);

        config.processor.batch_size = 5;
        assert_eq!(config.effective_batch_size(), 5);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
                [telegram]
                bot_token = "1:x"
                chat_id = "@news"

                [processor]
                batch_size = 3
                "#,
            ));
        let config: Config = figment.extract().unwrap();
        assert_eq!(config.telegram.bot_token, "1:x");
        assert_eq!(config.telegram.chat_id, ChatTarget::Name("@news".to_string()));
        assert_eq!(config.processor.batch_size, 3);
        assert_eq!(config.processor.max_message_length, 4096);
        assert_eq!(config.processor.max_caption_length, 1024);
        assert!(config.processor.send_media_as_photo);
        assert_eq!(config.stream.heartbeat_miss_factor, 3);
    }
}
