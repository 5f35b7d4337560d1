use std::time::Duration;

use thiserror::Error;

/// Startup configuration problems. The only errors allowed to stop the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Failures of the inbound connection. Always answered by a reconnect.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid stream request: {0}")]
    InvalidRequest(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// A frame that could not be turned into an event. The frame is dropped.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON frame: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("Binary frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Unexpected frame shape: {0}")]
    UnexpectedShape(String),
}

/// Outcome of a single Bot API call, as classified by the chat client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendFailure {
    #[error("Rate limited (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

/// Terminal failure of one message after the retry policy gave up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Still rate limited after {attempts} attempt(s)")]
    Throttled { attempts: u32 },

    #[error("Transient failure after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },

    #[error("Rejected by the chat API: {0}")]
    Permanent(String),

    #[error("Delivery cancelled by shutdown")]
    Cancelled,
}

/// First `max` characters of a payload, for log context.
pub fn excerpt(text: &str, max: usize) -> String {
    let mut out: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo…");
        assert_eq!(excerpt("short", 10), "short");
    }
}
