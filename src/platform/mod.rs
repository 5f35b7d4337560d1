pub mod telegram;

use async_trait::async_trait;

use crate::error::SendFailure;

/// Outbound chat platform the delivery client talks to
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send one HTML-formatted message to the configured chat
    async fn send_text(&self, text: &str) -> Result<(), SendFailure>;

    /// Send a photo by URL with an HTML caption
    async fn send_photo(&self, url: &str, caption: &str) -> Result<(), SendFailure>;

    /// Check credentials; returns the bot's username
    async fn verify(&self) -> Result<String, SendFailure>;
}
