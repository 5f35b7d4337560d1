//! Turns raw feed events into deliverable Telegram messages.

pub mod batch;
pub mod dedupe;
pub mod format;

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProcessorConfig;
use crate::event::{DeliveryBatch, FormattedMessage, Payload, Photo, RawEvent};
use crate::stats::Statistics;

use self::batch::Batcher;
use self::dedupe::DedupeWindow;
use self::format::{
    dedupe_key, parse_timestamp, render_follow, render_plain, render_post, render_profile_update,
    truncate_message,
};

const SLOW_INGEST_MS: i64 = 1_000;

pub struct MessageProcessor {
    config: ProcessorConfig,
    dedupe: DedupeWindow,
    batcher: Batcher,
    stats: Arc<Statistics>,
}

impl MessageProcessor {
    pub fn new(config: ProcessorConfig, batch_size: usize, stats: Arc<Statistics>) -> Self {
        let dedupe = DedupeWindow::new(config.dedupe_capacity, config.dedupe_retention());
        let batcher = Batcher::new(batch_size, config.batch_max_wait());
        Self {
            config,
            dedupe,
            batcher,
            stats,
        }
    }

    /// Format an event, or `None` for heartbeats, control frames and duplicates.
    pub fn process_at(&mut self, event: &RawEvent, now: Instant) -> Option<FormattedMessage> {
        let kind = event.kind();
        let mut created_at = event.received_at;
        let mut photo_url = None;

        let (text, author, identity) = match &event.payload {
            Payload::Heartbeat => return None,
            Payload::Control { name } => {
                debug!("Control frame from stream: {}", name);
                return None;
            }
            Payload::Post(post) => {
                if let Some(created) = post.created_at.as_deref().and_then(parse_timestamp) {
                    created_at = created;
                    let latency = (event.received_at - created).num_milliseconds();
                    if latency > SLOW_INGEST_MS {
                        warn!("Slow ingest for @{}: {}ms behind", post.author_handle, latency);
                    } else {
                        debug!("Ingest latency for @{}: {}ms", post.author_handle, latency);
                    }
                }
                let identity = if post.body.trim().is_empty() {
                    post.links.iter().chain(&post.media).cloned().collect::<Vec<_>>().join(" ")
                } else {
                    post.body.clone()
                };
                photo_url = post.media.first().cloned();
                (render_post(post), Some(post.author_handle.as_str()), identity)
            }
            Payload::Plain { body } => (render_plain(body), None, body.clone()),
            Payload::Follow(follow) => (
                render_follow(follow),
                Some(follow.handle.as_str()),
                follow.action.clone(),
            ),
            Payload::ProfileUpdate(update) => {
                let identity = update
                    .changes
                    .iter()
                    .map(|c| format!("{}={}", c.field, c.after))
                    .collect::<Vec<_>>()
                    .join(" ");
                (render_profile_update(update), Some(update.handle.as_str()), identity)
            }
        };

        let key = dedupe_key(kind, author, &identity);
        if self.dedupe.check_and_insert(&key, now) {
            self.stats.record_duplicate();
            debug!(
                "Dropping duplicate {} (window holds {} keys)",
                kind.as_str(),
                self.dedupe.len()
            );
            return None;
        }

        let photo = photo_url
            .filter(|_| self.config.send_media_as_photo)
            .map(|url| Photo {
                url,
                caption: truncate_message(
                    &text,
                    self.config.max_caption_length,
                    &self.config.truncation_marker,
                ),
            });

        let length = text.chars().count();
        let text = truncate_message(
            &text,
            self.config.max_message_length,
            &self.config.truncation_marker,
        );
        if length > self.config.max_message_length {
            info!(
                "Truncated {} message from {} to {} chars",
                kind.as_str(),
                length,
                self.config.max_message_length
            );
        }

        Some(FormattedMessage {
            kind,
            text,
            dedupe_key: key,
            created_at,
            photo,
        })
    }

    /// Process an event and add it to the pending batch.
    /// Returns a batch when this message filled one.
    pub fn accept(&mut self, event: &RawEvent) -> Option<DeliveryBatch> {
        self.accept_at(event, Instant::now())
    }

    pub fn accept_at(&mut self, event: &RawEvent, now: Instant) -> Option<DeliveryBatch> {
        let message = self.process_at(event, now)?;
        self.batcher.push(message, now)
    }

    /// The pending batch, once it has waited long enough.
    pub fn flush_due(&mut self) -> Option<DeliveryBatch> {
        self.flush_due_at(Instant::now())
    }

    pub fn flush_due_at(&mut self, now: Instant) -> Option<DeliveryBatch> {
        self.batcher.flush_due(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.batcher.deadline()
    }

    /// Close the pending partial batch at shutdown.
    pub fn drain(&mut self) -> Option<DeliveryBatch> {
        self.batcher.take()
    }
}
