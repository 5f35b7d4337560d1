use std::time::Duration;

use chrono::{DateTime, Utc};

/// Classification of a raw feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Post,
    PlainMessage,
    Follow,
    ProfileUpdate,
    Heartbeat,
    Control,
}

impl EventKind {
    /// Stable tag used in dedupe keys and logs
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Post => "post",
            EventKind::PlainMessage => "message",
            EventKind::Follow => "follow",
            EventKind::ProfileUpdate => "profile_update",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Control => "control",
        }
    }
}

/// A post from the feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostPayload {
    pub id: Option<String>,
    /// TWEET, REPLY, RETWEET or QUOTE
    pub post_type: String,
    pub author_handle: String,
    pub display_name: Option<String>,
    /// Raw creation timestamp as sent upstream
    pub created_at: Option<String>,
    pub body: String,
    /// Links supplied alongside the body
    pub links: Vec<String>,
    pub media: Vec<String>,
    pub reply_to: Option<String>,
    pub mentions: Vec<Mention>,
}

/// A user mentioned in a post, with their bio when the feed includes it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mention {
    pub handle: String,
    pub description: Option<String>,
}

/// Someone followed, unfollowed, or changed a follow relation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowPayload {
    /// Upstream event type, e.g. `following.create`
    pub action: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub following_count: Option<u64>,
    pub followers_count: Option<u64>,
    pub post_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileChange {
    pub field: &'static str,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdatePayload {
    pub handle: String,
    pub display_name: Option<String>,
    pub changes: Vec<ProfileChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Post(PostPayload),
    Plain { body: String },
    Follow(FollowPayload),
    ProfileUpdate(ProfileUpdatePayload),
    Heartbeat,
    Control { name: String },
}

/// One event decoded from a stream frame. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(payload: Payload, received_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            received_at,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            Payload::Post(_) => EventKind::Post,
            Payload::Plain { .. } => EventKind::PlainMessage,
            Payload::Follow(_) => EventKind::Follow,
            Payload::ProfileUpdate(_) => EventKind::ProfileUpdate,
            Payload::Heartbeat => EventKind::Heartbeat,
            Payload::Control { .. } => EventKind::Control,
        }
    }
}

/// Rendered, length-capped message ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedMessage {
    pub kind: EventKind,
    pub text: String,
    pub dedupe_key: String,
    pub created_at: DateTime<Utc>,
    /// Sent as a photo with `caption` instead of `text` when present
    pub photo: Option<Photo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub url: String,
    /// `text` cut to the caption limit
    pub caption: String,
}

/// Messages delivered together, in arrival order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryBatch {
    pub messages: Vec<FormattedMessage>,
}

impl DeliveryBatch {
    pub fn new(messages: Vec<FormattedMessage>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FormattedMessage> {
        self.messages.iter()
    }

    /// Lower bound on the time needed to send the batch at the given call spacing
    pub fn estimated_send_time(&self, spacing: Duration) -> Duration {
        spacing * self.messages.len().saturating_sub(1) as u32
    }
}
