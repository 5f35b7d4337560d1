//! Decoding of upstream feed frames into [`RawEvent`]s.
//!
//! Frames are JSON objects tagged by `type`; a JSON array carries several events.
//! Anything that does not start like JSON is forwarded as a plain message.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::event::{
    FollowPayload, Mention, Payload, PostPayload, ProfileChange, ProfileUpdatePayload, RawEvent,
};

const HEARTBEAT_TYPES: &[&str] = &["ping", "pong", "heartbeat", "ack", "keepalive"];
const CONTROL_TYPES: &[&str] = &[
    "welcome",
    "connected",
    "subscribe",
    "subscribed",
    "unsubscribed",
    "control",
    "error",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePost {
    id: Option<Value>,
    #[serde(rename = "type")]
    post_type: Option<String>,
    author: WireUser,
    body: WireBody,
    text: Option<String>,
    content: Option<String>,
    created_at: Option<Value>,
    media: WireMedia,
    reply: Option<WireUser>,
    subtweet: Option<WireSubtweet>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSubtweet {
    author: WireUser,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireUser {
    handle: Option<String>,
    /// Set on mentions; other users carry it under `profile`
    description: Option<Value>,
    profile: WireProfile,
    public_metrics: Option<WireMetrics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireProfile {
    name: Option<String>,
    description: Option<Value>,
    location: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMetrics {
    following_count: Option<u64>,
    followers_count: Option<u64>,
    tweet_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireBody {
    text: Option<String>,
    mentions: Vec<WireUser>,
    urls: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMedia {
    images: Vec<WireUrl>,
    videos: Vec<WireUrl>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireUrl {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireProfileUpdate {
    user: WireUser,
    before: WireUser,
}

/// Events decoded from one frame, plus the array elements that had to be dropped
#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub events: Vec<RawEvent>,
    pub rejected: Vec<ProtocolError>,
}

/// Decode one text frame. Heartbeats and control frames come back as events too.
/// A bad element of an array frame is rejected on its own; the rest still decode.
pub fn parse_frame(text: &str, received_at: DateTime<Utc>) -> Result<DecodedFrame, ProtocolError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::UnexpectedShape("empty frame".to_string()));
    }

    let mut frame = DecodedFrame::default();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)?;
        decode_value(value, received_at, &mut frame)?;
        return Ok(frame);
    }

    frame.events.push(RawEvent::new(
        Payload::Plain {
            body: trimmed.to_string(),
        },
        received_at,
    ));
    Ok(frame)
}

fn decode_value(
    value: Value,
    received_at: DateTime<Utc>,
    frame: &mut DecodedFrame,
) -> Result<(), ProtocolError> {
    match value {
        Value::Array(items) => {
            for item in items {
                if let Err(e) = decode_value(item, received_at, frame) {
                    frame.rejected.push(e);
                }
            }
        }
        Value::Object(map) => {
            let payload = payload_from_object(map)?;
            frame.events.push(RawEvent::new(payload, received_at));
        }
        Value::Null => return Err(ProtocolError::UnexpectedShape("null frame".to_string())),
        other => frame.events.push(RawEvent::new(
            Payload::Plain {
                body: other.to_string(),
            },
            received_at,
        )),
    }
    Ok(())
}

fn payload_from_object(mut map: Map<String, Value>) -> Result<Payload, ProtocolError> {
    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();

    if HEARTBEAT_TYPES.contains(&kind.as_str()) {
        return Ok(Payload::Heartbeat);
    }

    if let Some(tweet) = map.remove("tweet") {
        if !tweet.is_object() {
            return Err(ProtocolError::UnexpectedShape(
                "`tweet` is not an object".to_string(),
            ));
        }
        let wire: WirePost = serde_json::from_value(tweet)?;
        return Ok(Payload::Post(post_from_wire(wire)));
    }

    if kind == "profile.update" {
        if let Some(profile) = map.remove("profile") {
            let wire: WireProfileUpdate = serde_json::from_value(profile)?;
            return Ok(Payload::ProfileUpdate(profile_update_from_wire(wire)));
        }
    }

    if kind.starts_with("following.") || kind.starts_with("follower.") {
        if let Some(user) = map.remove("user") {
            let wire: WireUser = serde_json::from_value(user)?;
            return Ok(Payload::Follow(follow_from_wire(kind, wire)));
        }
    }

    if CONTROL_TYPES.contains(&kind.as_str()) {
        return Ok(Payload::Control { name: kind });
    }

    let body = serde_json::to_string_pretty(&Value::Object(map))?;
    Ok(Payload::Plain { body })
}

fn post_from_wire(wire: WirePost) -> PostPayload {
    let body = wire
        .body
        .text
        .or(wire.text)
        .or(wire.content)
        .unwrap_or_default();

    let links = wire.body.urls.iter().filter_map(url_of).collect();
    let media = wire
        .media
        .images
        .into_iter()
        .chain(wire.media.videos)
        .filter_map(|m| m.url)
        .filter(|url| !url.is_empty())
        .collect();
    let subtweet_author = wire.subtweet.map(|s| s.author).unwrap_or_default();
    let mentions = wire
        .body
        .mentions
        .into_iter()
        .filter_map(|m| {
            let handle = m.handle.filter(|h| !h.is_empty())?;
            // Replies carry the quoted author's full profile
            let description = m.description.as_ref().and_then(description_text).or_else(|| {
                (subtweet_author.handle.as_deref() == Some(handle.as_str()))
                    .then(|| subtweet_author.profile.description.as_ref())
                    .flatten()
                    .and_then(description_text)
            });
            Some(Mention {
                handle,
                description,
            })
        })
        .collect();

    PostPayload {
        id: wire.id.as_ref().and_then(scalar_string),
        post_type: wire
            .post_type
            .map(|t| t.to_ascii_uppercase())
            .unwrap_or_else(|| "TWEET".to_string()),
        author_handle: wire.author.handle.unwrap_or_else(|| "unknown".to_string()),
        display_name: wire.author.profile.name,
        created_at: wire.created_at.as_ref().and_then(scalar_string),
        body,
        links,
        media,
        reply_to: wire.reply.and_then(|r| r.handle),
        mentions,
    }
}

fn follow_from_wire(action: String, wire: WireUser) -> FollowPayload {
    let metrics = wire.public_metrics.unwrap_or_default();
    FollowPayload {
        action,
        handle: wire.handle.unwrap_or_else(|| "unknown".to_string()),
        display_name: wire.profile.name,
        description: wire.profile.description.as_ref().and_then(description_text),
        following_count: metrics.following_count,
        followers_count: metrics.followers_count,
        post_count: metrics.tweet_count,
    }
}

fn profile_update_from_wire(wire: WireProfileUpdate) -> ProfileUpdatePayload {
    let after = &wire.user.profile;
    let before = &wire.before.profile;

    let fields: [(&'static str, Option<String>, Option<String>); 4] = [
        ("name", before.name.clone(), after.name.clone()),
        (
            "description",
            before.description.as_ref().and_then(description_text),
            after.description.as_ref().and_then(description_text),
        ),
        ("location", before.location.clone(), after.location.clone()),
        ("url", before.url.clone(), after.url.clone()),
    ];

    let changes = fields
        .into_iter()
        .filter(|(_, old, new)| old != new)
        .map(|(field, old, new)| ProfileChange {
            field,
            before: old.unwrap_or_default(),
            after: new.unwrap_or_default(),
        })
        .collect();

    ProfileUpdatePayload {
        handle: wire.user.handle.unwrap_or_else(|| "unknown".to_string()),
        display_name: wire.user.profile.name,
        changes,
    }
}

/// Ids and timestamps arrive as either strings or numbers
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Profile descriptions are either a string or `{ "text": ... }`
fn description_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn url_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["expanded_url", "url"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}
