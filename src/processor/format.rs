//! Telegram HTML rendering of feed events.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::{EventKind, FollowPayload, PostPayload, ProfileUpdatePayload};

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("url pattern is valid"));
static ETHEREUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").expect("ethereum pattern is valid"));
static SOLANA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[1-9A-HJ-NP-Za-km-z]{32,44}\b").expect("solana pattern is valid")
});

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";
const TWITTER_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const DESCRIPTION_PREVIEW: usize = 200;
const MENTION_BIO_PREVIEW: usize = 100;

/// Crypto terms tagged alongside detected contract addresses, matched case-insensitively
const CRYPTO_KEYWORDS: &[&str] = &[
    "$BTC",
    "$ETH",
    "$SOL",
    "$USDT",
    "$USDC",
    "CA:",
    "CA =",
    "Contract:",
    "Contract Address",
    "Contract Addr",
    "Smart Contract",
    "Token Address",
    "Token",
    "DeFi",
    "NFT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Ethereum,
    Solana,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractAddress {
    pub chain: Chain,
    pub address: String,
}

/// Escape the three characters Telegram's HTML mode treats specially.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Links found in `body` followed by `extra`, first occurrence wins.
pub fn extract_links(body: &str, extra: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let found = URL_RE
        .find_iter(body)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '}']))
        .map(str::to_string);

    found
        .chain(extra.iter().cloned())
        .filter(|link| !link.is_empty() && seen.insert(link.clone()))
        .collect()
}

/// Token contract addresses mentioned in `body`, outside of URLs.
pub fn extract_contracts(body: &str) -> Vec<ContractAddress> {
    let text = URL_RE.replace_all(body, " ");
    let mut seen = HashSet::new();
    let mut contracts = Vec::new();

    for m in ETHEREUM_RE.find_iter(&text) {
        if seen.insert(m.as_str().to_string()) {
            contracts.push(ContractAddress {
                chain: Chain::Ethereum,
                address: m.as_str().to_string(),
            });
        }
    }
    for m in SOLANA_RE.find_iter(&text) {
        if seen.insert(m.as_str().to_string()) {
            contracts.push(ContractAddress {
                chain: Chain::Solana,
                address: m.as_str().to_string(),
            });
        }
    }
    contracts
}

/// Crypto keywords present in `text`, in list order.
pub fn extract_keywords(text: &str) -> Vec<&'static str> {
    let upper = text.to_uppercase();
    CRYPTO_KEYWORDS
        .iter()
        .copied()
        .filter(|keyword| upper.contains(&keyword.to_uppercase()))
        .collect()
}

/// Bullet lines for the contracts and keywords found in `text`.
fn contract_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = extract_contracts(text)
        .iter()
        .map(|contract| {
            let label = match contract.chain {
                Chain::Ethereum => "🔷 Ethereum",
                Chain::Solana => "🟣 Solana",
            };
            format!("{}: <code>{}</code>", label, contract.address)
        })
        .collect();

    let keywords = extract_keywords(text);
    if !keywords.is_empty() {
        lines.push(format!("🏷 Keywords: {}", escape_html(&keywords.join(", "))));
    }
    lines
}

/// Parse the timestamp shapes seen upstream. Unix values above 1e12 are milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(number) = raw.parse::<f64>() {
        let millis = if number > 1e12 { number } else { number * 1000.0 };
        return DateTime::from_timestamp_millis(millis as i64);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, TWITTER_FORMAT) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Render a timestamp for display; unparseable values are shown as received.
pub fn display_timestamp(raw: &str) -> String {
    match parse_timestamp(raw) {
        Some(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        None => escape_html(raw),
    }
}

fn post_emoji(post_type: &str) -> &'static str {
    match post_type {
        "REPLY" => "💬",
        "RETWEET" => "🔄",
        "QUOTE" => "💭",
        _ => "📝",
    }
}

fn author_line(handle: &str, display_name: Option<&str>) -> String {
    match display_name.filter(|name| !name.trim().is_empty()) {
        Some(name) => format!("<b>{}</b> (@{})", escape_html(name), escape_html(handle)),
        None => format!("<b>@{}</b>", escape_html(handle)),
    }
}

pub fn render_post(post: &PostPayload) -> String {
    let mut out = format!(
        "{} <b>{}</b> · {}\n",
        post_emoji(&post.post_type),
        escape_html(&post.post_type),
        author_line(&post.author_handle, post.display_name.as_deref())
    );
    if let Some(created_at) = &post.created_at {
        out.push_str(&format!("🕒 {}\n", display_timestamp(created_at)));
    }
    if let Some(reply_to) = &post.reply_to {
        out.push_str(&format!("↩️ Replying to @{}\n", escape_html(reply_to)));
    }

    if !post.body.trim().is_empty() {
        out.push_str(&format!("\n{}\n", escape_html(post.body.trim())));
    }

    if !post.mentions.is_empty() {
        let mentions: Vec<String> = post
            .mentions
            .iter()
            .map(|m| format!("@{}", escape_html(&m.handle)))
            .collect();
        out.push_str(&format!("\n👥 Mentions: {}\n", mentions.join(", ")));
    }

    let contracts = contract_lines(&post.body);
    if !contracts.is_empty() {
        out.push_str("\n🪙 <b>Contracts</b>\n");
        for line in &contracts {
            out.push_str(&format!("• {}\n", line));
        }
    }

    let mut mention_header = false;
    for mention in &post.mentions {
        let Some(bio) = mention.description.as_deref() else {
            continue;
        };
        let lines = contract_lines(bio);
        if lines.is_empty() {
            continue;
        }
        if !mention_header {
            out.push_str("\n🪙 <b>Mentioned accounts with contracts</b>\n");
            mention_header = true;
        }
        let preview: String = bio.trim().chars().take(MENTION_BIO_PREVIEW).collect();
        out.push_str(&format!(
            "• <b>@{}</b>: {}\n",
            escape_html(&mention.handle),
            escape_html(&preview)
        ));
        for line in &lines {
            out.push_str(&format!("  {}\n", line));
        }
    }

    let mut extra = post.links.clone();
    extra.extend(post.media.iter().cloned());
    let links = extract_links(&post.body, &extra);
    if !links.is_empty() {
        out.push_str("\n🔗 <b>Links</b>\n");
        for link in &links {
            out.push_str(&format!("• {}\n", escape_html(link)));
        }
    }

    if !post.media.is_empty() {
        out.push_str(&format!("🖼 Media: {} file(s)\n", post.media.len()));
    }
    if let Some(id) = &post.id {
        out.push_str(&format!(
            "\n📎 https://x.com/{}/status/{}\n",
            escape_html(&post.author_handle),
            escape_html(id)
        ));
    }

    out.trim_end().to_string()
}

pub fn render_plain(body: &str) -> String {
    format!("💬 <b>Message</b>\n\n{}", escape_html(body.trim()))
}

fn follow_heading(action: &str) -> (&'static str, &'static str) {
    match action {
        "following.create" => ("➕", "New following"),
        "following.update" => ("🔄", "Following updated"),
        "following.delete" => ("➖", "Unfollowed"),
        "follower.create" => ("👤", "New follower"),
        "follower.update" => ("🔄", "Follower updated"),
        "follower.delete" => ("👋", "Lost follower"),
        _ => ("📡", "Follow change"),
    }
}

pub fn render_follow(follow: &FollowPayload) -> String {
    let (emoji, title) = follow_heading(&follow.action);
    let mut out = format!(
        "{} <b>{}</b>\n\n{}\n",
        emoji,
        title,
        author_line(&follow.handle, follow.display_name.as_deref())
    );

    if let Some(description) = follow.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let preview: String = description.chars().take(DESCRIPTION_PREVIEW).collect();
        out.push_str(&format!("{}\n", escape_html(&preview)));
    }

    let counts: Vec<String> = [
        ("Following", follow.following_count),
        ("Followers", follow.followers_count),
        ("Posts", follow.post_count),
    ]
    .into_iter()
    .filter_map(|(label, value)| value.map(|v| format!("{}: {}", label, v)))
    .collect();
    if !counts.is_empty() {
        out.push_str(&format!("📊 {}\n", counts.join(" · ")));
    }

    out.push_str(&format!("🔗 https://x.com/{}", escape_html(&follow.handle)));
    out
}

pub fn render_profile_update(update: &ProfileUpdatePayload) -> String {
    let mut out = format!(
        "👤 <b>Profile updated</b>\n\n{}\n",
        author_line(&update.handle, update.display_name.as_deref())
    );

    if update.changes.is_empty() {
        out.push_str("\n📝 No field changes reported\n");
    } else {
        out.push_str("\n📝 <b>Changes</b>\n");
        for change in &update.changes {
            out.push_str(&format!(
                "• {}: {} → {}\n",
                change.field,
                escape_html(&change.before),
                escape_html(&change.after)
            ));
        }
    }

    out.push_str(&format!("🔗 https://x.com/{}", escape_html(&update.handle)));
    out
}

/// Cap `text` at `max_chars` characters, appending `marker` when cut.
/// A cut result is always exactly `max_chars` long. The kept prefix never ends
/// inside a tag or entity and has no unclosed tags; markup dropped from the end
/// is replaced by spaces before the marker.
pub fn truncate_message(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let keep = max_chars.saturating_sub(marker.chars().count());
    let cut = text
        .char_indices()
        .nth(keep)
        .map(|(i, _)| i)
        .unwrap_or(text.len());

    let head = drop_unclosed_tags(drop_partial_markup(&text[..cut]));
    let padding = keep - head.chars().count();
    format!("{}{}{}", head, " ".repeat(padding), marker)
}

fn drop_partial_markup(head: &str) -> &str {
    let mut head = head;
    if let Some(lt) = head.rfind('<') {
        if !head[lt..].contains('>') {
            head = &head[..lt];
        }
    }
    if let Some(amp) = head.rfind('&') {
        if !head[amp..].contains(';') {
            head = &head[..amp];
        }
    }
    head
}

fn drop_unclosed_tags(head: &str) -> &str {
    let mut open: Vec<(usize, &str)> = Vec::new();
    let mut pos = 0;

    while let Some(offset) = head[pos..].find('<') {
        let start = pos + offset;
        let Some(len) = head[start..].find('>') else {
            break;
        };
        let tag = &head[start + 1..start + len];
        if let Some(name) = tag.strip_prefix('/') {
            if let Some(idx) = open.iter().rposition(|(_, open_name)| *open_name == name.trim()) {
                open.truncate(idx);
            }
        } else {
            let name = tag.split_whitespace().next().unwrap_or_default();
            open.push((start, name));
        }
        pos = start + len + 1;
    }

    match open.first() {
        Some((start, _)) => &head[..*start],
        None => head,
    }
}

/// Lowercased body with runs of whitespace collapsed.
pub fn normalize_body(body: &str) -> String {
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable content identity over kind, author and normalized body.
pub fn dedupe_key(kind: EventKind, author: Option<&str>, body: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(author.unwrap_or_default().to_lowercase().as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(normalize_body(body).as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Mention, ProfileChange};
    use chrono::TimeZone;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn test_links_keep_order_and_drop_duplicates() {
        let links = extract_links(
            "see https://b.example/x, then https://a.example and https://b.example/x.",
            &["https://a.example".to_string(), "https://c.example/img.png".to_string()],
        );
        assert_eq!(
            links,
            vec![
                "https://b.example/x",
                "https://a.example",
                "https://c.example/img.png"
            ]
        );
    }

    #[test]
    fn test_contract_detection() {
        let body = "CA 0x1234567890abcdef1234567890ABCDEF12345678 and \
                    So11111111111111111111111111111111111111112 again \
                    0x1234567890abcdef1234567890ABCDEF12345678 https://x.co/7EcDhSYGxXyscszYEp35KHN8vvw3svAuLKTzXwCFLtV";
        let contracts = extract_contracts(body);
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].chain, Chain::Ethereum);
        assert_eq!(contracts[1].chain, Chain::Solana);
        assert_eq!(contracts[1].address, "So11111111111111111111111111111111111111112");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 8, 1, 14, 30, 0).unwrap();
        assert_eq!(parse_timestamp("1754058600"), Some(expected));
        assert_eq!(parse_timestamp("1754058600000"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-01T14:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-01T16:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("Fri Aug 01 14:30:00 +0000 2025"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-01 14:30:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(display_timestamp("1754058600"), "2025-08-01 14:30:00 UTC");
        assert_eq!(display_timestamp("soon <ish>"), "soon &lt;ish&gt;");
    }

    #[test]
    fn test_render_post() {
        let post = PostPayload {
            id: Some("42".to_string()),
            post_type: "REPLY".to_string(),
            author_handle: "alice".to_string(),
            display_name: Some("Alice & Co".to_string()),
            created_at: Some("2025-08-01T14:30:00Z".to_string()),
            body: "hello <world> https://x.co".to_string(),
            links: vec!["https://x.co".to_string()],
            media: vec!["https://img.example/1.jpg".to_string()],
            reply_to: Some("bob".to_string()),
            mentions: vec![Mention {
                handle: "bob".to_string(),
                description: Some("just vibes".to_string()),
            }],
        };
        let text = render_post(&post);

        assert!(text.starts_with("💬 <b>REPLY</b> · <b>Alice &amp; Co</b> (@alice)"));
        assert!(text.contains("🕒 2025-08-01 14:30:00 UTC"));
        assert!(text.contains("↩️ Replying to @bob"));
        assert!(text.contains("hello &lt;world&gt; https://x.co"));
        assert!(text.contains("• https://x.co\n• https://img.example/1.jpg"));
        assert_eq!(text.matches("• https://x.co").count(), 1);
        assert!(text.contains("🖼 Media: 1 file(s)"));
        assert!(text.ends_with("📎 https://x.com/alice/status/42"));
        assert!(!text.contains("Mentioned accounts"));
    }

    #[test]
    fn test_keywords_are_tagged_case_insensitively() {
        assert_eq!(
            extract_keywords("buying $eth, ca: below"),
            vec!["$ETH", "CA:"]
        );
        assert!(extract_keywords("nothing to see").is_empty());

        let post = PostPayload {
            post_type: "TWEET".to_string(),
            author_handle: "alice".to_string(),
            body: "New NFT drop".to_string(),
            ..PostPayload::default()
        };
        let text = render_post(&post);
        assert!(text.contains("🪙 <b>Contracts</b>\n• 🏷 Keywords: NFT"));
    }

    #[test]
    fn test_mentioned_bios_with_contracts_are_listed() {
        let post = PostPayload {
            post_type: "TWEET".to_string(),
            author_handle: "alice".to_string(),
            body: "shoutout @bob @carol".to_string(),
            mentions: vec![
                Mention {
                    handle: "bob".to_string(),
                    description: Some(
                        "CA: 0x1234567890abcdef1234567890ABCDEF12345678 <dev>".to_string(),
                    ),
                },
                Mention {
                    handle: "carol".to_string(),
                    description: Some("photographer".to_string()),
                },
                Mention {
                    handle: "dan".to_string(),
                    description: None,
                },
            ],
            ..PostPayload::default()
        };
        let text = render_post(&post);

        assert!(text.contains("👥 Mentions: @bob, @carol, @dan"));
        assert!(text.contains("🪙 <b>Mentioned accounts with contracts</b>\n• <b>@bob</b>: CA: 0x"));
        assert!(text.contains("&lt;dev&gt;"));
        assert!(text.contains(
            "  🔷 Ethereum: <code>0x1234567890abcdef1234567890ABCDEF12345678</code>\n  🏷 Keywords: CA:"
        ));
        assert!(!text.contains("<b>@carol</b>"));
        assert!(!text.contains("🪙 <b>Contracts</b>"));
    }

    #[test]
    fn test_render_plain_and_follow() {
        assert_eq!(render_plain(" hi & bye "), "💬 <b>Message</b>\n\nhi &amp; bye");

        let follow = FollowPayload {
            action: "follower.create".to_string(),
            handle: "carol".to_string(),
            followers_count: Some(10),
            ..FollowPayload::default()
        };
        let text = render_follow(&follow);
        assert!(text.starts_with("👤 <b>New follower</b>"));
        assert!(text.contains("📊 Followers: 10"));
        assert!(text.ends_with("🔗 https://x.com/carol"));
    }

    #[test]
    fn test_render_profile_update() {
        let update = ProfileUpdatePayload {
            handle: "dave".to_string(),
            display_name: None,
            changes: vec![ProfileChange {
                field: "name",
                before: "Dave".to_string(),
                after: "Dave <3".to_string(),
            }],
        };
        let text = render_profile_update(&update);
        assert!(text.contains("• name: Dave → Dave &lt;3"));
    }

    #[test]
    fn test_truncation_boundary() {
        let exact = "a".repeat(20);
        assert_eq!(truncate_message(&exact, 20, "…"), exact);

        let over = "a".repeat(21);
        let cut = truncate_message(&over, 20, "…");
        assert_eq!(cut.chars().count(), 20);
        assert_eq!(cut, format!("{}…", "a".repeat(19)));
    }

    #[test]
    fn test_truncation_counts_characters_not_bytes() {
        let text = "é".repeat(30);
        let cut = truncate_message(&text, 10, "[…]");
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with("[…]"));
    }

    #[test]
    fn test_truncation_never_leaves_broken_markup() {
        let text = "<b>header</b> tail &amp; more text here";
        assert_eq!(truncate_message(text, 21, "…"), "<b>header</b> tail  …");

        let inside_tag = "intro <a href=\"https://x.co\">link</a>";
        assert_eq!(
            truncate_message(inside_tag, 16, "…"),
            format!("intro{}…", " ".repeat(10))
        );

        let unclosed = "<b>bold text that goes on and on</b>";
        assert_eq!(truncate_message(unclosed, 12, "…"), format!("{}…", " ".repeat(11)));
    }

    #[test]
    fn test_truncation_inside_entity_keeps_exact_length() {
        let text = "&amp;".repeat(10);
        let cut = truncate_message(&text, 20, "…");
        assert_eq!(cut.chars().count(), 20);
        assert_eq!(cut, format!("&amp;&amp;&amp;{}…", " ".repeat(4)));

        let spaced = "word ".repeat(10);
        let cut = truncate_message(&spaced, 11, "…");
        assert_eq!(cut, "word word …");
    }

    #[test]
    fn test_dedupe_key_normalizes_body() {
        let a = dedupe_key(EventKind::Post, Some("Alice"), "Hello   World");
        let b = dedupe_key(EventKind::Post, Some("alice"), "hello world");
        let c = dedupe_key(EventKind::PlainMessage, Some("alice"), "hello world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
