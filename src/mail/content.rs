//! Message content decoding.
//!
//! Gmail hands back a MIME tree with base64url bodies. This module turns
//! it into plain strings: transport decoding with padding correction, a
//! charset fallback chain that never fails, a depth-first walk for the
//! first text/plain and first text/html parts, and RFC 2047 header decoding.

use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use regex::Regex;

use crate::mail::unsubscribe::extract_unsubscribe_url;
use crate::mail::{MessagePart, RawMessage};
use crate::store::NewMessage;

static CHARSET_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*"?([^";\s]+)"#).expect("charset regex")
});

/// Share of U+FFFD tolerated before lossy UTF-8 is rejected in favor of sniffing.
const MAX_REPLACEMENT_RATIO: f64 = 0.01;

/// Decode base64url data, correcting missing padding.
pub fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    let mut cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    let missing = (4 - cleaned.len() % 4) % 4;
    cleaned.extend(std::iter::repeat_n('=', missing));

    URL_SAFE
        .decode(&cleaned)
        .or_else(|_| URL_SAFE_NO_PAD.decode(cleaned.trim_end_matches('=')))
        .or_else(|_| STANDARD.decode(&cleaned))
        .ok()
}

/// Decode bytes to text.
///
/// Order: declared charset (strict), UTF-8 (accepting a small amount of
/// replacement), statistical sniffing (strict), then windows-1252, which
/// maps every byte.
pub fn decode_text(bytes: &[u8], declared_charset: Option<&str>) -> String {
    let declared = declared_charset.and_then(|label| Encoding::for_label(label.trim().as_bytes()));
    if let Some(text) =
        declared.and_then(|encoding| encoding.decode_without_bom_handling_and_without_replacement(bytes))
    {
        return text.into_owned();
    }

    let (utf8, _, had_errors) = UTF_8.decode(bytes);
    if !had_errors {
        return utf8.into_owned();
    }
    let total = utf8.chars().count().max(1);
    let replaced = utf8.chars().filter(|&c| c == '\u{FFFD}').count();
    if (replaced as f64) / (total as f64) <= MAX_REPLACEMENT_RATIO {
        return utf8.into_owned();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    let guess = detector.guess(None, true);
    if let Some(text) = guess.decode_without_bom_handling_and_without_replacement(bytes) {
        return text.into_owned();
    }

    WINDOWS_1252.decode_without_bom_handling(bytes).0.into_owned()
}

/// Decode HTML character references (`&amp;`, `&#39;`, …).
pub fn unescape_html(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

/// Decode RFC 2047 encoded-words in a header value.
pub fn decode_header_value(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }
    let flattened = value.replace(['\r', '\n'], " ");
    let synthetic = format!("Subject: {flattened}\r\n\r\n");
    mail_parser::MessageParser::default()
        .parse(synthetic.as_bytes())
        .and_then(|m| m.subject().map(str::to_string))
        .unwrap_or(flattened)
}

/// Render Gmail's `internalDate` (epoch ms) as a UTC timestamp.
pub fn parse_internal_date(internal_date: Option<&str>) -> Option<DateTime<Utc>> {
    let ms: i64 = internal_date?.trim().parse().ok()?;
    DateTime::from_timestamp_millis(ms)
}

/// First text/plain and first text/html bodies found in a MIME tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bodies {
    /// Plain text with HTML entities decoded.
    pub text: Option<String>,
    /// HTML as sent.
    pub html: Option<String>,
}

impl Bodies {
    pub fn from_part(part: &MessagePart) -> Self {
        let mut bodies = Self::default();
        collect_bodies(part, &mut bodies);
        bodies
    }

    /// Preferred stored body: plain text, else HTML.
    pub fn primary(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.html.as_deref())
    }

    /// Body to mine for links: HTML, else plain text.
    pub fn for_links(&self) -> Option<&str> {
        self.html.as_deref().or(self.text.as_deref())
    }
}

fn collect_bodies(part: &MessagePart, out: &mut Bodies) {
    if out.text.is_some() && out.html.is_some() {
        return;
    }

    if !part.parts.is_empty() {
        for child in &part.parts {
            collect_bodies(child, out);
        }
        return;
    }

    if !part.filename.is_empty() {
        return;
    }
    let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) else {
        return;
    };

    let mime = part.mime_type.to_ascii_lowercase();
    let wants_text = mime.starts_with("text/plain") && out.text.is_none();
    let wants_html = mime.starts_with("text/html") && out.html.is_none();
    if !wants_text && !wants_html {
        return;
    }

    let Some(bytes) = decode_base64url(data) else {
        return;
    };
    let charset = part
        .header("Content-Type")
        .and_then(|ct| CHARSET_PARAM.captures(ct))
        .map(|c| c[1].to_string());
    let decoded = decode_text(&bytes, charset.as_deref());

    if wants_text {
        out.text = Some(unescape_html(&decoded));
    } else {
        out.html = Some(decoded);
    }
}

/// A remote message reduced to the fields the pipelines store and inspect.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub external_id: String,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub bodies: Bodies,
    pub list_unsubscribe: Option<String>,
}

impl ParsedMessage {
    pub fn from_raw(raw: &RawMessage) -> Self {
        let header = |name: &str| {
            raw.payload
                .as_ref()
                .and_then(|p| p.header(name))
                .map(decode_header_value)
        };

        Self {
            external_id: raw.id.clone(),
            sender: header("From"),
            subject: header("Subject"),
            received_at: parse_internal_date(raw.internal_date.as_deref()),
            snippet: raw.snippet.as_deref().map(unescape_html),
            bodies: raw
                .payload
                .as_ref()
                .map(Bodies::from_part)
                .unwrap_or_default(),
            list_unsubscribe: raw
                .payload
                .as_ref()
                .and_then(|p| p.header("List-Unsubscribe"))
                .map(str::to_string),
        }
    }

    /// Parse a stored `raw_json` column back into content.
    pub fn from_raw_json(raw_json: &str) -> Option<Self> {
        serde_json::from_str::<RawMessage>(raw_json)
            .ok()
            .map(|raw| Self::from_raw(&raw))
    }

    pub fn unsubscribe_url(&self) -> Option<String> {
        extract_unsubscribe_url(
            self.list_unsubscribe.as_deref(),
            self.bodies.for_links().unwrap_or_default(),
        )
    }

    pub fn into_new_message(self, user_id: i64, raw_json: Option<String>) -> NewMessage {
        let body = self.bodies.primary().map(str::to_string);
        NewMessage {
            user_id,
            external_id: self.external_id,
            sender: self.sender,
            subject: self.subject,
            received_at: self.received_at,
            body,
            snippet: self.snippet,
            raw_json,
        }
    }
}
