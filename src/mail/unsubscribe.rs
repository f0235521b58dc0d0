//! Unsubscribe link discovery.
//!
//! Sources, in priority order:
//! 1. `List-Unsubscribe` header: `<https://…>` entries (mailto skipped),
//!    then any bare http(s) URL in the header
//! 2. HTML anchors whose href mentions unsubscribe / opt-out / remove /
//!    manage-preferences
//! 3. Plain-text URLs containing those keywords

use std::sync::LazyLock;

use regex::Regex;

static HEADER_BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("bracketed header regex"));

static HEADER_DIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"]+"#).expect("direct header regex"));

static HREF_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?is)<a[^>]+href\s*=\s*["']([^"']*unsubscribe[^"']*)["']"#,
        r#"(?is)<a[^>]+href\s*=\s*["']([^"']*opt[_-]?out[^"']*)["']"#,
        r#"(?is)<a[^>]+href\s*=\s*["']([^"']*remove[^"']*)["']"#,
        r#"(?is)<a[^>]+href\s*=\s*["']([^"']*manage[_-]?preferences[^"']*)["']"#,
        r#"(?is)href\s*=\s*["']([^"']*unsubscribe[^"']*)["']"#,
        r#"(?is)href\s*=\s*["']([^"']*opt[_-]?out[^"']*)["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("href regex"))
    .collect()
});

static TEXT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)https?://[^\s<>"')]+unsubscribe[^\s<>"')]*"#,
        r#"(?i)https?://[^\s<>"')]+opt[_-]?out[^\s<>"')]*"#,
        r#"(?i)https?://[^\s<>"')]+remove[^\s<>"')]*"#,
        r#"(?i)https?://[^\s<>"')]+(?:manage|email)[_-]?preferences[^\s<>"')]*"#,
        r#"(?i)https?://[^\s<>"')]+preferences[^\s<>"')]*"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("text url regex"))
    .collect()
});

static FIRST_DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://([^/\s"'<>]+)"#).expect("domain regex"));

const LINK_KEYWORDS: &[&str] = &["unsubscribe", "opt", "remove", "preferences"];

/// Find an unsubscribe URL from the `List-Unsubscribe` header and/or a body
/// (HTML preferred by callers).
pub fn extract_unsubscribe_url(list_unsubscribe: Option<&str>, body: &str) -> Option<String> {
    if let Some(url) = list_unsubscribe.and_then(from_header) {
        return Some(url);
    }
    if body.is_empty() {
        return None;
    }
    from_html(body).or_else(|| from_text(body))
}

fn from_header(header: &str) -> Option<String> {
    for cap in HEADER_BRACKETED.captures_iter(header) {
        let entry = cap[1].trim();
        if is_http(entry) {
            return Some(strip_trailing(entry));
        }
    }
    HEADER_DIRECT
        .find(header)
        .map(|m| strip_trailing(m.as_str()))
}

fn from_html(body: &str) -> Option<String> {
    for pattern in HREF_PATTERNS.iter() {
        for cap in pattern.captures_iter(body) {
            let href = html_escape::decode_html_entities(cap[1].trim()).into_owned();
            if let Some(url) = resolve_href(&href, body) {
                return Some(url);
            }
        }
    }
    None
}

fn resolve_href(href: &str, body: &str) -> Option<String> {
    if is_http(href) {
        let lower = href.to_ascii_lowercase();
        return LINK_KEYWORDS
            .iter()
            .any(|k| lower.contains(k))
            .then(|| strip_trailing(href));
    }
    if let Some(rest) = href.strip_prefix("//") {
        return Some(strip_trailing(&format!("https://{rest}")));
    }
    if href.starts_with('/') {
        let domain = FIRST_DOMAIN.captures(body)?;
        return Some(strip_trailing(&format!("https://{}{href}", &domain[1])));
    }
    None
}

fn from_text(body: &str) -> Option<String> {
    TEXT_PATTERNS
        .iter()
        .find_map(|p| p.find(body))
        .map(|m| strip_trailing(m.as_str()))
}

fn is_http(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn strip_trailing(url: &str) -> String {
    url.trim_end_matches(['.', ',', ';', ':', '!', '?', ')'])
        .to_string()
}
