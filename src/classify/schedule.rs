//! Meeting time normalization and date-relative resolution.
//!
//! Times are local wall-clock values rendered as `YYYY-MM-DDTHH:MM:SS`.
//! When the classifier gives no usable start time, the subject and body are
//! scanned for a day phrase (today / tonight / tomorrow) and an hour
//! expression, both relative to the message date.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

static TWELVE_HOUR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(1[0-2]|0?[1-9])(?::([0-5]\d))?\s*(a\.m\.|p\.m\.|am\b|pm\b)")
        .expect("12-hour regex")
});

static NOON_MIDNIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(noon|midnight)\b").expect("noon regex"));

static CLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([01]?\d|2[0-3]):([0-5]\d)\b").expect("clock regex"));

static AT_BARE_HOUR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bat\s+(1[0-2]|0?[1-9])\b").expect("bare hour regex"));

static TOMORROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btomorrow\b").expect("tomorrow regex"));

/// Parse the timestamp shapes classifiers return and render them in
/// [`TIMESTAMP_FORMAT`]. Offsets are dropped; the wall-clock time is kept.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    parse_timestamp(raw).map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Hour and minute mentioned in free text, first matching rule wins.
///
/// Bare hours 1 to 11 without am/pm are read as afternoon/evening, unless
/// written zero-padded as `HH:MM`.
pub fn extract_time_of_day(text: &str) -> Option<NaiveTime> {
    if let Some(cap) = TWELVE_HOUR.captures(text) {
        let hour: u32 = cap[1].parse().ok()?;
        let minute: u32 = cap.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
        let pm = cap[3].to_ascii_lowercase().starts_with('p');
        let hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    if let Some(cap) = NOON_MIDNIGHT.captures(text) {
        let hour = if cap[1].eq_ignore_ascii_case("noon") { 12 } else { 0 };
        return NaiveTime::from_hms_opt(hour, 0, 0);
    }

    if let Some(cap) = CLOCK.captures(text) {
        let hour: u32 = cap[1].parse().ok()?;
        let minute: u32 = cap[2].parse().ok()?;
        // "09:30" is 24-hour notation; only unpadded "9:30" is ambiguous.
        let hour = if cap[1].starts_with('0') { hour } else { assume_pm(hour) };
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    if let Some(cap) = AT_BARE_HOUR.captures(text) {
        let hour: u32 = cap[1].parse().ok()?;
        return NaiveTime::from_hms_opt(assume_pm(hour), 0, 0);
    }

    None
}

fn assume_pm(hour: u32) -> u32 {
    if (1..=11).contains(&hour) { hour + 12 } else { hour }
}

/// Resolve a start time from text relative to the message date.
///
/// "tomorrow" shifts one day; "today", "tonight" or no day phrase stays on
/// the message date. Returns `None` when no time of day is mentioned.
pub fn resolve_start(text: &str, message_date: NaiveDate) -> Option<NaiveDateTime> {
    let time = extract_time_of_day(text)?;
    let day = if TOMORROW.is_match(text) {
        message_date.succ_opt()?
    } else {
        message_date
    };
    Some(day.and_time(time))
}

/// Final meeting start/end.
///
/// A parseable classifier start wins; otherwise the text is resolved
/// against the message date. End defaults to start + 1 hour.
pub fn resolve_meeting_times(
    start: Option<&str>,
    end: Option<&str>,
    text: &str,
    message_date: Option<NaiveDate>,
) -> (Option<String>, Option<String>) {
    let start = start
        .and_then(parse_timestamp)
        .or_else(|| message_date.and_then(|d| resolve_start(text, d)));

    let end = end
        .and_then(parse_timestamp)
        .filter(|e| start.is_none_or(|s| *e > s))
        .or_else(|| start.map(|s| s + Duration::hours(1)));

    let render = |dt: NaiveDateTime| dt.format(TIMESTAMP_FORMAT).to_string();
    (start.map(render), end.map(render))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan1() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn tomorrow_6pm() {
        let (start, end) = resolve_meeting_times(None, None, "Let's meet tomorrow 6pm", Some(jan1()));
        assert_eq!(start.as_deref(), Some("2024-01-02T18:00:00"));
        assert_eq!(end.as_deref(), Some("2024-01-02T19:00:00"));
    }

    #[test]
    fn tonight_with_minutes() {
        let start = resolve_start("Dinner tonight at 7:45PM?", jan1()).unwrap();
        assert_eq!(start.format(TIMESTAMP_FORMAT).to_string(), "2024-01-01T19:45:00");
    }

    #[test]
    fn am_pm_table() {
        let t = |s: &str| extract_time_of_day(s).unwrap().format("%H:%M").to_string();
        assert_eq!(t("4pm"), "16:00");
        assert_eq!(t("6 AM"), "06:00");
        assert_eq!(t("12pm"), "12:00");
        assert_eq!(t("12am"), "00:00");
        assert_eq!(t("noon"), "12:00");
        assert_eq!(t("midnight"), "00:00");
        assert_eq!(t("18:30"), "18:30");
        assert_eq!(t("call at 4"), "16:00");
        assert_eq!(t("see you 9:15"), "21:15");
        assert!(extract_time_of_day("no time here").is_none());
    }

    #[test]
    fn zero_padded_clock_is_morning() {
        let (start, end) =
            resolve_meeting_times(None, None, "Standup tomorrow at 09:30", Some(jan1()));
        assert_eq!(start.as_deref(), Some("2024-01-02T09:30:00"));
        assert_eq!(end.as_deref(), Some("2024-01-02T10:30:00"));

        let t = |s: &str| extract_time_of_day(s).unwrap().format("%H:%M").to_string();
        assert_eq!(t("9:30"), "21:30");
        assert_eq!(t("00:15"), "00:15");
    }

    #[test]
    fn classifier_start_wins_and_offset_is_dropped() {
        let (start, end) = resolve_meeting_times(
            Some("2024-03-05T09:00:00-05:00"),
            None,
            "tomorrow 6pm",
            Some(jan1()),
        );
        assert_eq!(start.as_deref(), Some("2024-03-05T09:00:00"));
        assert_eq!(end.as_deref(), Some("2024-03-05T10:00:00"));
    }

    #[test]
    fn unparseable_start_falls_back_to_text() {
        let (start, _) = resolve_meeting_times(Some("6pm"), None, "today 6pm", Some(jan1()));
        assert_eq!(start.as_deref(), Some("2024-01-01T18:00:00"));
    }

    #[test]
    fn explicit_end_is_kept() {
        let (_, end) = resolve_meeting_times(
            Some("2024-01-01T18:00"),
            Some("2024-01-01 20:30"),
            "",
            None,
        );
        assert_eq!(end.as_deref(), Some("2024-01-01T20:30:00"));
    }

    #[test]
    fn nothing_to_resolve() {
        assert_eq!(
            resolve_meeting_times(None, None, "Quarterly sync", Some(jan1())),
            (None, None)
        );
    }

    #[test]
    fn normalize_shapes() {
        assert_eq!(normalize_timestamp("2024-01-05").as_deref(), Some("2024-01-05T00:00:00"));
        assert_eq!(
            normalize_timestamp("2024-01-05T10:00:00Z").as_deref(),
            Some("2024-01-05T10:00:00")
        );
        assert_eq!(normalize_timestamp("next week"), None);
    }
}
