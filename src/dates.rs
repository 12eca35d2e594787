//! Publish-date normalization for feed entries.
//!
//! Feeds in the wild stamp entries with a handful of timestamp layouts. The
//! layouts below are tried in order and the first one that parses wins.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DateFormatError {
    #[error("empty published date")]
    Empty,
    #[error("unable to parse date: {0}")]
    Unrecognized(String),
}

type Layout = fn(&str) -> Option<DateTime<Utc>>;

/// Priority order matters: RFC 3339 must be tried before the bare
/// `YYYY-MM-DDTHH:MM:SS` layout, which would otherwise ignore the offset.
const LAYOUTS: &[(&str, Layout)] = &[
    ("rfc1123z", parse_rfc1123_numeric),
    ("rfc1123", parse_rfc1123_zone_name),
    ("rfc3339", parse_rfc3339),
    ("datetime-space", parse_naive_space),
    ("datetime-t", parse_naive_t),
    ("date", parse_date_only),
    ("rfc2822", parse_rfc2822),
];

/// Parse a raw `pubDate` string into a UTC instant.
pub fn parse_pub_date(raw: &str) -> Result<DateTime<Utc>, DateFormatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DateFormatError::Empty);
    }

    LAYOUTS
        .iter()
        .find_map(|(_, layout)| layout(trimmed))
        .ok_or_else(|| DateFormatError::Unrecognized(raw.to_string()))
}

/// Drops a leading `"Mon, "` day-of-week. The weekday is checked for shape
/// only; publishers frequently get it wrong for the date they emit.
fn strip_weekday(s: &str) -> Option<&str> {
    let (day, rest) = s.split_once(", ")?;
    if day.len() == 3 && day.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn parse_rfc1123_numeric(s: &str) -> Option<DateTime<Utc>> {
    let rest = strip_weekday(s)?;
    DateTime::parse_from_str(rest, "%d %b %Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_rfc1123_zone_name(s: &str) -> Option<DateTime<Utc>> {
    let rest = strip_weekday(s)?;
    let (stamp, zone) = rest.rsplit_once(' ')?;
    if zone.is_empty() || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(stamp, "%d %b %Y %H:%M:%S").ok()?;
    let offset = FixedOffset::east_opt(zone_offset_hours(zone) * 3600)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// RFC 822 zone names. Anything else alphabetic is read as UTC.
fn zone_offset_hours(zone: &str) -> i32 {
    match zone.to_ascii_uppercase().as_str() {
        "EDT" => -4,
        "EST" | "CDT" => -5,
        "CST" | "MDT" => -6,
        "MST" | "PDT" => -7,
        "PST" => -8,
        _ => 0,
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_naive_space(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_naive_t(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_date_only(s: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn parse_rfc2822(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
