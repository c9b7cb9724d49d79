use chrono::{DateTime, NaiveDateTime, Utc};

/// Canonical timestamp layout used everywhere in the database:
/// `YYYY-MM-DD HH:MM:SS`, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_string() -> String {
    format_utc(Utc::now())
}

pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp. Returns None on any deviation from the
/// canonical layout so callers can warn and skip the record.
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Absolute difference between two stored timestamps, in hours.
/// None if either side fails to parse.
pub fn hours_between(a: &str, b: &str) -> Option<f64> {
    let a = parse_utc(a)?;
    let b = parse_utc(b)?;
    Some((a - b).num_seconds().abs() as f64 / 3600.0)
}

pub fn hours_ago_string(hours: i64) -> String {
    format_utc(Utc::now() - chrono::Duration::hours(hours))
}
