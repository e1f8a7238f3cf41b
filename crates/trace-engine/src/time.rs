//! # Timestamp Normalization
//!
//! The four event sources were written independently and disagree about how
//! to encode time: the IVR log and CDR store write date-time strings, the
//! queue log writes `"<unix-seconds>.<fractional>"`, and the application log
//! writes RFC 3339. Everything funnels through [`normalize_timestamp`] so
//! each source's quirk lives in exactly one place.
//!
//! Parsing never fails: a `None` or unparseable input degrades to `Utc::now()`.
//! That is a deliberate lossy sentinel — the merge step must not abort on one
//! bad timestamp, and callers must not rely on absolute accuracy for values
//! that did not parse.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Parse a raw timestamp string from any of the event sources into a
/// comparable instant.
///
/// Accepted encodings, tried in order:
/// - RFC 3339 (`2024-03-01T09:30:00Z`, with or without offset)
/// - space-separated date-time (`2024-03-01 09:30:00` / `...09:30:00.250`)
/// - Unix seconds with fractional part (`1709285400.123456`), fraction
///   truncated to millisecond precision
/// - bare Unix seconds (`1709285400`)
///
/// Anything else, including `None`, falls back to now.
pub fn normalize_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Utc::now();
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Utc.from_utc_datetime(&naive);
        }
    }

    if let Some(instant) = parse_unix_seconds(raw) {
        return instant;
    }

    Utc::now()
}

/// Parse `"<seconds>.<fractional>"` or plain `"<seconds>"`, truncating the
/// fractional part to millisecond precision.
fn parse_unix_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let (secs_part, frac_part) = match raw.split_once('.') {
        Some((secs, frac)) => (secs, Some(frac)),
        None => (raw, None),
    };

    let secs: i64 = secs_part.parse().ok()?;
    let millis: u32 = match frac_part {
        Some(frac) => {
            // Keep at most three digits, right-padded: "1" -> 100ms.
            let digits: String = frac.chars().take(3).collect();
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let value: u32 = digits.parse().ok()?;
            value * 10u32.pow(3 - digits.len() as u32)
        }
        None => 0,
    };

    Utc.timestamp_opt(secs, millis * 1_000_000).single()
}
