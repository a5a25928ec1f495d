//! Timestamp extraction from log line prefixes.
//!
//! PostgreSQL writes `%t`/`%m` prefixes as `2024-01-15 14:30:00[.123] UTC`.
//! Only the leading position is inspected; timestamps inside a message body
//! are never picked up.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

/// Length of `YYYY-MM-DD HH:MM:SS`.
const DATETIME_LEN: usize = 19;

/// Point in time extracted from a log line, normalized to UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

/// Returns true if the line begins with a `YYYY-MM-DD` date.
///
/// This is the boundary rule for plain-text logs: every new log entry starts
/// with a dated prefix, continuation lines never do.
pub fn starts_with_date(line: &str) -> bool {
    let b = line.as_bytes();
    b.len() >= 10
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
}

/// Extract the leading timestamp of a log line.
///
/// Accepts an optional fractional part and an optional zone: ` UTC`, ` GMT`,
/// or a numeric offset (`+03`, `+0330`, `-05:00`). Other zone names are
/// read as UTC.
pub fn extract_timestamp(line: &str) -> Option<Timestamp> {
    if line.len() < DATETIME_LEN || !starts_with_date(line) {
        return None;
    }

    let bytes = line.as_bytes();
    let mut end = DATETIME_LEN;
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }

    let naive = NaiveDateTime::parse_from_str(line.get(..end)?, "%Y-%m-%d %H:%M:%S%.f").ok()?;

    let dt = match parse_offset(&line[end..]) {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()?
            .with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    };

    Some(Timestamp(dt))
}

/// Parse a numeric zone offset directly following the datetime.
fn parse_offset(rest: &str) -> Option<FixedOffset> {
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };

    let hours: i32 = digits.get(..2)?.parse().ok()?;
    let tail = &digits[2..];
    let tail = tail.strip_prefix(':').unwrap_or(tail);
    let minutes: i32 = match tail.get(..2) {
        Some(m) if m.bytes().all(|c| c.is_ascii_digit()) => m.parse().ok()?,
        _ => 0,
    };

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        extract_timestamp(s).unwrap()
    }

    #[test]
    fn test_starts_with_date() {
        assert!(starts_with_date("2024-01-15 14:30:00 UTC [1]: LOG:  x"));
        assert!(starts_with_date("2024-01-15"));
        assert!(!starts_with_date("\tSELECT 1"));
        assert!(!starts_with_date("24-01-15 14:30:00"));
        assert!(!starts_with_date(""));
    }

    #[test]
    fn test_extract_utc() {
        let t = ts("2024-01-15 14:30:00 UTC [12345]: LOG:  statement: SELECT 1");
        assert_eq!(t.to_string(), "2024-01-15 14:30:00.000 UTC");
    }

    #[test]
    fn test_extract_millis() {
        let a = ts("2024-01-15 14:30:00.123 UTC [1]: LOG:  a");
        let b = ts("2024-01-15 14:30:00.124 UTC [1]: LOG:  b");
        assert!(a < b);
    }

    #[test]
    fn test_extract_numeric_offset() {
        let plus = ts("2024-01-15 17:30:00 +03 [1]: LOG:  a");
        let utc = ts("2024-01-15 14:30:00 UTC [1]: LOG:  a");
        assert_eq!(plus, utc);

        let minus = ts("2024-01-15 09:00:00-05:30 [1]: LOG:  a");
        assert_eq!(minus.to_string(), "2024-01-15 14:30:00.000 UTC");
    }

    #[test]
    fn test_named_zone_read_as_utc() {
        let cet = ts("2024-01-15 14:30:00 CET [1]: LOG:  a");
        let utc = ts("2024-01-15 14:30:00 UTC [1]: LOG:  a");
        assert_eq!(cet, utc);
    }

    #[test]
    fn test_no_timestamp() {
        assert!(extract_timestamp("\t{").is_none());
        assert!(extract_timestamp("2024-01-15 garbage").is_none());
        assert!(extract_timestamp("SELECT '2024-01-15 14:30:00'").is_none());
    }
}
