//! Time shorthand and stamp handling
//!
//! Query-language time literals take the form `<number>_<unit>`, e.g.
//! `30_minutes` or `2_weeks`. Units are fixed multipliers over
//! milliseconds; `_months` is 31 days and `_years` 365 days, calendar-
//! unaware. Both plural and singular unit spellings are accepted.
//!
//! Event stamps are milliseconds since the epoch. Ingest accepts
//! second-resolution stamps (anything small enough that it cannot be a
//! millisecond stamp) and promotes them.

use crate::error::{Error, ErrorCode, Result};
use chrono::DateTime;

/// Milliseconds in one second.
pub const MS_SECOND: i64 = 1_000;
/// Milliseconds in one minute.
pub const MS_MINUTE: i64 = 60 * MS_SECOND;
/// Milliseconds in one hour.
pub const MS_HOUR: i64 = 60 * MS_MINUTE;
/// Milliseconds in one day.
pub const MS_DAY: i64 = 24 * MS_HOUR;
/// Milliseconds in one week.
pub const MS_WEEK: i64 = 7 * MS_DAY;
/// Milliseconds in one month (fixed 31 days).
pub const MS_MONTH: i64 = 31 * MS_DAY;
/// Milliseconds in one year (fixed 365 days).
pub const MS_YEAR: i64 = 365 * MS_DAY;

// Stamps below this are second-resolution. 100_000_000_000 ms is the year
// 5138; 100_000_000_000 s is the year 5138 too, so the split is safe for
// any realistic event stream.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

/// Expand a `<number>_<unit>` literal to milliseconds. The number part
/// may be integral or fractional; fractional values truncate after unit
/// scaling.
pub fn expand_shorthand(literal: &str) -> Result<i64> {
    let underscore = literal.find('_').ok_or_else(|| bad_shorthand(literal))?;
    let (number_part, unit_part) = literal.split_at(underscore);
    let unit_part = &unit_part[1..];

    let scale = match unit_part {
        "ms" => 1,
        "second" | "seconds" => MS_SECOND,
        "minute" | "minutes" => MS_MINUTE,
        "hour" | "hours" => MS_HOUR,
        "day" | "days" => MS_DAY,
        "week" | "weeks" => MS_WEEK,
        "month" | "months" => MS_MONTH,
        "year" | "years" => MS_YEAR,
        _ => return Err(bad_shorthand(literal)),
    };

    if let Ok(n) = number_part.parse::<i64>() {
        return Ok(n * scale);
    }
    if let Ok(f) = number_part.parse::<f64>() {
        return Ok((f * scale as f64) as i64);
    }
    Err(bad_shorthand(literal))
}

/// Is this token shaped like a time shorthand literal? (digit start,
/// one underscore, letters after it)
pub fn is_shorthand(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() || c == '-' => {}
        _ => return false,
    }
    match token.find('_') {
        Some(pos) => token[pos + 1..].chars().all(|c| c.is_ascii_alphabetic())
            && !token[pos + 1..].is_empty()
            && token[..pos].chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-'),
        None => false,
    }
}

/// Promote a second-resolution stamp to milliseconds; millisecond stamps
/// pass through.
pub fn normalize_stamp(stamp: i64) -> i64 {
    if stamp != 0 && stamp.abs() < SECONDS_CUTOFF {
        stamp * 1000
    } else {
        stamp
    }
}

/// Parse an ISO-8601 date string (as used by `.range(...)`) to a
/// millisecond stamp.
pub fn parse_iso_stamp(s: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| {
            Error::parse(
                ErrorCode::SyntaxError,
                format!("bad date literal `{}`: {}", s, e),
            )
        })
}

fn bad_shorthand(literal: &str) -> Error {
    Error::parse(
        ErrorCode::InvalidTimeShorthand,
        format!("bad time shorthand `{}`", literal),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_units() {
        assert_eq!(expand_shorthand("250_ms").unwrap(), 250);
        assert_eq!(expand_shorthand("30_seconds").unwrap(), 30 * MS_SECOND);
        assert_eq!(expand_shorthand("30_minutes").unwrap(), 30 * MS_MINUTE);
        assert_eq!(expand_shorthand("2_weeks").unwrap(), 2 * MS_WEEK);
        assert_eq!(expand_shorthand("1_month").unwrap(), 31 * MS_DAY);
        assert_eq!(expand_shorthand("1_years").unwrap(), 365 * MS_DAY);
        assert_eq!(expand_shorthand("1.5_hours").unwrap(), MS_HOUR + MS_HOUR / 2);
    }

    #[test]
    fn test_bad_unit_rejected() {
        let err = expand_shorthand("3_fortnights").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTimeShorthand);
    }

    #[test]
    fn test_shorthand_shape() {
        assert!(is_shorthand("30_minutes"));
        assert!(is_shorthand("1.5_hours"));
        assert!(!is_shorthand("user_name"));
        assert!(!is_shorthand("30"));
        assert!(!is_shorthand("_ms"));
    }

    #[test]
    fn test_normalize_stamp() {
        // 2016-03-24T12:00:30Z in seconds promotes to ms
        assert_eq!(normalize_stamp(1_458_820_830), 1_458_820_830_000);
        // already ms: unchanged
        assert_eq!(normalize_stamp(1_458_820_830_000), 1_458_820_830_000);
        assert_eq!(normalize_stamp(0), 0);
    }

    #[test]
    fn test_parse_iso() {
        assert_eq!(
            parse_iso_stamp("2016-03-24T12:00:30+00:00").unwrap(),
            1_458_820_830_000
        );
        assert!(parse_iso_stamp("not a date").is_err());
    }
}
