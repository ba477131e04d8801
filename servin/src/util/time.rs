//! Parsing of user-facing time arguments.
//!
//! `logs --since`/`--until` accept either an absolute RFC-3339 timestamp or a
//! relative duration such as `42m` or `2h`, resolved against the current
//! clock at call time.

use chrono::{DateTime, Duration, Utc};

use crate::errors::{ServinError, ServinResult};

/// Parse a relative duration like `90s`, `42m`, `2h` or `1d`.
///
/// A bare integer is taken as seconds.
pub fn parse_duration_arg(arg: &str) -> ServinResult<Duration> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err(ServinError::InvalidConfig("empty duration".into()));
    }

    let (digits, unit) = match arg.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => arg.split_at(idx),
        None => (arg, "s"),
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| ServinError::InvalidConfig(format!("invalid duration: {arg}")))?;

    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        other => Err(ServinError::InvalidConfig(format!(
            "invalid duration unit {other:?} in {arg}"
        ))),
    }
}

/// Parse an absolute RFC-3339 timestamp or a relative duration (subtracted
/// from `now`).
pub fn parse_time_arg(arg: &str, now: DateTime<Utc>) -> ServinResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(arg) {
        return Ok(ts.with_timezone(&Utc));
    }
    let delta = parse_duration_arg(arg)?;
    Ok(now - delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_durations() {
        assert_eq!(parse_duration_arg("42m").unwrap(), Duration::minutes(42));
        assert_eq!(parse_duration_arg("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration_arg("90").unwrap(), Duration::seconds(90));
    }

    #[test]
    fn test_relative_since_is_now_minus_delta() {
        let now = Utc::now();
        let ts = parse_time_arg("42m", now).unwrap();
        assert_eq!(now - ts, Duration::minutes(42));
    }

    #[test]
    fn test_absolute_rfc3339() {
        let now = Utc::now();
        let ts = parse_time_arg("2026-01-02T03:04:05Z", now).unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration_arg("yesterday").is_err());
        assert!(parse_duration_arg("").is_err());
    }
}
