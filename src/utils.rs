//! Shared utility functions used across the crate.

use std::time::Duration;

/// Longest duration accepted anywhere in a profile table: `u64::MAX`
/// nanoseconds, about 584 years.
pub const MAX_DURATION: Duration = Duration::from_nanos(u64::MAX);

/// Parse a duration string (e.g., "30s", "500ms", "1m30s", "2h") into `Duration`.
///
/// Supported units are `ms`, `s`, `m` and `h`. Segments may be chained
/// (`"1m30s"`) and each segment may be fractional (`"1.5s"`). A plain number
/// is treated as milliseconds.
///
/// Returns `None` if the string cannot be parsed or exceeds [`MAX_DURATION`].
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ms) = s.parse::<u64>() {
        return Some(Duration::from_millis(ms)).filter(|d| *d <= MAX_DURATION);
    }

    let mut total_nanos = 0.0_f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let (nanos_per_unit, unit_len) = if rest.starts_with("ms") {
            (1e6, 2)
        } else if rest.starts_with('s') {
            (1e9, 1)
        } else if rest.starts_with('m') {
            (60e9, 1)
        } else if rest.starts_with('h') {
            (3600e9, 1)
        } else {
            return None;
        };
        total_nanos += value * nanos_per_unit;
        rest = &rest[unit_len..];
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total_nanos as u64))
}

/// Render a duration the way it is written in profile tables.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        "0s".to_string()
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_milliseconds() {
        assert_eq!(parse_duration_str("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_str("1000ms"), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_parse_seconds_minutes_hours() {
        assert_eq!(parse_duration_str("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_str("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_parse_plain_number() {
        assert_eq!(parse_duration_str("1000"), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_parse_with_whitespace() {
        assert_eq!(parse_duration_str(" 30s "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration_str("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_str("1h2m"), Some(Duration::from_secs(3720)));
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_duration_str("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration_str("0.5m"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse_duration_str("invalid"), None);
        assert_eq!(parse_duration_str("abc123"), None);
        assert_eq!(parse_duration_str("10x"), None);
        assert_eq!(parse_duration_str(""), None);
    }

    #[test]
    fn test_parse_out_of_range() {
        assert_eq!(parse_duration_str("6000000h"), None);
        assert_eq!(parse_duration_str("99999999999999999999s"), None);
        assert_eq!(parse_duration_str("18446744073709551615"), None);
        assert_eq!(
            parse_duration_str("5000000h"),
            Some(Duration::from_secs(5_000_000 * 3600))
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_millis(100)), "100ms");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
