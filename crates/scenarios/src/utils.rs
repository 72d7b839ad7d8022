//! Parsing helpers for human-readable magnitudes
//!
//! Profiles are written the way `tc` users write them: `"100ms"`, `"1.5s"`,
//! `"250us"`, `"5%"`. Bare numbers are milliseconds for durations and
//! percentages for probabilities.

use crate::error::ConfigError;
use std::time::Duration;

/// Parse a duration such as `"100ms"`, `"2s"`, `"250us"` or `"40"` (ms)
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(text.to_string()))?;

    let micros_per_unit = match unit.trim() {
        "" | "ms" | "msec" => 1_000.0,
        "us" | "usec" => 1.0,
        "s" | "sec" => 1_000_000.0,
        _ => return Err(ConfigError::InvalidDuration(text.to_string())),
    };

    duration_from_micros(value * micros_per_unit)
        .ok_or_else(|| ConfigError::InvalidDuration(text.to_string()))
}

/// Interpret a bare number as milliseconds
pub fn duration_from_millis_f64(ms: f64) -> Result<Duration, ConfigError> {
    duration_from_micros(ms * 1_000.0).ok_or_else(|| ConfigError::InvalidDuration(ms.to_string()))
}

fn duration_from_micros(micros: f64) -> Option<Duration> {
    if !micros.is_finite() || micros < 0.0 {
        return None;
    }
    Some(Duration::from_micros(micros.round() as u64))
}

/// Parse a percentage such as `"5%"`, `"0.5"` or `"100"`; must lie in [0, 100]
pub fn parse_percent(text: &str) -> Result<f64, ConfigError> {
    let trimmed = text.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    let value: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidPercent(text.to_string()))?;
    check_percent(value)
}

/// Reject percentages outside [0, 100] (and NaN)
pub fn check_percent(value: f64) -> Result<f64, ConfigError> {
    if (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidPercent(value.to_string()))
    }
}

/// Render a duration the way profiles are written back out
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    if micros % 1_000 == 0 {
        format!("{}ms", micros / 1_000)
    } else {
        format!("{}us", micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(" 40 ").unwrap(), Duration::from_millis(40));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("5%").unwrap(), 5.0);
        assert_eq!(parse_percent("0.25").unwrap(), 0.25);
        assert!(parse_percent("101%").is_err());
        assert!(parse_percent("-1").is_err());
        assert!(check_percent(f64::NAN).is_err());
    }

    #[test]
    fn test_format_duration_round_trip() {
        assert_eq!(format_duration(Duration::from_millis(100)), "100ms");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1500us");
        let back = parse_duration(&format_duration(Duration::from_micros(1500))).unwrap();
        assert_eq!(back, Duration::from_micros(1500));
    }
}
