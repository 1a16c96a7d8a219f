//! Duration string grammar: `<signed number><optional space><unit>`.
//!
//! Units accepted: `ms`, `s`, `m`, `h`, `d`, `w`, `mo`, `y`, each with several
//! long-form aliases. Bare numbers are milliseconds. Multi-unit strings like
//! `1h30m` are rejected rather than summed.

use std::fmt;

/// Milliseconds in a 30.4375-day month, matching the grammar's approximation.
const MS_PER_MONTH: f64 = 30.4375 * 24.0 * 60.0 * 60.0 * 1000.0;
/// Milliseconds in a 365.25-day year, matching the grammar's approximation.
const MS_PER_YEAR: f64 = 365.25 * 24.0 * 60.0 * 60.0 * 1000.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid duration string: {0:?}")]
pub struct DurationParseError(pub String);

/// Parse a duration string into signed milliseconds.
///
/// ```
/// use openworkflow::duration::parse_duration_ms;
/// assert_eq!(parse_duration_ms("5s").unwrap(), 5000);
/// assert_eq!(parse_duration_ms("0").unwrap(), 0);
/// assert!(parse_duration_ms("1h30m").is_err());
/// assert!(parse_duration_ms(" 5s").is_err());
/// ```
pub fn parse_duration_ms(input: &str) -> Result<i64, DurationParseError> {
    if input.is_empty() {
        return Err(DurationParseError(input.to_string()));
    }

    let bytes = input.as_bytes();
    let mut idx = 0;

    if bytes[idx] == b'+' || bytes[idx] == b'-' {
        idx += 1;
    }

    let number_start = idx;
    let mut saw_digit = false;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
        saw_digit = true;
    }
    if idx < bytes.len() && bytes[idx] == b'.' {
        idx += 1;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
            saw_digit = true;
        }
    }
    if !saw_digit {
        return Err(DurationParseError(input.to_string()));
    }

    let number_str = &input[..idx];
    let magnitude: f64 = number_str
        .parse()
        .map_err(|_| DurationParseError(input.to_string()))?;

    let rest = &input[idx..];
    // at most one optional space before the unit, never more
    let rest = if let Some(stripped) = rest.strip_prefix(' ') {
        stripped
    } else {
        rest
    };

    if rest.is_empty() {
        // bare number: milliseconds
        return Ok(magnitude as i64);
    }

    let unit = Unit::parse(rest).ok_or_else(|| DurationParseError(input.to_string()))?;
    Ok((magnitude * unit.millis_factor()).round() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Unit {
    fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Some(match lower.as_str() {
            "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => Unit::Millisecond,
            "s" | "sec" | "secs" | "second" | "seconds" => Unit::Second,
            "m" | "min" | "mins" | "minute" | "minutes" => Unit::Minute,
            "h" | "hr" | "hrs" | "hour" | "hours" => Unit::Hour,
            "d" | "day" | "days" => Unit::Day,
            "w" | "week" | "weeks" => Unit::Week,
            "mo" | "month" | "months" => Unit::Month,
            "y" | "yr" | "yrs" | "year" | "years" => Unit::Year,
            _ => return None,
        })
    }

    fn millis_factor(self) -> f64 {
        match self {
            Unit::Millisecond => 1.0,
            Unit::Second => 1_000.0,
            Unit::Minute => 60.0 * 1_000.0,
            Unit::Hour => 60.0 * 60.0 * 1_000.0,
            Unit::Day => 24.0 * 60.0 * 60.0 * 1_000.0,
            Unit::Week => 7.0 * 24.0 * 60.0 * 60.0 * 1_000.0,
            Unit::Month => MS_PER_MONTH,
            Unit::Year => MS_PER_YEAR,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::Millisecond => "ms",
            Unit::Second => "s",
            Unit::Minute => "m",
            Unit::Hour => "h",
            Unit::Day => "d",
            Unit::Week => "w",
            Unit::Month => "mo",
            Unit::Year => "y",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_milliseconds() {
        assert_eq!(parse_duration_ms("0").unwrap(), 0);
        assert_eq!(parse_duration_ms("1500").unwrap(), 1500);
    }

    #[test]
    fn simple_units() {
        assert_eq!(parse_duration_ms("5s").unwrap(), 5000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
    }

    #[test]
    fn long_aliases_and_case_insensitivity() {
        assert_eq!(parse_duration_ms("3 seconds").unwrap(), 3000);
        assert_eq!(parse_duration_ms("3SECONDS").unwrap(), 3000);
        assert_eq!(parse_duration_ms("1 Hour").unwrap(), 3_600_000);
    }

    #[test]
    fn negative_and_fractional() {
        assert_eq!(parse_duration_ms("-.5h").unwrap(), -1_800_000);
        assert_eq!(parse_duration_ms("-5s").unwrap(), -5000);
    }

    #[test]
    fn month_and_year_approximations() {
        assert_eq!(parse_duration_ms("1mo").unwrap(), MS_PER_MONTH as i64);
        assert_eq!(parse_duration_ms("1y").unwrap(), MS_PER_YEAR as i64);
    }

    #[test]
    fn rejects_multi_unit_strings() {
        assert!(parse_duration_ms("1h30m").is_err());
    }

    #[test]
    fn rejects_leading_whitespace() {
        assert!(parse_duration_ms(" 5s").is_err());
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration_ms("5 fortnights").is_err());
    }

    #[test]
    fn rejects_empty_string() {
        assert!(parse_duration_ms("").is_err());
    }
}
