//! Shorthand duration parsing for spec fields like `maxInstanceAge`.
//!
//! Supported format: any combination of days (d), hours (h), minutes (m)
//! and seconds (s), separated by optional whitespace. Each component is
//! optional but at least one must be present, e.g. "1d 5h 32m 15s", "30m",
//! "2h30m".

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("duration string must not be blank")]
    Blank,

    #[error("no valid duration components found in `{0}`")]
    NoComponents(String),

    #[error("unexpected character `{0}` in duration string")]
    UnexpectedChar(char),
}

/// Parse a shorthand duration string.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Blank);
    }

    let mut total_secs: u64 = 0;
    let mut digits = String::new();
    let mut matched = false;

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| DurationParseError::UnexpectedChar(ch))?;
        digits.clear();
        let per_unit = match ch.to_ascii_lowercase() {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            other => return Err(DurationParseError::UnexpectedChar(other)),
        };
        total_secs += value * per_unit;
        matched = true;
    }

    if !matched || !digits.is_empty() {
        return Err(DurationParseError::NoComponents(input.to_string()));
    }

    Ok(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(
            parse_duration("1d 5h 32m 15s").unwrap(),
            Duration::from_secs(104_535)
        );
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse_duration("2h30m").unwrap(), Duration::from_secs(9_000));
        assert_eq!(parse_duration("45S").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("15 s").unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn rejects_blank_and_garbage() {
        assert_eq!(parse_duration("  "), Err(DurationParseError::Blank));
        assert!(matches!(
            parse_duration("soon"),
            Err(DurationParseError::UnexpectedChar(_))
        ));
        // Trailing digits without a unit are not a valid component.
        assert!(matches!(
            parse_duration("15"),
            Err(DurationParseError::NoComponents(_))
        ));
        assert!(matches!(
            parse_duration("5x"),
            Err(DurationParseError::UnexpectedChar('x'))
        ));
    }
}
