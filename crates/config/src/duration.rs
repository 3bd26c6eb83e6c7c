//! Duration string codec
//!
//! Parses strings like `1d 20h 30m 30s` into a [`Duration`] and formats
//! durations back into the same notation.

use std::time::Duration;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// Error type for duration parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurationError {
    /// Input contained no tokens
    Empty,
    /// Token had no leading number (e.g. `h` or `x5m`)
    MissingNumber(String),
    /// Token ended without a unit (e.g. `30`)
    MissingUnit(String),
    /// Unit character is not one of `d`, `h`, `m`, `s`
    UnknownUnit { token: String, unit: char },
    /// Sum does not fit into a u64 number of seconds
    Overflow(String),
}

impl std::fmt::Display for DurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurationError::Empty => write!(f, "duration is empty"),
            DurationError::MissingNumber(t) => write!(f, "token '{}' has no number", t),
            DurationError::MissingUnit(t) => {
                write!(f, "token '{}' has no unit (expected d, h, m or s)", t)
            }
            DurationError::UnknownUnit { token, unit } => write!(
                f,
                "token '{}' has unknown unit '{}' (expected d, h, m or s)",
                token, unit
            ),
            DurationError::Overflow(t) => write!(f, "duration overflows at token '{}'", t),
        }
    }
}

impl std::error::Error for DurationError {}

fn unit_seconds(unit: char) -> Option<u64> {
    match unit {
        'd' => Some(SECS_PER_DAY),
        'h' => Some(SECS_PER_HOUR),
        'm' => Some(SECS_PER_MINUTE),
        's' => Some(1),
        _ => None,
    }
}

fn parse_token(token: &str) -> Result<u64, DurationError> {
    let digits_end = token
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(token.len());

    if digits_end == 0 {
        return Err(DurationError::MissingNumber(token.to_string()));
    }

    let mut rest = token[digits_end..].chars();
    let unit = match (rest.next(), rest.next()) {
        (None, _) => return Err(DurationError::MissingUnit(token.to_string())),
        (Some(u), None) => u,
        // Anything after the unit character is malformed, report the first extra char
        (Some(_), Some(extra)) => {
            return Err(DurationError::UnknownUnit {
                token: token.to_string(),
                unit: extra,
            })
        }
    };

    let per_unit = unit_seconds(unit).ok_or_else(|| DurationError::UnknownUnit {
        token: token.to_string(),
        unit,
    })?;

    let count: u64 = token[..digits_end]
        .parse()
        .map_err(|_| DurationError::Overflow(token.to_string()))?;

    count
        .checked_mul(per_unit)
        .ok_or_else(|| DurationError::Overflow(token.to_string()))
}

/// Parse a duration string such as `1d 20h 30m 30s`.
///
/// Tokens are separated by whitespace and summed. Each token is an unsigned
/// integer immediately followed by one of `d` (days), `h` (hours),
/// `m` (minutes) or `s` (seconds). Units may repeat: `1h 1h` is two hours.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let mut total: u64 = 0;
    let mut saw_token = false;

    for token in input.split_whitespace() {
        saw_token = true;
        let secs = parse_token(token)?;
        total = total
            .checked_add(secs)
            .ok_or_else(|| DurationError::Overflow(token.to_string()))?;
    }

    if !saw_token {
        return Err(DurationError::Empty);
    }

    Ok(Duration::from_secs(total))
}

/// Format a duration in the same notation accepted by [`parse_duration`].
///
/// Sub-second precision is dropped. Zero-valued units are omitted, a zero
/// duration formats as `0s`.
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let mut parts = Vec::with_capacity(4);
    for (unit, size) in [
        ('d', SECS_PER_DAY),
        ('h', SECS_PER_HOUR),
        ('m', SECS_PER_MINUTE),
        ('s', 1),
    ] {
        let count = secs / size;
        if count > 0 {
            parts.push(format!("{}{}", count, unit));
            secs %= size;
        }
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_full_example() {
        let d = parse_duration("1d 20h 30m 30s").unwrap();
        assert_eq!(d.as_secs(), 86400 + 20 * 3600 + 30 * 60 + 30);
        assert_eq!(d.as_secs(), 163830);
    }

    #[test]
    fn test_parse_zero() {
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_single_units() {
        assert_eq!(parse_duration("1d").unwrap().as_secs(), 86400);
        assert_eq!(parse_duration("7h").unwrap().as_secs(), 25200);
        assert_eq!(parse_duration("5m").unwrap().as_secs(), 300);
        assert_eq!(parse_duration("42s").unwrap().as_secs(), 42);
    }

    #[test]
    fn test_parse_tolerates_extra_whitespace() {
        assert_eq!(parse_duration("  1h\t30m ").unwrap().as_secs(), 5400);
    }

    #[test]
    fn test_parse_rejects_unknown_unit() {
        let err = parse_duration("1d 3w").unwrap_err();
        assert_eq!(
            err,
            DurationError::UnknownUnit {
                token: "3w".to_string(),
                unit: 'w'
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert_eq!(parse_duration("   "), Err(DurationError::Empty));
        assert!(matches!(parse_duration("30"), Err(DurationError::MissingUnit(_))));
        assert!(matches!(parse_duration("h"), Err(DurationError::MissingNumber(_))));
        assert!(matches!(parse_duration("-5m"), Err(DurationError::MissingNumber(_))));
        assert!(matches!(parse_duration("1hm"), Err(DurationError::UnknownUnit { .. })));
        assert!(matches!(parse_duration("1H"), Err(DurationError::UnknownUnit { .. })));
    }

    #[test]
    fn test_parse_rejects_overflow() {
        assert!(matches!(
            parse_duration("99999999999999999999d"),
            Err(DurationError::Overflow(_))
        ));
        assert!(matches!(
            parse_duration("213503982334602d"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(163830)), "1d 20h 30m 30s");
        assert_eq!(format_duration(Duration::from_secs(7 * 3600)), "7h");
        assert_eq!(format_duration(Duration::from_millis(61_500)), "1m 1s");
    }

    // Any combination of unit counts parses to the weighted sum, and
    // formatting that sum parses back to the same number of seconds.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_parse_sums_tokens(
            days in 0u64..1000,
            hours in 0u64..100,
            minutes in 0u64..1000,
            seconds in 0u64..100_000,
        ) {
            let input = format!("{}d {}h {}m {}s", days, hours, minutes, seconds);
            let parsed = parse_duration(&input).expect("well-formed input");
            let expected = days * 86400 + hours * 3600 + minutes * 60 + seconds;
            prop_assert_eq!(parsed.as_secs(), expected);

            let formatted = format_duration(parsed);
            prop_assert_eq!(parse_duration(&formatted).unwrap().as_secs(), expected);
        }

        #[test]
        fn prop_unknown_unit_rejected(
            count in 0u64..10_000,
            unit in "[a-zA-Z]"
                .prop_filter("not a unit", |u| !matches!(u.as_str(), "d" | "h" | "m" | "s")),
        ) {
            let input = format!("{}{}", count, unit);
            let is_unknown_unit = matches!(
                parse_duration(&input),
                Err(DurationError::UnknownUnit { .. })
            );
            prop_assert!(is_unknown_unit, "'{}' should be rejected", input);
        }
    }
}
