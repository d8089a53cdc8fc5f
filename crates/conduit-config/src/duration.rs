//! Duration grammar shared by every duration-typed configuration field.
//!
//! Accepted forms:
//! - integer seconds (`3600`)
//! - floating point seconds (`0.25`)
//! - duration strings made of `<number><unit>` terms, e.g. `1h30m`,
//!   `1h 30m 15s`, `1.5h`, `250ms`. Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`.
//!   A bare `0` is also accepted.

use serde::{de, Deserializer, Serializer};
use std::fmt;
use std::time::Duration;

/// Parse a duration string such as `1h30m` or `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration string".to_string());
    }

    let rest = match trimmed.as_bytes()[0] {
        b'-' => return Err(format!("negative duration `{}`", trimmed)),
        b'+' => &trimmed[1..],
        _ => trimmed,
    };

    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_secs = 0f64;
    let mut chars = rest.char_indices().peekable();
    let mut terms = 0;

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut end = start;
        let mut seen_dot = false;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_ascii_digit() || (c == '.' && !seen_dot) {
                seen_dot |= c == '.';
                end = idx + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let number = &rest[start..end];
        if number.is_empty() || number == "." {
            return Err(format!("expected a number in `{}`", trimmed));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number `{}` in `{}`", number, trimmed))?;

        let unit_start = end;
        let mut unit_end = end;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_alphabetic() {
                unit_end = idx + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let unit = &rest[unit_start..unit_end];
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" | "μs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit after `{}` in `{}`", number, trimmed)),
            other => return Err(format!("unknown unit `{}` in `{}`", other, trimmed)),
        };

        total_secs += value * scale;
        terms += 1;
    }

    if terms == 0 {
        return Err(format!("expected a number in `{}`", trimmed));
    }

    seconds_to_duration(total_secs)
}

/// Convert a (possibly fractional) number of seconds into a `Duration`.
pub fn seconds_to_duration(secs: f64) -> Result<Duration, String> {
    if secs.is_nan() {
        return Err("duration is not a number".to_string());
    }
    if secs < 0.0 {
        return Err(format!("negative duration {}s", secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("duration {}s overflows: {}", secs, e))
}

/// Serialize a duration as whole seconds when possible, fractional seconds otherwise.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if duration.subsec_nanos() == 0 {
        serializer.serialize_u64(duration.as_secs())
    } else {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

/// Deserialize a duration from seconds (integer or float) or a duration string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(FlexibleDurationVisitor)
}

struct FlexibleDurationVisitor;

impl<'de> de::Visitor<'de> for FlexibleDurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("seconds as a number or a duration string like \"1h30m\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
        if v < 0 {
            return Err(E::custom(format!("negative duration {}s", v)));
        }
        Ok(Duration::from_secs(v as u64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
        seconds_to_duration(v).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
        parse_duration(v).map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1h", 3600.0 ; "hours")]
    #[test_case("30m", 1800.0 ; "minutes")]
    #[test_case("45s", 45.0 ; "seconds")]
    #[test_case("250ms", 0.25 ; "milliseconds")]
    #[test_case("1h30m", 5400.0 ; "compound")]
    #[test_case("1h 30m 15s", 5415.0 ; "spaced compound")]
    #[test_case("1.5h", 5400.0 ; "fractional hours")]
    #[test_case("0", 0.0 ; "bare zero")]
    #[test_case("+2s", 2.0 ; "explicit plus")]
    #[test_case("500us", 0.0005 ; "microseconds")]
    fn test_parse_valid(input: &str, expected_secs: f64) {
        let parsed = parse_duration(input).unwrap();
        assert!((parsed.as_secs_f64() - expected_secs).abs() < 1e-9);
    }

    #[test_case("" ; "empty")]
    #[test_case("10" ; "missing unit")]
    #[test_case("1x" ; "unknown unit")]
    #[test_case("-5s" ; "negative")]
    #[test_case("h" ; "unit without number")]
    #[test_case("1h-" ; "trailing garbage")]
    fn test_parse_invalid(input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn test_seconds_to_duration_rejects_negative_and_nan() {
        assert!(seconds_to_duration(-1.0).is_err());
        assert!(seconds_to_duration(f64::NAN).is_err());
        assert_eq!(seconds_to_duration(1.5).unwrap(), Duration::from_millis(1500));
    }

    // 2^64 is where `u64::MAX as f64` rounds to, so it must be rejected, not clamped.
    #[test_case(18446744073709551616.0 ; "two to the sixty-four")]
    #[test_case(1e300 ; "huge")]
    #[test_case(f64::INFINITY ; "infinite")]
    fn test_seconds_to_duration_rejects_overflow(secs: f64) {
        assert!(seconds_to_duration(secs).unwrap_err().contains("overflows"));
    }

    #[test]
    fn test_parse_rejects_overflowing_string() {
        assert!(parse_duration("18446744073709551616s").is_err());
        assert!(parse_duration("300000000000000000h").is_err());
    }
}
