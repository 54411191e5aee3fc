//! Compact human duration parsing (`500ms`, `10s`, `5m`, `1h`, `1d`).
//!
//! Used by playbooks, task configs and the coordinator config. A zero
//! duration means "no limit" wherever a timeout is expected.

use anyhow::{Context, Result, bail};
use std::time::Duration;

/// Parse a duration such as `250ms`, `30s`, `5m`, `2h` or `1d`.
///
/// A bare number is interpreted as seconds. Compound forms like `1m30s`
/// are accepted and summed.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map_or(rest.len(), |(i, _)| i);
        let (num, tail) = rest.split_at(split);
        if num.is_empty() {
            bail!("invalid duration: {s}");
        }
        let n: u64 = num
            .parse()
            .with_context(|| format!("invalid duration: {s}"))?;

        let unit_len = tail
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map_or(tail.len(), |(i, _)| i);
        let (unit, next) = tail.split_at(unit_len);

        let part = match unit {
            "ms" => Some(Duration::from_millis(n)),
            "s" | "" => Some(Duration::from_secs(n)),
            "m" => n.checked_mul(60).map(Duration::from_secs),
            "h" => n.checked_mul(60 * 60).map(Duration::from_secs),
            "d" => n.checked_mul(24 * 60 * 60).map(Duration::from_secs),
            _ => bail!("unsupported duration unit in '{s}' (use ms|s|m|h|d)"),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .with_context(|| format!("duration out of range: {s}"))?;
        rest = next;
    }

    Ok(total)
}

/// Render a duration in the same compact form `parse_duration` accepts.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    match secs {
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

/// Serde adapter for `Duration` fields written as compact strings.
///
/// Plain integers are accepted as seconds.
pub mod serde_duration {
    use super::{format_duration, parse_duration};
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration like \"10s\" or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse_duration(v).map_err(|e| E::custom(format!("{e:#}")))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("negative duration"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
                Duration::try_from_secs_f64(v).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Duration, E> {
                Ok(Duration::ZERO)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
