//! Duration strings in the `300ms` / `1.5h` / `2h45m` grammar used by
//! experiment and template specs.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationParseError {
    #[error("invalid duration '{input}': empty")]
    Empty { input: String },
    #[error("invalid duration '{input}': missing unit")]
    MissingUnit { input: String },
    #[error("invalid duration '{input}': unknown unit '{unit}'")]
    UnknownUnit { input: String, unit: String },
    #[error("invalid duration '{input}': malformed number")]
    Malformed { input: String },
    #[error("invalid duration '{input}': negative durations are not allowed")]
    Negative { input: String },
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

/// Parse a sequence of decimal numbers each followed by a unit.
///
/// `"0"` is accepted without a unit; every other value needs one.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationParseError::Empty {
            input: input.to_string(),
        });
    }
    let s = match s.strip_prefix('+') {
        Some(rest) => rest,
        None if s.starts_with('-') => {
            return Err(DurationParseError::Negative {
                input: input.to_string(),
            })
        }
        None => s,
    };
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let malformed = || DurationParseError::Malformed {
        input: input.to_string(),
    };

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(malformed());
        }
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        if unit_len == 0 {
            return Err(DurationParseError::MissingUnit {
                input: input.to_string(),
            });
        }
        let (unit, next) = tail.split_at(unit_len);
        let scale = unit_nanos(unit).ok_or_else(|| DurationParseError::UnknownUnit {
            input: input.to_string(),
            unit: unit.to_string(),
        })?;

        let (whole, frac) = match number.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (number, ""),
        };
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(malformed());
        }
        let whole_value: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| malformed())?
        };
        let mut nanos = whole_value.checked_mul(scale).ok_or_else(malformed)?;
        if !frac.is_empty() {
            let digits = frac.len().min(18) as u32;
            let frac_value: u128 = frac[..digits as usize].parse().map_err(|_| malformed())?;
            nanos += frac_value * scale / 10u128.pow(digits);
        }
        total_nanos = total_nanos.checked_add(nanos).ok_or_else(malformed)?;
        rest = next;
    }

    let secs = (total_nanos / 1_000_000_000) as u64;
    let subsec = (total_nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, subsec))
}
