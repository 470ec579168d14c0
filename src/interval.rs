//! Polling interval strings such as `30s`, `10m` or `2h`.
use crate::error::{AppResult, MesuraError};
use std::time::Duration;

/// Shortest interval accepted when expressed in seconds.
pub const MIN_SECONDS: u64 = 10;
/// Longest interval accepted when expressed in minutes.
pub const MAX_MINUTES: u64 = 120;

/// Parses `<integer><unit>` with unit `s`, `m` or `h` (case-insensitive).
///
/// Zero is rejected in every unit. Seconds must be at least 10 and minutes at
/// most 120; hours have no upper bound.
pub fn parse_interval(input: &str) -> AppResult<Duration> {
    let normalized = input.trim().to_ascii_lowercase();
    let split = normalized
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid(input))?;
    let (digits, unit) = normalized.split_at(split);
    if digits.is_empty() {
        return Err(invalid(input));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| MesuraError::invalid_interval(input, "value is out of range"))?;
    if value == 0 {
        return Err(MesuraError::invalid_interval(input, "must be greater than zero"));
    }

    let seconds = match unit {
        "s" => {
            if value < MIN_SECONDS {
                return Err(MesuraError::invalid_interval(
                    input,
                    format!("must be at least {} seconds", MIN_SECONDS),
                ));
            }
            value
        }
        "m" => {
            if value > MAX_MINUTES {
                return Err(MesuraError::invalid_interval(
                    input,
                    format!("must be at most {} minutes", MAX_MINUTES),
                ));
            }
            value * 60
        }
        "h" => value
            .checked_mul(3600)
            .ok_or_else(|| MesuraError::invalid_interval(input, "value is out of range"))?,
        _ => return Err(invalid(input)),
    };

    Ok(Duration::from_secs(seconds))
}

fn invalid(input: &str) -> MesuraError {
    MesuraError::invalid_interval(input, "expected a number followed by s, m or h (e.g. 1m, 10m, 120m)")
}
