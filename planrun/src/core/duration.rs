//! Parsing of test duration budgets ("5m", "1h", "90s", "1h30m").

use std::time::Duration;

use crate::errors::SpecificationError;

/// Parse a duration budget into a [`Duration`].
///
/// Accepts one or more `<number><unit>` terms where the unit is one of
/// `s`, `m`, `h` or `d`. A bare number means seconds. Terms add up, so
/// `1h30m` is ninety minutes.
pub fn parse_duration(value: &str) -> Result<Duration, SpecificationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SpecificationError::new("Duration must not be empty."));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut seen_term = false;

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let multiplier = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            other => {
                return Err(SpecificationError::new(format!(
                    "Invalid duration '{value}': unexpected character '{other}'."
                )));
            }
        };
        if digits.is_empty() {
            return Err(SpecificationError::new(format!(
                "Invalid duration '{value}': unit '{ch}' without a number."
            )));
        }
        let number: u64 = digits.parse().map_err(|_| {
            SpecificationError::new(format!("Invalid duration '{value}': number out of range."))
        })?;
        total += number * multiplier;
        digits.clear();
        seen_term = true;
    }

    // Trailing bare number counts as seconds.
    if !digits.is_empty() {
        let number: u64 = digits.parse().map_err(|_| {
            SpecificationError::new(format!("Invalid duration '{value}': number out of range."))
        })?;
        total += number;
        seen_term = true;
    }

    if !seen_term {
        return Err(SpecificationError::new(format!(
            "Invalid duration '{value}'."
        )));
    }

    Ok(Duration::from_secs(total))
}
