//! Human-readable byte sizes
//!
//! Sizes use binary multiples (1 KB = 1024 bytes) in both directions.

use crate::config::ConfigError;

/// Unit suffixes, one per power of 1024
const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Format a byte count, e.g. `4MB` or `2.11KB`
///
/// The fractional part is the first two decimal digits of the remainder
/// left by the last unit division, and is only shown when that remainder
/// exceeds 100.
pub fn human_size(n: u64) -> String {
    let mut value = n;
    let mut remainder = 0;
    let mut unit = 0;

    while value >= 1024 && unit < UNITS.len() - 1 {
        remainder = value % 1024;
        value /= 1024;
        unit += 1;
    }

    if remainder > 100 {
        let digits = remainder.to_string();
        format!("{}.{}{}", value, &digits[..2], UNITS[unit])
    } else {
        format!("{}{}", value, UNITS[unit])
    }
}

/// Parse a size such as `512`, `64K`, `1MB`, `1.5GiB` into bytes
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize(input.to_string());

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    if number.is_empty() {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        _ => return Err(invalid()),
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid());
    }

    Ok(bytes as u64)
}
