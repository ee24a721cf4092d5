//! Human-readable byte sizes such as `"20mb"`.
//!
//! The accepted grammar is `<number><unit>` where the number is a non-negative
//! decimal and the unit is one of `kb`, `mb` or `gb` in any casing. The byte
//! count is `number * 1024^rank` with `kb = 1`, `mb = 2`, `gb = 3`, rounded down
//! to a whole byte. Anything else is rejected instead of yielding a bogus limit.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned for malformed size strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizeError {
    #[error("size string is empty")]
    Empty,
    #[error("invalid size number `{0}`")]
    InvalidNumber(String),
    #[error("unknown size unit `{0}` (expected kb, mb or gb)")]
    UnknownUnit(String),
    #[error("size `{0}` does not fit in 64 bits")]
    Overflow(String),
}

/// A byte count parsed from a size string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(Self)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

fn unit_rank(unit: &str) -> Option<i32> {
    match unit.to_ascii_lowercase().as_str() {
        "kb" => Some(1),
        "mb" => Some(2),
        "gb" => Some(3),
        _ => None,
    }
}

/// Converts a size string to a byte count.
pub fn parse_size(input: &str) -> Result<u64, SizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeError::Empty);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let unit = unit.trim_start();

    let valid_number = !number.is_empty()
        && number.chars().filter(|c| *c == '.').count() <= 1
        && !number.starts_with('.')
        && !number.ends_with('.');
    if !valid_number {
        return Err(SizeError::InvalidNumber(number.to_string()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| SizeError::InvalidNumber(number.to_string()))?;

    let rank = unit_rank(unit).ok_or_else(|| SizeError::UnknownUnit(unit.to_string()))?;
    let bytes = (value * 1024f64.powi(rank)).floor();

    #[allow(clippy::cast_precision_loss)]
    let max = u64::MAX as f64;
    if !bytes.is_finite() || bytes >= max {
        return Err(SizeError::Overflow(trimmed.to_string()));
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bytes = bytes as u64;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_megabytes() {
        assert_eq!(parse_size("20mb"), Ok(20 * 1024 * 1024));
        assert_eq!(parse_size("20mb"), Ok(20_971_520));
    }

    #[test]
    fn test_gigabytes() {
        assert_eq!(parse_size("1gb"), Ok(1_073_741_824));
    }

    #[test]
    fn test_unit_casing_is_ignored() {
        assert_eq!(parse_size("5KB"), parse_size("5kb"));
        assert_eq!(parse_size("5Kb"), Ok(5120));
    }

    #[test]
    fn test_fraction_rounds_down() {
        assert_eq!(parse_size("1.5kb"), Ok(1536));
        assert_eq!(parse_size("0.001kb"), Ok(1));
    }

    #[test]
    fn test_whitespace_between_number_and_unit() {
        assert_eq!(parse_size(" 2 mb "), Ok(2 * 1024 * 1024));
    }

    #[test]
    fn test_rejects_unknown_unit() {
        assert_eq!(parse_size("10tb"), Err(SizeError::UnknownUnit("tb".into())));
        assert_eq!(parse_size("10"), Err(SizeError::UnknownUnit(String::new())));
    }

    #[test]
    fn test_rejects_bad_number() {
        assert!(matches!(parse_size("mb"), Err(SizeError::InvalidNumber(_))));
        assert!(matches!(parse_size("1.2.3mb"), Err(SizeError::InvalidNumber(_))));
        assert!(matches!(parse_size("-5mb"), Err(SizeError::InvalidNumber(_))));
        assert_eq!(parse_size(""), Err(SizeError::Empty));
    }

    #[test]
    fn test_byte_size_from_str() {
        let size: ByteSize = "3kb".parse().unwrap();
        assert_eq!(size.as_u64(), 3072);
        assert_eq!(size.to_string(), "3072 bytes");
    }
}
