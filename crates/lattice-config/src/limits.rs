//! Human-readable request body size limits.
//!
//! The connector accepts bodies up to a configured size expressed either as a
//! plain byte count (`"1048576"`) or with a binary unit suffix (`"20mb"`,
//! `"64kb"`, `"1gb"`). Units are case-insensitive and use 1024-based
//! multipliers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const KIB: u64 = 1024;

/// A parsed body size limit in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BodyLimit(u64);

impl BodyLimit {
    /// Builds a limit from a raw byte count.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Returns the limit in bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.0
    }

    /// Returns true when `size` exceeds the limit.
    #[must_use]
    pub const fn exceeded_by(&self, size: usize) -> bool {
        size as u64 > self.0
    }
}

impl fmt::Display for BodyLimit {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}b", self.0)
    }
}

impl FromStr for BodyLimit {
    type Err = BodyLimitParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(BodyLimitParseError::Empty);
        }

        let lower = trimmed.to_ascii_lowercase();
        let (digits, multiplier) = match lower {
            _ if lower.ends_with("gb") => (&lower[..lower.len() - 2], KIB * KIB * KIB),
            _ if lower.ends_with("mb") => (&lower[..lower.len() - 2], KIB * KIB),
            _ if lower.ends_with("kb") => (&lower[..lower.len() - 2], KIB),
            _ if lower.ends_with('b') => (&lower[..lower.len() - 1], 1),
            _ => (lower.as_str(), 1),
        };

        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| BodyLimitParseError::InvalidNumber(input.to_string()))?;
        value
            .checked_mul(multiplier)
            .map(BodyLimit)
            .ok_or_else(|| BodyLimitParseError::Overflow(input.to_string()))
    }
}

/// Errors encountered while parsing a [`BodyLimit`] from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyLimitParseError {
    /// The input was empty or whitespace only.
    #[error("body size limit is empty")]
    Empty,
    /// The numeric portion failed to parse.
    #[error("invalid body size limit '{0}'")]
    InvalidNumber(String),
    /// The resulting byte count overflowed.
    #[error("body size limit '{0}' is out of range")]
    Overflow(String),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::megabytes("20mb", 20 * 1024 * 1024)]
    #[case::kilobytes("64kb", 64 * 1024)]
    #[case::gigabytes("1gb", 1024 * 1024 * 1024)]
    #[case::uppercase("5MB", 5 * 1024 * 1024)]
    #[case::plain_bytes("12345", 12345)]
    #[case::byte_suffix("512b", 512)]
    #[case::padded(" 8kb ", 8 * 1024)]
    fn parses_valid_limits(#[case] input: &str, #[case] expected: u64) {
        let limit: BodyLimit = input.parse().expect("parse limit");
        assert_eq!(limit.bytes(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_digits("mb")]
    #[case::garbage("twenty mb")]
    #[case::negative("-5mb")]
    fn rejects_invalid_limits(#[case] input: &str) {
        assert!(input.parse::<BodyLimit>().is_err());
    }

    #[test]
    fn exceeded_by_compares_against_bytes() {
        let limit = BodyLimit::from_bytes(10);
        assert!(!limit.exceeded_by(10));
        assert!(limit.exceeded_by(11));
    }
}
