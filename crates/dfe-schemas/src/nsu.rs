//! Distribution sequence number (NSU), used as the per-account watermark.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// A 15-digit sequence number issued by the distribution service.
///
/// Rendered zero-padded to [`Nsu::WIDTH`] digits on the wire and in logs.
/// `Nsu::default()` is the zero watermark (nothing consumed yet).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u64", into = "u64")]
pub struct Nsu(u64);

impl Nsu {
    pub const WIDTH: usize = 15;
    pub const MAX_VALUE: u64 = 999_999_999_999_999;
    pub const ZERO: Nsu = Nsu(0);

    pub fn new(value: u64) -> Result<Self, ParseError> {
        if value > Self::MAX_VALUE {
            return Err(ParseError::NsuOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Parse a decimal NSU of 1..=15 digits. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let s = raw.trim();
        if s.is_empty() || s.len() > Self::WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Nsu(s.to_string()));
        }
        let v: u64 = s.parse().map_err(|_| ParseError::Nsu(s.to_string()))?;
        Self::new(v)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Nsu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

impl TryFrom<u64> for Nsu {
    type Error = ParseError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Nsu> for u64 {
    fn from(n: Nsu) -> Self {
        n.0
    }
}
