//! base64(gzip(xml)) framing used by distributed document payloads.

use std::fmt;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Upper bound on a single decompressed document.
pub const MAX_DOC_BYTES: u64 = 10 * 1024 * 1024;

/// A payload that could not be unframed. Always confined to its own entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Empty,
    Base64(String),
    Gzip(String),
    TooLarge { limit: u64 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty payload"),
            DecodeError::Base64(e) => write!(f, "payload is not valid base64: {e}"),
            DecodeError::Gzip(e) => write!(f, "payload is not valid gzip: {e}"),
            DecodeError::TooLarge { limit } => {
                write!(f, "decompressed payload exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Reverse the base64 + gzip framing. Embedded whitespace (line-wrapped
/// payloads) is ignored. Output is capped at [`MAX_DOC_BYTES`].
pub fn decode(raw: &str) -> Result<Vec<u8>, DecodeError> {
    decode_capped(raw, MAX_DOC_BYTES)
}

fn decode_capped(raw: &str, limit: u64) -> Result<Vec<u8>, DecodeError> {
    let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(DecodeError::Empty);
    }

    let gz = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    let mut out = Vec::new();
    GzDecoder::new(gz.as_slice())
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Gzip(e.to_string()))?;
    if out.len() as u64 > limit {
        return Err(DecodeError::TooLarge { limit });
    }
    Ok(out)
}

/// Apply the framing. Inverse of [`decode`].
pub fn encode(bytes: &[u8]) -> String {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let gz = enc
        .write_all(bytes)
        .and_then(|_| enc.finish())
        .unwrap_or_default();
    STANDARD.encode(gz)
}
