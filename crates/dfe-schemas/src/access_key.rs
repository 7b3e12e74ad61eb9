//! 44-digit document access key.
//!
//! # Layout
//!
//! ```text
//! offset  0..2   authority (state) code
//!         2..6   issuance year + month (YYMM)
//!         6..20  issuer tax id (CNPJ, or CPF left-padded)
//!        20..22  document model (55 NF-e, 57 CT-e, ...)
//!        22..25  series
//!        25..34  document number
//!        34..35  emission type
//!        35..43  numeric code
//!        43..44  check digit (mod 11)
//! ```
//!
//! An [`AccessKey`] can only be constructed through [`AccessKey::parse`],
//! which rejects anything that is not exactly 44 ASCII digits with a valid
//! check digit.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DocumentFamily, ParseError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    pub const LEN: usize = 44;

    /// Parse and validate an access key (length, digits, check digit).
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let s = raw.trim();
        if s.len() != Self::LEN {
            return Err(ParseError::AccessKeyLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::AccessKeyNotNumeric);
        }
        let expected = check_digit(&s[..Self::LEN - 1])?;
        let got = s.as_bytes()[Self::LEN - 1] - b'0';
        if expected != got {
            return Err(ParseError::AccessKeyCheckDigit { expected, got });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn authority_code(&self) -> &str {
        &self.0[0..2]
    }

    /// `YYMM` of issuance.
    pub fn year_month(&self) -> &str {
        &self.0[2..6]
    }

    pub fn issuer_tax_id(&self) -> &str {
        &self.0[6..20]
    }

    pub fn model(&self) -> &str {
        &self.0[20..22]
    }

    pub fn series(&self) -> &str {
        &self.0[22..25]
    }

    pub fn number(&self) -> &str {
        &self.0[25..34]
    }

    pub fn emission_type(&self) -> &str {
        &self.0[34..35]
    }

    pub fn numeric_code(&self) -> &str {
        &self.0[35..43]
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[Self::LEN - 1] - b'0'
    }

    /// Document family derived from the model code, `None` for models this
    /// system does not distribute.
    pub fn family(&self) -> Option<DocumentFamily> {
        DocumentFamily::from_model(self.model())
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AccessKey {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccessKey> for String {
    fn from(k: AccessKey) -> Self {
        k.0
    }
}

/// Mod-11 check digit over the first 43 digits of a key.
///
/// Weights cycle 2..=9 starting from the rightmost digit; a remainder of 0 or
/// 1 yields digit 0.
pub fn check_digit(first_43: &str) -> Result<u8, ParseError> {
    if first_43.len() != AccessKey::LEN - 1 {
        return Err(ParseError::AccessKeyLength(first_43.len() + 1));
    }
    let mut sum: u32 = 0;
    let mut weight: u32 = 2;
    for b in first_43.bytes().rev() {
        if !b.is_ascii_digit() {
            return Err(ParseError::AccessKeyNotNumeric);
        }
        sum += u32::from(b - b'0') * weight;
        weight = if weight == 9 { 2 } else { weight + 1 };
    }
    let rem = sum % 11;
    Ok(if rem < 2 { 0 } else { (11 - rem) as u8 })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published sample key from the NF-e integration manual.
    const SAMPLE: &str = "52060433009911002506550120000007800267301615";

    #[test]
    fn sample_key_parses_and_exposes_fields() {
        let k = AccessKey::parse(SAMPLE).unwrap();
        assert_eq!(k.authority_code(), "52");
        assert_eq!(k.year_month(), "0604");
        assert_eq!(k.issuer_tax_id(), "33009911002506");
        assert_eq!(k.model(), "55");
        assert_eq!(k.series(), "012");
        assert_eq!(k.number(), "000000780");
        assert_eq!(k.emission_type(), "0");
        assert_eq!(k.numeric_code(), "26730161");
        assert_eq!(k.check_digit(), 5);
        assert_eq!(k.family(), Some(DocumentFamily::Nfe));
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(
            AccessKey::parse("123"),
            Err(ParseError::AccessKeyLength(3))
        );
    }

    #[test]
    fn non_digit_is_rejected() {
        let bad = format!("{}X", &SAMPLE[..43]);
        assert_eq!(AccessKey::parse(&bad), Err(ParseError::AccessKeyNotNumeric));
    }

    #[test]
    fn bad_check_digit_is_rejected() {
        let bad = format!("{}4", &SAMPLE[..43]);
        assert!(matches!(
            AccessKey::parse(&bad),
            Err(ParseError::AccessKeyCheckDigit { expected: 5, got: 4 })
        ));
    }

    #[test]
    fn serde_goes_through_validation() {
        let ok: AccessKey = serde_json::from_str(&format!("\"{SAMPLE}\"")).unwrap();
        assert_eq!(ok.as_str(), SAMPLE);
        assert!(serde_json::from_str::<AccessKey>("\"0000\"").is_err());
    }
}
