//! Shared data model for fiscal document distribution and acknowledgement.
//!
//! Pure types only: no IO, no clocks, no network. Every identifier that the
//! authority validates (access keys, watermarks, tax ids, authority codes) is
//! a newtype whose constructor enforces the wire format, so downstream crates
//! never handle an unchecked string.

mod access_key;
mod nsu;

pub use access_key::{check_digit, AccessKey};
pub use nsu::Nsu;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ParseError
// ---------------------------------------------------------------------------

/// Why a raw value could not be turned into one of the model's newtypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    AccessKeyLength(usize),
    AccessKeyNotNumeric,
    AccessKeyCheckDigit { expected: u8, got: u8 },
    Nsu(String),
    NsuOutOfRange(u64),
    TaxId(String),
    AuthorityCode(String),
    AccountId,
    Family(String),
    Kind(String),
    Environment(String),
    EventType(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::AccessKeyLength(n) => {
                write!(f, "access key must have 44 digits, got {n}")
            }
            ParseError::AccessKeyNotNumeric => write!(f, "access key must be numeric"),
            ParseError::AccessKeyCheckDigit { expected, got } => {
                write!(f, "access key check digit mismatch: expected {expected}, got {got}")
            }
            ParseError::Nsu(s) => write!(f, "invalid NSU '{s}'"),
            ParseError::NsuOutOfRange(v) => write!(f, "NSU {v} exceeds 15 digits"),
            ParseError::TaxId(s) => write!(f, "tax id must have 11 or 14 digits, got '{s}'"),
            ParseError::AuthorityCode(s) => {
                write!(f, "authority code must have 2 digits, got '{s}'")
            }
            ParseError::AccountId => write!(f, "account id must not be blank"),
            ParseError::Family(s) => write!(f, "unknown document family '{s}'"),
            ParseError::Kind(s) => write!(f, "unknown document kind '{s}'"),
            ParseError::Environment(s) => write!(f, "unknown environment '{s}'"),
            ParseError::EventType(s) => write!(f, "unknown event type '{s}'"),
        }
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Configured account identifier (operator-chosen, stable across restarts).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ParseError> {
        let s: String = raw.into();
        let t = s.trim();
        if t.is_empty() {
            return Err(ParseError::AccountId);
        }
        Ok(Self(t.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AccountId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for String {
    fn from(a: AccountId) -> Self {
        a.0
    }
}

/// Company (14-digit) or individual (11-digit) tax id.
///
/// The two forms travel in differently named XML elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaxId {
    Cnpj(String),
    Cpf(String),
}

impl TaxId {
    /// Accepts digits with or without the usual punctuation (`.`, `/`, `-`).
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let digits: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '.' | '/' | '-'))
            .collect();
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::TaxId(raw.to_string()));
        }
        match digits.len() {
            14 => Ok(TaxId::Cnpj(digits)),
            11 => Ok(TaxId::Cpf(digits)),
            _ => Err(ParseError::TaxId(raw.to_string())),
        }
    }

    pub fn digits(&self) -> &str {
        match self {
            TaxId::Cnpj(d) | TaxId::Cpf(d) => d,
        }
    }

    /// XML element name carrying this id.
    pub fn element_name(&self) -> &'static str {
        match self {
            TaxId::Cnpj(_) => "CNPJ",
            TaxId::Cpf(_) => "CPF",
        }
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.digits())
    }
}

impl TryFrom<String> for TaxId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaxId> for String {
    fn from(t: TaxId) -> Self {
        t.digits().to_string()
    }
}

/// Two-digit issuing-authority routing code (IBGE state code, or 91 for the
/// national environment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AuthorityCode(String);

impl AuthorityCode {
    pub const NATIONAL: &'static str = "91";

    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let s = raw.trim();
        if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::AuthorityCode(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AuthorityCode {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AuthorityCode> for String {
    fn from(a: AuthorityCode) -> Self {
        a.0
    }
}

/// Authority environment the account talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Homologation,
}

impl Environment {
    /// Wire flag (`tpAmb`).
    pub fn code(&self) -> &'static str {
        match self {
            Environment::Production => "1",
            Environment::Homologation => "2",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "production" | "prod" => Ok(Environment::Production),
            "2" | "homologation" | "hom" => Ok(Environment::Homologation),
            other => Err(ParseError::Environment(other.to_string())),
        }
    }
}

/// A querying identity as seen by the sync core. The signing identity itself
/// lives behind a credential store and is looked up by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub tax_id: TaxId,
    pub authority_code: AuthorityCode,
    pub environment: Environment,
    /// Families this account pulls, each with its own watermark.
    pub families: Vec<DocumentFamily>,
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Independent distribution streams; each has its own endpoint and watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFamily {
    /// Invoices (models 55 and 65).
    Nfe,
    /// Waybills (models 57 and 67).
    Cte,
}

impl DocumentFamily {
    pub const ALL: [DocumentFamily; 2] = [DocumentFamily::Nfe, DocumentFamily::Cte];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFamily::Nfe => "NFE",
            DocumentFamily::Cte => "CTE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NFE" | "NF-E" => Ok(DocumentFamily::Nfe),
            "CTE" | "CT-E" => Ok(DocumentFamily::Cte),
            other => Err(ParseError::Family(other.to_string())),
        }
    }

    /// Map a 2-digit model code (access key offset 20..22) to its family.
    pub fn from_model(model: &str) -> Option<Self> {
        match model {
            "55" | "65" => Some(DocumentFamily::Nfe),
            "57" | "67" => Some(DocumentFamily::Cte),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Summary,
    Event,
    Full,
}

impl DocumentKind {
    /// Storage precedence: a stored record is only replaced by a strictly
    /// higher rank, so a full document is never downgraded to a summary.
    /// Events are stored separately and never compete with documents.
    pub fn rank(&self) -> i16 {
        match self {
            DocumentKind::Summary => 0,
            DocumentKind::Event => 1,
            DocumentKind::Full => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Summary => "SUMMARY",
            DocumentKind::Event => "EVENT",
            DocumentKind::Full => "FULL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s {
            "SUMMARY" => Ok(DocumentKind::Summary),
            "EVENT" => Ok(DocumentKind::Event),
            "FULL" => Ok(DocumentKind::Full),
            other => Err(ParseError::Kind(other.to_string())),
        }
    }
}

/// Transient entry from a distribution response; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEnvelope {
    pub nsu: Nsu,
    /// Raw `schema` attribute, e.g. `resNFe_v1.01`.
    pub schema: Option<String>,
    /// base64(gzip(xml)) exactly as received.
    pub payload: String,
}

/// Identity of a distributed event document (`tpEvento` + `nSeqEvento`).
/// Events share the access key of the document they refer to, so they are
/// stored apart from summaries and full documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventRef {
    pub code: String,
    pub sequence: u32,
}

/// A decoded, classified document ready for idempotent storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedDocument {
    pub access_key: AccessKey,
    pub kind: DocumentKind,
    pub family: DocumentFamily,
    /// Sequence number the document was distributed under (zero for targeted
    /// queries, which carry no watermark).
    pub nsu: Nsu,
    pub schema_version: Option<String>,
    /// Local name of the XML root element.
    pub root: String,
    /// Present only for `DocumentKind::Event`.
    pub event: Option<EventRef>,
    pub xml: String,
}

// ---------------------------------------------------------------------------
// Quota window
// ---------------------------------------------------------------------------

/// Durable form of one account's rolling request window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaWindowSnapshot {
    /// Request instants still inside the window, oldest first.
    pub requests: Vec<DateTime<Utc>>,
    /// Set while the account is serving an authority-imposed cool-down.
    pub suspended_until: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Manifestation events
// ---------------------------------------------------------------------------

/// Recipient acknowledgement events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Confirmation,
    Awareness,
    UnknownOperation,
    OperationNotPerformed,
}

impl EventType {
    pub fn code(&self) -> &'static str {
        match self {
            EventType::Confirmation => "210200",
            EventType::Awareness => "210210",
            EventType::UnknownOperation => "210220",
            EventType::OperationNotPerformed => "210240",
        }
    }

    /// Fixed `descEvento` text (the authority compares it literally).
    pub fn description(&self) -> &'static str {
        match self {
            EventType::Confirmation => "Confirmacao da Operacao",
            EventType::Awareness => "Ciencia da Operacao",
            EventType::UnknownOperation => "Desconhecimento da Operacao",
            EventType::OperationNotPerformed => "Operacao nao Realizada",
        }
    }

    pub fn requires_justification(&self) -> bool {
        matches!(self, EventType::OperationNotPerformed)
    }

    pub fn parse(code: &str) -> Result<Self, ParseError> {
        match code.trim() {
            "210200" => Ok(EventType::Confirmation),
            "210210" => Ok(EventType::Awareness),
            "210220" => Ok(EventType::UnknownOperation),
            "210240" => Ok(EventType::OperationNotPerformed),
            other => Err(ParseError::EventType(other.to_string())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The authority's synchronous answer to an event submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status_code: u16,
    pub reason: String,
    /// Registration protocol number, present on success.
    pub protocol: Option<String>,
}

impl Verdict {
    /// 135/136: event registered. 573: the authority already holds an
    /// identical event, which is the same end state.
    pub fn is_registered(&self) -> bool {
        matches!(self.status_code, 135 | 136 | 573)
    }
}

/// A registered acknowledgement. At most one exists per
/// (access key, event type, account).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestationRecord {
    pub access_key: AccessKey,
    pub event_type: EventType,
    pub account_id: AccountId,
    pub sequence: u8,
    pub event_id: String,
    pub verdict: Verdict,
    pub signed_xml: String,
    pub registered_at_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tax_id_element_follows_length() {
        let cnpj = TaxId::parse("12.345.678/0001-95").unwrap();
        assert_eq!(cnpj.element_name(), "CNPJ");
        assert_eq!(cnpj.digits(), "12345678000195");

        let cpf = TaxId::parse("123.456.789-09").unwrap();
        assert_eq!(cpf.element_name(), "CPF");
        assert_eq!(cpf.digits(), "12345678909");

        assert!(TaxId::parse("1234").is_err());
    }

    #[test]
    fn authority_code_is_two_digits() {
        assert_eq!(AuthorityCode::parse("35").unwrap().as_str(), "35");
        assert!(AuthorityCode::parse("3").is_err());
        assert!(AuthorityCode::parse("3a").is_err());
    }

    #[test]
    fn family_from_model_code() {
        assert_eq!(DocumentFamily::from_model("55"), Some(DocumentFamily::Nfe));
        assert_eq!(DocumentFamily::from_model("65"), Some(DocumentFamily::Nfe));
        assert_eq!(DocumentFamily::from_model("57"), Some(DocumentFamily::Cte));
        assert_eq!(DocumentFamily::from_model("58"), None);
    }

    #[test]
    fn kind_rank_orders_summary_below_full() {
        assert!(DocumentKind::Summary.rank() < DocumentKind::Full.rank());
        assert!(DocumentKind::Event.rank() < DocumentKind::Full.rank());
        assert_eq!(DocumentKind::parse("FULL").unwrap(), DocumentKind::Full);
    }

    #[test]
    fn event_type_codes_round_trip() {
        for t in [
            EventType::Confirmation,
            EventType::Awareness,
            EventType::UnknownOperation,
            EventType::OperationNotPerformed,
        ] {
            assert_eq!(EventType::parse(t.code()).unwrap(), t);
        }
        assert!(EventType::parse("110111").is_err());
    }

    #[test]
    fn verdict_registration_codes() {
        let v = |c| Verdict {
            status_code: c,
            reason: String::new(),
            protocol: None,
        };
        assert!(v(135).is_registered());
        assert!(v(136).is_registered());
        assert!(v(573).is_registered());
        assert!(!v(650).is_registered());
    }

    #[test]
    fn environment_flag() {
        assert_eq!(Environment::parse("production").unwrap().code(), "1");
        assert_eq!(Environment::parse("2").unwrap(), Environment::Homologation);
    }
}
