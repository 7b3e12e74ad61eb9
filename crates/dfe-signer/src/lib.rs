//! Recipient acknowledgement events: build, sign, submit.
//!
//! # Contract
//! - [`event::build`] is the only way to obtain an [`EventEnvelope`]; it
//!   validates event id layout (54 characters), sequence (1..=20) and
//!   justification rules before anything is signed.
//! - [`xmldsig::sign`] applies the fixed reference transform chain
//!   `[enveloped-signature, c14n]`; the same constant drives both the
//!   computation and the `<Transforms>` written into the signature.
//! - [`Manifestor::manifest`] checks the repository first and makes zero
//!   network calls when the (access key, event type, account) triple is
//!   already registered.
//! - Submission failures are values ([`ManifestOutcome`]), never panics or
//!   errors that could abort a sync loop.

pub mod c14n;
pub mod credentials;
pub mod endpoints;
pub mod event;
pub mod identity;
mod manifest;
pub mod soap;
pub mod tls;
pub mod transport;
pub mod xmldsig;

pub use credentials::{CredentialMap, CredentialStore};
pub use endpoints::EventEndpoints;
pub use event::{build, event_id, EventEnvelope};
pub use identity::{CertEncoding, SigningIdentity};
pub use manifest::{ManifestRequest, Manifestor};
pub use tls::{ClientPool, IdentityClientPool, PlainClientPool};
pub use transport::{parse_event_response, EventTransport, SoapEventTransport, SubmitError};
pub use xmldsig::{sign, verify, SignedEnvelope};

use std::fmt;

use dfe_schemas::{ManifestationRecord, Verdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignError {
    /// Key or certificate unusable (wrong password, mismatch, expired).
    Identity(String),
    /// Event fields rejected before signing.
    Build(String),
    Canonicalize(String),
    Crypto(String),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::Identity(e) => write!(f, "signing identity: {e}"),
            SignError::Build(e) => write!(f, "invalid event: {e}"),
            SignError::Canonicalize(e) => write!(f, "canonicalization: {e}"),
            SignError::Crypto(e) => write!(f, "crypto: {e}"),
        }
    }
}

impl std::error::Error for SignError {}

/// Result of one acknowledgement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// A registered record already exists locally; nothing was sent.
    AlreadyRegistered(Box<ManifestationRecord>),
    /// The authority registered the event (135/136/573) and it was recorded.
    Registered(Verdict),
    /// The authority answered with any other status.
    Rejected(Verdict),
    /// Nothing conclusive happened (build, identity, signing or transport
    /// failure). Safe to retry later.
    Failed(String),
}

impl ManifestOutcome {
    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            ManifestOutcome::AlreadyRegistered(_) | ManifestOutcome::Registered(_)
        )
    }
}

impl fmt::Display for ManifestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestOutcome::AlreadyRegistered(r) => write!(
                f,
                "already registered (status {}, protocol {})",
                r.verdict.status_code,
                r.verdict.protocol.as_deref().unwrap_or("-")
            ),
            ManifestOutcome::Registered(v) => write!(
                f,
                "registered: {} {} (protocol {})",
                v.status_code,
                v.reason,
                v.protocol.as_deref().unwrap_or("-")
            ),
            ManifestOutcome::Rejected(v) => write!(f, "rejected: {} {}", v.status_code, v.reason),
            ManifestOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}
