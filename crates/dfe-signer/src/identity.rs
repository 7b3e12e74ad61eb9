//! Signing identity: one private key plus the certificate that vouches for it.
//!
//! # Contract
//! - Construction performs certificate-encoding negotiation exactly once and
//!   fails closed: the kept certificate is the first encoding whose public key
//!   matches the private key AND verifies a probe signature.
//! - Callers never see raw key material; they get `sign(bytes)` and
//!   `certificate_der()`.

use std::cmp::Ordering;
use std::fmt;

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;

use crate::SignError;

const PROBE: &[u8] = b"dfe-signing-identity-probe";

/// Certificate encodings tried, in order, when negotiating the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertEncoding {
    Pem,
    Der,
}

impl CertEncoding {
    pub const NEGOTIATION_ORDER: [CertEncoding; 2] = [CertEncoding::Pem, CertEncoding::Der];
}

pub struct SigningIdentity {
    key: PKey<Private>,
    cert: X509,
    chain: Vec<X509>,
    cert_der: Vec<u8>,
    encoding: CertEncoding,
    subject: String,
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("subject", &self.subject)
            .field("encoding", &self.encoding)
            .field("chain_len", &self.chain.len())
            .field("key", &"<REDACTED>")
            .finish()
    }
}

fn identity_err(what: &str, e: impl fmt::Display) -> SignError {
    SignError::Identity(format!("{what}: {e}"))
}

impl SigningIdentity {
    /// Load from container bytes: PEM bundles are recognized by their armor,
    /// anything else is treated as a PKCS#12 container.
    pub fn load(bytes: &[u8], password: &str) -> Result<Self, SignError> {
        if bytes
            .iter()
            .skip_while(|b| b.is_ascii_whitespace())
            .take(10)
            .eq(b"-----BEGIN".iter())
        {
            Self::from_pem_bundle(bytes, password)
        } else {
            Self::from_pkcs12(bytes, password)
        }
    }

    /// Open a password-protected PKCS#12 container.
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self, SignError> {
        let p12 = Pkcs12::from_der(der).map_err(|e| identity_err("not a PKCS#12 container", e))?;
        let parsed = p12
            .parse2(password)
            .map_err(|e| identity_err("cannot open PKCS#12 (wrong password?)", e))?;
        let key = parsed
            .pkey
            .ok_or_else(|| SignError::Identity("PKCS#12 has no private key".to_string()))?;
        let cert = parsed
            .cert
            .ok_or_else(|| SignError::Identity("PKCS#12 has no certificate".to_string()))?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();
        Self::from_parts(key, cert, chain)
    }

    /// A PEM bundle holding the private key (optionally encrypted with
    /// `password`) followed by the leaf certificate and any intermediates.
    pub fn from_pem_bundle(pem: &[u8], password: &str) -> Result<Self, SignError> {
        let key = if password.is_empty() {
            PKey::private_key_from_pem(pem)
        } else {
            PKey::private_key_from_pem_passphrase(pem, password.as_bytes())
        }
        .map_err(|e| identity_err("cannot read private key from PEM", e))?;

        let mut certs = X509::stack_from_pem(pem)
            .map_err(|e| identity_err("cannot read certificates from PEM", e))?
            .into_iter();
        let cert = certs
            .next()
            .ok_or_else(|| SignError::Identity("PEM bundle has no certificate".to_string()))?;
        Self::from_parts(key, cert, certs.collect())
    }

    /// Pair a key with its certificate, negotiating the certificate encoding.
    pub fn from_parts(key: PKey<Private>, cert: X509, chain: Vec<X509>) -> Result<Self, SignError> {
        let now = Asn1Time::days_from_now(0).map_err(|e| identity_err("clock", e))?;
        let expired = cert
            .not_after()
            .compare(&now)
            .map_err(|e| identity_err("certificate validity", e))?
            == Ordering::Less;
        if expired {
            return Err(SignError::Identity(format!(
                "certificate expired at {}",
                cert.not_after()
            )));
        }

        let probe_sig = sign_with(&key, PROBE)?;

        let mut last_failure = String::from("no encoding attempted");
        for encoding in CertEncoding::NEGOTIATION_ORDER {
            match negotiate(&key, &cert, encoding, &probe_sig) {
                Ok(candidate) => {
                    let cert_der = candidate
                        .to_der()
                        .map_err(|e| identity_err("certificate re-encode", e))?;
                    let subject = subject_line(&candidate);
                    return Ok(Self {
                        key,
                        cert: candidate,
                        chain,
                        cert_der,
                        encoding,
                        subject,
                    });
                }
                Err(reason) => {
                    tracing::debug!(?encoding, %reason, "identity/encoding_rejected");
                    last_failure = reason;
                }
            }
        }
        Err(SignError::Identity(format!(
            "no certificate encoding validates against the private key: {last_failure}"
        )))
    }

    /// RSA-SHA1 signature, as required by the event signature profile.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignError> {
        sign_with(&self.key, data)
    }

    /// DER bytes of the negotiated leaf certificate (embedded in KeyInfo).
    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn encoding(&self) -> CertEncoding {
        self.encoding
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// PKCS#8 key followed by the certificate chain, for TLS client auth.
    pub fn tls_pem(&self) -> Result<Vec<u8>, SignError> {
        let mut out = self
            .key
            .private_key_to_pem_pkcs8()
            .map_err(|e| identity_err("key export", e))?;
        for c in std::iter::once(&self.cert).chain(self.chain.iter()) {
            out.extend(c.to_pem().map_err(|e| identity_err("certificate export", e))?);
        }
        Ok(out)
    }
}

fn sign_with(key: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut signer =
        Signer::new(MessageDigest::sha1(), key).map_err(|e| SignError::Crypto(e.to_string()))?;
    signer
        .update(data)
        .map_err(|e| SignError::Crypto(e.to_string()))?;
    signer
        .sign_to_vec()
        .map_err(|e| SignError::Crypto(e.to_string()))
}

/// Re-read `cert` through `encoding` and accept it only if it pairs with `key`.
fn negotiate(
    key: &PKey<Private>,
    cert: &X509,
    encoding: CertEncoding,
    probe_sig: &[u8],
) -> Result<X509, String> {
    let candidate = match encoding {
        CertEncoding::Pem => cert
            .to_pem()
            .and_then(|pem| X509::from_pem(&pem))
            .map_err(|e| format!("pem: {e}"))?,
        CertEncoding::Der => cert
            .to_der()
            .and_then(|der| X509::from_der(&der))
            .map_err(|e| format!("der: {e}"))?,
    };

    let public = candidate
        .public_key()
        .map_err(|e| format!("public key: {e}"))?;
    if !public.public_eq(key) {
        return Err("certificate public key does not match private key".to_string());
    }

    let mut verifier =
        Verifier::new(MessageDigest::sha1(), &public).map_err(|e| format!("verifier: {e}"))?;
    verifier
        .update(PROBE)
        .map_err(|e| format!("verifier: {e}"))?;
    match verifier.verify(probe_sig) {
        Ok(true) => Ok(candidate),
        Ok(false) => Err("probe signature does not verify".to_string()),
        Err(e) => Err(format!("probe verification: {e}")),
    }
}

fn subject_line(cert: &X509) -> String {
    cert.subject_name()
        .entries()
        .filter_map(|e| {
            let field = e.object().nid().short_name().ok()?;
            let value = e.data().as_utf8().ok()?;
            Some(format!("{field}={value}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}
