//! Enveloped XML signature over `infEvento` (RSA-SHA1, C14N 1.0).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use openssl::hash::{hash, MessageDigest};
use openssl::sign::Verifier;
use openssl::x509::X509;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::c14n::{self, Target, Transform, C14N_ALGORITHM, DSIG_NS, REFERENCE_TRANSFORMS};
use crate::event::EventEnvelope;
use crate::identity::SigningIdentity;
use crate::SignError;

const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
const SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";

/// A signed `<evento>`, ready to be wrapped in a submission batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    envelope: EventEnvelope,
    xml: String,
}

impl SignedEnvelope {
    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    pub fn event_id(&self) -> &str {
        self.envelope.id()
    }

    /// The signed `<evento>` element.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// `<envEvento>` carrying this single event under batch id `lot`
    /// (rendered as 15 digits).
    pub fn batch_xml(&self, lot: u64) -> String {
        format!(
            "<envEvento xmlns=\"{}\" versao=\"{}\"><idLote>{:015}</idLote>{}</envEvento>",
            crate::event::NFE_NS,
            crate::event::EVENT_VERSION,
            lot % 1_000_000_000_000_000,
            self.xml
        )
    }
}

fn digest_b64(data: &[u8]) -> Result<String, SignError> {
    let d = hash(MessageDigest::sha1(), data).map_err(|e| SignError::Crypto(e.to_string()))?;
    Ok(STANDARD.encode(&*d))
}

fn signed_info_body(reference_uri: &str, digest: &str) -> String {
    let mut s = String::with_capacity(640);
    s.push_str(&format!(
        "<CanonicalizationMethod Algorithm=\"{C14N_ALGORITHM}\"></CanonicalizationMethod>"
    ));
    s.push_str(&format!("<SignatureMethod Algorithm=\"{RSA_SHA1}\"></SignatureMethod>"));
    s.push_str(&format!("<Reference URI=\"#{reference_uri}\"><Transforms>"));
    for t in REFERENCE_TRANSFORMS {
        s.push_str(&format!("<Transform Algorithm=\"{}\"></Transform>", t.algorithm()));
    }
    s.push_str("</Transforms>");
    s.push_str(&format!("<DigestMethod Algorithm=\"{SHA1}\"></DigestMethod>"));
    s.push_str(&format!("<DigestValue>{digest}</DigestValue></Reference>"));
    s
}

/// Sign `envelope` with `identity`.
///
/// 1. canonicalize `infEvento` through the reference transform chain;
/// 2. SHA-1 digest into `SignedInfo`;
/// 3. RSA-SHA1 over canonical `SignedInfo`;
/// 4. embed the negotiated certificate in `KeyInfo`.
pub fn sign(envelope: &EventEnvelope, identity: &SigningIdentity) -> Result<SignedEnvelope, SignError> {
    let unsigned = envelope.evento_xml(None);
    let canonical = c14n::canonicalize(&unsigned, Target::Id(envelope.id()), &REFERENCE_TRANSFORMS)
        .map_err(|e| SignError::Canonicalize(e.to_string()))?;
    let digest = digest_b64(canonical.as_bytes())?;

    let body = signed_info_body(envelope.id(), &digest);
    let standalone = format!("<SignedInfo xmlns=\"{DSIG_NS}\">{body}</SignedInfo>");
    let canonical_si = c14n::canonicalize(&standalone, Target::Root, &[Transform::C14n])
        .map_err(|e| SignError::Canonicalize(e.to_string()))?;
    let signature = STANDARD.encode(identity.sign(canonical_si.as_bytes())?);
    let cert = STANDARD.encode(identity.certificate_der());

    let signature_xml = format!(
        "<Signature xmlns=\"{DSIG_NS}\"><SignedInfo>{body}</SignedInfo>\
         <SignatureValue>{signature}</SignatureValue>\
         <KeyInfo><X509Data><X509Certificate>{cert}</X509Certificate></X509Data></KeyInfo>\
         </Signature>"
    );

    Ok(SignedEnvelope {
        envelope: envelope.clone(),
        xml: envelope.evento_xml(Some(&signature_xml)),
    })
}

#[derive(Default)]
struct SignatureParts {
    reference_uri: Option<String>,
    digest: Option<String>,
    signature: Option<String>,
    certificate: Option<String>,
}

fn extract_parts(xml: &str) -> Result<SignatureParts, SignError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut parts = SignatureParts::default();
    let mut current: Option<Vec<u8>> = None;

    loop {
        match reader
            .read_event()
            .map_err(|e| SignError::Canonicalize(e.to_string()))?
        {
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                if local == b"Reference" && parts.reference_uri.is_none() {
                    parts.reference_uri = e
                        .try_get_attribute("URI")
                        .ok()
                        .flatten()
                        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                }
                current = Some(local);
            }
            Event::Text(t) => {
                let v = t
                    .unescape()
                    .map_err(|e| SignError::Canonicalize(e.to_string()))?
                    .trim()
                    .to_string();
                match current.as_deref() {
                    Some(b"DigestValue") if parts.digest.is_none() => parts.digest = Some(v),
                    Some(b"SignatureValue") if parts.signature.is_none() => {
                        parts.signature = Some(v)
                    }
                    Some(b"X509Certificate") if parts.certificate.is_none() => {
                        parts.certificate = Some(v)
                    }
                    _ => {}
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(parts)
}

fn b64(field: &str, v: &str) -> Result<Vec<u8>, SignError> {
    let compact: String = v.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SignError::Crypto(format!("{field} is not base64: {e}")))
}

/// Check a signed event the way the authority does: recompute the reference
/// digest, then verify `SignatureValue` with the embedded certificate.
pub fn verify(signed_xml: &str) -> Result<(), SignError> {
    let parts = extract_parts(signed_xml)?;
    let missing = |what: &str| SignError::Crypto(format!("signature has no {what}"));

    let uri = parts.reference_uri.ok_or_else(|| missing("Reference URI"))?;
    let id = uri
        .strip_prefix('#')
        .ok_or_else(|| SignError::Crypto(format!("unsupported reference URI '{uri}'")))?;

    let canonical = c14n::canonicalize(signed_xml, Target::Id(id), &REFERENCE_TRANSFORMS)
        .map_err(|e| SignError::Canonicalize(e.to_string()))?;
    let expected = digest_b64(canonical.as_bytes())?;
    let stated = parts.digest.ok_or_else(|| missing("DigestValue"))?;
    if expected != stated {
        return Err(SignError::Crypto("reference digest mismatch".to_string()));
    }

    let canonical_si = c14n::canonicalize(signed_xml, Target::Element("SignedInfo"), &[Transform::C14n])
        .map_err(|e| SignError::Canonicalize(e.to_string()))?;
    let sig = b64("SignatureValue", &parts.signature.ok_or_else(|| missing("SignatureValue"))?)?;
    let der = b64("X509Certificate", &parts.certificate.ok_or_else(|| missing("X509Certificate"))?)?;

    let cert = X509::from_der(&der).map_err(|e| SignError::Crypto(e.to_string()))?;
    let public = cert.public_key().map_err(|e| SignError::Crypto(e.to_string()))?;
    let mut verifier =
        Verifier::new(MessageDigest::sha1(), &public).map_err(|e| SignError::Crypto(e.to_string()))?;
    verifier
        .update(canonical_si.as_bytes())
        .map_err(|e| SignError::Crypto(e.to_string()))?;
    match verifier.verify(&sig) {
        Ok(true) => Ok(()),
        Ok(false) => Err(SignError::Crypto("signature value does not verify".to_string())),
        Err(e) => Err(SignError::Crypto(e.to_string())),
    }
}
