//! Throwaway RSA identities for signing tests.

use anyhow::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};

use dfe_signer::SigningIdentity;

/// A fresh 2048-bit key and a self-signed certificate valid for `days`.
pub fn self_signed(common_name: &str, days: u32) -> Result<(PKey<Private>, X509)> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("C", "BR")?;
    name.append_entry_by_text("O", "ICP-Brasil")?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut cert = X509::builder()?;
    cert.set_version(2)?;
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    cert.set_serial_number(&serial)?;
    cert.set_subject_name(&name)?;
    cert.set_issuer_name(&name)?;
    cert.set_pubkey(&key)?;
    cert.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    cert.set_not_after(Asn1Time::days_from_now(days)?.as_ref())?;
    cert.sign(&key, MessageDigest::sha256())?;

    Ok((key, cert.build()))
}

/// Signing identity over a throwaway key, valid for a year.
pub fn test_identity() -> Result<SigningIdentity> {
    let (key, cert) = self_signed("EMPRESA TESTE LTDA:12345678000195", 365)?;
    Ok(SigningIdentity::from_parts(key, cert, Vec::new())?)
}

/// The same kind of identity packed in a password-protected PKCS#12
/// container, as operators deliver them.
pub fn test_pkcs12(password: &str) -> Result<Vec<u8>> {
    let (key, cert) = self_signed("EMPRESA TESTE LTDA:12345678000195", 365)?;
    let p12 = Pkcs12::builder()
        .name("dfe-test")
        .pkey(&key)
        .cert(&cert)
        .build2(password)?;
    Ok(p12.to_der()?)
}
