//! Runtime secret resolution for certificate containers.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (`certificate_password_env`).
//! - At startup, callers invoke [`resolve_certificate_passwords`] once and
//!   pass the result into the credential store; nothing else reads the env.
//! - `Debug` output redacts every value.
//! - Error messages reference the env var **NAME**, never the value.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use dfe_schemas::AccountId;

use crate::DfeConfig;

/// A PKCS#12 container password. Redacted in `Debug`.
#[derive(Clone)]
pub struct CertificatePassword(String);

impl CertificatePassword {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for CertificatePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertificatePassword(<REDACTED>)")
    }
}

/// Passwords for every enabled account, keyed by account id.
#[derive(Clone, Debug, Default)]
pub struct ResolvedPasswords {
    by_account: BTreeMap<AccountId, CertificatePassword>,
}

impl ResolvedPasswords {
    pub fn get(&self, id: &AccountId) -> Option<&CertificatePassword> {
        self.by_account.get(id)
    }

    pub fn insert(&mut self, id: AccountId, password: CertificatePassword) {
        self.by_account.insert(id, password);
    }

    pub fn len(&self) -> usize {
        self.by_account.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_account.is_empty()
    }
}

/// Resolve a named environment variable; unset or blank yields `None`.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve the certificate password of every enabled account.
///
/// # Errors
/// Fails closed on the first enabled account whose variable is unset or
/// blank. The message names the variable and the account, never a value.
pub fn resolve_certificate_passwords(cfg: &DfeConfig) -> Result<ResolvedPasswords> {
    let mut out = ResolvedPasswords::default();
    for acct in cfg.enabled_accounts() {
        let var = acct.certificate_password_env.trim();
        match resolve_env(var) {
            Some(v) => out.insert(acct.id.clone(), CertificatePassword::new(v)),
            None => bail!(
                "SECRETS_MISSING account={}: required env var '{}' \
                 (certificate password) is not set or empty",
                acct.id,
                var,
            ),
        }
    }
    Ok(out)
}
