//! Per-account signing identities.
//!
//! Loaded once at startup from the configured certificate containers; the
//! sync core and the signer only ever ask for "the identity of account X".

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dfe_config::{DfeConfig, ResolvedPasswords};
use dfe_schemas::AccountId;

use crate::identity::SigningIdentity;
use crate::SignError;

pub trait CredentialStore: Send + Sync {
    fn identity(&self, account: &AccountId) -> Result<Arc<SigningIdentity>, SignError>;
}

/// In-memory map of already-validated identities.
#[derive(Debug, Default, Clone)]
pub struct CredentialMap {
    by_account: HashMap<AccountId, Arc<SigningIdentity>>,
}

impl CredentialMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, account: AccountId, identity: SigningIdentity) {
        self.by_account.insert(account, Arc::new(identity));
    }

    pub fn len(&self) -> usize {
        self.by_account.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_account.is_empty()
    }

    /// Open the certificate container of every enabled account.
    ///
    /// # Errors
    /// Fails on the first account whose file cannot be read, whose password
    /// was not resolved, or whose container does not yield a valid identity.
    pub fn load_from_config(cfg: &DfeConfig, passwords: &ResolvedPasswords) -> Result<Self> {
        let mut out = Self::new();
        for acct in cfg.enabled_accounts() {
            let bytes = std::fs::read(&acct.certificate_path).with_context(|| {
                format!(
                    "reading certificate for account {} at {}",
                    acct.id, acct.certificate_path
                )
            })?;
            let password = passwords.get(&acct.id).ok_or_else(|| {
                anyhow!(
                    "SECRETS_MISSING account={}: certificate password not resolved",
                    acct.id
                )
            })?;
            let identity = SigningIdentity::load(&bytes, password.expose())
                .map_err(|e| anyhow!("CERTIFICATE_INVALID account={}: {e}", acct.id))?;
            tracing::info!(account = %acct.id, subject = %identity.subject(), "credentials/loaded");
            out.insert(acct.id.clone(), identity);
        }
        Ok(out)
    }
}

impl CredentialStore for CredentialMap {
    fn identity(&self, account: &AccountId) -> Result<Arc<SigningIdentity>, SignError> {
        self.by_account
            .get(account)
            .cloned()
            .ok_or_else(|| SignError::Identity(format!("no signing identity for account {account}")))
    }
}
