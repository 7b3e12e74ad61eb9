use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dfe_schemas::{Account, AccountId, AuthorityCode, DocumentFamily, Environment, TaxId};
use serde::Deserialize;
use serde_json::Value;

/// Typed configuration consumed by the sync service.
#[derive(Debug, Clone, Deserialize)]
pub struct DfeConfig {
    #[serde(default = "default_environment")]
    pub environment: Environment,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub endpoints: EndpointOverrides,
    #[serde(default)]
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: AccountId,
    pub tax_id: TaxId,
    pub authority_code: AuthorityCode,
    /// Path to the PKCS#12 container holding key + certificate chain.
    pub certificate_path: String,
    /// NAME of the env var holding the container password.
    pub certificate_password_env: String,
    #[serde(default = "default_families")]
    pub families: Vec<DocumentFamily>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-account override of the top-level environment.
    #[serde(default)]
    pub environment: Option<Environment>,
}

/// Protocol timing and limits. The cool-down must not be shorter than the
/// quota window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub quota_limit: u32,
    pub quota_window_secs: u64,
    pub quota_cooldown_secs: u64,
    pub long_sleep_secs: u64,
    pub max_iterations_per_pass: u32,
    pub request_timeout_secs: u64,
    /// Delay before an account that hit a transient fault is tried again.
    pub fault_retry_secs: u64,
    pub auto_acknowledge_summaries: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            quota_limit: 20,
            quota_window_secs: 3600,
            quota_cooldown_secs: 3900,
            long_sleep_secs: 3600,
            max_iterations_per_pass: 100,
            request_timeout_secs: 30,
            fault_retry_secs: 300,
            auto_acknowledge_summaries: false,
        }
    }
}

impl SyncSettings {
    pub fn quota_window(&self) -> Duration {
        Duration::from_secs(self.quota_window_secs)
    }

    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.quota_cooldown_secs)
    }

    pub fn long_sleep(&self) -> Duration {
        Duration::from_secs(self.long_sleep_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn fault_retry(&self) -> Duration {
        Duration::from_secs(self.fault_retry_secs)
    }
}

/// Endpoint URL overrides. Keys: family (`nfe` / `cte`) for distribution,
/// 2-digit authority code for event submission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointOverrides {
    pub distribution: BTreeMap<String, String>,
    pub events: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Extra PEM root certificates trusted for the authority endpoints.
    pub ca_bundle_path: Option<String>,
}

fn default_environment() -> Environment {
    Environment::Production
}

fn default_families() -> Vec<DocumentFamily> {
    vec![DocumentFamily::Nfe]
}

fn default_true() -> bool {
    true
}

impl DfeConfig {
    pub fn from_json(config_json: &Value) -> Result<Self> {
        let cfg: DfeConfig =
            serde_json::from_value(config_json.clone()).context("CONFIG_INVALID: typed view")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.sync;
        if s.quota_limit == 0 {
            bail!("CONFIG_INVALID: sync.quota_limit must be > 0");
        }
        if s.quota_window_secs == 0 {
            bail!("CONFIG_INVALID: sync.quota_window_secs must be > 0");
        }
        if s.quota_cooldown_secs < s.quota_window_secs {
            bail!(
                "CONFIG_INVALID: sync.quota_cooldown_secs ({}) must be >= sync.quota_window_secs ({})",
                s.quota_cooldown_secs,
                s.quota_window_secs
            );
        }
        if s.max_iterations_per_pass == 0 {
            bail!("CONFIG_INVALID: sync.max_iterations_per_pass must be > 0");
        }
        if s.fault_retry_secs == 0 {
            bail!("CONFIG_INVALID: sync.fault_retry_secs must be > 0");
        }
        if !(1..=120).contains(&s.request_timeout_secs) {
            bail!("CONFIG_INVALID: sync.request_timeout_secs must be within 1..=120");
        }

        let mut seen = BTreeSet::new();
        for a in &self.accounts {
            if !seen.insert(a.id.clone()) {
                bail!("CONFIG_INVALID: duplicate account id '{}'", a.id);
            }
            if a.families.is_empty() {
                bail!("CONFIG_INVALID: account '{}' has no families", a.id);
            }
            if a.certificate_password_env.trim().is_empty() {
                bail!(
                    "CONFIG_INVALID: account '{}' certificate_password_env is blank",
                    a.id
                );
            }
        }
        for family in self.endpoints.distribution.keys() {
            DocumentFamily::parse(family)
                .with_context(|| format!("CONFIG_INVALID: endpoints.distribution.{family}"))?;
        }
        for code in self.endpoints.events.keys() {
            AuthorityCode::parse(code)
                .with_context(|| format!("CONFIG_INVALID: endpoints.events.{code}"))?;
        }
        Ok(())
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id.as_str() == id)
    }

    /// Sync-core view of every enabled account.
    pub fn accounts(&self) -> Vec<Account> {
        self.enabled_accounts()
            .map(|a| a.to_account(self.environment))
            .collect()
    }
}

impl AccountConfig {
    pub fn to_account(&self, default_env: Environment) -> Account {
        let mut families = self.families.clone();
        families.sort();
        families.dedup();
        Account {
            id: self.id.clone(),
            tax_id: self.tax_id.clone(),
            authority_code: self.authority_code.clone(),
            environment: self.environment.unwrap_or(default_env),
            families,
        }
    }
}
