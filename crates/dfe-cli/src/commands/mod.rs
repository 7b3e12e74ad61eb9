//! Command handler modules for dfe-cli.
//!
//! Shared bootstrap (config, credentials, repository, engine wiring) lives
//! here. Command-specific logic lives in the submodules.

pub mod documents;
pub mod sync;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dfe_client::{DistributionEndpoints, SoapDistributionClient};
use dfe_config::{
    load_layered_yaml, report_unused_keys, resolve_certificate_passwords, DfeConfig, LoadedConfig,
    UnusedKeyPolicy,
};
use dfe_db::PgRepository;
use dfe_quota::{QuotaGuard, QuotaPolicy};
use dfe_schemas::Account;
use dfe_signer::{
    ClientPool, CredentialMap, EventEndpoints, IdentityClientPool, Manifestor, SoapEventTransport,
};
use dfe_sync::{EngineSettings, SyncEngine};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Merge the layered files and build the typed view. Unused keys are warned.
pub fn load_config(paths: &[String]) -> Result<(LoadedConfig, DfeConfig)> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = load_layered_yaml(&path_refs)?;

    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    for pointer in &report.unused_leaf_pointers {
        tracing::warn!(%pointer, "config/unused_key");
    }

    let cfg = loaded.typed()?;
    tracing::info!(
        config_hash = %loaded.config_hash,
        accounts = cfg.accounts.len(),
        enabled = cfg.enabled_accounts().count(),
        "config/loaded"
    );
    Ok((loaded, cfg))
}

/// The enabled account named `id`.
pub fn find_account(cfg: &DfeConfig, id: &str) -> Result<Account> {
    let acct = cfg
        .account(id)
        .with_context(|| format!("unknown account '{id}'"))?;
    if !acct.enabled {
        bail!("account '{id}' is disabled");
    }
    Ok(acct.to_account(cfg.environment))
}

// ---------------------------------------------------------------------------
// Runtime wiring
// ---------------------------------------------------------------------------

/// Everything a command needs to talk to the authority and the database.
pub struct Runtime {
    pub repo: Arc<PgRepository>,
    pub engine: Arc<SyncEngine>,
    pub manifestor: Arc<Manifestor>,
}

/// Resolve secrets, open every certificate, connect to Postgres and wire the
/// engine. Fails on the first missing secret, bad certificate or
/// unreachable database.
pub async fn build_runtime(cfg: &DfeConfig) -> Result<Runtime> {
    let passwords = resolve_certificate_passwords(cfg)?;
    let credentials = Arc::new(CredentialMap::load_from_config(cfg, &passwords)?);

    let mut pool = IdentityClientPool::new(credentials.clone(), cfg.sync.request_timeout());
    if let Some(path) = &cfg.tls.ca_bundle_path {
        let pem = std::fs::read(path).with_context(|| format!("reading CA bundle {path}"))?;
        pool = pool.with_ca_bundle(&pem)?;
    }
    let clients: Arc<dyn ClientPool> = Arc::new(pool);

    let db = dfe_db::connect_from_env().await?;
    dfe_db::migrate(&db).await?;
    let repo = Arc::new(PgRepository::new(db));

    let transport = SoapEventTransport::new(
        EventEndpoints::new(cfg.endpoints.events.clone()),
        clients.clone(),
    );
    let manifestor = Arc::new(Manifestor::new(
        repo.clone(),
        credentials,
        Arc::new(transport),
    ));

    let client = SoapDistributionClient::new(
        DistributionEndpoints::new(cfg.endpoints.distribution.clone()),
        clients,
    );

    let s = &cfg.sync;
    let policy = QuotaPolicy::new(s.quota_limit, s.quota_window(), s.quota_cooldown());
    let quota = Arc::new(QuotaGuard::with_system_clock(policy));

    let engine = SyncEngine::new(
        repo.clone(),
        Arc::new(client),
        quota,
        EngineSettings::from_config(s),
    )
    .with_manifestor(manifestor.clone());

    Ok(Runtime {
        repo,
        engine: Arc::new(engine),
        manifestor,
    })
}
