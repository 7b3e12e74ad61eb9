//! One-shot document commands: watermark inspection, acknowledgement and
//! targeted fetch by access key.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use dfe_db::WatermarkStore;
use dfe_schemas::{AccessKey, EventType};
use dfe_signer::{ManifestOutcome, ManifestRequest};
use dfe_sync::KeyFetch;

use super::{build_runtime, find_account, load_config};

/// Print the stored watermark of every family of every enabled account (or
/// of one account). Needs only the database, not the certificates.
pub async fn watermark_show(config_paths: &[String], account: Option<&str>) -> Result<()> {
    let (_, cfg) = load_config(config_paths)?;
    let accounts = match account {
        Some(id) => vec![find_account(&cfg, id)?],
        None => cfg.accounts(),
    };

    let pool = dfe_db::connect_from_env().await?;
    let repo = dfe_db::PgRepository::new(pool);

    for a in &accounts {
        for family in &a.families {
            let nsu = repo.get_watermark(&a.id, *family).await?;
            println!("account={} family={} nsu={}", a.id, family, nsu);
        }
    }
    Ok(())
}

pub struct ManifestArgs<'a> {
    pub account: &'a str,
    pub key: &'a str,
    pub event: &'a str,
    pub sequence: u8,
    pub justification: Option<String>,
}

/// Acknowledge one document. Exits non-zero unless the event ends up
/// registered (now or previously).
pub async fn manifest(config_paths: &[String], args: ManifestArgs<'_>) -> Result<()> {
    let key = AccessKey::parse(args.key).context("invalid --key")?;
    let event_type = EventType::parse(args.event).context("invalid --event")?;

    let (_, cfg) = load_config(config_paths)?;
    let account = find_account(&cfg, args.account)?;
    let rt = build_runtime(&cfg).await?;

    let req = ManifestRequest {
        sequence: args.sequence,
        justification: args.justification,
        ..ManifestRequest::new(account, key, event_type)
    };
    let outcome = rt.manifestor.manifest(&req, Utc::now()).await;

    println!("access_key={}", req.access_key);
    println!("event={}", req.event_type);
    println!("outcome={outcome}");
    match outcome {
        ManifestOutcome::AlreadyRegistered(_) | ManifestOutcome::Registered(_) => Ok(()),
        ManifestOutcome::Rejected(v) => bail!("MANIFEST_REJECTED: {} {}", v.status_code, v.reason),
        ManifestOutcome::Failed(reason) => bail!("MANIFEST_FAILED: {reason}"),
    }
}

/// Targeted query for one access key; stores whatever comes back.
pub async fn fetch_key(config_paths: &[String], account: &str, key: &str) -> Result<()> {
    let key = AccessKey::parse(key).context("invalid --key")?;

    let (_, cfg) = load_config(config_paths)?;
    let account = find_account(&cfg, account)?;
    let rt = build_runtime(&cfg).await?;
    rt.engine.restore_quota(&account).await?;

    match rt.engine.fetch_access_key(&account, &key).await? {
        KeyFetch::Stored(docs) => {
            for (k, kind, outcome) in docs {
                println!("access_key={k} kind={} outcome={outcome:?}", kind.as_str());
            }
            if let Some(doc) = dfe_db::DocumentStore::fetch_document(rt.repo.as_ref(), &key).await? {
                println!("stored_kind={} nsu={}", doc.kind.as_str(), doc.nsu);
            }
            Ok(())
        }
        KeyFetch::NotFound { status_code, reason } => {
            bail!("NOT_FOUND: authority answered {status_code} {reason}")
        }
        KeyFetch::QuotaBlocked(denied) => bail!("QUOTA_BLOCKED: {denied}"),
    }
}
