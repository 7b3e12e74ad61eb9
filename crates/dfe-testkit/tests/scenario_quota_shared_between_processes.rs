//! Scenario: a long-running daemon and short-lived `fetch-key` runs share
//! one hourly query window through the repository.
//!
//! # Invariants under test
//!
//! 1. Each process keeps its own guard, yet the combined number of queries
//!    admitted inside one window never exceeds the limit.
//! 2. A guard that was restored once at startup learns about queries other
//!    processes made since then, before its next admission.
//! 3. Once the shared window is full a targeted query is refused locally,
//!    without a network call.
//! 4. Every admitted query left exactly one reservation in the repository.

use std::sync::Arc;
use std::time::Duration;

use dfe_db::QuotaStore;
use dfe_quota::{QuotaDenied, QuotaGuard, QuotaPolicy};
use dfe_schemas::DocumentFamily;
use dfe_sync::{EngineSettings, KeyFetch, SleepReason, SyncEngine, SyncState};
use dfe_testkit::{
    documents_found, summary_entries, test_account, AccessKeyBuilder, ManualClock,
    MemoryRepository, ScriptedDistributionClient,
};

fn process(
    repo: &Arc<MemoryRepository>,
    client: &Arc<ScriptedDistributionClient>,
    clock: &Arc<ManualClock>,
) -> SyncEngine {
    let quota = Arc::new(QuotaGuard::new(QuotaPolicy::default(), clock.clone()));
    SyncEngine::new(repo.clone(), client.clone(), quota, EngineSettings::default())
}

#[tokio::test]
async fn daemon_and_key_fetches_stay_within_one_window() -> anyhow::Result<()> {
    let account = test_account("matriz")?;
    let repo = Arc::new(MemoryRepository::new());
    let clock = Arc::new(ManualClock::fixed());
    let daemon_client = Arc::new(ScriptedDistributionClient::new());
    let cli_client = Arc::new(ScriptedDistributionClient::new());

    // Far more pages than one window can admit.
    for i in 0..40u64 {
        let first = i * 10 + 1;
        daemon_client.respond(documents_found(first + 9, 10_000, summary_entries(first, 10)?)?);
    }

    let daemon = process(&repo, &daemon_client, &clock);
    daemon.restore_quota(&account).await?;

    let mut budget = 10;
    let first = daemon
        .drain_family(&account, DocumentFamily::Nfe, &mut budget)
        .await?;
    assert_eq!(first.queries, 10);
    assert_eq!(first.final_state, SyncState::Yield);

    // Five separate `fetch-key` runs, each with a fresh guard.
    for n in 0..5u64 {
        let key = AccessKeyBuilder::new().number(90_000 + n).build()?;
        let cli = process(&repo, &cli_client, &clock);
        cli.restore_quota(&account).await?;
        let fetched = cli.fetch_access_key(&account, &key).await?;
        assert!(matches!(fetched, KeyFetch::NotFound { .. }), "run {n}: {fetched:?}");
    }
    assert_eq!(cli_client.call_count(), 5);

    // The daemon never restarts, but only five more queries fit.
    clock.advance(Duration::from_secs(60));
    let mut budget = 100;
    let second = daemon
        .drain_family(&account, DocumentFamily::Nfe, &mut budget)
        .await?;
    assert_eq!(second.queries, 5);
    assert_eq!(second.final_state, SyncState::Sleeping(SleepReason::Quota));

    // A later run is refused without reaching the network.
    let key = AccessKeyBuilder::new().number(99_999).build()?;
    let late = process(&repo, &cli_client, &clock);
    late.restore_quota(&account).await?;
    let blocked = late.fetch_access_key(&account, &key).await?;
    assert!(matches!(
        blocked,
        KeyFetch::QuotaBlocked(QuotaDenied::WindowFull { .. })
    ));
    assert_eq!(cli_client.call_count(), 5);

    let total = daemon_client.call_count() + cli_client.call_count();
    assert_eq!(total, 20);
    assert_eq!(repo.quota_reservations(), 20);
    assert_eq!(repo.load_quota(&account.id).await?.requests.len(), 20);
    Ok(())
}

#[tokio::test]
async fn window_reopens_for_every_process_after_an_hour() -> anyhow::Result<()> {
    let account = test_account("matriz")?;
    let repo = Arc::new(MemoryRepository::new());
    let clock = Arc::new(ManualClock::fixed());
    let daemon_client = Arc::new(ScriptedDistributionClient::new());
    let cli_client = Arc::new(ScriptedDistributionClient::new());

    for i in 0..50u64 {
        let first = i * 10 + 1;
        daemon_client.respond(documents_found(first + 9, 10_000, summary_entries(first, 10)?)?);
    }

    let daemon = process(&repo, &daemon_client, &clock);
    let mut budget = 100;
    let full = daemon
        .drain_family(&account, DocumentFamily::Nfe, &mut budget)
        .await?;
    assert_eq!(full.queries, 20);

    let key = AccessKeyBuilder::new().number(4_242).build()?;
    let cli = process(&repo, &cli_client, &clock);
    cli.restore_quota(&account).await?;
    assert!(matches!(
        cli.fetch_access_key(&account, &key).await?,
        KeyFetch::QuotaBlocked(_)
    ));

    clock.advance(Duration::from_secs(3601));
    let cli = process(&repo, &cli_client, &clock);
    cli.restore_quota(&account).await?;
    assert!(matches!(
        cli.fetch_access_key(&account, &key).await?,
        KeyFetch::NotFound { .. }
    ));

    // The daemon sees the key fetch and leaves room for it.
    let mut budget = 100;
    let resumed = daemon
        .drain_family(&account, DocumentFamily::Nfe, &mut budget)
        .await?;
    assert_eq!(resumed.queries, 19);
    assert_eq!(cli_client.call_count(), 1);
    Ok(())
}
