//! `dfe sync`: the long-running distribution loop.

use std::future::Future;

use anyhow::{bail, Result};
use dfe_sync::Scheduler;
use tokio::sync::watch;

use super::{build_runtime, load_config};

/// Run the scheduler until Ctrl-C (or for one pass with `once`).
///
/// Startup is fail-closed: no enabled accounts, a missing secret, an
/// unreadable certificate or an unreachable database all abort before the
/// first query.
pub async fn run(config_paths: &[String], once: bool) -> Result<()> {
    let (loaded, cfg) = load_config(config_paths)?;

    let accounts = cfg.accounts();
    if accounts.is_empty() {
        bail!("NO_ACCOUNTS: configuration has no enabled accounts");
    }

    let rt = build_runtime(&cfg).await?;

    tracing::info!(
        config_hash = %loaded.config_hash,
        accounts = accounts.len(),
        once,
        "sync/start"
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), tx));

    let scheduler = Scheduler::new(rt.engine, accounts);
    scheduler.run(rx, once).await;

    println!("sync_stopped=true");
    Ok(())
}

/// Flip the shutdown flag when `signal` fires. If the signal handler cannot
/// be installed the sender is held until the scheduler goes away, since a
/// dropped sender also stops the scheduler.
async fn forward_shutdown<F>(signal: F, tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("sync/shutdown_requested");
            let _ = tx.send(true);
        }
        Err(e) => {
            tracing::warn!(error = %e, "sync/signal_handler_failed");
            tx.closed().await;
        }
    }
}
