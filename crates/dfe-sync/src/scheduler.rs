//! Multi-account pass loop with a cancellable inter-pass sleep.
//!
//! A pass visits every account in configuration order and drains each of
//! its families that is due. Families still sleeping are skipped. After the
//! pass the scheduler sleeps until the earliest wake-up or until shutdown is
//! signalled, whichever comes first. Watermarks are committed per batch
//! inside the engine, so interrupting the sleep loses nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dfe_schemas::{Account, AccountId, DocumentFamily};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::engine::{after, AccountPass, SyncEngine};

/// Per-account wake-up deadlines, one per family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSchedule {
    pub account: Account,
    wake: BTreeMap<DocumentFamily, DateTime<Utc>>,
}

impl AccountSchedule {
    /// Every family is due immediately.
    pub fn new(account: Account, now: DateTime<Utc>) -> Self {
        let wake = account.families.iter().map(|f| (*f, now)).collect();
        Self { account, wake }
    }

    pub fn due_families(&self, now: DateTime<Utc>) -> Vec<DocumentFamily> {
        self.wake
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(f, _)| *f)
            .collect()
    }

    pub fn wake_at(&self, family: DocumentFamily) -> Option<DateTime<Utc>> {
        self.wake.get(&family).copied()
    }

    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.wake.values().min().copied()
    }

    /// Fold a pass result into the deadlines. Families that did not run
    /// because of a fault retry after `fault_retry`.
    pub fn apply(&mut self, pass: &AccountPass, ran: &[DocumentFamily], now: DateTime<Utc>, fault_retry: Duration) {
        for r in &pass.reports {
            self.wake.insert(r.family, r.wake_at);
        }
        if pass.fault.is_some() {
            let retry_at = after(now, fault_retry);
            for f in ran {
                if !pass.reports.iter().any(|r| r.family == *f) {
                    self.wake.insert(*f, retry_at);
                }
            }
        }
    }
}

/// Totals of one pass over all accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub accounts_run: usize,
    pub accounts_skipped: usize,
    pub accounts_faulted: Vec<AccountId>,
    pub queries: u32,
    pub stored: usize,
    /// `true` when shutdown was observed before every due account ran.
    pub interrupted: bool,
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    schedules: Vec<AccountSchedule>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, accounts: Vec<Account>) -> Self {
        let now = engine.now();
        let schedules = accounts
            .into_iter()
            .map(|a| AccountSchedule::new(a, now))
            .collect();
        Self { engine, schedules }
    }

    pub fn schedules(&self) -> &[AccountSchedule] {
        &self.schedules
    }

    /// Load every account's persisted quota window. A failure is logged and
    /// the account starts with an empty window.
    pub async fn restore_quotas(&self) {
        for s in &self.schedules {
            if let Err(e) = self.engine.restore_quota(&s.account).await {
                tracing::warn!(account = %s.account.id, error = %format!("{e:#}"), "quota/restore_failed");
            }
        }
    }

    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.schedules.iter().filter_map(|s| s.next_wake()).min()
    }

    /// One sequential pass over all accounts. Stops early (between accounts)
    /// if `shutdown` reads `true`.
    pub async fn run_pass(&mut self, shutdown: &watch::Receiver<bool>) -> PassSummary {
        let pass_id = Uuid::new_v4();
        let fault_retry = self.engine.settings().fault_retry;
        let mut summary = PassSummary::default();

        tracing::info!(%pass_id, accounts = self.schedules.len(), "pass/start");

        for schedule in self.schedules.iter_mut() {
            if *shutdown.borrow() {
                summary.interrupted = true;
                break;
            }

            let now = self.engine.now();
            let due = schedule.due_families(now);
            if due.is_empty() {
                summary.accounts_skipped += 1;
                continue;
            }

            let span = tracing::info_span!("account", account = %schedule.account.id, %pass_id);
            let pass = self
                .engine
                .run_account(&schedule.account, &due)
                .instrument(span)
                .await;

            summary.accounts_run += 1;
            summary.queries += pass.queries();
            summary.stored += pass.stored();
            if pass.fault.is_some() {
                summary.accounts_faulted.push(schedule.account.id.clone());
            }
            schedule.apply(&pass, &due, self.engine.now(), fault_retry);
        }

        tracing::info!(
            %pass_id,
            run = summary.accounts_run,
            skipped = summary.accounts_skipped,
            faulted = summary.accounts_faulted.len(),
            queries = summary.queries,
            stored = summary.stored,
            "pass/done"
        );
        summary
    }

    /// Time from now until the next family is due (zero if one already is).
    pub fn time_until_next(&self) -> Duration {
        match self.next_wake() {
            Some(at) => (at - self.engine.now()).to_std().unwrap_or(Duration::ZERO),
            None => self.engine.settings().long_sleep,
        }
    }

    /// Run passes until `shutdown` becomes `true` (or its sender is dropped).
    /// With `once`, exactly one pass runs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, once: bool) {
        self.restore_quotas().await;

        loop {
            let summary = self.run_pass(&shutdown).await;
            if once || summary.interrupted {
                break;
            }

            let wait = self.time_until_next();
            tracing::info!(sleep_secs = wait.as_secs(), "pass/sleep");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        tracing::info!("scheduler/stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FamilyReport;
    use crate::fault::AccountFault;
    use crate::state::{SleepReason, SyncState};
    use chrono::TimeZone;
    use dfe_schemas::{AuthorityCode, Environment, Nsu, TaxId};

    fn account() -> Account {
        Account {
            id: AccountId::new("acme").unwrap(),
            tax_id: TaxId::parse("12345678000195").unwrap(),
            authority_code: AuthorityCode::parse("35").unwrap(),
            environment: Environment::Production,
            families: vec![DocumentFamily::Nfe, DocumentFamily::Cte],
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()
    }

    fn report(family: DocumentFamily, wake_at: DateTime<Utc>) -> FamilyReport {
        FamilyReport {
            family,
            final_state: SyncState::Sleeping(SleepReason::Long),
            watermark: Nsu::ZERO,
            queries: 1,
            stored: 0,
            skipped: 0,
            acknowledged: 0,
            wake_at,
        }
    }

    #[test]
    fn families_are_due_until_they_sleep() {
        let now = t0();
        let mut s = AccountSchedule::new(account(), now);
        assert_eq!(s.due_families(now), vec![DocumentFamily::Nfe, DocumentFamily::Cte]);

        let later = now + chrono::Duration::hours(1);
        let pass = AccountPass {
            reports: vec![report(DocumentFamily::Nfe, later)],
            fault: None,
        };
        s.apply(&pass, &[DocumentFamily::Nfe], now, Duration::from_secs(300));

        assert_eq!(s.due_families(now), vec![DocumentFamily::Cte]);
        assert_eq!(s.next_wake(), Some(now));
        assert_eq!(s.due_families(later).len(), 2);
    }

    #[test]
    fn faulted_family_retries_after_delay() {
        let now = t0();
        let mut s = AccountSchedule::new(account(), now);
        let pass = AccountPass {
            reports: vec![report(DocumentFamily::Nfe, now + chrono::Duration::hours(1))],
            fault: Some((DocumentFamily::Cte, AccountFault::fatal("query", "timed out"))),
        };
        s.apply(
            &pass,
            &[DocumentFamily::Nfe, DocumentFamily::Cte],
            now,
            Duration::from_secs(300),
        );
        assert_eq!(
            s.wake_at(DocumentFamily::Cte),
            Some(now + chrono::Duration::seconds(300))
        );
        assert!(s.due_families(now).is_empty());
    }
}
