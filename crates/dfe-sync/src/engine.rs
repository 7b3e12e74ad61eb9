//! Per-account drain loop: quota check, query, classify, persist, decide.
//!
//! # Contract
//!
//! - Every query is admitted against the request window persisted in the
//!   repository, so separate processes querying for the same account share
//!   one limit. The local [`QuotaGuard`] mirrors that window and
//!   short-circuits denials; suspensions are published to the repository.
//! - The watermark is committed once per fully processed batch, never for a
//!   failed or timed-out call.
//! - A malformed entry is an [`EntryFault`]; a failed query or a failed
//!   write is an [`AccountFault`] that ends the account's pass.
//! - Optional awareness acknowledgements run after the batch is committed
//!   and never affect the state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dfe_classify::classify_entry;
use dfe_client::{DistStatus, DistributionClient, DistributionResponse};
use dfe_config::SyncSettings;
use dfe_db::{Repository, UpsertOutcome, WatermarkWrite};
use dfe_quota::{QuotaDenied, QuotaGuard};
use dfe_schemas::{AccessKey, Account, DocumentFamily, DocumentKind, EventType, Nsu};
use dfe_signer::{ManifestRequest, Manifestor};

use crate::fault::{AccountFault, EntryFault};
use crate::state::{after_response, decide_after_batch, ProcessedBatch, SleepReason, SyncState};

/// Longest delay the engine will ever schedule.
const MAX_DELAY_SECS: u64 = 366 * 24 * 3600;

pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let secs = d.as_secs().min(MAX_DELAY_SECS) as i64;
    now + chrono::Duration::seconds(secs) + chrono::Duration::nanoseconds(i64::from(d.subsec_nanos()))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Query ceiling per account per pass, shared by its families.
    pub max_iterations_per_pass: u32,
    pub long_sleep: Duration,
    pub fault_retry: Duration,
    pub auto_acknowledge_summaries: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&SyncSettings::default())
    }
}

impl EngineSettings {
    pub fn from_config(s: &SyncSettings) -> Self {
        Self {
            max_iterations_per_pass: s.max_iterations_per_pass,
            long_sleep: s.long_sleep(),
            fault_retry: s.fault_retry(),
            auto_acknowledge_summaries: s.auto_acknowledge_summaries,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// How one family's drain ended in this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyReport {
    pub family: DocumentFamily,
    /// `Sleeping(..)`, or `Yield` when the iteration ceiling cut the drain
    /// short.
    pub final_state: SyncState,
    pub watermark: Nsu,
    pub queries: u32,
    pub stored: usize,
    pub skipped: usize,
    pub acknowledged: usize,
    /// Earliest instant this family should be queried again.
    pub wake_at: DateTime<Utc>,
}

/// Everything one account did in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPass {
    pub reports: Vec<FamilyReport>,
    /// Set when the pass was cut short; families after the failing one did
    /// not run.
    pub fault: Option<(DocumentFamily, AccountFault)>,
}

impl AccountPass {
    pub fn queries(&self) -> u32 {
        self.reports.iter().map(|r| r.queries).sum()
    }

    pub fn stored(&self) -> usize {
        self.reports.iter().map(|r| r.stored).sum()
    }
}

/// Result of a targeted query by access key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFetch {
    /// Each returned document and what storing it did.
    Stored(Vec<(AccessKey, DocumentKind, UpsertOutcome)>),
    /// The authority returned no document for the key.
    NotFound { status_code: u16, reason: String },
    /// Quota would not admit the query, or the authority reported a
    /// violation and the account is now suspended.
    QuotaBlocked(QuotaDenied),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One step of the drain loop, with the data each state carries.
enum Step {
    Idle,
    Querying,
    Processing(DistributionResponse),
    Sleeping(SleepReason, DateTime<Utc>),
    /// Iteration ceiling reached with work still pending.
    Yield,
}

impl Step {
    fn state(&self) -> SyncState {
        match self {
            Step::Idle => SyncState::Idle,
            Step::Querying => SyncState::Querying,
            Step::Yield => SyncState::Yield,
            Step::Processing(_) => SyncState::Processing,
            Step::Sleeping(reason, _) => SyncState::Sleeping(*reason),
        }
    }
}

pub struct SyncEngine {
    repo: Arc<dyn Repository>,
    client: Arc<dyn DistributionClient>,
    quota: Arc<QuotaGuard>,
    manifestor: Option<Arc<Manifestor>>,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        client: Arc<dyn DistributionClient>,
        quota: Arc<QuotaGuard>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            repo,
            client,
            quota,
            manifestor: None,
            settings,
        }
    }

    /// Enable awareness acknowledgements for new NF-e summaries (only when
    /// `auto_acknowledge_summaries` is also set).
    pub fn with_manifestor(mut self, manifestor: Arc<Manifestor>) -> Self {
        self.manifestor = Some(manifestor);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.quota.now()
    }

    /// Load the persisted quota window of `account` into the guard.
    pub async fn restore_quota(&self, account: &Account) -> anyhow::Result<()> {
        let snapshot = self.repo.load_quota(&account.id).await?;
        self.quota.restore(&account.id, &snapshot);
        if let Some(until) = self.quota.suspended_until(&account.id) {
            tracing::info!(account = %account.id, until = %until.to_rfc3339(), "quota/restored_suspension");
        }
        Ok(())
    }

    /// Admit one query against the window persisted in the repository, which
    /// every process querying for `account` shares, then mirror that window
    /// into the local guard. A local denial answers without a round trip.
    async fn admit(&self, account: &Account) -> Result<Result<(), QuotaDenied>, AccountFault> {
        if let Err(denied) = self.quota.check(&account.id) {
            return Ok(Err(denied));
        }

        let policy = *self.quota.policy();
        let reservation = self
            .repo
            .reserve_quota(&account.id, self.now(), policy.window(), policy.limit())
            .await
            .map_err(|e| AccountFault::fatal("quota", format!("{e:#}")))?;
        self.quota.restore(&account.id, &reservation.window);

        if reservation.admitted {
            return Ok(Ok(()));
        }
        Ok(Err(self.quota.check(&account.id).err().unwrap_or(QuotaDenied::WindowFull {
            retry_after: policy.window().to_std().unwrap_or_default(),
        })))
    }

    /// Start the cool-down locally and publish it to the repository.
    async fn suspend(&self, account: &Account) -> DateTime<Utc> {
        let until = self.quota.suspend(&account.id);
        if let Err(e) = self.repo.record_suspension(&account.id, until).await {
            tracing::warn!(account = %account.id, error = %format!("{e:#}"), "quota/persist_failed");
        }
        until
    }

    /// Drain every family in `families` for `account`, in order, until each
    /// sleeps or the shared iteration ceiling is reached. Never returns an
    /// error: a fault ends the pass and is reported in [`AccountPass`].
    pub async fn run_account(&self, account: &Account, families: &[DocumentFamily]) -> AccountPass {
        let mut budget = self.settings.max_iterations_per_pass;
        let mut reports = Vec::with_capacity(families.len());

        for &family in families {
            match self.drain_family(account, family, &mut budget).await {
                Ok(r) => reports.push(r),
                Err(fault) => {
                    tracing::error!(
                        account = %account.id,
                        family = %family,
                        stage = fault.stage(),
                        error = %fault,
                        "sync/account_fault"
                    );
                    return AccountPass {
                        reports,
                        fault: Some((family, fault)),
                    };
                }
            }
        }

        AccountPass {
            reports,
            fault: None,
        }
    }

    /// Run the state machine for one (account, family) until it sleeps or
    /// `budget` is exhausted.
    pub async fn drain_family(
        &self,
        account: &Account,
        family: DocumentFamily,
        budget: &mut u32,
    ) -> Result<FamilyReport, AccountFault> {
        let mut watermark = self
            .repo
            .get_watermark(&account.id, family)
            .await
            .map_err(|e| AccountFault::fatal("watermark", format!("{e:#}")))?;

        let mut report = FamilyReport {
            family,
            final_state: SyncState::Idle,
            watermark,
            queries: 0,
            stored: 0,
            skipped: 0,
            acknowledged: 0,
            wake_at: self.now(),
        };

        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => {
                    if self.quota.can_query(&account.id) {
                        Step::Querying
                    } else {
                        let wait = self.quota.time_until_available(&account.id);
                        Step::Sleeping(SleepReason::Quota, after(self.now(), wait))
                    }
                }

                Step::Querying if *budget == 0 => Step::Yield,

                Step::Querying => match self.admit(account).await? {
                    Err(denied) => {
                        let now = self.now();
                        tracing::info!(account = %account.id, family = %family, reason = %denied, "quota/deferred");
                        Step::Sleeping(SleepReason::Quota, after(now, denied.wait_from(now)))
                    }
                    Ok(()) => {
                        *budget -= 1;
                        report.queries += 1;
                        let (next, committed) = self.query(account, family, watermark).await?;
                        if let Some(n) = committed {
                            watermark = n;
                            report.watermark = n;
                        }
                        next
                    }
                },

                Step::Processing(resp) => {
                    let batch = self.process_batch(account, family, watermark, resp).await?;
                    watermark = batch.committed();
                    report.watermark = watermark;
                    report.stored += batch.stored();
                    report.skipped += batch.skipped().len();
                    report.acknowledged += self.acknowledge(account, &batch).await;

                    match decide_after_batch(&batch) {
                        SyncState::Querying => Step::Querying,
                        _ => {
                            if !batch.is_caught_up() {
                                tracing::warn!(
                                    account = %account.id,
                                    family = %family,
                                    nsu = %watermark,
                                    max_nsu = %batch.max_nsu(),
                                    "sync/stalled"
                                );
                            }
                            Step::Sleeping(SleepReason::Long, after(self.now(), self.settings.long_sleep))
                        }
                    }
                }

                done @ (Step::Sleeping(..) | Step::Yield) => done,
            };
            tracing::debug!(account = %account.id, family = %family, state = %step.state(), "sync/transition");
            if step.state().ends_drain() {
                break;
            }
        }

        report.final_state = step.state();
        report.wake_at = match step {
            Step::Sleeping(_, until) => until,
            _ => self.now(),
        };

        tracing::info!(
            account = %account.id,
            family = %family,
            state = %report.final_state,
            nsu = %report.watermark,
            queries = report.queries,
            stored = report.stored,
            skipped = report.skipped,
            wake_at = %report.wake_at.to_rfc3339(),
            "sync/family_done"
        );
        Ok(report)
    }

    /// One round trip and the state it leads to, plus the watermark if a
    /// `NoDocuments` answer moved it.
    async fn query(
        &self,
        account: &Account,
        family: DocumentFamily,
        watermark: Nsu,
    ) -> Result<(Step, Option<Nsu>), AccountFault> {
        let resp = self
            .client
            .fetch(account, family, watermark)
            .await
            .map_err(|e| AccountFault::fatal("query", e))?;

        tracing::debug!(
            account = %account.id,
            family = %family,
            status = resp.status_code,
            reason = %resp.reason,
            docs = resp.documents.len(),
            "sync/response"
        );

        let now = self.now();
        let mut committed = None;
        let step = match after_response(resp.status) {
            SyncState::Processing => Step::Processing(resp),
            SyncState::Sleeping(SleepReason::Quota) => {
                let until = self.suspend(account).await;
                Step::Sleeping(SleepReason::Quota, until)
            }
            _ => {
                if resp.status == DistStatus::NoDocuments {
                    // Nothing exists between the watermark and ultNSU.
                    if let Some(last) = resp.last_nsu.filter(|n| *n > watermark) {
                        committed = Some(self.commit(account, family, last).await?);
                    }
                } else {
                    tracing::warn!(
                        account = %account.id,
                        family = %family,
                        status = resp.status_code,
                        reason = %resp.reason,
                        "sync/unexpected_status"
                    );
                }
                Step::Sleeping(SleepReason::Long, after(now, self.settings.long_sleep))
            }
        };
        Ok((step, committed))
    }

    async fn commit(&self, account: &Account, family: DocumentFamily, nsu: Nsu) -> Result<Nsu, AccountFault> {
        let write = self
            .repo
            .set_watermark(&account.id, family, nsu)
            .await
            .map_err(|e| AccountFault::fatal("watermark", format!("{e:#}")))?;
        Ok(match write {
            WatermarkWrite::Advanced { to } => to,
            WatermarkWrite::Unchanged => nsu,
            WatermarkWrite::Rejected { stored, offered } => {
                tracing::warn!(
                    account = %account.id,
                    family = %family,
                    stored = %stored,
                    offered = %offered,
                    "sync/watermark_rejected"
                );
                stored
            }
        })
    }

    /// Persist every entry of a `DocumentsFound` response, then commit the
    /// watermark. The returned token is the only input the convergence
    /// check accepts.
    async fn process_batch(
        &self,
        account: &Account,
        family: DocumentFamily,
        watermark: Nsu,
        resp: DistributionResponse,
    ) -> Result<ProcessedBatch, AccountFault> {
        let mut skipped: Vec<EntryFault> = resp
            .malformed_entries
            .iter()
            .map(|r| EntryFault::unreadable(r.as_str()))
            .collect();
        let mut stored = 0usize;
        let mut new_summaries = Vec::new();

        for entry in &resp.documents {
            let doc = match classify_entry(entry) {
                Ok(d) => d,
                Err(e) => {
                    let fault = EntryFault::from_entry(entry.nsu, &e);
                    tracing::warn!(account = %account.id, family = %family, nsu = %entry.nsu, error = %e, "sync/entry_skipped");
                    skipped.push(fault);
                    continue;
                }
            };

            let outcome = self
                .repo
                .upsert_document(&account.id, &doc)
                .await
                .map_err(|e| AccountFault::fatal("persist", format!("nsu {}: {e:#}", entry.nsu)))?;

            match outcome {
                UpsertOutcome::Inserted => {
                    stored += 1;
                    if doc.kind == DocumentKind::Summary && doc.family == DocumentFamily::Nfe {
                        new_summaries.push(doc.access_key.clone());
                    }
                }
                UpsertOutcome::Upgraded => stored += 1,
                UpsertOutcome::Unchanged => {}
            }
        }

        for fault in skipped.iter().filter(|f| matches!(f, EntryFault::Skip { nsu: None, .. })) {
            tracing::warn!(account = %account.id, family = %family, error = %fault, "sync/entry_skipped");
        }

        // ultNSU covers skipped entries too: they are dropped, not retried.
        let highest_entry = resp.documents.iter().map(|d| d.nsu).max();
        let target = resp.last_nsu.or(highest_entry).unwrap_or(watermark).max(watermark);
        let committed = self.commit(account, family, target).await?;
        let max_nsu = resp.max_nsu.unwrap_or(committed);

        tracing::info!(
            account = %account.id,
            family = %family,
            from = %watermark,
            nsu = %committed,
            max_nsu = %max_nsu,
            entries = resp.documents.len(),
            stored,
            skipped = skipped.len(),
            "sync/batch_committed"
        );

        Ok(ProcessedBatch::new(
            family,
            watermark,
            committed,
            max_nsu,
            stored,
            skipped,
            new_summaries,
        ))
    }

    async fn acknowledge(&self, account: &Account, batch: &ProcessedBatch) -> usize {
        if !self.settings.auto_acknowledge_summaries {
            return 0;
        }
        let Some(manifestor) = self.manifestor.as_ref() else {
            return 0;
        };

        let mut registered = 0;
        for key in batch.new_summaries() {
            let req = ManifestRequest::new(account.clone(), key.clone(), EventType::Awareness);
            let outcome = manifestor.manifest(&req, self.now()).await;
            if outcome.is_registered() {
                registered += 1;
            } else {
                tracing::warn!(account = %account.id, access_key = %key, outcome = %outcome, "sync/acknowledge_failed");
            }
        }
        registered
    }

    /// Targeted query for one document (typically to replace a stored
    /// summary with the full document). Quota-checked like any query; does
    /// not touch watermarks.
    pub async fn fetch_access_key(&self, account: &Account, key: &AccessKey) -> Result<KeyFetch, AccountFault> {
        if let Err(denied) = self.admit(account).await? {
            return Ok(KeyFetch::QuotaBlocked(denied));
        }

        let resp = self
            .client
            .fetch_by_access_key(account, key)
            .await
            .map_err(|e| AccountFault::fatal("query", e))?;

        match resp.status {
            DistStatus::DocumentsFound => {}
            DistStatus::QuotaExceeded => {
                let until = self.suspend(account).await;
                return Ok(KeyFetch::QuotaBlocked(QuotaDenied::Suspended { until }));
            }
            _ => {
                return Ok(KeyFetch::NotFound {
                    status_code: resp.status_code,
                    reason: resp.reason,
                })
            }
        }

        let mut out = Vec::new();
        for entry in &resp.documents {
            let doc = match classify_entry(entry) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(account = %account.id, access_key = %key, error = %e, "fetch_key/entry_skipped");
                    continue;
                }
            };
            let outcome = self
                .repo
                .upsert_document(&account.id, &doc)
                .await
                .map_err(|e| AccountFault::fatal("persist", format!("{e:#}")))?;
            out.push((doc.access_key, doc.kind, outcome));
        }
        Ok(KeyFetch::Stored(out))
    }
}
