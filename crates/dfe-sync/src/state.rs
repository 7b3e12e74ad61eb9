//! Sync state machine and the post-batch decision.
//!
//! # Invariants
//!
//! - **Process, then converge**: [`decide_after_batch`] only accepts a
//!   [`ProcessedBatch`], and a `ProcessedBatch` can only be produced by the
//!   engine after every entry of a response has been persisted (or skipped)
//!   and the watermark committed. The "caught up?" comparison therefore
//!   cannot run against a batch that is still pending.
//! - **Pure**: nothing in this module performs IO or reads a clock.

use std::fmt;

use dfe_client::DistStatus;
use dfe_schemas::{AccessKey, DocumentFamily, Nsu};

use crate::fault::EntryFault;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepReason {
    /// Caught up (or the authority answered something unexpected).
    Long,
    /// Quota window full or authority-imposed cool-down.
    Quota,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Querying,
    Processing,
    Sleeping(SleepReason),
    /// The pass's iteration ceiling was hit with work still pending; the
    /// next pass picks up immediately.
    Yield,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Querying => "querying",
            SyncState::Processing => "processing",
            SyncState::Sleeping(SleepReason::Long) => "sleeping_long",
            SyncState::Sleeping(SleepReason::Quota) => "sleeping_quota",
            SyncState::Yield => "yield",
        }
    }

    pub fn is_sleeping(&self) -> bool {
        matches!(self, SyncState::Sleeping(_))
    }

    /// Whether a drain stops in this state.
    pub fn ends_drain(&self) -> bool {
        matches!(self, SyncState::Sleeping(_) | SyncState::Yield)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Querying -> next
// ---------------------------------------------------------------------------

/// Where a response status leads, before any entry is looked at.
///
/// `DocumentsFound` always goes to `Processing`; the convergence check is
/// not reachable from here.
pub fn after_response(status: DistStatus) -> SyncState {
    match status {
        DistStatus::DocumentsFound => SyncState::Processing,
        DistStatus::NoDocuments => SyncState::Sleeping(SleepReason::Long),
        DistStatus::QuotaExceeded => SyncState::Sleeping(SleepReason::Quota),
        DistStatus::Unexpected => SyncState::Sleeping(SleepReason::Long),
    }
}

// ---------------------------------------------------------------------------
// Processing -> next
// ---------------------------------------------------------------------------

/// Proof that one response batch was fully consumed and its watermark
/// committed. Only the engine can build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBatch {
    family: DocumentFamily,
    started_from: Nsu,
    committed: Nsu,
    max_nsu: Nsu,
    stored: usize,
    skipped: Vec<EntryFault>,
    new_summaries: Vec<AccessKey>,
}

impl ProcessedBatch {
    pub(crate) fn new(
        family: DocumentFamily,
        started_from: Nsu,
        committed: Nsu,
        max_nsu: Nsu,
        stored: usize,
        skipped: Vec<EntryFault>,
        new_summaries: Vec<AccessKey>,
    ) -> Self {
        Self {
            family,
            started_from,
            committed,
            max_nsu,
            stored,
            skipped,
            new_summaries,
        }
    }

    pub fn family(&self) -> DocumentFamily {
        self.family
    }

    /// Watermark before this batch.
    pub fn started_from(&self) -> Nsu {
        self.started_from
    }

    /// Watermark durably stored after this batch.
    pub fn committed(&self) -> Nsu {
        self.committed
    }

    /// Highest NSU the authority reported as available.
    pub fn max_nsu(&self) -> Nsu {
        self.max_nsu
    }

    /// Entries written (inserted or upgraded).
    pub fn stored(&self) -> usize {
        self.stored
    }

    pub fn skipped(&self) -> &[EntryFault] {
        &self.skipped
    }

    /// NF-e summaries seen for the first time in this batch.
    pub fn new_summaries(&self) -> &[AccessKey] {
        &self.new_summaries
    }

    pub fn is_caught_up(&self) -> bool {
        self.committed >= self.max_nsu
    }

    fn made_progress(&self) -> bool {
        self.committed > self.started_from
    }
}

/// Convergence check. Drain immediately while the committed watermark is
/// below the reported maximum; sleep long once it reaches it.
///
/// A batch that did not move the watermark but still reports more pending
/// is treated as caught up for this pass, so a misbehaving response cannot
/// burn the whole iteration budget.
pub fn decide_after_batch(batch: &ProcessedBatch) -> SyncState {
    if batch.is_caught_up() || !batch.made_progress() {
        SyncState::Sleeping(SleepReason::Long)
    } else {
        SyncState::Querying
    }
}
