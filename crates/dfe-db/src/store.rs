//! Repository contracts injected into the sync engine and the signer.
//!
//! Every method is keyed explicitly by account (and family / access key);
//! there is no ambient state. Implementations must be safe to share across
//! per-account workers (`Send + Sync`).
//!
//! # Invariants every implementation upholds
//! - `set_watermark` never lowers a stored value.
//! - `upsert_document` never replaces a document with a lower or equal rank.
//! - `record_manifestation` never overwrites an existing
//!   (access key, event type, account) record.
//! - `reserve_quota` checks and appends in one step, serialized per account
//!   across every process sharing the store; recorded requests are only
//!   removed once they age out of the window.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dfe_schemas::{
    AccessKey, AccountId, ClassifiedDocument, DocumentFamily, DocumentKind, EventType,
    ManifestationRecord, Nsu, QuotaWindowSnapshot,
};

/// Result of a watermark write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkWrite {
    /// Stored value moved forward (or was created).
    Advanced { to: Nsu },
    /// Offered value equals the stored value; nothing to do.
    Unchanged,
    /// Offered value is below the stored value and was ignored.
    Rejected { stored: Nsu, offered: Nsu },
}

impl WatermarkWrite {
    pub fn is_rejected(&self) -> bool {
        matches!(self, WatermarkWrite::Rejected { .. })
    }
}

/// Result of an idempotent document write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this key (or event identity) was seen.
    Inserted,
    /// A stored summary was replaced by the full document.
    Upgraded,
    /// Already stored at the same or a higher rank; nothing written.
    Unchanged,
}

/// A stored summary or full document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub access_key: AccessKey,
    pub account_id: AccountId,
    pub family: DocumentFamily,
    pub kind: DocumentKind,
    pub nsu: Nsu,
    pub schema_version: Option<String>,
    pub root_element: String,
    pub xml: String,
    pub updated_at_utc: DateTime<Utc>,
}

/// Result of an admission attempt against the persisted quota window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaReservation {
    /// `true` when the request instant was appended.
    pub admitted: bool,
    /// Live window after the attempt, including requests recorded by other
    /// processes.
    pub window: QuotaWindowSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkRow {
    pub account_id: AccountId,
    pub family: DocumentFamily,
    pub nsu: Nsu,
    pub updated_at_utc: DateTime<Utc>,
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Last consumed NSU; the zero watermark when nothing is stored.
    async fn get_watermark(&self, account: &AccountId, family: DocumentFamily) -> Result<Nsu>;

    /// Commit `nsu` only if it is >= the stored value.
    async fn set_watermark(
        &self,
        account: &AccountId,
        family: DocumentFamily,
        nsu: Nsu,
    ) -> Result<WatermarkWrite>;

    /// All stored watermarks, optionally restricted to one account,
    /// ordered by (account, family).
    async fn list_watermarks(&self, account: Option<&AccountId>) -> Result<Vec<WatermarkRow>>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a classified document. Summaries/full documents are keyed by
    /// access key with rank-based upgrade; events are keyed by
    /// (access key, event code, event sequence).
    async fn upsert_document(
        &self,
        account: &AccountId,
        doc: &ClassifiedDocument,
    ) -> Result<UpsertOutcome>;

    async fn fetch_document(&self, key: &AccessKey) -> Result<Option<StoredDocument>>;
}

#[async_trait]
pub trait ManifestationStore: Send + Sync {
    async fn find_manifestation(
        &self,
        key: &AccessKey,
        event_type: EventType,
        account: &AccountId,
    ) -> Result<Option<ManifestationRecord>>;

    /// Insert a registered acknowledgement. Returns `false` (and writes
    /// nothing) if the identity triple already exists.
    async fn record_manifestation(&self, rec: &ManifestationRecord) -> Result<bool>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn load_quota(&self, account: &AccountId) -> Result<QuotaWindowSnapshot>;

    /// Drop requests at or before `at - window`, then append `at` unless a
    /// suspension is running past `at` or `limit` requests are still live.
    async fn reserve_quota(
        &self,
        account: &AccountId,
        at: DateTime<Utc>,
        window: chrono::Duration,
        limit: usize,
    ) -> Result<QuotaReservation>;

    /// Store a cool-down deadline. A later deadline already on file wins.
    async fn record_suspension(&self, account: &AccountId, until: DateTime<Utc>) -> Result<()>;
}

/// Everything the sync core persists, behind one injectable handle.
pub trait Repository: WatermarkStore + DocumentStore + ManifestationStore + QuotaStore {}

impl<T> Repository for T where T: WatermarkStore + DocumentStore + ManifestationStore + QuotaStore {}
