//! In-memory repository with the same write rules as the Postgres one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dfe_db::{
    DocumentStore, ManifestationStore, QuotaReservation, QuotaStore, StoredDocument,
    UpsertOutcome, WatermarkRow, WatermarkStore, WatermarkWrite,
};
use dfe_schemas::{
    AccessKey, AccountId, ClassifiedDocument, DocumentFamily, DocumentKind, EventType,
    ManifestationRecord, Nsu, QuotaWindowSnapshot,
};

type EventKey = (AccessKey, String, u32);
type ManifestKey = (AccessKey, EventType, AccountId);

#[derive(Default)]
struct State {
    watermarks: BTreeMap<(AccountId, DocumentFamily), WatermarkRow>,
    documents: HashMap<AccessKey, StoredDocument>,
    events: HashMap<EventKey, ClassifiedDocument>,
    manifestations: HashMap<ManifestKey, ManifestationRecord>,
    quota: HashMap<AccountId, QuotaWindowSnapshot>,
    quota_reservations: usize,
    quota_suspensions: usize,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    fail_document_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent `upsert_document` fail (simulates a lost DB).
    pub fn fail_document_writes(&self, fail: bool) {
        self.fail_document_writes.store(fail, Ordering::SeqCst);
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub fn manifestation_count(&self) -> usize {
        self.lock().manifestations.len()
    }

    /// Admitted `reserve_quota` calls, across every guard sharing this
    /// repository.
    pub fn quota_reservations(&self) -> usize {
        self.lock().quota_reservations
    }

    pub fn quota_suspensions(&self) -> usize {
        self.lock().quota_suspensions
    }

    pub fn seed_watermark(&self, account: &AccountId, family: DocumentFamily, nsu: Nsu) {
        self.lock().watermarks.insert(
            (account.clone(), family),
            WatermarkRow {
                account_id: account.clone(),
                family,
                nsu,
                updated_at_utc: Utc::now(),
            },
        );
    }

    pub fn seed_manifestation(&self, rec: ManifestationRecord) {
        let key = (rec.access_key.clone(), rec.event_type, rec.account_id.clone());
        self.lock().manifestations.insert(key, rec);
    }
}

#[async_trait]
impl WatermarkStore for MemoryRepository {
    async fn get_watermark(&self, account: &AccountId, family: DocumentFamily) -> Result<Nsu> {
        Ok(self
            .lock()
            .watermarks
            .get(&(account.clone(), family))
            .map(|r| r.nsu)
            .unwrap_or_default())
    }

    async fn set_watermark(
        &self,
        account: &AccountId,
        family: DocumentFamily,
        nsu: Nsu,
    ) -> Result<WatermarkWrite> {
        let mut st = self.lock();
        let key = (account.clone(), family);
        if let Some(row) = st.watermarks.get(&key) {
            if row.nsu == nsu {
                return Ok(WatermarkWrite::Unchanged);
            }
            if row.nsu > nsu {
                return Ok(WatermarkWrite::Rejected {
                    stored: row.nsu,
                    offered: nsu,
                });
            }
        }
        st.watermarks.insert(
            key,
            WatermarkRow {
                account_id: account.clone(),
                family,
                nsu,
                updated_at_utc: Utc::now(),
            },
        );
        Ok(WatermarkWrite::Advanced { to: nsu })
    }

    async fn list_watermarks(&self, account: Option<&AccountId>) -> Result<Vec<WatermarkRow>> {
        Ok(self
            .lock()
            .watermarks
            .values()
            .filter(|r| account.map_or(true, |a| &r.account_id == a))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DocumentStore for MemoryRepository {
    async fn upsert_document(
        &self,
        account: &AccountId,
        doc: &ClassifiedDocument,
    ) -> Result<UpsertOutcome> {
        if self.fail_document_writes.load(Ordering::SeqCst) {
            bail!("document store unavailable");
        }
        let mut st = self.lock();

        if doc.kind == DocumentKind::Event {
            let Some(ev) = doc.event.as_ref() else {
                bail!("event document {} has no event identity", doc.access_key);
            };
            let key = (doc.access_key.clone(), ev.code.clone(), ev.sequence);
            if st.events.contains_key(&key) {
                return Ok(UpsertOutcome::Unchanged);
            }
            st.events.insert(key, doc.clone());
            return Ok(UpsertOutcome::Inserted);
        }

        let outcome = match st.documents.get(&doc.access_key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.kind.rank() < doc.kind.rank() => UpsertOutcome::Upgraded,
            Some(_) => return Ok(UpsertOutcome::Unchanged),
        };
        st.documents.insert(
            doc.access_key.clone(),
            StoredDocument {
                access_key: doc.access_key.clone(),
                account_id: account.clone(),
                family: doc.family,
                kind: doc.kind,
                nsu: doc.nsu,
                schema_version: doc.schema_version.clone(),
                root_element: doc.root.clone(),
                xml: doc.xml.clone(),
                updated_at_utc: Utc::now(),
            },
        );
        Ok(outcome)
    }

    async fn fetch_document(&self, key: &AccessKey) -> Result<Option<StoredDocument>> {
        Ok(self.lock().documents.get(key).cloned())
    }
}

#[async_trait]
impl ManifestationStore for MemoryRepository {
    async fn find_manifestation(
        &self,
        key: &AccessKey,
        event_type: EventType,
        account: &AccountId,
    ) -> Result<Option<ManifestationRecord>> {
        Ok(self
            .lock()
            .manifestations
            .get(&(key.clone(), event_type, account.clone()))
            .cloned())
    }

    async fn record_manifestation(&self, rec: &ManifestationRecord) -> Result<bool> {
        let mut st = self.lock();
        let key = (rec.access_key.clone(), rec.event_type, rec.account_id.clone());
        if st.manifestations.contains_key(&key) {
            return Ok(false);
        }
        st.manifestations.insert(key, rec.clone());
        Ok(true)
    }
}

#[async_trait]
impl QuotaStore for MemoryRepository {
    async fn load_quota(&self, account: &AccountId) -> Result<QuotaWindowSnapshot> {
        Ok(self.lock().quota.get(account).cloned().unwrap_or_default())
    }

    async fn reserve_quota(
        &self,
        account: &AccountId,
        at: DateTime<Utc>,
        window: chrono::Duration,
        limit: usize,
    ) -> Result<QuotaReservation> {
        let mut st = self.lock();
        let entry = st.quota.entry(account.clone()).or_default();
        entry.requests.retain(|t| *t > at - window);
        entry.requests.sort();

        let running = entry.suspended_until.filter(|until| *until > at);
        let admitted = running.is_none() && entry.requests.len() < limit;
        if admitted {
            entry.requests.push(at);
        }
        let live = QuotaWindowSnapshot {
            requests: entry.requests.clone(),
            suspended_until: running,
        };
        if admitted {
            st.quota_reservations += 1;
        }
        Ok(QuotaReservation {
            admitted,
            window: live,
        })
    }

    async fn record_suspension(&self, account: &AccountId, until: DateTime<Utc>) -> Result<()> {
        let mut st = self.lock();
        let entry = st.quota.entry(account.clone()).or_default();
        entry.suspended_until = entry.suspended_until.max(Some(until));
        st.quota_suspensions += 1;
        Ok(())
    }
}
