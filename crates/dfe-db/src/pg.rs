use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dfe_schemas::{
    AccessKey, AccountId, ClassifiedDocument, DocumentFamily, DocumentKind, EventType,
    ManifestationRecord, Nsu, QuotaWindowSnapshot, Verdict,
};
use sqlx::{PgPool, Row};

use crate::store::{
    DocumentStore, ManifestationStore, QuotaReservation, QuotaStore, StoredDocument,
    UpsertOutcome, WatermarkRow, WatermarkStore, WatermarkWrite,
};

/// Postgres-backed repository. Cheap to clone (the pool is reference counted).
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn nsu_to_db(nsu: Nsu) -> i64 {
    // Nsu is capped at 15 digits, far below i64::MAX.
    nsu.value() as i64
}

fn nsu_from_db(v: i64) -> Result<Nsu> {
    let u = u64::try_from(v).map_err(|_| anyhow!("negative nsu in db: {v}"))?;
    Nsu::new(u).map_err(|e| anyhow!("invalid nsu in db: {e}"))
}

#[async_trait]
impl WatermarkStore for PgRepository {
    async fn get_watermark(&self, account: &AccountId, family: DocumentFamily) -> Result<Nsu> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            select nsu
            from watermarks
            where account_id = $1 and family = $2
            "#,
        )
        .bind(account.as_str())
        .bind(family.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("get_watermark failed")?;

        match row {
            Some((v,)) => nsu_from_db(v),
            None => Ok(Nsu::ZERO),
        }
    }

    async fn set_watermark(
        &self,
        account: &AccountId,
        family: DocumentFamily,
        nsu: Nsu,
    ) -> Result<WatermarkWrite> {
        // The WHERE on the conflict branch is the monotonic guard: a lower or
        // equal value leaves the row untouched and returns nothing.
        let advanced: Option<(i64,)> = sqlx::query_as(
            r#"
            insert into watermarks (account_id, family, nsu, updated_at_utc)
            values ($1, $2, $3, now())
            on conflict (account_id, family) do update
              set nsu = excluded.nsu,
                  updated_at_utc = excluded.updated_at_utc
              where watermarks.nsu < excluded.nsu
            returning nsu
            "#,
        )
        .bind(account.as_str())
        .bind(family.as_str())
        .bind(nsu_to_db(nsu))
        .fetch_optional(&self.pool)
        .await
        .context("set_watermark upsert failed")?;

        if advanced.is_some() {
            return Ok(WatermarkWrite::Advanced { to: nsu });
        }

        let stored = self.get_watermark(account, family).await?;
        if stored == nsu {
            Ok(WatermarkWrite::Unchanged)
        } else {
            Ok(WatermarkWrite::Rejected {
                stored,
                offered: nsu,
            })
        }
    }

    async fn list_watermarks(&self, account: Option<&AccountId>) -> Result<Vec<WatermarkRow>> {
        let rows = sqlx::query(
            r#"
            select account_id, family, nsu, updated_at_utc
            from watermarks
            where ($1::text is null or account_id = $1)
            order by account_id asc, family asc
            "#,
        )
        .bind(account.map(|a| a.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("list_watermarks failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let account_id: String = r.try_get("account_id")?;
            let family: String = r.try_get("family")?;
            out.push(WatermarkRow {
                account_id: AccountId::new(account_id).map_err(|e| anyhow!("{e}"))?,
                family: DocumentFamily::parse(&family).map_err(|e| anyhow!("{e}"))?,
                nsu: nsu_from_db(r.try_get("nsu")?)?,
                updated_at_utc: r.try_get("updated_at_utc")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for PgRepository {
    async fn upsert_document(
        &self,
        account: &AccountId,
        doc: &ClassifiedDocument,
    ) -> Result<UpsertOutcome> {
        if doc.kind == DocumentKind::Event {
            return insert_event(&self.pool, account, doc).await;
        }

        // (xmax = 0) is true for a fresh insert and false for an update.
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            insert into documents (
              access_key, account_id, family, kind, kind_rank, nsu,
              schema_version, root_element, xml, received_at_utc, updated_at_utc
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, now(), now()
            )
            on conflict (access_key) do update
              set kind = excluded.kind,
                  kind_rank = excluded.kind_rank,
                  nsu = excluded.nsu,
                  schema_version = excluded.schema_version,
                  root_element = excluded.root_element,
                  xml = excluded.xml,
                  updated_at_utc = now()
              where documents.kind_rank < excluded.kind_rank
            returning (xmax = 0) as inserted
            "#,
        )
        .bind(doc.access_key.as_str())
        .bind(account.as_str())
        .bind(doc.family.as_str())
        .bind(doc.kind.as_str())
        .bind(doc.kind.rank())
        .bind(nsu_to_db(doc.nsu))
        .bind(doc.schema_version.as_deref())
        .bind(&doc.root)
        .bind(&doc.xml)
        .fetch_optional(&self.pool)
        .await
        .context("upsert_document failed")?;

        Ok(match row {
            Some((true,)) => UpsertOutcome::Inserted,
            Some((false,)) => UpsertOutcome::Upgraded,
            None => UpsertOutcome::Unchanged,
        })
    }

    async fn fetch_document(&self, key: &AccessKey) -> Result<Option<StoredDocument>> {
        let row = sqlx::query(
            r#"
            select access_key, account_id, family, kind, nsu, schema_version,
                   root_element, xml, updated_at_utc
            from documents
            where access_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("fetch_document failed")?;

        let Some(r) = row else {
            return Ok(None);
        };

        let access_key: String = r.try_get("access_key")?;
        let account_id: String = r.try_get("account_id")?;
        let family: String = r.try_get("family")?;
        let kind: String = r.try_get("kind")?;
        Ok(Some(StoredDocument {
            access_key: AccessKey::parse(&access_key).map_err(|e| anyhow!("{e}"))?,
            account_id: AccountId::new(account_id).map_err(|e| anyhow!("{e}"))?,
            family: DocumentFamily::parse(&family).map_err(|e| anyhow!("{e}"))?,
            kind: DocumentKind::parse(&kind).map_err(|e| anyhow!("{e}"))?,
            nsu: nsu_from_db(r.try_get("nsu")?)?,
            schema_version: r.try_get("schema_version")?,
            root_element: r.try_get("root_element")?,
            xml: r.try_get("xml")?,
            updated_at_utc: r.try_get("updated_at_utc")?,
        }))
    }
}

async fn insert_event(
    pool: &PgPool,
    account: &AccountId,
    doc: &ClassifiedDocument,
) -> Result<UpsertOutcome> {
    let ev = doc
        .event
        .as_ref()
        .ok_or_else(|| anyhow!("event document {} has no event identity", doc.access_key))?;
    let seq = i32::try_from(ev.sequence).context("event sequence out of range")?;

    let res = sqlx::query(
        r#"
        insert into document_events (
          access_key, event_code, event_seq, account_id, family, nsu,
          schema_version, root_element, xml, received_at_utc
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, now()
        )
        on conflict (access_key, event_code, event_seq) do nothing
        "#,
    )
    .bind(doc.access_key.as_str())
    .bind(&ev.code)
    .bind(seq)
    .bind(account.as_str())
    .bind(doc.family.as_str())
    .bind(nsu_to_db(doc.nsu))
    .bind(doc.schema_version.as_deref())
    .bind(&doc.root)
    .bind(&doc.xml)
    .execute(pool)
    .await
    .context("insert document_event failed")?;

    Ok(if res.rows_affected() == 1 {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Unchanged
    })
}

#[async_trait]
impl ManifestationStore for PgRepository {
    async fn find_manifestation(
        &self,
        key: &AccessKey,
        event_type: EventType,
        account: &AccountId,
    ) -> Result<Option<ManifestationRecord>> {
        let row = sqlx::query(
            r#"
            select sequence, event_id, status_code, reason, protocol,
                   signed_xml, registered_at_utc
            from manifestations
            where access_key = $1 and event_type = $2 and account_id = $3
            "#,
        )
        .bind(key.as_str())
        .bind(event_type.code())
        .bind(account.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("find_manifestation failed")?;

        let Some(r) = row else {
            return Ok(None);
        };

        let sequence: i16 = r.try_get("sequence")?;
        let status_code: i32 = r.try_get("status_code")?;
        let event_id: String = r.try_get("event_id")?;
        Ok(Some(ManifestationRecord {
            access_key: key.clone(),
            event_type,
            account_id: account.clone(),
            sequence: u8::try_from(sequence).context("manifestation sequence out of range")?,
            event_id: event_id.trim_end().to_string(),
            verdict: Verdict {
                status_code: u16::try_from(status_code).context("status_code out of range")?,
                reason: r.try_get("reason")?,
                protocol: r.try_get("protocol")?,
            },
            signed_xml: r.try_get("signed_xml")?,
            registered_at_utc: r.try_get("registered_at_utc")?,
        }))
    }

    async fn record_manifestation(&self, rec: &ManifestationRecord) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into manifestations (
              access_key, event_type, account_id, sequence, event_id,
              status_code, reason, protocol, signed_xml, registered_at_utc
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            on conflict (access_key, event_type, account_id) do nothing
            "#,
        )
        .bind(rec.access_key.as_str())
        .bind(rec.event_type.code())
        .bind(rec.account_id.as_str())
        .bind(i16::from(rec.sequence))
        .bind(&rec.event_id)
        .bind(i32::from(rec.verdict.status_code))
        .bind(&rec.verdict.reason)
        .bind(rec.verdict.protocol.as_deref())
        .bind(&rec.signed_xml)
        .bind(rec.registered_at_utc)
        .execute(&self.pool)
        .await
        .context("record_manifestation failed")?;

        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl QuotaStore for PgRepository {
    async fn load_quota(&self, account: &AccountId) -> Result<QuotaWindowSnapshot> {
        let requests: Vec<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            select requested_at_utc
            from quota_requests
            where account_id = $1
            order by requested_at_utc asc
            "#,
        )
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await
        .context("load_quota requests failed")?;

        let suspended: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            select suspended_until_utc
            from quota_suspensions
            where account_id = $1
            "#,
        )
        .bind(account.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("load_quota suspension failed")?;

        Ok(QuotaWindowSnapshot {
            requests: requests.into_iter().map(|(t,)| t).collect(),
            suspended_until: suspended.map(|(t,)| t),
        })
    }

    async fn reserve_quota(
        &self,
        account: &AccountId,
        at: DateTime<Utc>,
        window: chrono::Duration,
        limit: usize,
    ) -> Result<QuotaReservation> {
        let mut tx = self.pool.begin().await.context("reserve_quota begin failed")?;

        sqlx::query("insert into quota_accounts (account_id) values ($1) on conflict do nothing")
            .bind(account.as_str())
            .execute(&mut *tx)
            .await
            .context("reserve_quota account row failed")?;

        sqlx::query("select account_id from quota_accounts where account_id = $1 for update")
            .bind(account.as_str())
            .execute(&mut *tx)
            .await
            .context("reserve_quota lock failed")?;

        sqlx::query("delete from quota_requests where account_id = $1 and requested_at_utc <= $2")
            .bind(account.as_str())
            .bind(at - window)
            .execute(&mut *tx)
            .await
            .context("reserve_quota prune failed")?;

        let live: Vec<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            select requested_at_utc
            from quota_requests
            where account_id = $1
            order by requested_at_utc asc
            "#,
        )
        .bind(account.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("reserve_quota window read failed")?;

        let suspended: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            select suspended_until_utc
            from quota_suspensions
            where account_id = $1 and suspended_until_utc > $2
            "#,
        )
        .bind(account.as_str())
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .context("reserve_quota suspension read failed")?;

        let mut window = QuotaWindowSnapshot {
            requests: live.into_iter().map(|(t,)| t).collect(),
            suspended_until: suspended.map(|(t,)| t),
        };

        let admitted = window.suspended_until.is_none() && window.requests.len() < limit;
        if admitted {
            sqlx::query(
                "insert into quota_requests (account_id, requested_at_utc) values ($1, $2)",
            )
            .bind(account.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await
            .context("reserve_quota insert failed")?;
            window.requests.push(at);
        }

        tx.commit().await.context("reserve_quota commit failed")?;
        Ok(QuotaReservation { admitted, window })
    }

    async fn record_suspension(&self, account: &AccountId, until: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            insert into quota_suspensions (account_id, suspended_until_utc)
            values ($1, $2)
            on conflict (account_id) do update
              set suspended_until_utc = greatest(
                quota_suspensions.suspended_until_utc,
                excluded.suspended_until_utc
              )
            "#,
        )
        .bind(account.as_str())
        .bind(until)
        .execute(&self.pool)
        .await
        .context("record_suspension failed")?;
        Ok(())
    }
}
