//! Idempotent acknowledgement workflow: check, build, sign, submit, record.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use dfe_db::ManifestationStore;
use dfe_schemas::{AccessKey, Account, EventType, ManifestationRecord};

use crate::credentials::CredentialStore;
use crate::transport::EventTransport;
use crate::{event, xmldsig, ManifestOutcome};

/// `dhEvento` is rendered in the authority's local time (UTC-03:00).
pub const AUTHORITY_UTC_OFFSET_SECS: i32 = -3 * 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRequest {
    pub account: Account,
    pub access_key: AccessKey,
    pub event_type: EventType,
    pub sequence: u8,
    pub justification: Option<String>,
}

impl ManifestRequest {
    /// First-sequence request without justification.
    pub fn new(account: Account, access_key: AccessKey, event_type: EventType) -> Self {
        Self {
            account,
            access_key,
            event_type,
            sequence: 1,
            justification: None,
        }
    }
}

pub struct Manifestor {
    store: Arc<dyn ManifestationStore>,
    credentials: Arc<dyn CredentialStore>,
    transport: Arc<dyn EventTransport>,
}

fn authority_time(at: DateTime<Utc>) -> DateTime<FixedOffset> {
    match FixedOffset::east_opt(AUTHORITY_UTC_OFFSET_SECS) {
        Some(offset) => at.with_timezone(&offset),
        None => at.fixed_offset(),
    }
}

impl Manifestor {
    pub fn new(
        store: Arc<dyn ManifestationStore>,
        credentials: Arc<dyn CredentialStore>,
        transport: Arc<dyn EventTransport>,
    ) -> Self {
        Self {
            store,
            credentials,
            transport,
        }
    }

    /// Acknowledge one document. Never returns an error: every failure is a
    /// [`ManifestOutcome::Failed`] that leaves the event unregistered.
    pub async fn manifest(&self, req: &ManifestRequest, at: DateTime<Utc>) -> ManifestOutcome {
        let account = &req.account;

        // Local idempotency check comes before any signing or network work.
        // If it cannot be answered, nothing is sent.
        match self
            .store
            .find_manifestation(&req.access_key, req.event_type, &account.id)
            .await
        {
            Ok(Some(existing)) => {
                tracing::info!(
                    account = %account.id,
                    access_key = %req.access_key,
                    event = %req.event_type,
                    "manifest/already_registered"
                );
                return ManifestOutcome::AlreadyRegistered(Box::new(existing));
            }
            Ok(None) => {}
            Err(e) => return ManifestOutcome::Failed(format!("idempotency check: {e:#}")),
        }

        let envelope = match event::build(
            account,
            &req.access_key,
            req.event_type,
            req.sequence,
            authority_time(at),
            req.justification.as_deref(),
        ) {
            Ok(env) => env,
            Err(e) => return ManifestOutcome::Failed(e.to_string()),
        };

        let identity = match self.credentials.identity(&account.id) {
            Ok(i) => i,
            Err(e) => return ManifestOutcome::Failed(e.to_string()),
        };

        let signed = match xmldsig::sign(&envelope, &identity) {
            Ok(s) => s,
            Err(e) => return ManifestOutcome::Failed(e.to_string()),
        };
        if let Err(e) = xmldsig::verify(signed.xml()) {
            return ManifestOutcome::Failed(format!("self-check of signature failed: {e}"));
        }

        let verdict = match self.transport.submit(account, &signed).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    account = %account.id,
                    access_key = %req.access_key,
                    error = %e,
                    "manifest/submit_failed"
                );
                return ManifestOutcome::Failed(e.to_string());
            }
        };

        if !verdict.is_registered() {
            tracing::warn!(
                account = %account.id,
                access_key = %req.access_key,
                status = verdict.status_code,
                reason = %verdict.reason,
                "manifest/rejected"
            );
            return ManifestOutcome::Rejected(verdict);
        }

        let record = ManifestationRecord {
            access_key: req.access_key.clone(),
            event_type: req.event_type,
            account_id: account.id.clone(),
            sequence: req.sequence,
            event_id: signed.event_id().to_string(),
            verdict: verdict.clone(),
            signed_xml: signed.xml().to_string(),
            registered_at_utc: at,
        };
        if let Err(e) = self.store.record_manifestation(&record).await {
            // The authority holds the event; a retry will come back as 573
            // and be recorded then.
            tracing::error!(
                account = %account.id,
                access_key = %req.access_key,
                error = %format!("{e:#}"),
                "manifest/record_failed"
            );
        }

        tracing::info!(
            account = %account.id,
            access_key = %req.access_key,
            event = %req.event_type,
            status = verdict.status_code,
            "manifest/registered"
        );
        ManifestOutcome::Registered(verdict)
    }
}
