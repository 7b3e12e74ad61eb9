//! Scenario: acknowledgement is checked locally before anything is signed or
//! sent, and only registered verdicts are recorded.
//!
//! # Invariants under test
//!
//! 1. An already-recorded (key, event, account) triple short-circuits with
//!    zero transport calls, even without a signing identity.
//! 2. A first acknowledgement is signed, submitted once and recorded with a
//!    54-character event id; a repeat short-circuits.
//! 3. `573` (duplicate at the authority) counts as registered.
//! 4. A rejection or a transport failure records nothing.
//! 5. Invalid events fail before the network is touched.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use dfe_db::ManifestationStore;
use dfe_schemas::{EventType, ManifestationRecord, Verdict};
use dfe_signer::{CredentialMap, ManifestOutcome, ManifestRequest, Manifestor, SubmitError};
use dfe_testkit::{test_account, test_identity, AccessKeyBuilder, MemoryRepository, RecordingEventTransport};

fn manifestor(
    repo: &Arc<MemoryRepository>,
    transport: &Arc<RecordingEventTransport>,
    with_identity: bool,
) -> anyhow::Result<Manifestor> {
    let mut creds = CredentialMap::new();
    if with_identity {
        creds.insert(test_account("matriz")?.id, test_identity()?);
    }
    Ok(Manifestor::new(repo.clone(), Arc::new(creds), transport.clone()))
}

fn verdict(code: u16) -> Verdict {
    Verdict {
        status_code: code,
        reason: format!("status {code}"),
        protocol: Some("891240000000009".to_string()),
    }
}

// ---------------------------------------------------------------------------
// 1: local short-circuit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recorded_event_makes_no_network_call() -> anyhow::Result<()> {
    let account = test_account("matriz")?;
    let key = AccessKeyBuilder::new().number(77).build()?;
    let repo = Arc::new(MemoryRepository::new());
    let transport = Arc::new(RecordingEventTransport::registering());

    repo.seed_manifestation(ManifestationRecord {
        access_key: key.clone(),
        event_type: EventType::Confirmation,
        account_id: account.id.clone(),
        sequence: 1,
        event_id: format!("ID210200{key}01"),
        verdict: verdict(135),
        signed_xml: "<evento/>".to_string(),
        registered_at_utc: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    });

    // No identity loaded: any signing attempt would fail.
    let m = manifestor(&repo, &transport, false)?;
    let req = ManifestRequest::new(account, key, EventType::Confirmation);
    let outcome = m.manifest(&req, Utc::now()).await;

    assert!(matches!(outcome, ManifestOutcome::AlreadyRegistered(_)));
    assert!(outcome.is_registered());
    assert_eq!(transport.calls(), 0);
    Ok(())
}

// ---------------------------------------------------------------------------
// 2 + 3: register, then short-circuit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_acknowledgement_is_recorded_then_reused() -> anyhow::Result<()> {
    let account = test_account("matriz")?;
    let key = AccessKeyBuilder::new().number(78).build()?;
    let repo = Arc::new(MemoryRepository::new());
    let transport = Arc::new(RecordingEventTransport::registering());
    let m = manifestor(&repo, &transport, true)?;

    let req = ManifestRequest::new(account.clone(), key.clone(), EventType::Awareness);
    let at = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
    let outcome = m.manifest(&req, at).await;
    assert!(matches!(outcome, ManifestOutcome::Registered(ref v) if v.status_code == 135));
    assert_eq!(transport.calls(), 1);

    let rec = repo
        .find_manifestation(&key, EventType::Awareness, &account.id)
        .await?
        .expect("registered event must be recorded");
    assert_eq!(rec.event_id.len(), 54);
    assert_eq!(rec.event_id, format!("ID210210{key}01"));
    assert_eq!(rec.sequence, 1);
    assert_eq!(rec.registered_at_utc, at);
    assert!(rec.signed_xml.contains("<dhEvento>2024-01-02T12:00:00-03:00</dhEvento>"));

    let submitted = transport.submitted();
    dfe_signer::verify(&submitted[0])?;

    let again = m.manifest(&req, at).await;
    assert!(matches!(again, ManifestOutcome::AlreadyRegistered(_)));
    assert_eq!(transport.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_at_authority_counts_as_registered() -> anyhow::Result<()> {
    let account = test_account("matriz")?;
    let key = AccessKeyBuilder::new().number(79).build()?;
    let repo = Arc::new(MemoryRepository::new());
    let transport = Arc::new(RecordingEventTransport::new(Ok(verdict(573))));
    let m = manifestor(&repo, &transport, true)?;

    let req = ManifestRequest::new(account, key, EventType::Awareness);
    let outcome = m.manifest(&req, Utc::now()).await;
    assert!(outcome.is_registered());
    assert_eq!(repo.manifestation_count(), 1);
    Ok(())
}

// ---------------------------------------------------------------------------
// 4 + 5: nothing recorded
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejection_and_transport_failure_record_nothing() -> anyhow::Result<()> {
    let account = test_account("matriz")?;
    let key = AccessKeyBuilder::new().number(80).build()?;
    let repo = Arc::new(MemoryRepository::new());

    let rejecting = Arc::new(RecordingEventTransport::new(Ok(verdict(650))));
    let m = manifestor(&repo, &rejecting, true)?;
    let req = ManifestRequest::new(account.clone(), key.clone(), EventType::Awareness);
    let outcome = m.manifest(&req, Utc::now()).await;
    assert!(matches!(outcome, ManifestOutcome::Rejected(ref v) if v.status_code == 650));
    assert_eq!(repo.manifestation_count(), 0);

    let failing = Arc::new(RecordingEventTransport::new(Err(SubmitError::Timeout)));
    let m = manifestor(&repo, &failing, true)?;
    let outcome = m.manifest(&req, Utc::now()).await;
    assert!(matches!(outcome, ManifestOutcome::Failed(_)));
    assert!(!outcome.is_registered());
    assert_eq!(failing.calls(), 1);
    assert_eq!(repo.manifestation_count(), 0);
    Ok(())
}

#[tokio::test]
async fn invalid_events_fail_before_submission() -> anyhow::Result<()> {
    let account = test_account("matriz")?;
    let key = AccessKeyBuilder::new().number(81).build()?;
    let repo = Arc::new(MemoryRepository::new());
    let transport = Arc::new(RecordingEventTransport::registering());
    let m = manifestor(&repo, &transport, true)?;

    let mut out_of_range = ManifestRequest::new(account.clone(), key.clone(), EventType::Awareness);
    out_of_range.sequence = 21;
    assert!(matches!(
        m.manifest(&out_of_range, Utc::now()).await,
        ManifestOutcome::Failed(_)
    ));

    // 210240 needs a justification of 15..=255 characters.
    let mut no_reason = ManifestRequest::new(account.clone(), key.clone(), EventType::OperationNotPerformed);
    assert!(matches!(
        m.manifest(&no_reason, Utc::now()).await,
        ManifestOutcome::Failed(_)
    ));
    no_reason.justification = Some("curta".to_string());
    assert!(matches!(
        m.manifest(&no_reason, Utc::now()).await,
        ManifestOutcome::Failed(_)
    ));

    let cte_key = AccessKeyBuilder::new().model("57").number(82).build()?;
    let cte = ManifestRequest::new(account, cte_key, EventType::Awareness);
    assert!(matches!(m.manifest(&cte, Utc::now()).await, ManifestOutcome::Failed(_)));

    assert_eq!(transport.calls(), 0);
    assert_eq!(repo.manifestation_count(), 0);
    Ok(())
}
