//! Network doubles: a distribution client that replays queued responses and
//! an event transport that records every submission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dfe_client::{ClientError, DistStatus, DistributionClient, DistributionResponse};
use dfe_schemas::{AccessKey, Account, AccountId, DocumentFamily, Nsu, Verdict};
use dfe_signer::{EventTransport, SignedEnvelope, SubmitError};

/// One observed distribution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistCall {
    Since {
        account: AccountId,
        family: DocumentFamily,
        since: Nsu,
    },
    ByKey {
        account: AccountId,
        key: AccessKey,
    },
}

/// Replays queued results in order. Once the queue is empty every call
/// answers "no documents" at the requested watermark.
#[derive(Default)]
pub struct ScriptedDistributionClient {
    script: Mutex<VecDeque<Result<DistributionResponse, ClientError>>>,
    calls: Mutex<Vec<DistCall>>,
}

impl ScriptedDistributionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<DistributionResponse, ClientError>) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
        self
    }

    pub fn respond(&self, resp: DistributionResponse) -> &Self {
        self.push(Ok(resp))
    }

    pub fn calls(&self) -> Vec<DistCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next(&self, since: Nsu) -> Result<DistributionResponse, ClientError> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(no_documents(since)))
    }
}

/// A `137` response pinned at `at`.
pub fn no_documents(at: Nsu) -> DistributionResponse {
    DistributionResponse {
        status: DistStatus::NoDocuments,
        status_code: DistStatus::NO_DOCUMENTS,
        reason: "Nenhum documento localizado".to_string(),
        last_nsu: Some(at),
        max_nsu: Some(at),
        documents: Vec::new(),
        malformed_entries: Vec::new(),
    }
}

/// A `656` quota violation.
pub fn quota_exceeded(at: Nsu) -> DistributionResponse {
    DistributionResponse {
        status: DistStatus::QuotaExceeded,
        status_code: DistStatus::QUOTA_EXCEEDED,
        reason: "Rejeicao: Consumo Indevido".to_string(),
        last_nsu: Some(at),
        max_nsu: Some(at),
        documents: Vec::new(),
        malformed_entries: Vec::new(),
    }
}

#[async_trait]
impl DistributionClient for ScriptedDistributionClient {
    async fn fetch(
        &self,
        account: &Account,
        family: DocumentFamily,
        since: Nsu,
    ) -> Result<DistributionResponse, ClientError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DistCall::Since {
                account: account.id.clone(),
                family,
                since,
            });
        self.next(since)
    }

    async fn fetch_by_access_key(
        &self,
        account: &Account,
        key: &AccessKey,
    ) -> Result<DistributionResponse, ClientError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DistCall::ByKey {
                account: account.id.clone(),
                key: key.clone(),
            });
        self.next(Nsu::ZERO)
    }
}

/// Answers every submission with a fixed verdict and keeps the signed XML.
pub struct RecordingEventTransport {
    verdict: Result<Verdict, SubmitError>,
    calls: AtomicUsize,
    submitted: Mutex<Vec<String>>,
}

impl RecordingEventTransport {
    pub fn new(verdict: Result<Verdict, SubmitError>) -> Self {
        Self {
            verdict,
            calls: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Registers everything with status 135.
    pub fn registering() -> Self {
        Self::new(Ok(Verdict {
            status_code: 135,
            reason: "Evento registrado e vinculado a NF-e".to_string(),
            protocol: Some("891240000000001".to_string()),
        }))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventTransport for RecordingEventTransport {
    async fn submit(&self, _account: &Account, signed: &SignedEnvelope) -> Result<Verdict, SubmitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(signed.xml().to_string());
        self.verdict.clone()
    }
}
