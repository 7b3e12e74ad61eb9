//! Event submission over SOAP 1.2 and parsing of the synchronous verdict.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dfe_schemas::{Account, Verdict};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::endpoints::EventEndpoints;
use crate::soap;
use crate::tls::ClientPool;
use crate::xmldsig::SignedEnvelope;

pub const EVENT_WSDL_NS: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NFeRecepcaoEvento4";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    NoEndpoint(String),
    Identity(String),
    Timeout,
    Transport(String),
    Http { status: u16, body: String },
    Envelope(String),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::NoEndpoint(code) => write!(f, "no event endpoint for authority {code}"),
            SubmitError::Identity(e) => write!(f, "client identity: {e}"),
            SubmitError::Timeout => write!(f, "event submission timed out"),
            SubmitError::Transport(e) => write!(f, "transport: {e}"),
            SubmitError::Http { status, body } => write!(f, "HTTP {status}: {body}"),
            SubmitError::Envelope(e) => write!(f, "malformed response: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Deliver one signed event and return the authority's verdict for it.
    async fn submit(&self, account: &Account, signed: &SignedEnvelope) -> Result<Verdict, SubmitError>;
}

pub struct SoapEventTransport {
    endpoints: EventEndpoints,
    clients: Arc<dyn ClientPool>,
    next_lot: AtomicU64,
}

impl SoapEventTransport {
    pub fn new(endpoints: EventEndpoints, clients: Arc<dyn ClientPool>) -> Self {
        // Batch ids only need to be distinct per submission; seed from the
        // wall clock so restarts do not reuse low numbers.
        let seed = chrono::Utc::now().timestamp_millis().unsigned_abs();
        Self {
            endpoints,
            clients,
            next_lot: AtomicU64::new(seed),
        }
    }
}

#[async_trait]
impl EventTransport for SoapEventTransport {
    async fn submit(&self, account: &Account, signed: &SignedEnvelope) -> Result<Verdict, SubmitError> {
        let url = self
            .endpoints
            .resolve(&account.authority_code, account.environment)
            .ok_or_else(|| SubmitError::NoEndpoint(account.authority_code.to_string()))?;
        let client = self
            .clients
            .client(&account.id)
            .map_err(|e| SubmitError::Identity(e.to_string()))?;

        let lot = self.next_lot.fetch_add(1, Ordering::Relaxed);
        let body = soap::envelope(EVENT_WSDL_NS, &signed.batch_xml(lot));

        tracing::debug!(account = %account.id, %url, event_id = %signed.event_id(), "event/submit");

        let resp = client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, soap::SOAP_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = resp.status();
        let text = resp.text().await.map_err(map_reqwest)?;
        if !status.is_success() {
            // SOAP faults come back as 500 with a parseable body.
            if let Ok(v) = parse_event_response(&text) {
                return Ok(v);
            }
            return Err(SubmitError::Http {
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }
        parse_event_response(&text)
    }
}

fn map_reqwest(e: reqwest::Error) -> SubmitError {
    if e.is_timeout() {
        SubmitError::Timeout
    } else {
        SubmitError::Transport(e.to_string())
    }
}

/// Verdict for the (single) event in a `retEnvEvento`.
///
/// The per-event `retEvento/infEvento` status wins; a batch-level status is
/// returned only when the batch itself was refused.
pub fn parse_event_response(xml: &str) -> Result<Verdict, SubmitError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut batch_stat: Option<String> = None;
    let mut batch_reason: Option<String> = None;
    let mut event_stat: Option<String> = None;
    let mut event_reason: Option<String> = None;
    let mut protocol: Option<String> = None;
    let mut fault: Option<String> = None;

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| SubmitError::Envelope(e.to_string()))?;
        match ev {
            Event::Start(e) => stack.push(e.local_name().as_ref().to_vec()),
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(t) => {
                let v = t
                    .unescape()
                    .map_err(|e| SubmitError::Envelope(e.to_string()))?
                    .trim()
                    .to_string();
                let in_event = stack.iter().any(|n| n == b"retEvento");
                let in_fault = stack.iter().any(|n| n == b"Fault");
                match stack.last().map(|n| n.as_slice()) {
                    Some(b"cStat") if in_event => event_stat.get_or_insert(v),
                    Some(b"xMotivo") if in_event => event_reason.get_or_insert(v),
                    Some(b"nProt") if in_event => protocol.get_or_insert(v),
                    Some(b"cStat") => batch_stat.get_or_insert(v),
                    Some(b"xMotivo") => batch_reason.get_or_insert(v),
                    Some(b"Text") if in_fault => fault.get_or_insert(v),
                    _ => continue,
                };
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let (stat, reason, protocol) = match (event_stat, batch_stat) {
        (Some(s), _) => (s, event_reason, protocol),
        (None, Some(s)) => (s, batch_reason, None),
        (None, None) => {
            return Err(SubmitError::Envelope(match fault {
                Some(f) => format!("SOAP fault: {f}"),
                None => "response carries no cStat".to_string(),
            }))
        }
    };
    let status_code = stat
        .parse::<u16>()
        .map_err(|_| SubmitError::Envelope(format!("non-numeric cStat '{stat}'")))?;

    Ok(Verdict {
        status_code,
        reason: reason.unwrap_or_default(),
        protocol: protocol.filter(|p| !p.is_empty()),
    })
}
