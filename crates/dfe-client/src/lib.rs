//! Distribution service client (`distDFeInt` / `retDistDFeInt`).
//!
//! # Contract
//! - One call is one authority request. No retries, no sleeping: pacing and
//!   quota are the caller's job.
//! - Every request carries the account's own client identity (see
//!   [`dfe_signer::ClientPool`]).
//! - Malformed document entries do not fail the whole response; they are
//!   reported in [`DistributionResponse::malformed_entries`].

mod family;
mod request;
mod response;

pub use family::{profile, DistributionEndpoints, ServiceProfile, CTE, NFE};
pub use request::{dist_request, Query};
pub use response::{parse_response, DistStatus, DistributionResponse};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dfe_schemas::{AccessKey, Account, DocumentFamily, Nsu};
use dfe_signer::soap;
use dfe_signer::ClientPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Timeout,
    Transport(String),
    Http { status: u16 },
    /// Response body is not a usable `retDistDFeInt`.
    Envelope(String),
    Identity(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Timeout => write!(f, "distribution request timed out"),
            ClientError::Transport(e) => write!(f, "transport: {e}"),
            ClientError::Http { status } => write!(f, "HTTP {status}"),
            ClientError::Envelope(e) => write!(f, "malformed response: {e}"),
            ClientError::Identity(e) => write!(f, "client identity: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

#[async_trait]
pub trait DistributionClient: Send + Sync {
    /// Documents after `since` for one family.
    async fn fetch(
        &self,
        account: &Account,
        family: DocumentFamily,
        since: Nsu,
    ) -> Result<DistributionResponse, ClientError>;

    /// One document by access key; the family follows the key's model.
    async fn fetch_by_access_key(
        &self,
        account: &Account,
        key: &AccessKey,
    ) -> Result<DistributionResponse, ClientError>;
}

pub struct SoapDistributionClient {
    endpoints: DistributionEndpoints,
    clients: Arc<dyn ClientPool>,
}

impl SoapDistributionClient {
    pub fn new(endpoints: DistributionEndpoints, clients: Arc<dyn ClientPool>) -> Self {
        Self { endpoints, clients }
    }

    async fn call(
        &self,
        account: &Account,
        family: DocumentFamily,
        query: &Query,
    ) -> Result<DistributionResponse, ClientError> {
        let p = profile(family);
        let url = self.endpoints.resolve(family, account.environment);
        let client = self
            .clients
            .client(&account.id)
            .map_err(|e| ClientError::Identity(e.to_string()))?;

        let body = soap::envelope_with_operation(
            p.wsdl_ns,
            p.operation,
            p.message_element,
            &dist_request(account, family, query),
        );

        tracing::debug!(account = %account.id, family = %family.as_str(), %url, "dist/request");

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
            return Err(ClientError::Http {
                status: status.as_u16(),
            });
        }

        let parsed = parse_response(&text)?;
        tracing::debug!(
            account = %account.id,
            family = %family.as_str(),
            status = parsed.status_code,
            docs = parsed.documents.len(),
            malformed = parsed.malformed_entries.len(),
            "dist/response"
        );
        Ok(parsed)
    }
}

fn map_reqwest(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Transport(e.to_string())
    }
}

#[async_trait]
impl DistributionClient for SoapDistributionClient {
    async fn fetch(
        &self,
        account: &Account,
        family: DocumentFamily,
        since: Nsu,
    ) -> Result<DistributionResponse, ClientError> {
        self.call(account, family, &Query::SinceWatermark(since)).await
    }

    async fn fetch_by_access_key(
        &self,
        account: &Account,
        key: &AccessKey,
    ) -> Result<DistributionResponse, ClientError> {
        let family = key
            .family()
            .ok_or_else(|| ClientError::Envelope(format!("access key {key} has no known model")))?;
        self.call(account, family, &Query::ByAccessKey(key.clone()))
            .await
    }
}
