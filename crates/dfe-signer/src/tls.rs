//! HTTPS clients bound to one account's client certificate.
//!
//! A client is built once per account and reused; no client is ever shared
//! between two accounts, so an in-flight call always carries exactly one
//! identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dfe_schemas::AccountId;

use crate::credentials::CredentialStore;
use crate::SignError;

pub trait ClientPool: Send + Sync {
    fn client(&self, account: &AccountId) -> Result<reqwest::Client, SignError>;
}

/// Mutually authenticated clients (production).
pub struct IdentityClientPool {
    credentials: Arc<dyn CredentialStore>,
    timeout: Duration,
    extra_roots: Vec<reqwest::Certificate>,
    cache: Mutex<HashMap<AccountId, reqwest::Client>>,
}

impl IdentityClientPool {
    pub fn new(credentials: Arc<dyn CredentialStore>, timeout: Duration) -> Self {
        Self {
            credentials,
            timeout,
            extra_roots: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Trust the authority chain from a PEM bundle in addition to the
    /// built-in roots.
    pub fn with_ca_bundle(mut self, pem: &[u8]) -> Result<Self, SignError> {
        let certs = openssl::x509::X509::stack_from_pem(pem)
            .map_err(|e| SignError::Identity(format!("CA bundle: {e}")))?;
        for cert in certs {
            let der = cert
                .to_der()
                .map_err(|e| SignError::Identity(format!("CA bundle: {e}")))?;
            let root = reqwest::Certificate::from_der(&der)
                .map_err(|e| SignError::Identity(format!("CA bundle: {e}")))?;
            self.extra_roots.push(root);
        }
        Ok(self)
    }
}

impl ClientPool for IdentityClientPool {
    fn client(&self, account: &AccountId) -> Result<reqwest::Client, SignError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = cache.get(account) {
            return Ok(c.clone());
        }

        let identity = self.credentials.identity(account)?;
        let tls = reqwest::Identity::from_pem(&identity.tls_pem()?)
            .map_err(|e| SignError::Identity(format!("TLS identity: {e}")))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(tls)
            .timeout(self.timeout);
        for root in &self.extra_roots {
            builder = builder.add_root_certificate(root.clone());
        }
        let client = builder
            .build()
            .map_err(|e| SignError::Identity(format!("HTTPS client: {e}")))?;

        cache.insert(account.clone(), client.clone());
        Ok(client)
    }
}

/// One client without a client certificate, for plain-HTTP test servers.
#[derive(Debug, Clone)]
pub struct PlainClientPool {
    client: reqwest::Client,
}

impl PlainClientPool {
    pub fn new(timeout: Duration) -> Result<Self, SignError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignError::Identity(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl ClientPool for PlainClientPool {
    fn client(&self, _account: &AccountId) -> Result<reqwest::Client, SignError> {
        Ok(self.client.clone())
    }
}
