//! HTTP client construction and caching.
//!
//! A client carries its bearer token as a default header, so clients are
//! cached per credential identity (endpoint origin + token variable). The
//! cache is an ordinary value owned by whoever builds the pipeline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::debug;
use url::Url;

use indexsync_shared::{IndexSyncError, Result, read_secret};

/// User-Agent string for every outbound request.
pub const USER_AGENT: &str = concat!("indexsync/", env!("CARGO_PKG_VERSION"));

/// Who a client authenticates as, and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    /// `scheme://host:port` of the endpoint.
    pub origin: String,
    /// Env var holding the bearer token, if any.
    pub token_env: Option<String>,
}

impl CredentialKey {
    pub fn new(endpoint: &str, token_env: Option<&str>) -> Result<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| IndexSyncError::config(format!("invalid endpoint '{endpoint}': {e}")))?;
        Ok(Self {
            origin: url.origin().ascii_serialization(),
            token_env: token_env.map(String::from),
        })
    }
}

/// Clients built so far, one per credential identity.
#[derive(Debug, Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<CredentialKey, Client>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached client for `key`, built on first use.
    pub fn client(&self, key: &CredentialKey) -> Result<Client> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| IndexSyncError::Network("client cache poisoned".into()))?;
        if let Some(client) = clients.get(key) {
            return Ok(client.clone());
        }
        let client = build_client(key.token_env.as_deref())?;
        debug!(origin = %key.origin, token_env = ?key.token_env, "built HTTP client");
        clients.insert(key.clone(), client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_client(token_env: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if let Some(var) = token_env {
        let token = read_secret(var).ok_or_else(|| {
            IndexSyncError::config(format!("token variable {var} is not set"))
        })?;
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| IndexSyncError::config(format!("token in {var} is not a valid header: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| IndexSyncError::Network(format!("failed to build HTTP client: {e}")))
}
