//! JSON-over-HTTP content source.
//!
//! `GET {url}/items?page_size=N[&page_token=T]` returns
//! `{"items": [...], "next_page_token": "..."}`; the listing follows tokens
//! until none is returned. `GET {url}/items/{id}/content` returns raw bytes.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument};
use url::Url;

use indexsync_shared::{Fingerprint, IndexSyncError, ManifestEntry, Result, SourceConfig, SourceKind};

use crate::RemoteSource;
use crate::client::{ClientCache, CredentialKey};

/// Upper bound on pages followed in one listing.
const MAX_PAGES: usize = 10_000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    items: Vec<RemoteItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteItem {
    id: String,
    path: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: u64,
    /// Unix seconds.
    #[serde(default)]
    modified: Option<i64>,
    #[serde(default)]
    content_type: Option<String>,
}

impl RemoteItem {
    fn into_entry(self, kind: SourceKind) -> ManifestEntry {
        let content_type = self
            .content_type
            .unwrap_or_else(|| default_content_type(kind).to_string());
        let mut entry = ManifestEntry::new(
            self.id,
            Fingerprint {
                size: self.size,
                mtime: self.modified,
            },
            self.path,
            content_type,
        );
        if let Some(name) = self.name {
            entry.name = name;
        }
        entry
    }
}

fn default_content_type(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Html => "text/html",
        SourceKind::Markdown => "text/markdown",
        SourceKind::Text => "text/plain",
    }
}

// ---------------------------------------------------------------------------
// HttpSource
// ---------------------------------------------------------------------------

/// [`RemoteSource`] backed by the items API of one configured source.
#[derive(Debug, Clone)]
pub struct HttpSource {
    name: String,
    kind: SourceKind,
    base: Url,
    page_size: u32,
    client: Client,
}

impl HttpSource {
    pub fn new(config: &SourceConfig, cache: &ClientCache) -> Result<Self> {
        let base = Url::parse(&config.url).map_err(|e| {
            IndexSyncError::config(format!("invalid url for source '{}': {e}", config.name))
        })?;
        let key = CredentialKey::new(&config.url, config.token_env.as_deref())?;
        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            base,
            page_size: config.page_size.max(1),
            client: cache.client(&key)?,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| IndexSyncError::config(format!("source url '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| IndexSyncError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(IndexSyncError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(IndexSyncError::Network(format!("{url}: HTTP {status}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(source = %self.name))]
    async fn list(&self) -> Result<Vec<ManifestEntry>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        let mut seen_tokens = HashSet::new();

        for page in 1..=MAX_PAGES {
            let mut url = self.endpoint(&["items"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("page_size", &self.page_size.to_string());
                if let Some(t) = &token {
                    query.append_pair("page_token", t);
                }
            }

            let body: ItemsPage = self
                .get(url.clone())
                .await?
                .json()
                .await
                .map_err(|e| IndexSyncError::parse(format!("{url}: invalid items page: {e}")))?;

            debug!(page, items = body.items.len(), "listed page");
            entries.extend(body.items.into_iter().map(|item| item.into_entry(self.kind)));

            match body.next_page_token.filter(|t| !t.is_empty()) {
                None => {
                    info!(items = entries.len(), pages = page, "remote manifest listed");
                    return Ok(entries);
                }
                Some(next) if !seen_tokens.insert(next.clone()) => {
                    return Err(IndexSyncError::parse(format!(
                        "{}: page token '{next}' repeated",
                        self.base
                    )));
                }
                Some(next) => token = Some(next),
            }
        }

        Err(IndexSyncError::ResourceExhausted(format!(
            "{}: more than {MAX_PAGES} pages",
            self.base
        )))
    }

    async fn fetch(&self, entry: &ManifestEntry) -> Result<Vec<u8>> {
        let url = self.endpoint(&["items", &entry.id, "content"])?;
        debug!(source = %self.name, id = %entry.id, "fetching item");
        let bytes = self
            .get(url.clone())
            .await?
            .bytes()
            .await
            .map_err(|e| IndexSyncError::Network(format!("{url}: body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}
