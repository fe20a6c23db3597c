//! JSON-over-HTTP index client.
//!
//! - `POST {url}/indexes/{index}/documents` with `{"documents": [doc]}` → `{"ids": [...]}`
//! - `POST {url}/indexes/{index}/documents/delete` with `{"ids": [...]}`

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use indexsync_shared::{IndexConfig, IndexSyncError, Result, read_secret};
use indexsync_source::{ClientCache, CredentialKey};

use crate::{IndexDocument, IndexPublisher};

#[derive(Serialize)]
struct PublishRequest<'a> {
    documents: [&'a IndexDocument; 1],
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Serialize)]
struct RetractRequest<'a> {
    ids: &'a [String],
}

/// [`IndexPublisher`] for the configured index.
#[derive(Debug, Clone)]
pub struct HttpIndexClient {
    documents_url: Url,
    delete_url: Url,
    client: Client,
}

impl HttpIndexClient {
    /// The API key is sent only when its env var is set.
    pub fn new(config: &IndexConfig, cache: &ClientCache) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| IndexSyncError::config(format!("invalid index url '{}': {e}", config.url)))?;

        let token_env = read_secret(&config.api_key_env).map(|_| config.api_key_env.as_str());
        if token_env.is_none() {
            debug!(var = %config.api_key_env, "index API key not set, sending unauthenticated requests");
        }
        let key = CredentialKey::new(&config.url, token_env)?;

        let endpoint = |tail: &[&str]| -> Result<Url> {
            let mut url = base.clone();
            url.path_segments_mut()
                .map_err(|_| IndexSyncError::config(format!("index url '{base}' cannot be a base")))?
                .pop_if_empty()
                .extend(["indexes", config.index.as_str(), "documents"])
                .extend(tail);
            Ok(url)
        };

        Ok(Self {
            documents_url: endpoint(&[])?,
            delete_url: endpoint(&["delete"])?,
            client: cache.client(&key)?,
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, url: &Url, body: &B) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| IndexSyncError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(IndexSyncError::Publish(format!("{url}: HTTP {status}: {detail}")));
        }
        Err(IndexSyncError::Network(format!("{url}: HTTP {status}")))
    }
}

#[async_trait]
impl IndexPublisher for HttpIndexClient {
    async fn publish(&self, doc: &IndexDocument) -> Result<Vec<String>> {
        let body = PublishRequest { documents: [doc] };
        let response: PublishResponse = self
            .post(&self.documents_url, &body)
            .await?
            .json()
            .await
            .map_err(|e| IndexSyncError::parse(format!("invalid publish response: {e}")))?;
        if response.ids.is_empty() {
            return Err(IndexSyncError::Publish(format!(
                "index returned no ids for {}",
                doc.path
            )));
        }
        info!(path = %doc.path, ids = response.ids.len(), "document published");
        Ok(response.ids)
    }

    async fn retract(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post(&self.delete_url, &RetractRequest { ids }).await?;
        info!(count = ids.len(), "documents retracted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexsync_shared::{Fingerprint, ManifestEntry};
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str, key_env: &str) -> IndexConfig {
        IndexConfig {
            url: url.into(),
            index: "docs".into(),
            api_key_env: key_env.into(),
        }
    }

    fn doc() -> IndexDocument {
        let entry = ManifestEntry::new("1", Fingerprint::new(3, 1), "a.md", "text/markdown");
        IndexDocument::new("notes", &entry, "A".into(), "# A\n".into())
    }

    #[tokio::test]
    async fn publish_returns_assigned_ids() {
        let server = MockServer::start().await;
        let var = "INDEXSYNC_TEST_INDEX_KEY_PUBLISH";
        // SAFETY: test-only variable, not read by any other test.
        unsafe { std::env::set_var(var, "k3y") };

        Mock::given(method("POST"))
            .and(path("/indexes/docs/documents"))
            .and(header("authorization", "Bearer k3y"))
            .and(body_partial_json(serde_json::json!({
                "documents": [{"item_id": "1", "source": "notes", "title": "A"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ids": ["chunk-1", "chunk-2"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpIndexClient::new(&config(&server.uri(), var), &ClientCache::new()).unwrap();
        let ids = client.publish(&doc()).await.unwrap();
        assert_eq!(ids, vec!["chunk-1", "chunk-2"]);
    }

    #[tokio::test]
    async fn retract_posts_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/indexes/docs/documents/delete"))
            .and(body_json(serde_json::json!({"ids": ["chunk-1"]})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpIndexClient::new(
            &config(&server.uri(), "INDEXSYNC_TEST_INDEX_KEY_UNSET"),
            &ClientCache::new(),
        )
        .unwrap();
        client.retract(&["chunk-1".to_string()]).await.unwrap();
        client.retract(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_document_is_a_publish_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("too large"))
            .mount(&server)
            .await;

        let client = HttpIndexClient::new(
            &config(&server.uri(), "INDEXSYNC_TEST_INDEX_KEY_UNSET"),
            &ClientCache::new(),
        )
        .unwrap();
        let err = client.publish(&doc()).await.unwrap_err();
        assert!(matches!(err, IndexSyncError::Publish(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn empty_id_list_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ids": []})))
            .mount(&server)
            .await;

        let client = HttpIndexClient::new(
            &config(&server.uri(), "INDEXSYNC_TEST_INDEX_KEY_UNSET"),
            &ClientCache::new(),
        )
        .unwrap();
        assert!(client.publish(&doc()).await.is_err());
    }
}
