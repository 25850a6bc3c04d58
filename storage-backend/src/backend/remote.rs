use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use shared_types::{Document, DocumentEnvelope, RegistryKey, VERSION_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::decode_envelope;
use crate::error::{RegistryError, Result};
use crate::version::VersionGate;
use crate::{Revision, StorageBackend, StoredDocument, WriteCondition};

/// Forwards every operation to a peer instance of this service.
pub struct RemoteProxyStore {
    name: String,
    client: Client,
    base_url: Url,
    token: Option<String>,
    gate: Arc<VersionGate>,
}

impl RemoteProxyStore {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        token: Option<String>,
        gate: Arc<VersionGate>,
    ) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid peer URL: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            bail!("Peer URL cannot hold document paths: {base_url}");
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        info!("Proxying to peer registry at: {}", base_url);

        Ok(Self {
            name: name.into(),
            client,
            base_url,
            token,
            gate,
        })
    }

    /// `{base}/configs/{registry}/{namespace}/{name}[/{support}]`
    fn document_url(&self, key: &RegistryKey) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("configs")
                .push(&key.registry)
                .extend(key.storage_segments());
        }
        url
    }

    fn request(&self, method: Method, key: &RegistryKey) -> RequestBuilder {
        let request = self
            .client
            .request(method, self.document_url(key))
            .header(VERSION_HEADER, self.gate.server_version());
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn status_error(
        &self,
        key: &RegistryKey,
        condition: &WriteCondition,
        status: StatusCode,
    ) -> RegistryError {
        match status {
            StatusCode::NOT_FOUND => RegistryError::NotFound(key.to_string()),
            StatusCode::PRECONDITION_FAILED => {
                RegistryError::precondition(key, condition.describe(), "a newer revision")
            }
            status => {
                RegistryError::unavailable(&self.name, anyhow!("peer responded with {status}"))
            }
        }
    }

    async fn send(
        &self,
        key: &RegistryKey,
        condition: &WriteCondition,
        request: RequestBuilder,
    ) -> Result<reqwest::Response> {
        let request = match condition {
            WriteCondition::Unconditional => request,
            WriteCondition::Absent => request.header(IF_NONE_MATCH, "*"),
            WriteCondition::Matches(revision) => request.header(IF_MATCH, revision.0.as_str()),
        };

        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::unavailable(&self.name, e))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.status_error(key, condition, response.status()))
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteProxyStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn exists(&self, key: &RegistryKey) -> Result<bool> {
        let request = self.request(Method::HEAD, key);
        match self.send(key, &WriteCondition::Unconditional, request).await {
            Ok(_) => Ok(true),
            Err(RegistryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn load(&self, key: &RegistryKey) -> Result<StoredDocument> {
        let request = self.request(Method::GET, key);
        let response = self
            .send(key, &WriteCondition::Unconditional, request)
            .await?;

        let revision = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| Revision(value.to_string()))
            .unwrap_or_else(|| Revision(String::new()));
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RegistryError::unavailable(&self.name, e))?;
        debug!("Peer returned {} bytes for {}", bytes.len(), key);

        let document = decode_envelope(&self.gate, key, &bytes)?;
        Ok(StoredDocument { document, revision })
    }

    #[instrument(skip(self, document), fields(backend = %self.name))]
    async fn save(
        &self,
        key: &RegistryKey,
        document: &Document,
        condition: &WriteCondition,
    ) -> Result<()> {
        let envelope = DocumentEnvelope::stamped(document, self.gate.server_version());
        let request = self.request(Method::PUT, key).json(&envelope);
        self.send(key, condition, request).await?;

        info!("Stored config {} on peer", key);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn delete(&self, key: &RegistryKey, condition: &WriteCondition) -> Result<()> {
        let request = self.request(Method::DELETE, key);
        self.send(key, condition, request).await?;

        info!("Deleted config {} on peer", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    const DOCUMENT_PATH: &str = "/configs/main/platform/monorepo";

    async fn setup_store() -> (RemoteProxyStore, ServerGuard) {
        let server = Server::new_async().await;
        let gate = Arc::new(VersionGate::new("1.3.0").unwrap());
        let store =
            RemoteProxyStore::new("peer", &server.url(), Some("secret".to_string()), gate)
                .unwrap();
        (store, server)
    }

    fn key() -> RegistryKey {
        RegistryKey::new("main", "platform", "monorepo")
    }

    #[test]
    fn test_document_url() {
        let gate = Arc::new(VersionGate::new("1.3.0").unwrap());
        let store =
            RemoteProxyStore::new("peer", "https://peer.example.com/registry/", None, gate)
                .unwrap();

        assert_eq!(
            store.document_url(&key()).path(),
            "/registry/configs/main/platform/monorepo"
        );
        assert_eq!(
            store.document_url(&key().with_support("2.x")).path(),
            "/registry/configs/main/platform/monorepo/2.x"
        );
    }

    #[tokio::test]
    async fn test_load_sends_bearer_and_version() {
        let (store, mut server) = setup_store().await;
        let mock = server
            .mock("GET", DOCUMENT_PATH)
            .match_header("authorization", "Bearer secret")
            .match_header(VERSION_HEADER, "1.3.0")
            .with_status(200)
            .with_header("etag", "\"abc\"")
            .with_body(r#"{"apiVersion": "1.2.0", "content": {"develop": "develop"}}"#)
            .create_async()
            .await;

        let stored = store.load(&key()).await.unwrap();
        assert_eq!(stored.document.api_version, "1.2.0");
        assert_eq!(stored.document.content, json!({"develop": "develop"}));
        assert_eq!(stored.revision, Revision("\"abc\"".to_string()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_save_forwards_condition() {
        let (store, mut server) = setup_store().await;
        let mock = server
            .mock("PUT", DOCUMENT_PATH)
            .match_header("if-match", "\"abc\"")
            .match_body(Matcher::PartialJson(json!({
                "apiVersion": "1.3.0",
                "content": {"develop": "main"}
            })))
            .with_status(200)
            .create_async()
            .await;

        let document = Document::new("1.0.0", json!({"develop": "main"}));
        let condition = WriteCondition::Matches(Revision("\"abc\"".to_string()));
        store.save(&key(), &document, &condition).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (store, mut server) = setup_store().await;
        let _missing = server
            .mock("GET", DOCUMENT_PATH)
            .with_status(404)
            .create_async()
            .await;
        let _stale = server
            .mock("PUT", DOCUMENT_PATH)
            .with_status(412)
            .create_async()
            .await;
        let _broken = server
            .mock("DELETE", DOCUMENT_PATH)
            .with_status(500)
            .create_async()
            .await;

        assert!(store.load(&key()).await.unwrap_err().is_not_found());
        assert!(matches!(
            store
                .save(&key(), &Document::empty("1.3.0"), &WriteCondition::Absent)
                .await,
            Err(RegistryError::PreconditionFailed { .. })
        ));
        assert!(matches!(
            store.delete(&key(), &WriteCondition::Unconditional).await,
            Err(RegistryError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_exists() {
        let (store, mut server) = setup_store().await;
        let _present = server
            .mock("HEAD", DOCUMENT_PATH)
            .with_status(200)
            .create_async()
            .await;
        let _absent = server
            .mock("HEAD", "/configs/main/platform/other")
            .with_status(404)
            .create_async()
            .await;
        let _denied = server
            .mock("HEAD", "/configs/main/platform/locked")
            .with_status(401)
            .create_async()
            .await;

        assert!(store.exists(&key()).await.unwrap());
        assert!(!store
            .exists(&RegistryKey::new("main", "platform", "other"))
            .await
            .unwrap());
        assert!(matches!(
            store
                .exists(&RegistryKey::new("main", "platform", "locked"))
                .await,
            Err(RegistryError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_newer_peer_document_is_refused() {
        let (store, mut server) = setup_store().await;
        let _mock = server
            .mock("GET", DOCUMENT_PATH)
            .with_status(200)
            .with_body(r#"{"apiVersion": "2.0.0", "content": {}}"#)
            .create_async()
            .await;

        assert!(matches!(
            store.load(&key()).await,
            Err(RegistryError::VersionIncompatible { .. })
        ));
    }
}
