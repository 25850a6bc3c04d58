use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AsHeaderName, HeaderMap, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use shared_types::{canonical_json, Document, RegistryKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::decode_content;
use crate::error::{RegistryError, Result};
use crate::version::VersionGate;
use crate::{Revision, StorageBackend, StoredDocument, Transform, WriteCondition};

const MS_VERSION: &str = "2021-08-06";
const LEASE_ID: &str = "x-ms-lease-id";
const LEASE_ACTION: &str = "x-ms-lease-action";
const VERSION_METADATA: &str = "x-ms-meta-apiversion";

/// Block blobs in a container reached through the Blob REST API with a SAS token.
///
/// Conditional writes take an infinite lease on the blob for their duration, so a
/// competing writer holding the blob sees a conflict instead of racing the upload.
pub struct BlobStore {
    name: String,
    client: Client,
    container: Url,
    sas_token: Option<String>,
    gate: Arc<VersionGate>,
}

fn ms_request(client: &Client, method: Method, url: Url) -> RequestBuilder {
    client
        .request(method, url)
        .header("x-ms-version", MS_VERSION)
        .header(
            "x-ms-date",
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        )
}

fn header_str(headers: &HeaderMap, name: impl AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// An infinite lease on one blob. Released explicitly; if dropped while still
/// held (for example when the caller's future is cancelled) the release is
/// sent from a background task.
struct Lease {
    client: Client,
    url: Url,
    id: String,
    backend: String,
    held: bool,
}

impl Lease {
    fn release_request(&self) -> RequestBuilder {
        ms_request(&self.client, Method::PUT, self.url.clone())
            .header(LEASE_ACTION, "release")
            .header(LEASE_ID, self.id.as_str())
    }

    /// The guard stays armed until the service confirms the release, so a
    /// cancelled or failed release is sent again on drop.
    async fn release(mut self) -> Result<()> {
        let response = self
            .release_request()
            .send()
            .await
            .map_err(|e| RegistryError::unavailable(&self.backend, e))?;

        if response.status().is_success() {
            self.held = false;
            debug!("Released lease {}", self.id);
            Ok(())
        } else {
            Err(RegistryError::unavailable(
                &self.backend,
                anyhow!("lease release responded with {}", response.status()),
            ))
        }
    }

    /// The blob was deleted and took the lease with it.
    fn forget(mut self) {
        self.held = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        let request = self.release_request();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = request.send().await {
                        warn!("Failed to release abandoned lease {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("Lease {} dropped outside a runtime and was not released", id),
        }
    }
}

/// The operation's outcome stands on its own. A failed release is logged and
/// retried by the lease guard; until then later acquires report a conflict.
fn settle<T>(outcome: Result<T>, released: Result<()>) -> Result<T> {
    if let Err(release_err) = released {
        warn!("Failed to release lease: {}", release_err);
    }
    outcome
}

impl BlobStore {
    pub fn new(
        name: impl Into<String>,
        container_url: &str,
        sas_token: Option<String>,
        gate: Arc<VersionGate>,
    ) -> anyhow::Result<Self> {
        let container = Url::parse(container_url)
            .with_context(|| format!("Invalid container URL: {container_url}"))?;
        if container.cannot_be_a_base() {
            bail!("Container URL cannot hold blob paths: {container_url}");
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        info!("Initializing blob storage at: {}", container);

        Ok(Self {
            name: name.into(),
            client,
            container,
            sas_token: sas_token.map(|t| t.trim_start_matches('?').to_string()),
            gate,
        })
    }

    fn blob_url(&self, key: &RegistryKey) -> Url {
        let mut url = self.container.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            let storage = key.storage_segments();
            if let Some((last, parents)) = storage.split_last() {
                segments.extend(parents);
                segments.push(&format!("{last}.json"));
            }
        }
        url.set_query(self.sas_token.as_deref());
        url
    }

    fn request(&self, method: Method, key: &RegistryKey) -> RequestBuilder {
        ms_request(&self.client, method, self.blob_url(key))
    }

    fn unavailable(&self, err: impl Into<anyhow::Error>) -> RegistryError {
        RegistryError::unavailable(&self.name, err)
    }

    fn status_error(&self, status: StatusCode) -> RegistryError {
        self.unavailable(anyhow!("blob service responded with {status}"))
    }

    async fn acquire_lease(&self, key: &RegistryKey) -> Result<Lease> {
        let mut url = self.blob_url(key);
        url.query_pairs_mut().append_pair("comp", "lease");

        let response = ms_request(&self.client, Method::PUT, url.clone())
            .header(LEASE_ACTION, "acquire")
            .header("x-ms-lease-duration", "-1")
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let id = header_str(response.headers(), LEASE_ID)
                    .ok_or_else(|| self.unavailable(anyhow!("lease granted without an id")))?;
                debug!("Acquired lease {} on {}", id, key);
                Ok(Lease {
                    client: self.client.clone(),
                    url,
                    id,
                    backend: self.name.clone(),
                    held: true,
                })
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(key.to_string())),
            StatusCode::CONFLICT => Err(RegistryError::precondition(
                key,
                "exclusive lease",
                "lease held by another writer",
            )),
            status => Err(self.status_error(status)),
        }
    }

    async fn fetch(&self, key: &RegistryKey, lease_id: Option<&str>) -> Result<StoredDocument> {
        let mut request = self.request(Method::GET, key);
        if let Some(id) = lease_id {
            request = request.header(LEASE_ID, id);
        }
        let response = request.send().await.map_err(|e| self.unavailable(e))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(RegistryError::NotFound(key.to_string())),
            status => return Err(self.status_error(status)),
        }

        let version = header_str(response.headers(), VERSION_METADATA)
            .ok_or_else(|| RegistryError::corrupt(key, "missing version metadata"))?;
        self.gate.check_stored(key, &version)?;
        let revision = Revision(header_str(response.headers(), ETAG).unwrap_or_default());

        let bytes = response.bytes().await.map_err(|e| self.unavailable(e))?;
        let document = decode_content(&self.gate, key, Some(&version), &bytes)?;
        Ok(StoredDocument { document, revision })
    }

    async fn upload(
        &self,
        key: &RegistryKey,
        document: &Document,
        lease_id: Option<&str>,
        condition: &WriteCondition,
    ) -> Result<()> {
        let mut request = self
            .request(Method::PUT, key)
            .header("x-ms-blob-type", "BlockBlob")
            .header(VERSION_METADATA, self.gate.server_version())
            .header(CONTENT_TYPE, "application/json")
            .body(canonical_json(&document.content));
        if let Some(id) = lease_id {
            request = request.header(LEASE_ID, id);
        }
        request = match condition {
            WriteCondition::Unconditional => request,
            WriteCondition::Absent => request.header(IF_NONE_MATCH, "*"),
            WriteCondition::Matches(revision) => request.header(IF_MATCH, revision.0.as_str()),
        };

        let response = request.send().await.map_err(|e| self.unavailable(e))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => Err(
                RegistryError::precondition(key, condition.describe(), "a newer revision"),
            ),
            status => Err(self.status_error(status)),
        }
    }

    async fn remove(
        &self,
        key: &RegistryKey,
        lease_id: Option<&str>,
        condition: &WriteCondition,
    ) -> Result<()> {
        let mut request = self.request(Method::DELETE, key);
        if let Some(id) = lease_id {
            request = request.header(LEASE_ID, id);
        }
        if let WriteCondition::Matches(revision) = condition {
            request = request.header(IF_MATCH, revision.0.as_str());
        }

        let response = request.send().await.map_err(|e| self.unavailable(e))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(key.to_string())),
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => Err(
                RegistryError::precondition(key, condition.describe(), "a newer revision"),
            ),
            status => Err(self.status_error(status)),
        }
    }

    async fn modify_under_lease(
        &self,
        key: &RegistryKey,
        lease_id: &str,
        transform: Transform,
    ) -> Result<Document> {
        let current = self.fetch(key, Some(lease_id)).await?;

        match transform(current.document.clone()).map_err(RegistryError::from_transform)? {
            None => {
                debug!("Transform left {} unchanged", key);
                Ok(current.document)
            }
            Some(replacement) => {
                self.upload(key, &replacement, Some(lease_id), &WriteCondition::Unconditional)
                    .await?;
                info!("Stored config {} under lease", key);
                Ok(Document::new(
                    self.gate.server_version(),
                    replacement.content,
                ))
            }
        }
    }
}

#[async_trait]
impl StorageBackend for BlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn exists(&self, key: &RegistryKey) -> Result<bool> {
        let response = self
            .request(Method::HEAD, key)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.status_error(status)),
        }
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn load(&self, key: &RegistryKey) -> Result<StoredDocument> {
        self.fetch(key, None).await
    }

    #[instrument(skip(self, document), fields(backend = %self.name))]
    async fn save(
        &self,
        key: &RegistryKey,
        document: &Document,
        condition: &WriteCondition,
    ) -> Result<()> {
        if !matches!(condition, WriteCondition::Matches(_)) {
            self.upload(key, document, None, condition).await?;
            info!("Stored config: {}", key);
            return Ok(());
        }

        let lease = match self.acquire_lease(key).await {
            Err(RegistryError::NotFound(_)) => {
                return Err(RegistryError::precondition(key, condition.describe(), "none"))
            }
            other => other?,
        };
        let outcome = self.upload(key, document, Some(&lease.id), condition).await;
        settle(outcome, lease.release().await)?;

        info!("Stored config: {}", key);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn delete(&self, key: &RegistryKey, condition: &WriteCondition) -> Result<()> {
        match condition {
            WriteCondition::Unconditional => self.remove(key, None, condition).await?,
            WriteCondition::Absent => {
                return if self.exists(key).await? {
                    Err(RegistryError::precondition(key, "none", "present"))
                } else {
                    Err(RegistryError::NotFound(key.to_string()))
                };
            }
            WriteCondition::Matches(_) => {
                let lease = self.acquire_lease(key).await?;
                match self.remove(key, Some(&lease.id), condition).await {
                    Ok(()) => lease.forget(),
                    Err(e) => return settle(Err(e), lease.release().await),
                }
            }
        }

        info!("Deleted config: {}", key);
        Ok(())
    }

    #[instrument(skip(self, transform), fields(backend = %self.name))]
    async fn modify_exclusive(&self, key: &RegistryKey, transform: Transform) -> Result<Document> {
        let lease = self.acquire_lease(key).await?;
        let outcome = self.modify_under_lease(key, &lease.id, transform).await;
        settle(outcome, lease.release().await)
    }
}
