use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutMode, PutOptions, PutPayload,
    UpdateVersion,
};
use shared_types::{canonical_json, Document, RegistryKey};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{decode_content, object_name};
use crate::config::ObjectStoreConfig;
use crate::error::{RegistryError, Result};
use crate::version::VersionGate;
use crate::{Revision, StorageBackend, StoredDocument, WriteCondition};

const VERSION_METADATA: &str = "apiversion";

pub struct ObjectStoreBackend {
    name: String,
    store: Arc<dyn ObjectStore>,
    gate: Arc<VersionGate>,
}

impl ObjectStoreBackend {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        gate: Arc<VersionGate>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            gate,
        }
    }

    pub fn from_config(
        name: impl Into<String>,
        config: &ObjectStoreConfig,
        gate: Arc<VersionGate>,
    ) -> AnyResult<Self> {
        let store: Arc<dyn ObjectStore> = match config {
            ObjectStoreConfig::Memory => {
                info!("Initializing in-memory object storage");
                Arc::new(InMemory::new())
            }
            ObjectStoreConfig::S3 {
                bucket,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
                allow_http,
            } => {
                info!("Initializing S3 object storage for bucket: {}", bucket);
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_allow_http(*allow_http)
                    .with_conditional_put(S3ConditionalPut::ETagMatch);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(access_key_id) = access_key_id {
                    builder = builder.with_access_key_id(access_key_id);
                }
                if let Some(secret_access_key) = secret_access_key {
                    builder = builder.with_secret_access_key(secret_access_key);
                }
                Arc::new(builder.build()?)
            }
        };

        Ok(Self::new(name, store, gate))
    }

    fn object_path(&self, key: &RegistryKey) -> Path {
        Path::from(object_name(key))
    }

    fn version_attribute() -> Attribute {
        Attribute::Metadata(Cow::Borrowed(VERSION_METADATA))
    }

    /// Conditional writes compare ETags; a revision without one cannot be enforced.
    fn require_etag<'a>(&self, revision: &'a Revision) -> Result<&'a str> {
        if revision.0.is_empty() {
            Err(RegistryError::unavailable(
                &self.name,
                anyhow!("store reported no ETag, conditional writes cannot be enforced"),
            ))
        } else {
            Ok(&revision.0)
        }
    }

    fn map_error(
        &self,
        key: &RegistryKey,
        condition: &WriteCondition,
        err: object_store::Error,
    ) -> RegistryError {
        match err {
            object_store::Error::NotFound { .. } => RegistryError::NotFound(key.to_string()),
            object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. } => {
                RegistryError::precondition(key, condition.describe(), "a newer revision")
            }
            other => RegistryError::unavailable(&self.name, other),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn exists(&self, key: &RegistryKey) -> Result<bool> {
        let path = self.object_path(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(RegistryError::unavailable(&self.name, e)),
        }
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn load(&self, key: &RegistryKey) -> Result<StoredDocument> {
        let path = self.object_path(key);
        debug!("Getting object {}", path);

        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| self.map_error(key, &WriteCondition::Unconditional, e))?;

        // Gate on the metadata before pulling the body
        let version = result
            .attributes
            .get(&Self::version_attribute())
            .map(|value| {
                let value: &str = value.as_ref();
                value.to_string()
            })
            .ok_or_else(|| RegistryError::corrupt(key, "missing version metadata"))?;
        self.gate.check_stored(key, &version)?;

        let revision = Revision(result.meta.e_tag.clone().unwrap_or_default());
        let bytes = result
            .bytes()
            .await
            .map_err(|e| RegistryError::unavailable(&self.name, e))?;
        let document = decode_content(&self.gate, key, Some(&version), &bytes)?;

        Ok(StoredDocument { document, revision })
    }

    #[instrument(skip(self, document), fields(backend = %self.name))]
    async fn save(
        &self,
        key: &RegistryKey,
        document: &Document,
        condition: &WriteCondition,
    ) -> Result<()> {
        let path = self.object_path(key);

        let mut attributes = Attributes::new();
        attributes.insert(
            Self::version_attribute(),
            AttributeValue::from(self.gate.server_version().to_string()),
        );
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from("application/json"),
        );

        let mode = match condition {
            WriteCondition::Unconditional => PutMode::Overwrite,
            WriteCondition::Absent => PutMode::Create,
            WriteCondition::Matches(revision) => PutMode::Update(UpdateVersion {
                e_tag: Some(self.require_etag(revision)?.to_string()),
                version: None,
            }),
        };
        let options = PutOptions {
            mode,
            attributes,
            ..Default::default()
        };

        let payload = PutPayload::from(canonical_json(&document.content).into_bytes());
        self.store
            .put_opts(&path, payload, options)
            .await
            .map_err(|e| self.map_error(key, condition, e))?;

        info!("Stored config {} at {}", key, path);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn delete(&self, key: &RegistryKey, condition: &WriteCondition) -> Result<()> {
        let path = self.object_path(key);

        // Object stores delete idempotently; check with head first so absence is reported
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|e| self.map_error(key, condition, e))?;
        let current = Revision(meta.e_tag.unwrap_or_default());
        if let WriteCondition::Matches(expected) = condition {
            self.require_etag(expected)?;
            self.require_etag(&current)?;
        }
        super::ensure_condition(key, condition, Some(&current))?;

        self.store
            .delete(&path)
            .await
            .map_err(|e| self.map_error(key, condition, e))?;

        info!("Deleted config: {}", key);
        Ok(())
    }
}
