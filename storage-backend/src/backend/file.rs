use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared_types::{Document, DocumentEnvelope, KeyError, RegistryKey};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{decode_envelope, ensure_condition};
use crate::error::{RegistryError, Result};
use crate::version::VersionGate;
use crate::{Revision, StorageBackend, StoredDocument, WriteCondition};

/// Documents as JSON envelopes under a root directory:
/// `root/namespace/name.json` or `root/namespace/name/support.json`.
pub struct FileStore {
    name: String,
    root: PathBuf,
    gate: Arc<VersionGate>,
    // Held across read-compare-rename so conditional writes are atomic in-process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, gate: Arc<VersionGate>) -> Self {
        let root = root.into();
        info!("Initializing file storage at: {:?}", root);
        Self {
            name: name.into(),
            root,
            gate,
            write_lock: Mutex::new(()),
        }
    }

    fn document_path(&self, key: &RegistryKey) -> Result<PathBuf> {
        key.validate()?;

        let segments = key.storage_segments();
        let Some((last, parents)) = segments.split_last() else {
            return Err(KeyError {
                segment: String::new(),
                reason: "key has no segments",
            }
            .into());
        };

        let mut relative: PathBuf = parents.iter().collect();
        relative.push(format!("{last}.json"));

        if let Some(component) = relative
            .components()
            .find(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(KeyError {
                segment: component.as_os_str().to_string_lossy().into_owned(),
                reason: "path escapes the storage root",
            }
            .into());
        }

        Ok(self.root.join(relative))
    }

    fn revision(bytes: &[u8]) -> Revision {
        Revision(format!("{:x}", Sha256::digest(bytes)))
    }

    fn unavailable(&self, err: std::io::Error) -> RegistryError {
        RegistryError::unavailable(&self.name, err)
    }

    async fn read_current(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(RegistryError::unavailable(
                &self.name,
                anyhow::anyhow!("{} has no parent directory", path.display()),
            ));
        };

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| self.unavailable(e))?;

        let temp = parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            Uuid::new_v4()
        ));
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| self.unavailable(e))?;

        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.unavailable(e));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn exists(&self, key: &RegistryKey) -> Result<bool> {
        let path = self.document_path(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| self.unavailable(e))
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn load(&self, key: &RegistryKey) -> Result<StoredDocument> {
        let path = self.document_path(key)?;
        debug!("Reading config from {:?}", path);

        let bytes = self
            .read_current(&path)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        let document = decode_envelope(&self.gate, key, &bytes)?;

        Ok(StoredDocument {
            document,
            revision: Self::revision(&bytes),
        })
    }

    #[instrument(skip(self, document), fields(backend = %self.name))]
    async fn save(
        &self,
        key: &RegistryKey,
        document: &Document,
        condition: &WriteCondition,
    ) -> Result<()> {
        let path = self.document_path(key)?;
        let envelope = DocumentEnvelope::stamped(document, self.gate.server_version());
        let bytes =
            serde_json::to_vec_pretty(&envelope).map_err(|e| RegistryError::corrupt(key, e))?;

        let _guard = self.write_lock.lock().await;
        let current = self.read_current(&path).await?;
        let current_revision = current.as_deref().map(Self::revision);
        ensure_condition(key, condition, current_revision.as_ref())?;

        self.write_atomic(&path, &bytes).await?;
        info!("Stored config {} at {:?}", key, path);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn delete(&self, key: &RegistryKey, condition: &WriteCondition) -> Result<()> {
        let path = self.document_path(key)?;

        let _guard = self.write_lock.lock().await;
        let current = self
            .read_current(&path)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        ensure_condition(key, condition, Some(&Self::revision(&current)))?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted config: {}", key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(RegistryError::NotFound(key.to_string()))
            }
            Err(e) => Err(self.unavailable(e)),
        }
    }
}
