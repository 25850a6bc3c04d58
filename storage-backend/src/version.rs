use semver::{BuildMetadata, Version};
use shared_types::RegistryKey;

use crate::error::{RegistryError, Result};

/// Compares protocol versions against the version this server speaks.
///
/// A version is compatible when it is not newer than the server's. Build
/// metadata is ignored and a leading `v` is tolerated.
#[derive(Debug, Clone)]
pub struct VersionGate {
    server: Version,
    raw: String,
}

impl VersionGate {
    pub fn new(server_version: &str) -> Result<Self> {
        let server = parse(server_version)?;
        Ok(Self {
            server,
            raw: server_version.trim().to_string(),
        })
    }

    pub fn server_version(&self) -> &str {
        &self.raw
    }

    pub fn is_compatible(&self, candidate: &str) -> Result<bool> {
        Ok(parse(candidate)? <= self.server)
    }

    /// Gate a version declared by a caller.
    pub fn check(&self, candidate: &str) -> Result<()> {
        if self.is_compatible(candidate)? {
            Ok(())
        } else {
            Err(RegistryError::VersionIncompatible {
                found: candidate.to_string(),
                server: self.raw.clone(),
            })
        }
    }

    /// Gate the version tag of a stored document. Unreadable tags mean the
    /// stored representation itself is damaged.
    pub fn check_stored(&self, key: &RegistryKey, stored: &str) -> Result<()> {
        self.check(stored).map_err(|err| match err {
            RegistryError::InvalidVersion { version, reason } => {
                RegistryError::corrupt(key, format!("version tag {version:?}: {reason}"))
            }
            other => other,
        })
    }
}

fn parse(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let mut version = Version::parse(trimmed).map_err(|e| RegistryError::InvalidVersion {
        version: raw.to_string(),
        reason: e.to_string(),
    })?;
    version.build = BuildMetadata::EMPTY;
    Ok(version)
}
