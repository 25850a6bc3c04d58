use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod token;

pub use token::{canonical_json, ConcurrencyToken};

/// Request header carrying the caller's protocol version.
pub const VERSION_HEADER: &str = "x-registry-version";

/// Structured key for identifying a repository configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub support: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid key segment {segment:?}: {reason}")]
pub struct KeyError {
    pub segment: String,
    pub reason: &'static str,
}

impl RegistryKey {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            namespace: namespace.into(),
            name: name.into(),
            support: None,
        }
    }

    /// Qualify the key with a support branch.
    #[must_use]
    pub fn with_support(mut self, support: impl Into<String>) -> Self {
        self.support = Some(support.into());
        self
    }

    /// `registry/namespace/name[/support]`, the string route patterns match against.
    pub fn to_route_path(&self) -> String {
        match &self.support {
            Some(support) => format!(
                "{}/{}/{}/{}",
                self.registry, self.namespace, self.name, support
            ),
            None => format!("{}/{}/{}", self.registry, self.namespace, self.name),
        }
    }

    /// `namespace/name[/support]`, the backend-relative address.
    pub fn to_storage_path(&self) -> String {
        match &self.support {
            Some(support) => format!("{}/{}/{}", self.namespace, self.name, support),
            None => format!("{}/{}", self.namespace, self.name),
        }
    }

    /// Segments that make up the backend-relative address.
    pub fn storage_segments(&self) -> Vec<&str> {
        let mut segments = vec![self.namespace.as_str(), self.name.as_str()];
        if let Some(support) = &self.support {
            segments.push(support);
        }
        segments
    }

    /// Reject segments that could address anything outside their own slot.
    pub fn validate(&self) -> Result<(), KeyError> {
        std::iter::once(self.registry.as_str())
            .chain(self.storage_segments())
            .try_for_each(validate_segment)
    }
}

fn validate_segment(segment: &str) -> Result<(), KeyError> {
    let reason = if segment.is_empty() {
        "segment is empty"
    } else if segment == "." || segment == ".." {
        "relative path segment"
    } else if segment.contains(['/', '\\']) {
        "segment contains a path separator"
    } else if segment.contains('\0') {
        "segment contains a NUL byte"
    } else {
        return Ok(());
    };

    Err(KeyError {
        segment: segment.to_string(),
        reason,
    })
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_route_path())
    }
}

/// A configuration document: opaque content plus the protocol version it was written with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub api_version: String,
    pub content: serde_json::Value,
}

impl Document {
    pub fn new(api_version: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            api_version: api_version.into(),
            content,
        }
    }

    /// A fresh document with no content, stamped with `api_version`.
    pub fn empty(api_version: impl Into<String>) -> Self {
        Self::new(
            api_version,
            serde_json::Value::Object(serde_json::Map::new()),
        )
    }

    pub fn token(&self) -> ConcurrencyToken {
        ConcurrencyToken::of(&self.content)
    }
}

/// Persisted and wire form of a document when the version travels inline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEnvelope {
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub content: serde_json::Value,
}

/// Just the version field of a [`DocumentEnvelope`], read before the content is trusted
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub api_version: String,
}

impl DocumentEnvelope {
    pub fn stamped(document: &Document, api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            updated_at: Some(Utc::now()),
            content: document.content.clone(),
        }
    }

    pub fn into_document(self) -> Document {
        Document::new(self.api_version, self.content)
    }
}

impl From<Document> for DocumentEnvelope {
    fn from(document: Document) -> Self {
        Self {
            api_version: document.api_version,
            updated_at: None,
            content: document.content,
        }
    }
}
