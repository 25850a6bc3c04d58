use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One entry of the route table: a named backend and the key patterns it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Globs over `registry/namespace/name[/support]`, tried in declaration order.
    pub patterns: Vec<String>,
    #[serde(flatten)]
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendKind {
    File {
        root: PathBuf,
    },
    Blob {
        container_url: String,
        #[serde(default)]
        sas_token: Option<String>,
    },
    Object {
        store: ObjectStoreConfig,
    },
    Remote {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    Memory,
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        #[serde(default)]
        allow_http: bool,
    },
}

/// Pattern matching every key.
pub const CATCH_ALL: &str = "**";

impl BackendConfig {
    pub fn new(name: impl Into<String>, patterns: &[&str], kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.iter().map(ToString::to_string).collect(),
            kind,
        }
    }

    pub fn file(name: impl Into<String>, patterns: &[&str], root: impl Into<PathBuf>) -> Self {
        Self::new(name, patterns, BackendKind::File { root: root.into() })
    }

    pub fn memory(name: impl Into<String>, patterns: &[&str]) -> Self {
        Self::new(
            name,
            patterns,
            BackendKind::Object {
                store: ObjectStoreConfig::Memory,
            },
        )
    }

    pub fn remote(
        name: impl Into<String>,
        patterns: &[&str],
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self::new(
            name,
            patterns,
            BackendKind::Remote {
                base_url: base_url.into(),
                token,
            },
        )
    }

    /// A single catch-all backend chosen by `STORAGE_BACKEND`.
    pub fn from_env() -> anyhow::Result<Self> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "local".to_string());

        let kind = match backend.as_str() {
            "local" => {
                let path = std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data".to_string());
                BackendKind::File { root: path.into() }
            }
            "s3" => {
                let bucket = std::env::var("AWS_BUCKET")
                    .map_err(|_| anyhow::anyhow!("AWS_BUCKET is required for S3 backend"))?;
                let allow_http = std::env::var("AWS_ALLOW_HTTP")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse::<bool>()
                    .unwrap_or(false);

                BackendKind::Object {
                    store: ObjectStoreConfig::S3 {
                        bucket,
                        region: std::env::var("AWS_REGION").ok(),
                        endpoint: std::env::var("AWS_ENDPOINT").ok(),
                        access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                        secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
                        allow_http,
                    },
                }
            }
            "blob" => BackendKind::Blob {
                container_url: std::env::var("BLOB_CONTAINER_URL").map_err(|_| {
                    anyhow::anyhow!("BLOB_CONTAINER_URL is required for blob backend")
                })?,
                sas_token: std::env::var("BLOB_SAS_TOKEN").ok(),
            },
            "remote" => BackendKind::Remote {
                base_url: std::env::var("REMOTE_URL")
                    .map_err(|_| anyhow::anyhow!("REMOTE_URL is required for remote backend"))?,
                token: std::env::var("REMOTE_TOKEN").ok(),
            },
            _ => anyhow::bail!(
                "Unknown storage backend: {}. Must be 'local', 's3', 'blob' or 'remote'",
                backend
            ),
        };

        Ok(Self::new(backend, &[CATCH_ALL], kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_route_table() {
        let json = r#"[
            {"name": "legacy", "patterns": ["main/legacy/**"], "type": "file", "root": "/srv/configs"},
            {"name": "azure", "patterns": ["main/*/*"], "type": "blob",
             "container_url": "https://acct.blob.core.windows.net/configs"},
            {"name": "s3", "patterns": ["archive/**"], "type": "object",
             "store": {"provider": "s3", "bucket": "configs", "region": "eu-west-1",
                       "endpoint": null, "access_key_id": null, "secret_access_key": null}},
            {"name": "peer", "patterns": ["**"], "type": "remote",
             "base_url": "https://peer.example.com", "token": "t0k3n"}
        ]"#;

        let configs: Vec<BackendConfig> = serde_json::from_str(json).unwrap();
        assert_eq!(configs.len(), 4);
        assert!(matches!(configs[0].kind, BackendKind::File { .. }));
        assert!(matches!(
            configs[1].kind,
            BackendKind::Blob {
                sas_token: None,
                ..
            }
        ));
        match &configs[2].kind {
            BackendKind::Object {
                store: ObjectStoreConfig::S3 {
                    bucket, allow_http, ..
                },
            } => {
                assert_eq!(bucket, "configs");
                assert!(!allow_http);
            }
            other => panic!("expected S3 object store, got {other:?}"),
        }
        assert_eq!(configs[3].patterns, vec!["**".to_string()]);
    }

    #[test]
    fn test_constructors() {
        let config = BackendConfig::file("local", &["main/**"], "/tmp/configs");
        assert_eq!(config.name, "local");
        assert_eq!(config.patterns, vec!["main/**".to_string()]);
        assert!(matches!(config.kind, BackendKind::File { .. }));

        let config = BackendConfig::memory("scratch", &[CATCH_ALL]);
        assert!(matches!(
            config.kind,
            BackendKind::Object {
                store: ObjectStoreConfig::Memory
            }
        ));
    }
}
