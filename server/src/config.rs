use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use storage_backend::BackendConfig;

pub const CONFIG_ENV: &str = "REGISTRY_CONFIG";

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Process-level settings: where to listen, who may call, and the route table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Protocol version this server speaks. Defaults to the crate version.
    #[serde(default)]
    pub server_version: Option<String>,

    /// Bearer tokens accepted on document routes. Empty means open access.
    #[serde(default)]
    pub access_tokens: Vec<String>,

    pub backends: Vec<BackendConfig>,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

impl ServerConfig {
    /// Read the file named by `REGISTRY_CONFIG`, or fall back to the environment.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path),
            Err(_) => Self::from_env(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.backends.is_empty() {
            anyhow::bail!("At least one backend must be configured");
        }
        Ok(config)
    }

    /// A single catch-all backend plus `BIND_ADDRESS` and `REGISTRY_TOKENS`.
    pub fn from_env() -> Result<Self> {
        let bind_address = std::env::var("BIND_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string())
            .parse::<SocketAddr>()
            .context("Invalid BIND_ADDRESS")?;
        let access_tokens = std::env::var("REGISTRY_TOKENS")
            .map(|raw| parse_tokens(&raw))
            .unwrap_or_default();

        Ok(Self {
            bind_address,
            server_version: std::env::var("REGISTRY_VERSION").ok(),
            access_tokens,
            backends: vec![BackendConfig::from_env()?],
        })
    }

    pub fn server_version(&self) -> &str {
        self.server_version
            .as_deref()
            .unwrap_or(env!("CARGO_PKG_VERSION"))
    }
}

fn parse_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use storage_backend::BackendKind;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_json(
            r#"{"backends": [{"name": "local", "patterns": ["**"], "type": "file", "root": "./data"}]}"#,
        )
        .unwrap();

        assert_eq!(config.bind_address.to_string(), DEFAULT_BIND_ADDRESS);
        assert_eq!(config.server_version(), env!("CARGO_PKG_VERSION"));
        assert!(config.access_tokens.is_empty());
        assert!(matches!(config.backends[0].kind, BackendKind::File { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "bind_address": "127.0.0.1:8080",
                "server_version": "2.1.0",
                "access_tokens": ["alpha", "beta"],
                "backends": [
                    {{"name": "scratch", "patterns": ["scratch/**"], "type": "object", "store": {{"provider": "memory"}}}},
                    {{"name": "peer", "patterns": ["**"], "type": "remote", "base_url": "http://peer:3000"}}
                ]
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_address.port(), 8080);
        assert_eq!(config.server_version(), "2.1.0");
        assert_eq!(config.access_tokens, vec!["alpha", "beta"]);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].name, "peer");
    }

    #[test]
    fn test_requires_backends() {
        let result = ServerConfig::from_json(r#"{"backends": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ServerConfig::from_file("/nonexistent/registry.json");
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_parse_tokens() {
        assert_eq!(parse_tokens("one, two,,three "), vec!["one", "two", "three"]);
        assert!(parse_tokens(" , ").is_empty());
    }
}
