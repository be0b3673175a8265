//! TOML configuration parsing and validation.
//!
//! The file describes where project stores and the settings database live,
//! the seed server configuration, the embedding provider, and the log filter.
//! The runtime server configuration ([`McpServerConfig`]) is persisted in the
//! settings store once it has been changed; the `[server]` table only seeds it.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub server: McpServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Location of one project's store: `<root>/<projectId>/index.sqlite`.
    pub fn project_db_path(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id).join("index.sqlite")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettingsConfig {
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
        }
    }
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("./data/settings.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: i64 = 7332;
pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_MAX_CONNECTIONS: i64 = 64;

/// Runtime configuration of the MCP listener.
///
/// Persisted as JSON under [`crate::settings::SERVER_CONFIG_KEY`]. Integers
/// are signed so that out-of-range input can be reported instead of failing
/// to deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default = "default_protocol", deserialize_with = "lenient_protocol")]
    pub protocol: String,
    #[serde(
        default = "default_max_connections",
        alias = "max_connections",
        deserialize_with = "lenient_max_connections"
    )]
    pub max_connections: i64,
}

// Both fields fall back to their defaults instead of failing the whole
// config when the stored value has the wrong type.
fn lenient_protocol<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        _ => default_protocol(),
    })
}

fn lenient_max_connections<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(serde_json::Value::deserialize(deserializer)?
        .as_i64()
        .unwrap_or_else(default_max_connections))
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> i64 {
    DEFAULT_PORT
}
fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}
fn default_max_connections() -> i64 {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: default_protocol(),
            max_connections: default_max_connections(),
        }
    }
}

impl McpServerConfig {
    /// Rejects a blank host or a port outside `1..=65535`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::Validation("host must not be blank".to_string()));
        }
        if self.port <= 0 {
            return Err(Error::Validation(format!(
                "port must be positive, got {}",
                self.port
            )));
        }
        if self.port > i64::from(u16::MAX) {
            return Err(Error::Validation(format!(
                "port must be at most {}, got {}",
                u16::MAX,
                self.port
            )));
        }
        Ok(())
    }

    /// Replaces an invalid connection limit or protocol with the defaults.
    pub fn normalized(mut self) -> Self {
        self.host = self.host.trim().to_string();
        if self.max_connections <= 0 {
            self.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        let protocol = self.protocol.trim().to_ascii_lowercase();
        self.protocol = if protocol == DEFAULT_PROTOCOL {
            protocol
        } else {
            DEFAULT_PROTOCOL.to_string()
        };
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection_limit(&self) -> Option<usize> {
        usize::try_from(self.max_connections).ok().filter(|n| *n > 0)
    }
}

impl Config {
    /// Configuration used when no file is present: everything under `./data`.
    pub fn minimal() -> Self {
        Self {
            storage: StorageConfig {
                root: PathBuf::from("./data/projects"),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            settings: SettingsConfig::default(),
            server: McpServerConfig::default(),
            embedding: EmbeddingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.busy_timeout_ms == 0 {
        anyhow::bail!("storage.busy_timeout_ms must be > 0");
    }

    config
        .server
        .validate()
        .map_err(|e| anyhow::anyhow!("server: {}", e))?;

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_file_with_defaults() {
        let cfg: Config = toml::from_str("[storage]\nroot = \"/tmp/p\"\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.server, McpServerConfig::default());
        assert_eq!(cfg.embedding.provider, "hash");
        assert_eq!(
            cfg.storage.project_db_path("p1"),
            PathBuf::from("/tmp/p/p1/index.sqlite")
        );
    }

    #[test]
    fn rejects_unknown_provider() {
        let cfg: Config =
            toml::from_str("[storage]\nroot = \"/tmp/p\"\n[embedding]\nprovider = \"magic\"\n")
                .unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn server_config_validation() {
        let mut cfg = McpServerConfig::default();
        cfg.host = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = McpServerConfig::default();
        cfg.port = 0;
        assert!(cfg.validate().is_err());
        cfg.port = 70000;
        assert!(cfg.validate().is_err());
        cfg.port = 8080;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn normalization_replaces_invalid_optional_values() {
        let cfg = McpServerConfig {
            host: " localhost ".to_string(),
            port: 9000,
            protocol: "grpc".to_string(),
            max_connections: -3,
        }
        .normalized();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.protocol, "http");
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn wrongly_typed_optional_values_fall_back_to_defaults() {
        for raw in [
            r#"{"host":"h","port":1,"maxConnections":null,"protocol":null}"#,
            r#"{"host":"h","port":1,"maxConnections":"lots","protocol":7}"#,
            r#"{"host":"h","port":1,"maxConnections":1.5}"#,
        ] {
            let cfg: McpServerConfig = serde_json::from_str(raw).unwrap();
            assert_eq!(cfg.protocol, DEFAULT_PROTOCOL, "{raw}");
            assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS, "{raw}");
        }

        let cfg: McpServerConfig =
            serde_json::from_str(r#"{"host":"h","port":1,"maxConnections":12}"#).unwrap();
        assert_eq!(cfg.max_connections, 12);
    }

    #[test]
    fn server_config_json_is_camel_case() {
        let json = serde_json::to_value(McpServerConfig::default()).unwrap();
        assert!(json.get("maxConnections").is_some());
        let back: McpServerConfig = serde_json::from_str(r#"{"host":"h","port":1}"#).unwrap();
        assert_eq!(back.protocol, "http");
        assert_eq!(back.max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
