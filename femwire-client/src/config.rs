//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FEMWIRE_CONFIG)
//! 3. Environment variables

use crate::connection::ConnectionConfig;
use femwire_protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_FILE_CHUNK_SIZE, DEFAULT_PORT, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How to reach the engine.
    pub engine: EngineConfig,
    /// Stream chunking.
    pub transfer: TransferConfig,
    /// Workspace naming.
    pub workspace: WorkspaceConfig,
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FEMWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.engine.apply_env_overrides();
        self.transfer.apply_env_overrides();
        self.workspace.apply_env_overrides();
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()?;
        if let Some(prefix) = &self.workspace.name_prefix {
            crate::names::validate_prefix(prefix)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Connection settings for the TCP transport.
    pub fn connection(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.engine.addr)
            .with_connect_timeout(self.engine.connect_timeout())
            .with_request_timeout(self.engine.request_timeout())
            .with_read_buffer_size(self.engine.read_buffer_size)
            .with_defer_interrupts(self.engine.defer_interrupts);
        if let Some(name) = &self.engine.client_name {
            config = config.with_client_name(name);
        }
        config
    }
}

/// Engine connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Hold Ctrl-C until the in-flight request has completed.
    pub defer_interrupts: bool,
    /// Name reported in the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
            read_buffer_size: crate::connection::DEFAULT_READ_BUFFER_SIZE,
            defer_interrupts: false,
            client_name: None,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FEMWIRE_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("FEMWIRE_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.connect_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("FEMWIRE_REQUEST_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.request_timeout_secs = secs;
            }
        }

        if let Ok(defer) = std::env::var("FEMWIRE_DEFER_INTERRUPTS") {
            self.defer_interrupts = defer == "1" || defer.to_lowercase() == "true";
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Stream chunking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for array streams, in bytes.
    pub chunk_size: usize,
    /// Chunk size for file transfers, in bytes.
    pub file_chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
        }
    }
}

impl TransferConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("FEMWIRE_CHUNK_SIZE") {
            if let Ok(n) = size.parse() {
                self.chunk_size = n;
            }
        }

        if let Ok(size) = std::env::var("FEMWIRE_FILE_CHUNK_SIZE") {
            if let Ok(n) = size.parse() {
                self.file_chunk_size = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("chunk_size", self.chunk_size),
            ("file_chunk_size", self.file_chunk_size),
        ] {
            if value == 0 || value > MAX_CHUNK_SIZE {
                return Err(ConfigError::ValidationError(format!(
                    "transfer.{} must be between 1 and {} bytes, got {}",
                    key, MAX_CHUNK_SIZE, value
                )));
            }
        }
        Ok(())
    }
}

/// Workspace naming configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Fixed name prefix; a random one is drawn per session when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
}

impl WorkspaceConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(prefix) = std::env::var("FEMWIRE_NAME_PREFIX") {
            self.name_prefix = Some(prefix);
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("invalid config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.engine.addr.port(), DEFAULT_PORT);
        assert_eq!(config.transfer.chunk_size, 256 * 1024);
        assert_eq!(config.transfer.file_chunk_size, 1024 * 1024);
        assert!(config.workspace.name_prefix.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.yaml");
        std::fs::write(
            &path,
            "engine:\n  addr: \"10.0.0.5:6000\"\ntransfer:\n  chunk_size: 4096\n",
        )
        .unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.engine.addr, "10.0.0.5:6000".parse().unwrap());
        assert_eq!(config.engine.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.transfer.chunk_size, 4096);
        assert_eq!(config.transfer.file_chunk_size, DEFAULT_FILE_CHUNK_SIZE);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.yaml");

        let mut config = ClientConfig::default();
        config.workspace.name_prefix = Some("QX".to_string());
        config.save(&path).unwrap();

        let reloaded = ClientConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.workspace.name_prefix.as_deref(), Some("QX"));
        assert_eq!(reloaded.engine.addr, config.engine.addr);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let mut config = ClientConfig::default();
        config.transfer.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let mut config = ClientConfig::default();
        config.workspace.name_prefix = Some("a1".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ClientConfig::from_file("/nonexistent/femwire.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_, _))));
    }

    #[test]
    fn test_connection_settings() {
        let mut config = ClientConfig::default();
        config.engine.request_timeout_secs = 7;
        config.engine.defer_interrupts = true;
        let connection = config.connection();
        assert_eq!(connection.request_timeout, Duration::from_secs(7));
        assert!(connection.defer_interrupts);
    }
}
