// Configuration — router, client, security and limit settings
//
// All structs are serde JSON with defaults, so a partial file fills in
// the rest. `validate()` turns every misconfiguration the runtime would
// otherwise trip over later (bad key sizes, unknown ciphers, unusable
// addresses) into a startup error.

use crate::crypto::cipher::{CipherAlgorithm, CipherError, DEFAULT_KEY_SIZE, KEY_SIZES};
use crate::crypto::kdf::DEFAULT_ITERATIONS;
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Hard ceilings. Configured limits may be lower, never higher.
pub const MAX_KEYWORD_SIZE: usize = 128;
pub const MAX_CHAT_SIZE: usize = 1024;
pub const MAX_MESSAGE_SIZE: usize = 4096;
pub const MAX_NAME_SIZE: usize = 64;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Worker thread count must be at least 1")]
    NoWorkers,
    #[error("Security configuration needs at least one cipher layer")]
    NoLayers,
    #[error("Layer {index}: {source}")]
    Layer { index: usize, source: CipherError },
    #[error("Layer {0}: passphrase must not be empty")]
    EmptyPassphrase(usize),
    #[error("Limit {name} = {value} exceeds maximum {max}")]
    LimitTooLarge {
        name: &'static str,
        value: usize,
        max: usize,
    },
    #[error("Limit {0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("Timeout {0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("Client name must be 1..={MAX_NAME_SIZE} bytes")]
    InvalidName,
}

// ============================================================================
// SECURITY
// ============================================================================

/// One cipher layer: algorithm name plus the passphrase its key derives from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub cipher: String,
    pub passphrase: String,
    #[serde(default = "default_key_size")]
    pub key_size: usize,
}

impl LayerConfig {
    pub fn new(cipher: &str, passphrase: &str, key_size: usize) -> Self {
        Self {
            cipher: cipher.to_string(),
            passphrase: passphrase.to_string(),
            key_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Layers in encryption order
    pub layers: Vec<LayerConfig>,
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// PBKDF2 salt
    pub salt: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            layers: vec![
                LayerConfig::new("aes", "change me (aes)", DEFAULT_KEY_SIZE),
                LayerConfig::new("serpent", "change me (serpent)", DEFAULT_KEY_SIZE),
            ],
            iterations: DEFAULT_ITERATIONS,
            salt: "shade".to_string(),
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.is_empty() {
            return Err(ConfigError::NoLayers);
        }

        for (index, layer) in self.layers.iter().enumerate() {
            CipherAlgorithm::from_name(&layer.cipher)
                .map_err(|source| ConfigError::Layer { index, source })?;
            if !KEY_SIZES.contains(&layer.key_size) {
                return Err(ConfigError::Layer {
                    index,
                    source: CipherError::InvalidKeySize(layer.key_size),
                });
            }
            if layer.passphrase.is_empty() {
                return Err(ConfigError::EmptyPassphrase(index));
            }
        }

        Ok(())
    }
}

fn default_key_size() -> usize {
    DEFAULT_KEY_SIZE
}

// ============================================================================
// LIMITS
// ============================================================================

/// Per-field size limits enforced by commands and the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub keyword: usize,
    pub chat: usize,
    pub message: usize,
    pub name: usize,
    pub chunk: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            keyword: MAX_KEYWORD_SIZE,
            chat: MAX_CHAT_SIZE,
            message: MAX_MESSAGE_SIZE,
            name: MAX_NAME_SIZE,
            chunk: MAX_CHUNK_SIZE,
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("keyword", self.keyword, MAX_KEYWORD_SIZE),
            ("chat", self.chat, MAX_CHAT_SIZE),
            ("message", self.message, MAX_MESSAGE_SIZE),
            ("name", self.name, MAX_NAME_SIZE),
            ("chunk", self.chunk, MAX_CHUNK_SIZE),
        ];

        for (name, value, max) in checks {
            if value == 0 {
                return Err(ConfigError::ZeroLimit(name));
            }
            if value > max {
                return Err(ConfigError::LimitTooLarge { name, value, max });
            }
        }
        Ok(())
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Byte-per-second ceilings shared by every connection (0 = unlimited)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen_address: String,
    pub port: u16,
    pub worker_threads: usize,
    /// Sessions idle longer than this are evicted
    pub session_timeout_secs: u64,
    /// Per-request read deadline (slow-loris guard)
    pub read_timeout_secs: u64,
    pub max_connections: usize,
    pub throttle: ThrottleConfig,
    pub security: SecurityConfig,
    pub limits: Limits,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 7450,
            worker_threads: 4,
            session_timeout_secs: 300,
            read_timeout_secs: 30,
            max_connections: 256,
            throttle: ThrottleConfig::default(),
            security: SecurityConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if self.worker_threads == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroLimit("max_connections"));
        }
        if self.session_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("session_timeout_secs"));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("read_timeout_secs"));
        }
        self.security.validate()?;
        self.limits.validate()
    }

    /// Socket address the acceptor binds to.
    pub fn endpoint(&self) -> Result<SocketAddr, ConfigError> {
        let address = format!("{}:{}", self.listen_address, self.port);
        address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(address))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// host:port of the router
    pub router_address: String,
    /// Display name announced at handshake
    pub name: String,
    /// Passphrase shared by everyone in the same group
    pub group_passphrase: Option<String>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Connection attempts before giving up
    pub connect_retries: u32,
    pub security: SecurityConfig,
    pub limits: Limits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            router_address: "127.0.0.1:7450".to_string(),
            name: "anonymous".to_string(),
            group_passphrase: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            connect_retries: 5,
            security: SecurityConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let resolves = self
            .router_address
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        if !resolves {
            return Err(ConfigError::InvalidAddress(self.router_address.clone()));
        }
        if self.name.is_empty() || self.name.len() > self.limits.name {
            return Err(ConfigError::InvalidName);
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_secs"));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("read_timeout_secs"));
        }
        self.security.validate()?;
        self.limits.validate()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

// ============================================================================
// FILE I/O
// ============================================================================

/// Read a JSON config file.
pub fn load_from<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Write a JSON config file, creating parent directories.
pub fn save_to<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let contents = serde_json::to_string_pretty(value).context("Failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_validate() {
        RouterConfig::default().validate().unwrap();
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bad_listen_address() {
        let config = RouterConfig {
            listen_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_unknown_cipher_is_fatal() {
        let mut config = RouterConfig::default();
        config.security.layers[1].cipher = "des".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Layer {
                index: 1,
                source: CipherError::UnknownAlgorithm("des".to_string())
            })
        );
    }

    #[test]
    fn test_bad_key_size_is_fatal() {
        let mut config = ClientConfig::default();
        config.security.layers[0].key_size = 20;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Layer {
                index: 0,
                source: CipherError::InvalidKeySize(20)
            })
        ));
    }

    #[test]
    fn test_empty_layers_rejected() {
        let mut config = RouterConfig::default();
        config.security.layers.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoLayers));
    }

    #[test]
    fn test_limits_cannot_exceed_ceiling() {
        let limits = Limits {
            chat: MAX_CHAT_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(
            limits.validate(),
            Err(ConfigError::LimitTooLarge { name: "chat", .. })
        ));

        let limits = Limits {
            keyword: 0,
            ..Default::default()
        };
        assert_eq!(limits.validate(), Err(ConfigError::ZeroLimit("keyword")));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: RouterConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.security.layers.len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("client.json");

        let config = ClientConfig {
            name: "alice".to_string(),
            group_passphrase: Some("friends".to_string()),
            ..Default::default()
        };
        save_to(&config, &path).unwrap();

        let loaded: ClientConfig = load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_from::<RouterConfig>(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
