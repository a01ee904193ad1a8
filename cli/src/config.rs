// Configuration files for the shade CLI
//
// Router and client settings live in separate JSON files:
// - Linux:   ~/.config/shade/{router,client}.json
// - macOS:   ~/Library/Application Support/shade/{router,client}.json
// - Windows: %APPDATA%\shade\{router,client}.json
//
// Keys are flat strings (`port`, `layers`, `limits.chat`, ...) so they can be
// edited with `shade config set`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shade_core::config::{load_from, save_to, LayerConfig, Limits, SecurityConfig};
use shade_core::{ClientConfig, RouterConfig};
use std::path::{Path, PathBuf};

/// Config directory, created on first use
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("shade");
    std::fs::create_dir_all(&dir).context("Failed to create config directory")?;
    Ok(dir)
}

/// Directory for rotated log files
pub fn log_dir() -> Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .context("Failed to determine data directory")?
        .join("shade")
        .join("logs");
    std::fs::create_dir_all(&dir).context("Failed to create log directory")?;
    Ok(dir)
}

/// A settings file with flat string keys
pub trait ConfigFile: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Option<String>;
    fn list(&self) -> Vec<(String, String)>;

    fn path_in(dir: &Path) -> PathBuf {
        dir.join(Self::FILE_NAME)
    }

    /// Load from `dir`, or the defaults when no file exists yet.
    fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        if path.exists() {
            load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn save_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(dir);
        save_to(self, &path)?;
        Ok(path)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .ok()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

// ============================================================================
// SHARED SECTIONS
// ============================================================================

/// `aes:secret-one,serpent:secret-two` → layers with the default key size
fn parse_layers(value: &str) -> Result<Vec<LayerConfig>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (cipher, passphrase) = entry
                .split_once(':')
                .with_context(|| format!("Layer {:?} must look like cipher:passphrase", entry))?;
            Ok(LayerConfig::new(
                cipher.trim(),
                passphrase,
                shade_core::crypto::cipher::DEFAULT_KEY_SIZE,
            ))
        })
        .collect()
}

fn layer_names(security: &SecurityConfig) -> String {
    security
        .layers
        .iter()
        .map(|layer| layer.cipher.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn set_security(security: &mut SecurityConfig, key: &str, value: &str) -> Result<bool> {
    match key {
        "layers" => security.layers = parse_layers(value)?,
        "iterations" => security.iterations = parse(key, value)?,
        "salt" => security.salt = value.to_string(),
        _ => return Ok(false),
    }
    Ok(true)
}

fn get_security(security: &SecurityConfig, key: &str) -> Option<String> {
    match key {
        "layers" => Some(layer_names(security)),
        "iterations" => Some(security.iterations.to_string()),
        "salt" => Some(security.salt.clone()),
        _ => None,
    }
}

fn set_limit(limits: &mut Limits, key: &str, value: &str) -> Result<bool> {
    match key {
        "limits.keyword" => limits.keyword = parse(key, value)?,
        "limits.chat" => limits.chat = parse(key, value)?,
        "limits.message" => limits.message = parse(key, value)?,
        "limits.name" => limits.name = parse(key, value)?,
        "limits.chunk" => limits.chunk = parse(key, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn get_limit(limits: &Limits, key: &str) -> Option<String> {
    match key {
        "limits.keyword" => Some(limits.keyword.to_string()),
        "limits.chat" => Some(limits.chat.to_string()),
        "limits.message" => Some(limits.message.to_string()),
        "limits.name" => Some(limits.name.to_string()),
        "limits.chunk" => Some(limits.chunk.to_string()),
        _ => None,
    }
}

const SECURITY_KEYS: [&str; 3] = ["layers", "iterations", "salt"];
const LIMIT_KEYS: [&str; 5] = [
    "limits.keyword",
    "limits.chat",
    "limits.message",
    "limits.name",
    "limits.chunk",
];

// ============================================================================
// ROUTER
// ============================================================================

const ROUTER_KEYS: [&str; 8] = [
    "listen_address",
    "port",
    "worker_threads",
    "session_timeout_secs",
    "read_timeout_secs",
    "max_connections",
    "read_bytes_per_sec",
    "write_bytes_per_sec",
];

impl ConfigFile for RouterConfig {
    const FILE_NAME: &'static str = "router.json";

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "listen_address" => self.listen_address = value.to_string(),
            "port" => self.port = parse(key, value)?,
            "worker_threads" => self.worker_threads = parse(key, value)?,
            "session_timeout_secs" => self.session_timeout_secs = parse(key, value)?,
            "read_timeout_secs" => self.read_timeout_secs = parse(key, value)?,
            "max_connections" => self.max_connections = parse(key, value)?,
            "read_bytes_per_sec" => self.throttle.read_bytes_per_sec = parse(key, value)?,
            "write_bytes_per_sec" => self.throttle.write_bytes_per_sec = parse(key, value)?,
            _ => {
                if !set_security(&mut self.security, key, value)?
                    && !set_limit(&mut self.limits, key, value)?
                {
                    anyhow::bail!("Unknown router config key: {}", key);
                }
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        match key {
            "listen_address" => Some(self.listen_address.clone()),
            "port" => Some(self.port.to_string()),
            "worker_threads" => Some(self.worker_threads.to_string()),
            "session_timeout_secs" => Some(self.session_timeout_secs.to_string()),
            "read_timeout_secs" => Some(self.read_timeout_secs.to_string()),
            "max_connections" => Some(self.max_connections.to_string()),
            "read_bytes_per_sec" => Some(self.throttle.read_bytes_per_sec.to_string()),
            "write_bytes_per_sec" => Some(self.throttle.write_bytes_per_sec.to_string()),
            _ => get_security(&self.security, key).or_else(|| get_limit(&self.limits, key)),
        }
    }

    fn list(&self) -> Vec<(String, String)> {
        ROUTER_KEYS
            .iter()
            .chain(SECURITY_KEYS.iter())
            .chain(LIMIT_KEYS.iter())
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }
}

// ============================================================================
// CLIENT
// ============================================================================

const CLIENT_KEYS: [&str; 6] = [
    "router_address",
    "name",
    "group_passphrase",
    "connect_timeout_secs",
    "read_timeout_secs",
    "connect_retries",
];

impl ConfigFile for ClientConfig {
    const FILE_NAME: &'static str = "client.json";

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "router_address" => self.router_address = value.to_string(),
            "name" => self.name = value.to_string(),
            "group_passphrase" => {
                self.group_passphrase = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "connect_timeout_secs" => self.connect_timeout_secs = parse(key, value)?,
            "read_timeout_secs" => self.read_timeout_secs = parse(key, value)?,
            "connect_retries" => self.connect_retries = parse(key, value)?,
            _ => {
                if !set_security(&mut self.security, key, value)?
                    && !set_limit(&mut self.limits, key, value)?
                {
                    anyhow::bail!("Unknown client config key: {}", key);
                }
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        match key {
            "router_address" => Some(self.router_address.clone()),
            "name" => Some(self.name.clone()),
            "group_passphrase" => self.group_passphrase.as_ref().map(|_| "(set)".to_string()),
            "connect_timeout_secs" => Some(self.connect_timeout_secs.to_string()),
            "read_timeout_secs" => Some(self.read_timeout_secs.to_string()),
            "connect_retries" => Some(self.connect_retries.to_string()),
            _ => get_security(&self.security, key).or_else(|| get_limit(&self.limits, key)),
        }
    }

    fn list(&self) -> Vec<(String, String)> {
        CLIENT_KEYS
            .iter()
            .chain(SECURITY_KEYS.iter())
            .chain(LIMIT_KEYS.iter())
            .map(|key| {
                let value = self.get(key).unwrap_or_else(|| "(none)".to_string());
                (key.to_string(), value)
            })
            .collect()
    }
}
