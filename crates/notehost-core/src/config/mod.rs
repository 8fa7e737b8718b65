//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Length in bytes of an ed25519 public key
const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Notehost configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fetcher: FetcherConfig,
    pub validator: ValidatorConfig,
    pub events: EventsConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
}

/// Remote artifact download limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub max_download_bytes: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Archive suffixes accepted on remote URLs, without the leading dot
    pub allowed_extensions: Vec<String>,
    /// Disables the private/loopback host block. Only for local development.
    pub allow_private_hosts: bool,
}

/// Archive inspection ceilings and trust anchors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_entries: usize,
    pub max_decompressed_bytes: u64,
    /// Entries larger than this are size-checked but not pattern-scanned past the limit
    pub max_scanned_entry_bytes: u64,
    pub trusted_hosts: Vec<String>,
    /// Base64-encoded ed25519 public keys
    pub trusted_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

/// Limits applied to running plugin handles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub fuel_limit: u64,
    pub memory_limit_bytes: usize,
    pub execution_timeout_ms: u64,
    pub max_module_bytes: u64,
    pub callback_timeout_secs: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetcher: FetcherConfig::default(),
            validator: ValidatorConfig::default(),
            events: EventsConfig::default(),
            runtime: RuntimeConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_download_bytes: 50 * 1024 * 1024,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            allowed_extensions: vec!["zip".to_string(), "nhp".to_string()],
            allow_private_hosts: false,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_decompressed_bytes: 500 * 1024 * 1024,
            max_scanned_entry_bytes: 8 * 1024 * 1024,
            trusted_hosts: Vec::new(),
            trusted_keys: Vec::new(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 10_000_000,
            memory_limit_bytes: 16 * 1024 * 1024,
            execution_timeout_ms: 5_000,
            max_module_bytes: 16 * 1024 * 1024,
            callback_timeout_secs: 10,
            queue_capacity: 256,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join("notehost"))
            .unwrap_or_else(|| PathBuf::from(".notehost"));
        Self { data_dir }
    }
}

impl StorageConfig {
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn plugins_path(&self) -> PathBuf {
        self.data_dir.join("plugins.json")
    }

    pub fn grants_path(&self) -> PathBuf {
        self.data_dir.join("grants.jsonl")
    }

    pub fn verdicts_path(&self) -> PathBuf {
        self.data_dir.join("verdicts.jsonl")
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("NOTEHOST_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("notehost")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        debug!(path = %path.display(), "Saved config");

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_range("fetcher.max_download_bytes", self.fetcher.max_download_bytes, 1, u64::MAX)?;
        validate_range("fetcher.connect_timeout_secs", self.fetcher.connect_timeout_secs, 1, 600)?;
        validate_range("fetcher.read_timeout_secs", self.fetcher.read_timeout_secs, 1, 3600)?;
        if self.fetcher.allowed_extensions.is_empty() {
            return Err(anyhow!("fetcher.allowed_extensions must not be empty"));
        }
        for ext in &self.fetcher.allowed_extensions {
            validate_extension(ext)?;
        }

        validate_range("validator.max_entries", self.validator.max_entries as u64, 1, 1_000_000)?;
        validate_range(
            "validator.max_decompressed_bytes",
            self.validator.max_decompressed_bytes,
            1,
            u64::MAX,
        )?;
        for host in &self.validator.trusted_hosts {
            validate_host(host)?;
        }
        for key in &self.validator.trusted_keys {
            validate_base64_key(key)?;
        }

        validate_range("events.workers", self.events.workers as u64, 1, 256)?;
        validate_range("events.queue_capacity", self.events.queue_capacity as u64, 1, 1_000_000)?;

        validate_range("runtime.fuel_limit", self.runtime.fuel_limit, 1, u64::MAX)?;
        validate_range("runtime.execution_timeout_ms", self.runtime.execution_timeout_ms, 1, 600_000)?;
        validate_range("runtime.callback_timeout_secs", self.runtime.callback_timeout_secs, 1, 600)?;
        validate_range("runtime.queue_capacity", self.runtime.queue_capacity as u64, 1, 1_000_000)?;

        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "fetcher.max_download_bytes" => Ok(self.fetcher.max_download_bytes.to_string()),
            "fetcher.connect_timeout_secs" => Ok(self.fetcher.connect_timeout_secs.to_string()),
            "fetcher.read_timeout_secs" => Ok(self.fetcher.read_timeout_secs.to_string()),
            "fetcher.allowed_extensions" => Ok(self.fetcher.allowed_extensions.join(", ")),
            "validator.max_entries" => Ok(self.validator.max_entries.to_string()),
            "validator.max_decompressed_bytes" => {
                Ok(self.validator.max_decompressed_bytes.to_string())
            }
            "validator.trusted_hosts" => Ok(self.validator.trusted_hosts.join(", ")),
            "validator.trusted_keys" => Ok(self.validator.trusted_keys.len().to_string()),
            "events.workers" => Ok(self.events.workers.to_string()),
            "events.queue_capacity" => Ok(self.events.queue_capacity.to_string()),
            "storage.data_dir" => Ok(self.storage.data_dir.display().to_string()),
            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `notehost config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "fetcher.max_download_bytes" => {
                self.fetcher.max_download_bytes = parse_number(key, value)?;
            }
            "fetcher.connect_timeout_secs" => {
                self.fetcher.connect_timeout_secs = parse_number(key, value)?;
            }
            "fetcher.read_timeout_secs" => {
                self.fetcher.read_timeout_secs = parse_number(key, value)?;
            }
            "fetcher.allowed_extensions" => {
                let extensions = split_list(value);
                for ext in &extensions {
                    validate_extension(ext)?;
                }
                self.fetcher.allowed_extensions = extensions;
            }
            "validator.max_entries" => {
                self.validator.max_entries = parse_number(key, value)?;
            }
            "validator.max_decompressed_bytes" => {
                self.validator.max_decompressed_bytes = parse_number(key, value)?;
            }
            "validator.trusted_hosts" => {
                let hosts = split_list(value);
                for host in &hosts {
                    validate_host(host)?;
                }
                self.validator.trusted_hosts = hosts;
            }
            "validator.trusted_keys" => {
                let keys = split_list(value);
                for key in &keys {
                    validate_base64_key(key)?;
                }
                self.validator.trusted_keys = keys;
            }
            "events.workers" => {
                self.events.workers = parse_number(key, value)?;
            }
            "events.queue_capacity" => {
                self.events.queue_capacity = parse_number(key, value)?;
            }
            "storage.data_dir" => {
                self.storage.data_dir = PathBuf::from(value);
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `notehost config list` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "fetcher.max_download_bytes",
            "fetcher.connect_timeout_secs",
            "fetcher.read_timeout_secs",
            "fetcher.allowed_extensions",
            "validator.max_entries",
            "validator.max_decompressed_bytes",
            "validator.trusted_hosts",
            "validator.trusted_keys",
            "events.workers",
            "events.queue_capacity",
            "storage.data_dir",
        ];

        keys.into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

/// Check that `value` lies within `min..=max`
pub fn validate_range(name: &str, value: u64, min: u64, max: u64) -> anyhow::Result<()> {
    if value < min || value > max {
        return Err(anyhow!("{} must be between {} and {} (got {})", name, min, max, value));
    }
    Ok(())
}

/// Archive extensions are bare lowercase alphanumerics ("zip", not ".zip")
pub fn validate_extension(ext: &str) -> anyhow::Result<()> {
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(anyhow!(
            "Invalid archive extension '{}': use lowercase letters and digits without a dot",
            ext
        ));
    }
    Ok(())
}

/// Trusted hosts are bare DNS names, no scheme, port, or path
pub fn validate_host(host: &str) -> anyhow::Result<()> {
    let parsed = url::Host::parse(host).map_err(|e| anyhow!("Invalid trusted host '{}': {}", host, e))?;
    match parsed {
        url::Host::Domain(_) => Ok(()),
        _ => Err(anyhow!(
            "Trusted host '{}' must be a DNS name, not an IP address",
            host
        )),
    }
}

/// Trusted keys must decode to a 32-byte ed25519 public key
pub fn validate_base64_key(key: &str) -> anyhow::Result<()> {
    let bytes = BASE64_STANDARD
        .decode(key)
        .map_err(|e| anyhow!("Invalid trusted key encoding: {}", e))?;
    if bytes.len() != ED25519_PUBLIC_KEY_LEN {
        return Err(anyhow!(
            "Trusted key must be {} bytes (got {})",
            ED25519_PUBLIC_KEY_LEN,
            bytes.len()
        ));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", key, value))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
