//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML with optional command-line style
//! overrides. Sections: `[store]` (how to reach the backing store),
//! `[registry]` (key namespace and lock behaviour) and `[telemetry]`.

use crate::net::tls::{TlsConfig, TlsMaterial};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing store connection.
    pub store: StoreConfig,

    /// Registry namespace and locking.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Backing store connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints (e.g., "127.0.0.1:2379").
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Username for store authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for store authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Client certificate path.
    #[serde(default)]
    pub cert_file: Option<String>,

    /// Client private key path.
    #[serde(default)]
    pub key_file: Option<String>,

    /// CA bundle path.
    #[serde(default)]
    pub ca_file: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            username: None,
            password: None,
            cert_file: None,
            key_file: None,
            ca_file: None,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("endpoints", &self.endpoints)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("ca_file", &self.ca_file)
            .finish()
    }
}

/// Registry namespace and locking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Key-space prefix, e.g. "/coreos.com/network".
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// TTL of the session backing the registry mutex, in seconds.
    #[serde(default = "default_lock_session_ttl_seconds")]
    pub lock_session_ttl_seconds: i64,

    /// Reject creation of a subnet overlapping a different live lease.
    #[serde(default)]
    pub reject_overlapping: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            lock_session_ttl_seconds: default_lock_session_ttl_seconds(),
            reject_overlapping: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_prefix() -> String {
    "/coreos.com/network".to_string()
}

fn default_lock_session_ttl_seconds() -> i64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Store credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a store connector needs, resolved from [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Store endpoints.
    pub endpoints: Vec<String>,
    /// Credentials, when a username is configured.
    pub credentials: Option<Credentials>,
    /// TLS material, when cert, key and CA are all configured.
    pub tls: Option<TlsMaterial>,
}

impl StoreConfig {
    /// TLS file locations, if TLS is enabled.
    pub fn tls_config(&self) -> Option<TlsConfig> {
        TlsConfig::from_parts(
            self.cert_file.as_deref(),
            self.key_file.as_deref(),
            self.ca_file.as_deref(),
        )
    }

    /// Resolve connector options, loading TLS material from disk.
    pub fn client_options(&self) -> Result<ClientOptions> {
        let credentials = self
            .username
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|username| Credentials {
                username: username.clone(),
                password: self.password.clone().unwrap_or_default(),
            });
        let tls = self
            .tls_config()
            .map(|tls| tls.load())
            .transpose()
            .with_context(|| "failed to load store TLS material")?;
        Ok(ClientOptions {
            endpoints: self.endpoints.clone(),
            credentials,
            tls,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref endpoints) = overrides.endpoints {
            self.store.endpoints = endpoints.clone();
        }
        if let Some(ref prefix) = overrides.prefix {
            self.registry.prefix = prefix.clone();
        }
        if let Some(reject) = overrides.reject_overlapping {
            self.registry.reject_overlapping = reject;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_registry()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.endpoints.is_empty() {
            anyhow::bail!("store.endpoints must list at least one endpoint");
        }
        if let Some(blank) = self.store.endpoints.iter().find(|e| e.trim().is_empty()) {
            anyhow::bail!("store.endpoints contains an empty entry: {:?}", blank);
        }

        // TLS is all-or-nothing
        let set = [
            ("cert_file", &self.store.cert_file),
            ("key_file", &self.store.key_file),
            ("ca_file", &self.store.ca_file),
        ];
        let configured = set.iter().filter(|(_, path)| path.is_some()).count();
        if configured != 0 && configured != set.len() {
            let missing: Vec<&str> = set
                .iter()
                .filter(|(_, path)| path.is_none())
                .map(|(name, _)| *name)
                .collect();
            anyhow::bail!("store TLS requires cert_file, key_file and ca_file; missing {:?}", missing);
        }

        if self.store.password.is_some() && self.store.username.is_none() {
            anyhow::bail!("store.password set without store.username");
        }
        Ok(())
    }

    fn validate_registry(&self) -> Result<()> {
        let prefix = &self.registry.prefix;
        if !prefix.starts_with('/') || prefix.len() < 2 {
            anyhow::bail!("registry.prefix must be an absolute key path, got: {:?}", prefix);
        }
        if prefix.ends_with('/') {
            anyhow::bail!("registry.prefix must not end with '/', got: {:?}", prefix);
        }
        if self.registry.lock_session_ttl_seconds <= 0 {
            anyhow::bail!("registry.lock_session_ttl_seconds must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override store endpoints.
    pub endpoints: Option<Vec<String>>,
    /// Override key-space prefix.
    pub prefix: Option<String>,
    /// Override the overlap policy.
    pub reject_overlapping: Option<bool>,
}
