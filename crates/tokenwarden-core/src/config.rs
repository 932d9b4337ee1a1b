//! Application configuration management.
//!
//! Configuration covers the identity provider location, where credentials
//! are kept, and the refresh policy knobs.
//!
//! Configuration is stored at `~/.config/tokenwarden/config.json`.
//! Environment variables override the file (see [`Config::apply_env`]).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::auth::{
    CredentialStore, FileBackend, KeyringBackend, MemoryBackend, RefreshFailurePolicy,
    SecretBackend,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tokenwarden";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "https://localhost:8000/api/v1";

/// Identity provider endpoints live under this path
const DEFAULT_AUTH_PATH: &str = "user/";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_BASE_URL: &str = "TOKENWARDEN_BASE_URL";
pub const ENV_STORAGE: &str = "TOKENWARDEN_STORAGE";

/// Where the credential pair is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Keyring,
    File,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(StorageKind::Keyring),
            "file" => Ok(StorageKind::File),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API root, e.g. `https://example.com/api/v1`
    pub base_url: String,
    /// Path of the identity provider endpoints under `base_url`
    pub auth_path: String,
    pub request_timeout_secs: u64,
    pub storage: StorageKind,
    /// Stored tokens are dropped after this many hours
    pub retention_hours: i64,
    pub clock_skew_leeway_secs: u64,
    pub refresh_failure_policy: RefreshFailurePolicy,
    /// Permit attaching credentials over plain http
    pub allow_insecure_transport: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_path: DEFAULT_AUTH_PATH.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage: StorageKind::default(),
            retention_hours: crate::auth::credentials::DEFAULT_RETENTION_HOURS,
            clock_skew_leeway_secs: 0,
            refresh_failure_policy: RefreshFailurePolicy::default(),
            allow_insecure_transport: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from `TOKENWARDEN_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(base_url) = std::env::var(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Ok(storage) = std::env::var(ENV_STORAGE) {
            self.storage = storage.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Retention window for stored tokens. Must be a positive number of hours.
    pub fn retention(&self) -> Result<TimeDelta> {
        if self.retention_hours <= 0 {
            bail!("retention_hours must be positive, got {}", self.retention_hours);
        }
        TimeDelta::try_hours(self.retention_hours)
            .with_context(|| format!("retention_hours out of range: {}", self.retention_hours))
    }

    /// Join an endpoint path onto the base URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Base URL of the `token/`, `token/refresh/` and `register/` endpoints
    pub fn auth_base_url(&self) -> String {
        self.endpoint(&self.auth_path)
    }

    pub fn is_secure_transport(&self) -> bool {
        self.base_url.starts_with("https://")
    }

    /// Build the credential store selected by `storage`.
    pub fn credential_store(&self) -> Result<CredentialStore> {
        let backend: Arc<dyn SecretBackend> = match self.storage {
            StorageKind::Keyring => Arc::new(KeyringBackend::new()),
            StorageKind::File => Arc::new(FileBackend::new(self.cache_dir()?)),
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
        };
        let retention = self.retention()?;
        Ok(CredentialStore::with_retention(backend, retention))
    }
}
