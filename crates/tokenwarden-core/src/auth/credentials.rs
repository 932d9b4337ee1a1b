use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SERVICE_NAME: &str = "tokenwarden";

/// File name used by `FileBackend` in the cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

const ACCESS_KEY: &str = "access_token";
const REFRESH_KEY: &str = "refresh_token";

/// Hard ceiling on how long stored tokens are kept, independent of their claims.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// An access/refresh token pair. Always replaced as a unit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

/// What `CredentialStore::get` found. Either side may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

impl StoredCredentials {
    /// The complete pair, or `None` if either token is missing.
    pub fn pair(&self) -> Option<CredentialPair> {
        match (&self.access, &self.refresh) {
            (Some(access), Some(refresh)) => Some(CredentialPair::new(access, refresh)),
            _ => None,
        }
    }
}

/// Envelope persisted for each token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSecret {
    value: String,
    expires_at: DateTime<Utc>,
    /// Only to be sent over encrypted transport
    secure: bool,
}

impl StoredSecret {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Keyed secret storage used by `CredentialStore`.
pub trait SecretBackend: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns `Ok(None)` when no entry exists.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Removing a missing entry is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// OS keychain storage
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretBackend for KeyringBackend {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store secret in keychain")
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete secret from keychain"),
        }
    }
}

/// JSON file in the cache directory, for hosts without a keychain.
pub struct FileBackend {
    cache_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            lock: Mutex::new(()),
        }
    }

    fn path(&self) -> PathBuf {
        self.cache_dir.join(CREDENTIALS_FILE)
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        let path = self.path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents =
            std::fs::read_to_string(&path).context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    fn write_all(&self, entries: &HashMap<String, String>) -> Result<()> {
        let path = self.path();
        if entries.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).context("Failed to remove credentials file")?;
            }
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&path, contents).context("Failed to write credentials file")?;
        restrict_permissions(&path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict credentials file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

impl SecretBackend for FileBackend {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_all()?.remove(key))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBackend for MemoryBackend {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Persists the credential pair with a retention ceiling and the secure-transport flag.
/// Clone is cheap - the backend is shared.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
    retention: Duration,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self::with_retention(backend, Duration::hours(DEFAULT_RETENTION_HOURS))
    }

    pub fn with_retention(backend: Arc<dyn SecretBackend>, retention: Duration) -> Self {
        Self { backend, retention }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Every stored secret is marked secure-transport-only.
    pub fn secure_only(&self) -> bool {
        true
    }

    /// Store both tokens, each expiring after `ttl`.
    pub fn put(&self, pair: &CredentialPair, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .context("Retention window out of range")?;
        self.put_secret(ACCESS_KEY, &pair.access, expires_at)?;
        self.put_secret(REFRESH_KEY, &pair.refresh, expires_at)?;
        debug!(%expires_at, "Stored credential pair");
        Ok(())
    }

    /// Store both tokens for the configured retention window.
    pub fn save(&self, pair: &CredentialPair) -> Result<()> {
        self.put(pair, self.retention)
    }

    pub fn get(&self) -> Result<StoredCredentials> {
        Ok(StoredCredentials {
            access: self.get_secret(ACCESS_KEY)?,
            refresh: self.get_secret(REFRESH_KEY)?,
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.backend.remove(ACCESS_KEY)?;
        self.backend.remove(REFRESH_KEY)?;
        debug!("Cleared stored credentials");
        Ok(())
    }

    fn put_secret(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let secret = StoredSecret {
            value: value.to_string(),
            expires_at,
            secure: self.secure_only(),
        };
        let encoded = serde_json::to_string(&secret)?;
        self.backend
            .set(key, &encoded)
            .with_context(|| format!("Failed to store {}", key))
    }

    fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self
            .backend
            .get(key)
            .with_context(|| format!("Failed to load {}", key))?
        else {
            return Ok(None);
        };

        let secret: StoredSecret = match serde_json::from_str(&raw) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(key = key, error = %e, "Discarding unreadable stored secret");
                self.backend.remove(key)?;
                return Ok(None);
            }
        };

        if secret.is_expired() {
            debug!(key = key, expired_at = %secret.expires_at, "Stored secret past retention");
            self.backend.remove(key)?;
            return Ok(None);
        }

        Ok(Some(secret.value))
    }
}
