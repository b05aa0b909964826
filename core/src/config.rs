//! Configuration types for Stowage

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::StoreError;
use crate::traits::StoreResult;

/// Which storage engine answers the store's calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Embedded,
    External,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Embedded => write!(f, "embedded"),
            BackendKind::External => write!(f, "external"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" => Ok(BackendKind::Embedded),
            "external" => Ok(BackendKind::External),
            other => Err(StoreError::validation(format!(
                "unknown backend '{}', expected 'embedded' or 'external'",
                other
            ))),
        }
    }
}

/// Main store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selector
    pub backend: BackendKind,

    /// Embedded engine configuration
    pub embedded: EmbeddedConfig,

    /// External cache configuration
    pub external: ExternalConfig,
}

impl StoreConfig {
    /// Embedded store at `path` with default settings
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Embedded,
            embedded: EmbeddedConfig {
                path: path.into(),
                ..EmbeddedConfig::default()
            },
            external: ExternalConfig::default(),
        }
    }

    /// External store at `host:port` with default settings
    pub fn external(host: impl Into<String>, port: u16) -> Self {
        Self {
            backend: BackendKind::External,
            embedded: EmbeddedConfig::default(),
            external: ExternalConfig {
                host: host.into(),
                port,
                ..ExternalConfig::default()
            },
        }
    }

    pub fn from_json(content: &str) -> StoreResult<Self> {
        let config: StoreConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> StoreResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::validation(format!("cannot encode configuration: {}", e)))
    }

    /// Load and validate a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StoreError::validation(format!(
                "cannot read configuration {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Reject values that cannot produce a working backend
    ///
    /// Only the selected backend's section is checked.
    pub fn validate(&self) -> StoreResult<()> {
        match self.backend {
            BackendKind::Embedded => self.embedded.validate(),
            BackendKind::External => self.external.validate(),
        }
    }
}

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(365 * 86_400);
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 7 * 86_400;

/// Embedded engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    /// Primary data file
    pub path: PathBuf,

    /// Write-ahead log journal (durability mode); off uses the rollback journal
    pub wal_enabled: bool,

    /// How long the engine waits on a locked database before reporting busy
    pub busy_timeout_ms: u64,

    /// Run the background expiry sweeper
    pub auto_cleanup_enabled: bool,

    /// Sweeper interval in days; fractional values are allowed
    pub cleanup_interval_days: f64,

    /// Maximum keys deleted per sweeper transaction
    pub cleanup_batch_size: usize,
}

impl EmbeddedConfig {
    /// Sweeper period; `validate` guarantees it lies within the allowed bounds
    pub fn cleanup_interval(&self) -> Duration {
        self.checked_cleanup_interval()
            .unwrap_or(Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS))
    }

    fn checked_cleanup_interval(&self) -> Option<Duration> {
        let interval = Duration::try_from_secs_f64(self.cleanup_interval_days * 86_400.0).ok()?;
        (MIN_CLEANUP_INTERVAL..=MAX_CLEANUP_INTERVAL)
            .contains(&interval)
            .then_some(interval)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn validate(&self) -> StoreResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(StoreError::validation("embedded.path must not be empty"));
        }
        if self.checked_cleanup_interval().is_none() {
            return Err(StoreError::validation(format!(
                "embedded.cleanup_interval_days must be between {} second and {} days",
                MIN_CLEANUP_INTERVAL.as_secs(),
                MAX_CLEANUP_INTERVAL.as_secs() / 86_400
            )));
        }
        if self.cleanup_batch_size == 0 {
            return Err(StoreError::validation(
                "embedded.cleanup_batch_size must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/stowage.db"),
            wal_enabled: true,
            busy_timeout_ms: 5_000,
            auto_cleanup_enabled: true,
            cleanup_interval_days: 7.0,
            cleanup_batch_size: 500,
        }
    }
}

/// External cache configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub host: String,

    pub port: u16,

    /// Logical database index on the server
    pub db_index: i64,

    pub password: Option<String>,

    /// Upper bound on pooled connections
    pub max_connections: usize,

    /// Per-command response timeout in seconds
    pub socket_timeout_secs: u64,

    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,

    /// Namespace prepended to every key
    pub key_prefix: String,

    /// TTL applied by `set` when none is given
    pub default_ttl_secs: Option<u64>,

    /// Attempts per operation on connection failures
    pub max_retries: u32,
}

impl ExternalConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> StoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(StoreError::validation("external.host must not be empty"));
        }
        if self.db_index < 0 {
            return Err(StoreError::validation("external.db_index must not be negative"));
        }
        if self.max_connections == 0 {
            return Err(StoreError::validation(
                "external.max_connections must be greater than zero",
            ));
        }
        if self.socket_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(StoreError::validation("external timeouts must be greater than zero"));
        }
        if self.default_ttl_secs == Some(0) {
            return Err(StoreError::validation(
                "external.default_ttl_secs must be greater than zero",
            ));
        }
        if self.max_retries == 0 {
            return Err(StoreError::validation(
                "external.max_retries must be at least one",
            ));
        }
        Ok(())
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db_index: 0,
            password: None,
            max_connections: 10,
            socket_timeout_secs: 5,
            connect_timeout_secs: 5,
            key_prefix: "stowage:".to_string(),
            default_ttl_secs: None,
            max_retries: 3,
        }
    }
}

// Keep the password out of logs
impl fmt::Debug for ExternalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_index", &self.db_index)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("max_connections", &self.max_connections)
            .field("socket_timeout_secs", &self.socket_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("key_prefix", &self.key_prefix)
            .field("default_ttl_secs", &self.default_ttl_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert_eq!(config.backend, BackendKind::Embedded);
        config.validate().unwrap();

        let external = StoreConfig::external("localhost", 6380);
        assert_eq!(external.external.port, 6380);
        external.validate().unwrap();
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("External".parse::<BackendKind>().unwrap(), BackendKind::External);
        assert!("memory".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StoreConfig::from_json(
            r#"{ "backend": "external", "external": { "key_prefix": "jobs:", "max_connections": 4 } }"#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::External);
        assert_eq!(config.external.key_prefix, "jobs:");
        assert_eq!(config.external.max_connections, 4);
        assert_eq!(config.external.port, 6379);
        assert!(config.embedded.wal_enabled);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = StoreConfig::external("localhost", 6379);
        config.external.max_connections = 0;
        assert!(matches!(config.validate(), Err(StoreError::Validation(_))));

        let mut config = StoreConfig::embedded("");
        assert!(config.validate().is_err());
        config.embedded.path = PathBuf::from("state.db");
        config.embedded.cleanup_interval_days = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cleanup_interval_bounds() {
        let mut config = StoreConfig::embedded("state.db");

        config.embedded.cleanup_interval_days = 1e20;
        assert!(matches!(config.validate(), Err(StoreError::Validation(_))));

        config.embedded.cleanup_interval_days = 1e-16;
        assert!(matches!(config.validate(), Err(StoreError::Validation(_))));

        config.embedded.cleanup_interval_days = f64::NAN;
        assert!(matches!(config.validate(), Err(StoreError::Validation(_))));

        // a few seconds is fine; sub-second periods are not
        config.embedded.cleanup_interval_days = 2.0 / 86_400.0;
        config.validate().unwrap();
        let interval = config.embedded.cleanup_interval();
        assert!(interval >= Duration::from_secs(1) && interval <= Duration::from_secs(2));

        config.embedded.cleanup_interval_days = 0.5 / 86_400.0;
        assert!(matches!(config.validate(), Err(StoreError::Validation(_))));

        config.embedded.cleanup_interval_days = 365.0;
        config.validate().unwrap();
        assert_eq!(
            config.embedded.cleanup_interval(),
            Duration::from_secs(365 * 86_400)
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = StoreConfig::from_json(r#"{ "backend": "memcached" }"#).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = StoreConfig::embedded(tmp.path().join("state.db"));
        config.embedded.cleanup_interval_days = 0.5;
        std::fs::write(&path, config.to_json().unwrap()).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        assert_eq!(loaded.embedded.path, tmp.path().join("state.db"));
        assert_eq!(loaded.embedded.cleanup_interval(), Duration::from_secs(43_200));
    }

    #[test]
    fn test_password_is_redacted() {
        let mut config = ExternalConfig::default();
        config.password = Some("hunter2".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }
}
