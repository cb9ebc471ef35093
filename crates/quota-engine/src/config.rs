//! Service configuration

use crate::error::{EngineError, Result};
use quota_accounts::AccountsConfig;
use quota_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration of the accounting sidecar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StoreConfig,
    pub ingest: IngestConfig,
    pub enforcement: EnforcementConfig,
    pub defaults: DefaultsConfig,
    pub accounts: AccountsConfig,
    pub logging: LoggingConfig,
}

/// Admin API listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub source: IngestSource,
}

/// Where proxy log lines come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestSource {
    /// Follow a log file the way `tail -f` does.
    ///
    /// The read offset is not persisted. With `from_start = false` (the
    /// default) bytes logged while the service is down are never accounted;
    /// with `from_start = true` the whole file is read again on every start,
    /// so it only suits a log that is rotated whenever the service restarts.
    File {
        path: PathBuf,
        /// Read existing content instead of starting at the end
        #[serde(default)]
        from_start: bool,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },

    /// Accept one connection and read log lines from it
    Tcp { bind_address: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub interval_secs: u64,
    pub retry: RetryConfig,
}

/// Backoff for external collaborator calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Values given to records that are created without explicit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub expiry_days: u32,
    /// Quota in bytes; `None` leaves the quota disabled
    pub allowed_usage: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl Default for IngestSource {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("/var/log/sockd.log"),
            from_start: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            expiry_days: 30,
            allowed_usage: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,quota_engine=debug".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl EnforcementConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        toml::from_str(&content)
            .map_err(|e| EngineError::config(format!("Failed to parse config: {}", e)))
    }

    /// Load `path` if it exists, defaults otherwise; environment overrides
    /// are applied on top in both cases
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            Self::load_from_file(path).await?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override selected settings from `QUOTA_*` variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("QUOTA_BIND") {
            self.server.bind_address = bind;
        }
        if let Some(path) = lookup("QUOTA_DB_PATH") {
            self.storage = StoreConfig::Sled {
                path: PathBuf::from(path),
            };
        }
        if let Some(log_path) = lookup("QUOTA_LOG_PATH") {
            let (from_start, poll_interval_ms) = match &self.ingest.source {
                IngestSource::File {
                    from_start,
                    poll_interval_ms,
                    ..
                } => (*from_start, *poll_interval_ms),
                IngestSource::Tcp { .. } => (false, default_poll_interval_ms()),
            };
            self.ingest.source = IngestSource::File {
                path: PathBuf::from(log_path),
                from_start,
                poll_interval_ms,
            };
        }
        if let Some(secs) = lookup("QUOTA_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.enforcement.interval_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_address()?;
        if self.enforcement.interval_secs == 0 {
            return Err(EngineError::config("enforcement.interval_secs must be positive"));
        }
        if self.enforcement.retry.max_attempts == 0 {
            return Err(EngineError::config("enforcement.retry.max_attempts must be at least 1"));
        }
        if self.defaults.expiry_days == 0 {
            return Err(EngineError::config("defaults.expiry_days must be positive"));
        }
        match &self.ingest.source {
            IngestSource::File {
                poll_interval_ms, ..
            } if *poll_interval_ms == 0 => {
                return Err(EngineError::config("ingest.source.poll_interval_ms must be positive"));
            }
            IngestSource::Tcp { bind_address } => {
                bind_address.parse::<SocketAddr>().map_err(|e| {
                    EngineError::config(format!("Invalid ingest bind address: {}", e))
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.server
            .bind_address
            .parse()
            .map_err(|e| EngineError::config(format!("Invalid bind address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.enforcement.interval(), Duration::from_secs(30));
        assert_eq!(config.defaults.expiry_days, 30);
        assert_eq!(config.defaults.allowed_usage, None);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [server]
            bind_address = "127.0.0.1:7000"

            [storage]
            type = "memory"

            [ingest.source]
            type = "tcp"
            bind_address = "127.0.0.1:8080"

            [enforcement]
            interval_secs = 5

            [defaults]
            allowed_usage = 1073741824
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:7000");
        assert_eq!(config.storage, StoreConfig::Memory);
        assert_eq!(
            config.ingest.source,
            IngestSource::Tcp {
                bind_address: "127.0.0.1:8080".to_string()
            }
        );
        assert_eq!(config.enforcement.interval_secs, 5);
        assert_eq!(config.enforcement.retry, RetryConfig::default());
        assert_eq!(config.defaults.allowed_usage, Some(1 << 30));
        assert_eq!(config.defaults.expiry_days, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_source_defaults() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [ingest.source]
            type = "file"
            path = "/tmp/sockd.log"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.ingest.source,
            IngestSource::File {
                path: PathBuf::from("/tmp/sockd.log"),
                from_start: false,
                poll_interval_ms: 500,
            }
        );
    }

    #[test]
    fn test_file_source_can_replay_existing_content() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [ingest.source]
            type = "file"
            path = "/tmp/sockd.log"
            from_start = true
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.ingest.source,
            IngestSource::File { from_start: true, .. }
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("QUOTA_BIND", "127.0.0.1:1234"),
            ("QUOTA_DB_PATH", "/tmp/db"),
            ("QUOTA_LOG_PATH", "/tmp/x.log"),
            ("QUOTA_INTERVAL_SECS", "7"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.bind_address, "127.0.0.1:1234");
        assert_eq!(
            config.storage,
            StoreConfig::Sled {
                path: PathBuf::from("/tmp/db")
            }
        );
        assert!(matches!(
            &config.ingest.source,
            IngestSource::File { path, .. } if path == Path::new("/tmp/x.log")
        ));
        assert_eq!(config.enforcement.interval_secs, 7);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ServiceConfig::default();
        config.enforcement.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.server.bind_address = "not an address".to_string();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.enforcement.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("quota.toml");
        tokio::fs::write(&path, "[enforcement]\ninterval_secs = 12\n")
            .await
            .unwrap();

        let config = ServiceConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.enforcement.interval_secs, 12);

        tokio::fs::write(&path, "[enforcement\n").await.unwrap();
        assert!(ServiceConfig::load_from_file(&path).await.is_err());
    }
}
