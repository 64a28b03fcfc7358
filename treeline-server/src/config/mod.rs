//! Configuration for treeline-server.
//!
//! Settings come from a TOML file, with the database URL overridable
//! through the `TREELINE_DB` environment variable and the consumer name
//! through the CLI. A missing file falls back to defaults so a local run
//! needs no setup.

pub mod file;

use crate::config::file::{BridgeSection, FileConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use treeline_core::channels::DeliveryMode;
use treeline_core::dispatcher::DispatcherConfig;

/// Environment variable overriding the log database URL.
pub const DATABASE_URL_ENV: &str = "TREELINE_DB";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub stream: String,
    pub delivery_mode: DeliveryMode,
    pub dispatcher: DispatcherConfig,
    /// Present only when the producer adapter is enabled.
    pub bridge: Option<BridgeSettings>,
}

/// Resolved producer adapter settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub feed_path: PathBuf,
    pub rpc_url: Option<String>,
    pub contract_address: Option<String>,
    pub poll_interval: Duration,
}

/// Resolve the database URL: environment first, config file second.
pub fn database_url(from_file: &str) -> String {
    std::env::var(DATABASE_URL_ENV)
        .ok()
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| from_file.to_string())
}

/// Configuration loader handling the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
    consumer_override: Option<String>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, consumer_override: Option<String>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            consumer_override,
        }
    }

    /// Load and resolve the configuration.
    ///
    /// 1. Read the TOML file (defaults when it does not exist)
    /// 2. Apply the environment and CLI overrides
    /// 3. Validate
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let file_config = if self.config_path.exists() {
            let content = std::fs::read_to_string(&self.config_path)?;
            toml::from_str::<FileConfig>(&content)?
        } else {
            tracing::info!(path = %self.config_path.display(), "no config file, using defaults");
            FileConfig::default()
        };

        self.validate(&file_config)?;

        let consumer = self
            .consumer_override
            .clone()
            .or(file_config.dispatcher.consumer.clone())
            .unwrap_or_else(|| format!("{}-{}", file_config.dispatcher.group, uuid::Uuid::new_v4()));

        let bridge = if file_config.bridge.enabled {
            Some(resolve_bridge(&file_config.bridge)?)
        } else {
            None
        };

        Ok(Settings {
            database_url: database_url(&file_config.log.database_url),
            stream: file_config.log.stream.clone(),
            delivery_mode: file_config.dispatcher.delivery_mode,
            dispatcher: DispatcherConfig {
                group: file_config.dispatcher.group.clone(),
                consumer,
                batch_size: file_config.dispatcher.batch_size,
                max_wait: Duration::from_millis(file_config.dispatcher.max_wait_ms),
                startup_attempts: file_config.dispatcher.startup_attempts,
            },
            bridge,
        })
    }

    fn validate(&self, config: &FileConfig) -> Result<(), ConfigError> {
        if config.dispatcher.batch_size == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.batch_size must be at least 1".to_string(),
            ));
        }
        if config.log.stream.is_empty() {
            return Err(ConfigError::Validation(
                "log.stream must not be empty".to_string(),
            ));
        }
        if config.dispatcher.group.is_empty() {
            return Err(ConfigError::Validation(
                "dispatcher.group must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_bridge(section: &BridgeSection) -> Result<BridgeSettings, ConfigError> {
    let Some(feed_path) = section.feed_path.clone() else {
        return Err(ConfigError::Validation(
            "bridge.feed_path is required when the bridge is enabled".to_string(),
        ));
    };
    Ok(BridgeSettings {
        feed_path: PathBuf::from(feed_path),
        rpc_url: section.rpc_url.clone(),
        contract_address: section.contract_address.clone(),
        poll_interval: Duration::from_millis(section.poll_interval_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let loader = ConfigLoader::new("/nonexistent/treeline.toml", None);
        let settings = loader.load().unwrap();
        assert_eq!(settings.stream, "context-stream");
        assert_eq!(settings.dispatcher.group, "orchestrator");
        assert!(settings.bridge.is_none());
        assert!(settings.dispatcher.consumer.starts_with("orchestrator-"));
    }

    #[test]
    fn file_settings_flow_through() {
        let path = std::env::temp_dir().join(format!(
            "treeline-config-{}.toml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(
            &path,
            r#"
[log]
database_url = "sqlite:///var/lib/treeline/deployed.db?mode=rwc"
stream = "deployed-stream"

[dispatcher]
group = "deployed"
"#,
        )
        .unwrap();

        let settings = ConfigLoader::new(&path, None).load().unwrap();
        assert_eq!(settings.stream, "deployed-stream");
        assert_eq!(settings.dispatcher.group, "deployed");
        if std::env::var(DATABASE_URL_ENV).is_err() {
            assert_eq!(
                settings.database_url,
                "sqlite:///var/lib/treeline/deployed.db?mode=rwc"
            );
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn consumer_override_wins() {
        let loader = ConfigLoader::new("/nonexistent/treeline.toml", Some("orc-7".to_string()));
        let settings = loader.load().unwrap();
        assert_eq!(settings.dispatcher.consumer, "orc-7");
    }

    #[test]
    fn enabled_bridge_requires_a_feed_path() {
        let loader = ConfigLoader::new("/nonexistent/treeline.toml", None);
        let mut config = FileConfig::default();
        config.bridge.enabled = true;
        assert!(loader.validate(&config).is_ok());
        assert!(matches!(
            resolve_bridge(&config.bridge),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let loader = ConfigLoader::new("/nonexistent/treeline.toml", None);
        let mut config = FileConfig::default();
        config.dispatcher.batch_size = 0;
        assert!(matches!(
            loader.validate(&config),
            Err(ConfigError::Validation(_))
        ));
    }
}
