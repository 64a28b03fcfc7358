//! TOML file configuration structures.
//!
//! These structs directly map to the `treeline.toml` file format. Every
//! section and field has a default, so a missing file yields a runnable
//! local configuration.

use serde::{Deserialize, Serialize};
use treeline_core::channels::DeliveryMode;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// Event log section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// Database URL for the log substrate. Overridden by `TREELINE_DB`.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Stream name the dispatcher consumes.
    #[serde(default = "default_stream")]
    pub stream: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            stream: default_stream(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://treeline.db?mode=rwc".to_string()
}

fn default_stream() -> String {
    "context-stream".to_string()
}

/// Dispatcher section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    /// Consumer group name on the stream.
    #[serde(default = "default_group")]
    pub group: String,
    /// Member name within the group; generated per process when unset.
    #[serde(default)]
    pub consumer: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Upper bound, in milliseconds, on one blocking log read.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Connection attempts before startup fails fatally.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
    /// Task channel policy: best-effort pub/sub or log-backed delivery.
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            group: default_group(),
            consumer: None,
            batch_size: default_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            startup_attempts: default_startup_attempts(),
            delivery_mode: DeliveryMode::default(),
        }
    }
}

fn default_group() -> String {
    "orchestrator".to_string()
}

const fn default_batch_size() -> u32 {
    10
}

const fn default_max_wait_ms() -> u64 {
    1000
}

const fn default_startup_attempts() -> u32 {
    5
}

/// Producer adapter section. Consumed only by the bridge, never by the
/// dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    #[serde(default)]
    pub enabled: bool,
    /// JSON-lines feed the development source tails.
    #[serde(default)]
    pub feed_path: Option<String>,
    /// Network endpoint of the external chain deployment; recorded for
    /// operators, not dialed by the development source.
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Contract address of the external deployment.
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            feed_path: None,
            rpc_url: None,
            contract_address: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

const fn default_poll_interval_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_parses_to_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config.log.stream, "context-stream");
        assert_eq!(config.dispatcher.group, "orchestrator");
        assert_eq!(config.dispatcher.batch_size, 10);
        assert_eq!(config.dispatcher.delivery_mode, DeliveryMode::BestEffort);
        assert!(!config.bridge.enabled);
    }

    #[test]
    fn full_file_parses() {
        let toml_str = r#"
[log]
database_url = "sqlite:///var/lib/treeline/log.db?mode=rwc"
stream = "context-stream"

[dispatcher]
group = "orchestrator"
consumer = "orchestrator-a"
batch_size = 25
max_wait_ms = 500
delivery_mode = "durable"

[bridge]
enabled = true
feed_path = "/var/lib/treeline/chain-events.jsonl"
rpc_url = "https://sepolia.example.org/rpc"
contract_address = "0x52908400098527886E0F7030069857D2E4169EE7"
poll_interval_ms = 2000
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dispatcher.batch_size, 25);
        assert_eq!(config.dispatcher.consumer.as_deref(), Some("orchestrator-a"));
        assert_eq!(config.dispatcher.delivery_mode, DeliveryMode::Durable);
        assert!(config.bridge.enabled);
        assert_eq!(
            config.bridge.feed_path.as_deref(),
            Some("/var/lib/treeline/chain-events.jsonl")
        );
    }
}
