//! Daemon configuration.
//!
//! One hierarchical YAML document; unknown keys are rejected at load time.
//! Environment variables prefixed `AAS_UPLINK_` override the file and
//! mapping paths.

use aas_uplink_semantic::{
    CommandRules, DriftRules, FidelityRules, LifecycleRules, StreamingRules, ValidationRules,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// MQTT broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MqttConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    pub keepalive_seconds: u64,
    /// Minimum reconnect backoff in seconds
    pub reconnect_delay_min_seconds: u64,
    /// Maximum reconnect backoff in seconds
    pub reconnect_delay_max_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "aas-uplink".to_string(),
            username: None,
            password: None,
            keepalive_seconds: 30,
            reconnect_delay_min_seconds: 1,
            reconnect_delay_max_seconds: 120,
        }
    }
}

/// Retained-plane payload modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// Full metadata in every payload
    Inline,
    /// Hash reference only
    Pointer,
    /// Full metadata plus the hash reference
    Hybrid,
}

/// Retained-plane publication configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UnsConfig {
    /// Master switch
    pub enabled: bool,
    /// Optional topic prefix
    pub root_topic: String,
    /// Delivery QoS (0, 1 or 2)
    pub qos: u8,
    /// Payload mode
    pub payload_mode: PayloadMode,
}

impl Default for UnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_topic: String::new(),
            qos: 1,
            payload_mode: PayloadMode::Inline,
        }
    }
}

/// Lifecycle-plane (Sparkplug) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SparkplugConfig {
    /// Master switch
    pub enabled: bool,
    /// Sparkplug group identifier
    pub group_id: String,
    /// Edge node identifier
    pub edge_node_id: String,
}

impl Default for SparkplugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group_id: "AAS".to_string(),
            edge_node_id: "Uplink".to_string(),
        }
    }
}

/// File watcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileWatcherConfig {
    /// Master switch
    pub enabled: bool,
    /// Directory to watch
    pub watch_dir: PathBuf,
    /// File name suffixes to pick up
    pub extensions: Vec<String>,
    /// Debounce window in seconds
    pub debounce_seconds: f64,
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_dir: PathBuf::from("./watch"),
            extensions: vec![".json".to_string()],
            debounce_seconds: 2.0,
        }
    }
}

/// Repository polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RepoClientConfig {
    /// Master switch
    pub enabled: bool,
    /// Repository base URL
    pub base_url: String,
    /// Poll interval in seconds
    pub poll_interval_seconds: u64,
    /// Per-call timeout in seconds
    pub timeout_seconds: u64,
    /// Optional bearer token
    pub auth_token: Option<String>,
    /// Write retry attempts on the command path
    pub write_retries: u32,
}

impl Default for RepoClientConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8081".to_string(),
            poll_interval_seconds: 60,
            timeout_seconds: 30,
            auth_token: None,
            write_retries: 3,
        }
    }
}

/// State persistence configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StateConfig {
    /// Directory holding the state databases
    pub dir: PathBuf,
    /// Cap of the alias table
    pub max_aliases: usize,
    /// Cap of the payload-hash table
    pub max_hashes: usize,
    /// Cap shared by the semantic tables
    pub max_semantic_entries: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./state"),
            max_aliases: 100_000,
            max_hashes: 500_000,
            max_semantic_entries: 100_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (`console` or `json`)
    pub log_format: String,
    /// Prometheus exporter port (0 disables)
    pub metrics_port: u16,
    /// Health endpoint port (0 disables)
    pub health_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "console".to_string(),
            metrics_port: 9090,
            health_port: 8080,
        }
    }
}

/// Semantic subsystem configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SemanticConfig {
    /// Pre-publish validation rules
    pub validation: ValidationRules,
    /// Schema drift rules
    pub drift: DriftRules,
    /// Streaming anomaly rules
    pub streaming: StreamingRules,
    /// Lifecycle tracking rules
    pub lifecycle: LifecycleRules,
    /// Fidelity scoring rules
    pub fidelity: FidelityRules,
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    /// Broker connection
    pub mqtt: MqttConfig,
    /// Retained plane
    pub uns: UnsConfig,
    /// Lifecycle plane
    pub sparkplug: SparkplugConfig,
    /// File ingress
    pub file_watcher: FileWatcherConfig,
    /// Repository ingress and command egress
    pub repo_client: RepoClientConfig,
    /// Persistence
    pub state: StateConfig,
    /// Logs, metrics, health
    pub observability: ObservabilityConfig,
    /// Validation, drift, lifecycle, fidelity
    pub semantic: SemanticConfig,
    /// Broker-to-AAS write-back
    pub sync: CommandRules,
    /// Preferred language for multi-language properties
    pub preferred_language: String,
    /// Pipeline worker count (defaults to available parallelism, minimum 2)
    pub parallelism: Option<usize>,
    /// Bound on graceful shutdown in seconds
    pub shutdown_deadline_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            uns: UnsConfig::default(),
            sparkplug: SparkplugConfig::default(),
            file_watcher: FileWatcherConfig::default(),
            repo_client: RepoClientConfig::default(),
            state: StateConfig::default(),
            observability: ObservabilityConfig::default(),
            semantic: SemanticConfig::default(),
            sync: CommandRules::default(),
            preferred_language: "en".to_string(),
            parallelism: None,
            shutdown_deadline_seconds: 30,
        }
    }
}

impl AgentConfig {
    /// Load the configuration from a YAML file; a missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns error when the file exists but cannot be read, parses with
    /// unknown keys, or fails the sanity checks.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.uns.qos <= 2, "uns.qos must be 0, 1 or 2");
        anyhow::ensure!(
            self.mqtt.reconnect_delay_min_seconds <= self.mqtt.reconnect_delay_max_seconds,
            "mqtt.reconnect_delay_min_seconds exceeds reconnect_delay_max_seconds"
        );
        anyhow::ensure!(
            !self.sparkplug.group_id.contains(['/', '+', '#']),
            "sparkplug.group_id must not contain topic separators or wildcards"
        );
        anyhow::ensure!(
            !self.sparkplug.edge_node_id.contains(['/', '+', '#']),
            "sparkplug.edge_node_id must not contain topic separators or wildcards"
        );
        anyhow::ensure!(
            self.semantic.validation.level <= 2,
            "semantic.validation.level must be 0, 1 or 2"
        );
        Ok(())
    }

    /// Number of pipeline workers: configured, or available parallelism with
    /// a floor of 2.
    #[must_use]
    pub fn pipeline_workers(&self) -> usize {
        self.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get)
        })
        .max(2)
    }

    /// Reconnect backoff bounds.
    #[must_use]
    pub fn reconnect_delays(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.mqtt.reconnect_delay_min_seconds.max(1)),
            Duration::from_secs(self.mqtt.reconnect_delay_max_seconds.max(1)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.pipeline_workers() >= 2);
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
mqtt:
  host: broker.example.org
  port: 8883
  client_id: uplink-1
uns:
  qos: 0
  payload_mode: hybrid
sparkplug:
  group_id: Plant1
  edge_node_id: Edge7
semantic:
  validation:
    level: 2
    enforce_semantic_ids: true
    reject_invalid: true
    constraints:
      "0173-1#02-AAO677#002":
        min: 0.0
        max: 150.0
        unit: degC
sync:
  enabled: true
  allowed_write_patterns: ["Setpoints/*"]
  denied_write_patterns: ["Identification/*"]
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mqtt.host, "broker.example.org");
        assert_eq!(config.uns.payload_mode, PayloadMode::Hybrid);
        assert_eq!(config.semantic.validation.level, 2);
        assert!(config.sync.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = r#"
mqtt:
  host: localhost
  broker_url: nope
"#;
        let result: std::result::Result<AgentConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());

        let yaml = "telemetry:\n  enabled: true\n";
        let result: std::result::Result<AgentConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_qos_fails_validation() {
        let mut config = AgentConfig::default();
        config.uns.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "mqtt:\n  host: example.org\n").unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.mqtt.host, "example.org");
    }
}
