//! Broker-to-AAS command routing.
//!
//! Subscribers publish `{value, timestamp, correlation_id}` on a retained
//! topic with `/cmd` appended; the router maps the topic back to its AAS
//! coordinates, authorises it against deny-then-allow pattern lists,
//! optionally re-validates the value, and shapes the repository write plus
//! the acknowledgement. Actual MQTT and HTTP I/O stay with the callers;
//! per-path write serialisation is enforced by the runtime's command
//! workers.

use crate::validation::{ValidationOutcome, Validator};
use aas_uplink_core::{LeafKind, LeafRecord, MetricValue};
use aas_uplink_proto::topics::CommandTopic;
use serde::Deserialize;
use std::collections::HashMap;
use wildmatch::WildMatch;

/// Command-path configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CommandRules {
    /// Master switch
    pub enabled: bool,
    /// Glob patterns over `{submodel}/{path}` that may be written
    pub allowed_write_patterns: Vec<String>,
    /// Glob patterns that are always denied (checked first)
    pub denied_write_patterns: Vec<String>,
    /// Re-run value validation before writing
    pub validate_before_write: bool,
}

impl Default for CommandRules {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_write_patterns: Vec::new(),
            denied_write_patterns: Vec::new(),
            validate_before_write: true,
        }
    }
}

/// A parsed write command.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    /// Value to write
    pub value: MetricValue,
    /// Raw JSON value for the repository PATCH
    pub value_json: serde_json::Value,
    /// Sender's correlation id, echoed in the acknowledgement
    pub correlation_id: Option<String>,
    /// Sender-side timestamp, when given
    pub timestamp_ms: Option<i64>,
}

/// Where a writable property lives, registered from the publish pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    /// Asset the property belongs to
    pub asset_uri: String,
    /// Submodel identifier for the repository API
    pub submodel_id: String,
    /// idShortPath in API notation (`Limits.Max`, `Voltages[0]`)
    pub id_short_path: String,
    /// Element kind, for pre-write validation
    pub kind: LeafKind,
    /// XSD value type
    pub value_type: String,
    /// Semantic id, for constraint lookup
    pub semantic_id: Option<String>,
    /// Unit, for constraint checks
    pub unit: Option<String>,
}

/// Outcome of routing one command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandDecision {
    /// Proceed with the repository write
    Execute {
        /// Resolved write target
        target: WriteTarget,
        /// Parsed command
        command: WriteCommand,
        /// Topic for the acknowledgement
        response_topic: String,
    },
    /// Refuse and publish the given nack payload
    Reject {
        /// Topic for the nack
        response_topic: String,
        /// Serialised nack payload
        payload: Vec<u8>,
        /// Error category (`denied` / `invalid` / `unknown_target` / `malformed`)
        error: &'static str,
    },
}

/// Router over the command rule set and the topic reverse index.
pub struct CommandRouter {
    rules: CommandRules,
    allowed: Vec<WildMatch>,
    denied: Vec<WildMatch>,
    targets: HashMap<String, WriteTarget>,
}

impl CommandRouter {
    /// Compile the rule set.
    #[must_use]
    pub fn new(rules: CommandRules) -> Self {
        let allowed = rules.allowed_write_patterns.iter().map(|p| WildMatch::new(p)).collect();
        let denied = rules.denied_write_patterns.iter().map(|p| WildMatch::new(p)).collect();
        Self {
            rules,
            allowed,
            denied,
            targets: HashMap::new(),
        }
    }

    /// True when the command path is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.rules.enabled
    }

    /// Register the write target behind a retained topic.
    ///
    /// Called by the pipeline for every composed topic so incoming commands
    /// can be mapped back to `(asset_uri, submodel_id, path)`.
    pub fn register_target(&mut self, retained_topic: &str, record: &LeafRecord) {
        self.targets.insert(
            retained_topic.to_string(),
            WriteTarget {
                asset_uri: record.asset_uri.clone(),
                submodel_id: record.submodel_id.clone(),
                id_short_path: api_path(&record.path),
                kind: record.kind,
                value_type: record.value_type.clone(),
                semantic_id: record.semantic_id.clone(),
                unit: record.unit.clone(),
            },
        );
    }

    /// Number of registered targets.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Route one command message.
    #[must_use]
    pub fn route(
        &self,
        topic: &CommandTopic,
        payload: &[u8],
        validator: &Validator,
    ) -> CommandDecision {
        let command = match parse_command(payload) {
            Ok(command) => command,
            Err(reason) => {
                tracing::warn!(topic = %topic.response_topic, reason, "Malformed command payload");
                return self.reject(topic, None, "malformed");
            }
        };

        let rule_path = topic.rule_path();
        if self.denied.iter().any(|p| p.matches(&rule_path)) {
            return self.reject(topic, command.correlation_id.as_deref(), "denied");
        }
        if !self.allowed.iter().any(|p| p.matches(&rule_path)) {
            return self.reject(topic, command.correlation_id.as_deref(), "denied");
        }

        let Some(target) = self.targets.get(&topic.response_topic) else {
            return self.reject(topic, command.correlation_id.as_deref(), "unknown_target");
        };

        if self.rules.validate_before_write && validator.enabled() {
            let candidate = LeafRecord {
                asset_uri: target.asset_uri.clone(),
                submodel_id: target.submodel_id.clone(),
                submodel_id_short: topic.submodel_id_short.clone(),
                path: topic.path.clone(),
                kind: target.kind,
                value: command.value.clone(),
                value_type: target.value_type.clone(),
                semantic_id: target.semantic_id.clone(),
                unit: target.unit.clone(),
                submodel_semantic_id: None,
                source_timestamp_ms: command.timestamp_ms.unwrap_or_default(),
                origin_uri: String::new(),
            };
            if let ValidationOutcome::Reject(violations) = validator.validate(&candidate) {
                tracing::info!(
                    topic = %topic.response_topic,
                    violations = violations.len(),
                    "Command value rejected by validation"
                );
                return self.reject(topic, command.correlation_id.as_deref(), "invalid");
            }
        }

        CommandDecision::Execute {
            target: target.clone(),
            command,
            response_topic: topic.response_topic.clone(),
        }
    }

    fn reject(
        &self,
        topic: &CommandTopic,
        correlation_id: Option<&str>,
        error: &'static str,
    ) -> CommandDecision {
        CommandDecision::Reject {
            response_topic: topic.response_topic.clone(),
            payload: nack_payload(error, correlation_id),
            error,
        }
    }
}

/// Parse a command payload.
fn parse_command(payload: &[u8]) -> Result<WriteCommand, &'static str> {
    #[derive(Deserialize)]
    struct Raw {
        value: serde_json::Value,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        correlation_id: Option<String>,
    }

    let raw: Raw = serde_json::from_slice(payload).map_err(|_| "invalid JSON")?;
    Ok(WriteCommand {
        value: MetricValue::from_json(&raw.value),
        value_json: raw.value,
        correlation_id: raw.correlation_id,
        timestamp_ms: raw.timestamp,
    })
}

/// Positive acknowledgement payload.
#[must_use]
pub fn ack_payload(correlation_id: Option<&str>, timestamp_ms: i64) -> Vec<u8> {
    let value = serde_json::json!({
        "ack": true,
        "correlation_id": correlation_id,
        "timestamp": timestamp_ms,
    });
    value.to_string().into_bytes()
}

/// Negative acknowledgement payload.
#[must_use]
pub fn nack_payload(error: &str, correlation_id: Option<&str>) -> Vec<u8> {
    let value = serde_json::json!({
        "ack": false,
        "error": error,
        "correlation_id": correlation_id,
    });
    value.to_string().into_bytes()
}

/// Convert record path segments to API idShortPath notation: dot-joined,
/// with positional `idx_N` segments becoming `[N]` index suffixes.
#[must_use]
pub fn api_path(segments: &[String]) -> String {
    let mut out = String::new();
    for segment in segments {
        if let Some(index) = segment.strip_prefix("idx_") {
            if index.chars().all(|c| c.is_ascii_digit()) {
                out.push_str(&format!("[{index}]"));
                continue;
            }
        }
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(segment);
    }
    out
}
