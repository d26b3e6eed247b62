//! Topic schemes for both publish planes.
//!
//! Retained plane:
//! `[prefix/]{enterprise}/{site}/{area}/{line}/{asset}/context/{submodel}/{path…}`
//!
//! Lifecycle plane:
//! `spBv1.0/{group}/{msgType}/{edgeNode}[/{device}]`
//!
//! Command path: a retained-plane topic with a trailing `/cmd`; the
//! acknowledgement goes to the same topic with `/cmd` removed.

use aas_uplink_core::sanitize::sanitize_segment;
use aas_uplink_core::{AssetAddress, LeafRecord};
use serde::{Deserialize, Serialize};

/// Sparkplug B namespace element.
pub const SPARKPLUG_NAMESPACE: &str = "spBv1.0";

/// System topic prefix for context dictionary distribution.
pub const CONTEXT_TOPIC_PREFIX: &str = "UNS/Sys/Context";

/// System topic prefix for drift alerts.
pub const DRIFT_TOPIC_PREFIX: &str = "UNS/Sys/DriftAlerts";

/// System topic prefix for lifecycle events.
pub const LIFECYCLE_TOPIC_PREFIX: &str = "UNS/Sys/Lifecycle";

/// System topic prefix for fidelity alerts.
pub const FIDELITY_TOPIC_PREFIX: &str = "UNS/Sys/FidelityAlerts";

/// Suffix marking a command topic.
pub const COMMAND_SUFFIX: &str = "/cmd";

/// Sparkplug message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SparkplugMessageType {
    Nbirth,
    Ndeath,
    Dbirth,
    Ddeath,
    Ndata,
    Ddata,
    Ncmd,
    Dcmd,
}

impl SparkplugMessageType {
    /// Topic element for the message type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SparkplugMessageType::Nbirth => "NBIRTH",
            SparkplugMessageType::Ndeath => "NDEATH",
            SparkplugMessageType::Dbirth => "DBIRTH",
            SparkplugMessageType::Ddeath => "DDEATH",
            SparkplugMessageType::Ndata => "NDATA",
            SparkplugMessageType::Ddata => "DDATA",
            SparkplugMessageType::Ncmd => "NCMD",
            SparkplugMessageType::Dcmd => "DCMD",
        }
    }
}

impl std::fmt::Display for SparkplugMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sparkplug topic scheme bound to a group and edge node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkplugTopicScheme {
    /// Sparkplug group identifier
    pub group_id: String,
    /// Edge node identifier
    pub edge_node_id: String,
}

impl SparkplugTopicScheme {
    /// Create a scheme for the given group and edge node.
    #[must_use]
    pub fn new(group_id: impl Into<String>, edge_node_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            edge_node_id: edge_node_id.into(),
        }
    }

    /// Node-level topic (`NBIRTH`, `NDEATH`, `NDATA`, `NCMD`).
    #[must_use]
    pub fn node(&self, msg_type: SparkplugMessageType) -> String {
        format!(
            "{SPARKPLUG_NAMESPACE}/{}/{}/{}",
            self.group_id, msg_type, self.edge_node_id
        )
    }

    /// Device-level topic (`DBIRTH`, `DDEATH`, `DDATA`, `DCMD`).
    #[must_use]
    pub fn device(&self, msg_type: SparkplugMessageType, device_id: &str) -> String {
        format!(
            "{SPARKPLUG_NAMESPACE}/{}/{}/{}/{}",
            self.group_id, msg_type, self.edge_node_id, device_id
        )
    }
}

/// Retained-plane topic scheme with an optional root prefix.
#[derive(Debug, Clone, Default)]
pub struct RetainedTopicScheme {
    prefix: Option<String>,
}

impl RetainedTopicScheme {
    /// Create a scheme. An empty prefix means no prefix element.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        Self {
            prefix: (!trimmed.is_empty()).then(|| trimmed.to_string()),
        }
    }

    /// Compose the retained topic for a leaf record.
    ///
    /// Path segments are escaped here (`/`, `+`, `#` replaced) while staying
    /// verbatim in the record itself.
    #[must_use]
    pub fn topic(&self, address: &AssetAddress, record: &LeafRecord) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(record.path.len() + 8);
        if let Some(prefix) = &self.prefix {
            parts.push(prefix.clone());
        }
        parts.push(address.enterprise.clone());
        parts.push(address.site.clone());
        parts.push(address.area.clone());
        parts.push(address.line.clone());
        parts.push(address.asset.clone());
        parts.push("context".to_string());
        parts.push(sanitize_segment(&record.submodel_id_short));
        for segment in &record.path {
            parts.push(sanitize_segment(segment));
        }
        parts.join("/")
    }

    /// Subscription filter covering every command topic under this scheme.
    #[must_use]
    pub fn command_filter(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/+/+/+/+/+/context/#"),
            None => "+/+/+/+/+/context/#".to_string(),
        }
    }

    /// Parse a command topic (`…/context/{submodel}/{path…}/cmd`).
    ///
    /// Returns `None` for topics without the command suffix or with too few
    /// elements; responses (`…` without `/cmd`) never match.
    #[must_use]
    pub fn parse_command(&self, topic: &str) -> Option<CommandTopic> {
        let stripped = topic.strip_suffix(COMMAND_SUFFIX)?;
        let stripped = match &self.prefix {
            Some(prefix) => stripped.strip_prefix(&format!("{prefix}/"))?,
            None => stripped,
        };

        let parts: Vec<&str> = stripped.split('/').collect();
        // enterprise/site/area/line/asset/context/submodel/path...
        if parts.len() < 8 || parts[5] != "context" {
            return None;
        }

        Some(CommandTopic {
            address: AssetAddress {
                enterprise: parts[0].to_string(),
                site: parts[1].to_string(),
                area: parts[2].to_string(),
                line: parts[3].to_string(),
                asset: parts[4].to_string(),
            },
            submodel_id_short: parts[6].to_string(),
            path: parts[7..].iter().map(|s| (*s).to_string()).collect(),
            response_topic: topic
                .strip_suffix(COMMAND_SUFFIX)
                .unwrap_or(topic)
                .to_string(),
        })
    }
}

/// A parsed command topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    /// Hierarchy address the command targets
    pub address: AssetAddress,
    /// Submodel idShort element
    pub submodel_id_short: String,
    /// Property path segments (topic form)
    pub path: Vec<String>,
    /// Topic for the acknowledgement (`/cmd` removed)
    pub response_topic: String,
}

impl CommandTopic {
    /// Slash-joined property path.
    #[must_use]
    pub fn path_joined(&self) -> String {
        self.path.join("/")
    }

    /// `{submodel}/{path}` form matched against allow/deny patterns.
    #[must_use]
    pub fn rule_path(&self) -> String {
        format!("{}/{}", self.submodel_id_short, self.path_joined())
    }
}

/// Topic for a context dictionary entry.
#[must_use]
pub fn context_topic(dictionary: &str, hash: &str) -> String {
    format!("{CONTEXT_TOPIC_PREFIX}/{}/{hash}", sanitize_segment(dictionary))
}

/// Topic for a drift alert of an asset.
#[must_use]
pub fn drift_topic(asset_id: &str) -> String {
    format!(
        "{DRIFT_TOPIC_PREFIX}/{}",
        aas_uplink_core::sanitize::sanitize_asset_id(asset_id)
    )
}

/// Topic for a lifecycle event of an asset.
#[must_use]
pub fn lifecycle_topic(asset_id: &str) -> String {
    format!(
        "{LIFECYCLE_TOPIC_PREFIX}/{}",
        aas_uplink_core::sanitize::sanitize_asset_id(asset_id)
    )
}

/// Topic for a fidelity alert of an asset.
#[must_use]
pub fn fidelity_topic(asset_id: &str) -> String {
    format!(
        "{FIDELITY_TOPIC_PREFIX}/{}",
        aas_uplink_core::sanitize::sanitize_asset_id(asset_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use aas_uplink_core::{LeafKind, MetricValue};

    fn address() -> AssetAddress {
        AssetAddress {
            enterprise: "Acme".into(),
            site: "Plant1".into(),
            area: "Paint".into(),
            line: "Line4".into(),
            asset: "Robot7".into(),
        }
    }

    fn record(path: &[&str]) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:example:asset:robot7".into(),
            submodel_id: "urn:example:sm:tech".into(),
            submodel_id_short: "TechData".into(),
            path: path.iter().map(|s| (*s).to_string()).collect(),
            kind: LeafKind::Property,
            value: MetricValue::Int(1),
            value_type: "xs:int".into(),
            semantic_id: None,
            unit: None,
            submodel_semantic_id: None,
            source_timestamp_ms: 0,
            origin_uri: String::new(),
        }
    }

    #[test]
    fn sparkplug_topic_shapes() {
        let scheme = SparkplugTopicScheme::new("AAS", "Uplink");
        assert_eq!(scheme.node(SparkplugMessageType::Nbirth), "spBv1.0/AAS/NBIRTH/Uplink");
        assert_eq!(
            scheme.device(SparkplugMessageType::Ddata, "Robot7"),
            "spBv1.0/AAS/DDATA/Uplink/Robot7"
        );
    }

    #[test]
    fn retained_topic_composition() {
        let scheme = RetainedTopicScheme::new("");
        let topic = scheme.topic(&address(), &record(&["General", "Serial"]));
        assert_eq!(topic, "Acme/Plant1/Paint/Line4/Robot7/context/TechData/General/Serial");
    }

    #[test]
    fn retained_topic_with_prefix_and_escaping() {
        let scheme = RetainedTopicScheme::new("uns/");
        let topic = scheme.topic(&address(), &record(&["A/B", "C+D"]));
        assert_eq!(topic, "uns/Acme/Plant1/Paint/Line4/Robot7/context/TechData/A_B/C_D");
    }

    #[test]
    fn command_topic_roundtrip() {
        let scheme = RetainedTopicScheme::new("");
        let addr = address();
        let topic = scheme.topic(&addr, &record(&["Setpoints", "Target"]));
        let cmd = scheme.parse_command(&format!("{topic}/cmd")).unwrap();

        assert_eq!(cmd.address, addr);
        assert_eq!(cmd.submodel_id_short, "TechData");
        assert_eq!(cmd.path, vec!["Setpoints".to_string(), "Target".to_string()]);
        assert_eq!(cmd.response_topic, topic);
        assert_eq!(cmd.rule_path(), "TechData/Setpoints/Target");
    }

    #[test]
    fn command_parse_rejects_non_commands() {
        let scheme = RetainedTopicScheme::new("");
        assert!(scheme.parse_command("Acme/P/A/L/R/context/Tech/X").is_none());
        assert!(scheme.parse_command("Acme/P/context/Tech/X/cmd").is_none());
        assert!(scheme
            .parse_command("Acme/P/A/L/R/nontext/Tech/X/cmd")
            .is_none());
    }

    #[test]
    fn command_filter_shape() {
        assert_eq!(RetainedTopicScheme::new("").command_filter(), "+/+/+/+/+/context/#");
        assert_eq!(
            RetainedTopicScheme::new("uns").command_filter(),
            "uns/+/+/+/+/+/context/#"
        );
    }

    #[test]
    fn system_topics() {
        assert_eq!(context_topic("ECLASS", "a1b2"), "UNS/Sys/Context/ECLASS/a1b2");
        assert!(drift_topic("https://example.org/asset/1").starts_with("UNS/Sys/DriftAlerts/"));
        assert!(lifecycle_topic("urn:x:1").starts_with("UNS/Sys/Lifecycle/"));
    }
}
