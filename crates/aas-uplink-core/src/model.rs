//! Core domain model: leaf records, value union, asset addresses.
//!
//! A [`LeafRecord`] is one observable leaf of an AAS submodel, flattened for
//! publication. It is ephemeral: created by traversal, consumed within one
//! pipeline pass. The [`AssetAddress`] is memoised per asset URI by the
//! mapping layer.

use serde::{Deserialize, Serialize};

/// The AAS element kind a leaf record was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeafKind {
    /// A single-valued property (includes multi-language properties)
    Property,
    /// One bound of a Range element (`min` or `max` path suffix)
    Range,
    /// A reference element carrying its target reference string
    ReferenceElement,
    /// An entity element (entityType / globalAssetId synthetic leaves)
    Entity,
    /// A relationship element carrying `first -> second` references
    Relationship,
    /// A file reference (path value, MIME type in `value_type`)
    File,
    /// A blob (content hash value, MIME type in `value_type`)
    Blob,
}

impl LeafKind {
    /// Stable name used in validation config and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafKind::Property => "Property",
            LeafKind::Range => "Range",
            LeafKind::ReferenceElement => "ReferenceElement",
            LeafKind::Entity => "Entity",
            LeafKind::Relationship => "Relationship",
            LeafKind::File => "File",
            LeafKind::Blob => "Blob",
        }
    }
}

impl std::fmt::Display for LeafKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged value union for leaf records.
///
/// Replaces the runtime-typed values of AAS content with an explicit variant
/// set; encoders dispatch on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Absent or null value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// IEEE double
    Float(f64),
    /// Text
    Text(String),
    /// Raw bytes (blob content hashes are carried as Text, not Bytes)
    Bytes(Vec<u8>),
}

impl MetricValue {
    /// True when the value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, MetricValue::Null)
    }

    /// Numeric view, for validation range checks and drift featurisation.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Textual view, for pattern constraints.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetricValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convert to a JSON value for retained-plane payloads.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetricValue::Null => serde_json::Value::Null,
            MetricValue::Bool(b) => serde_json::Value::from(*b),
            MetricValue::Int(i) => serde_json::Value::from(*i),
            MetricValue::Float(f) => serde_json::Value::from(*f),
            MetricValue::Text(s) => serde_json::Value::from(s.clone()),
            MetricValue::Bytes(b) => {
                serde_json::Value::from(b.iter().map(|x| format!("{x:02x}")).collect::<String>())
            }
        }
    }

    /// Build a value from a JSON payload field (command path).
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => MetricValue::Null,
            serde_json::Value::Bool(b) => MetricValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetricValue::Int(i)
                } else {
                    MetricValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => MetricValue::Text(s.clone()),
            other => MetricValue::Text(other.to_string()),
        }
    }
}

/// One observable leaf of an AAS submodel.
///
/// Uniqueness: `(asset_uri, submodel_id, path)` is unique within a snapshot.
/// `path` is non-empty; segments are preserved verbatim and only escaped when
/// composing topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafRecord {
    /// Globally unique identifier of the containing asset
    pub asset_uri: String,
    /// Identifier of the submodel within the asset
    pub submodel_id: String,
    /// idShort of the submodel (first topic segment under `context/`)
    pub submodel_id_short: String,
    /// Navigation from submodel root to leaf
    pub path: Vec<String>,
    /// Element kind the leaf was derived from
    pub kind: LeafKind,
    /// The leaf value
    pub value: MetricValue,
    /// XSD-style primitive type name (e.g. `xs:double`), or MIME type for File/Blob
    pub value_type: String,
    /// Primary semantic identifier (IRDI or IRI), if any
    pub semantic_id: Option<String>,
    /// Unit of measurement, if any
    pub unit: Option<String>,
    /// Semantic identifier of the parent submodel, if any
    pub submodel_semantic_id: Option<String>,
    /// Milliseconds since epoch at extraction
    pub source_timestamp_ms: i64,
    /// Where this leaf came from: file path or repository URL
    pub origin_uri: String,
}

impl LeafRecord {
    /// Dot-joined path below the submodel root.
    #[must_use]
    pub fn metric_name(&self) -> String {
        self.path.join(".")
    }

    /// Submodel-qualified name, unique per asset. Used as the Sparkplug
    /// metric name and the drift-fingerprint key, where leaves of different
    /// submodels share one namespace.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.submodel_id_short, self.path.join("."))
    }
}

/// ISA-95 hierarchy address of an asset.
///
/// All five segments are non-empty and topic-safe: no segment contains
/// `/`, `+` or `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetAddress {
    /// Level 4: enterprise
    pub enterprise: String,
    /// Level 3: site / plant
    pub site: String,
    /// Level 2: area
    pub area: String,
    /// Level 1: production line
    pub line: String,
    /// Equipment identifier within the line
    pub asset: String,
}

impl AssetAddress {
    /// Slash-joined hierarchy prefix.
    #[must_use]
    pub fn topic_prefix(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.enterprise, self.site, self.area, self.line, self.asset
        )
    }
}

impl std::fmt::Display for AssetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.topic_prefix())
    }
}

/// Error event emitted for a malformed element during traversal.
///
/// Traversal never aborts on a single element; the event identifies the spot
/// and processing continues with siblings.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed element at {asset_uri}/{submodel_id}/{}: {reason}", .path.join("."))]
pub struct TraversalError {
    /// Asset the element belongs to
    pub asset_uri: String,
    /// Submodel the element belongs to
    pub submodel_id: String,
    /// Path walked so far
    pub path: Vec<String>,
    /// What was wrong
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_value_numeric_views() {
        assert_eq!(MetricValue::Int(42).as_f64(), Some(42.0));
        assert_eq!(MetricValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(MetricValue::Text("x".into()).as_f64(), None);
        assert!(MetricValue::Null.is_null());
    }

    #[test]
    fn metric_value_json_roundtrip() {
        let v = MetricValue::from_json(&serde_json::json!(26.0));
        assert_eq!(v, MetricValue::Float(26.0));
        assert_eq!(v.to_json(), serde_json::json!(26.0));

        let v = MetricValue::from_json(&serde_json::json!("AB123456"));
        assert_eq!(v.to_json(), serde_json::json!("AB123456"));
    }

    #[test]
    fn address_topic_prefix() {
        let addr = AssetAddress {
            enterprise: "Acme".into(),
            site: "Plant1".into(),
            area: "Paint".into(),
            line: "Line4".into(),
            asset: "Robot7".into(),
        };
        assert_eq!(addr.topic_prefix(), "Acme/Plant1/Paint/Line4/Robot7");
    }

    #[test]
    fn metric_name_joins_path() {
        let record = LeafRecord {
            asset_uri: "urn:example:asset:1".into(),
            submodel_id: "urn:example:sm:tech".into(),
            submodel_id_short: "TechData".into(),
            path: vec!["General".into(), "Serial".into()],
            kind: LeafKind::Property,
            value: MetricValue::Text("AB123456".into()),
            value_type: "xs:string".into(),
            semantic_id: None,
            unit: None,
            submodel_semantic_id: None,
            source_timestamp_ms: 0,
            origin_uri: "file:///tmp/a.json".into(),
        };
        assert_eq!(record.metric_name(), "General.Serial");
    }
}
