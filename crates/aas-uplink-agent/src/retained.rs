//! Retained-plane publisher.
//!
//! Composes the per-property JSON payload (inline, pointer or hybrid mode),
//! deduplicates against the persisted payload-identity hash, and hands
//! changed payloads to the broker worker with the retain flag set. The
//! identity hash covers every payload field except the volatile timestamp,
//! so restarting on unchanged content republishes nothing.

use crate::config::{PayloadMode, UnsConfig};
use aas_uplink_core::{AssetAddress, LeafRecord};
use aas_uplink_proto::RetainedTopicScheme;
use aas_uplink_semantic::ContextPointer;
use aas_uplink_state::{HashStore, StateError};
use sha2::{Digest, Sha256};

/// Identifier stamped into the payload `source` field.
pub const SOURCE_NAME: &str = "aas-uplink";

/// A composed retained publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedPublish {
    /// Topic, retain true
    pub topic: String,
    /// UTF-8 JSON payload
    pub payload: Vec<u8>,
}

/// Retained publisher over the dedupe store.
pub struct RetainedPublisher {
    config: UnsConfig,
    scheme: RetainedTopicScheme,
    hashes: HashStore,
}

impl RetainedPublisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(config: UnsConfig, hashes: HashStore) -> Self {
        let scheme = RetainedTopicScheme::new(&config.root_topic);
        Self {
            config,
            scheme,
            hashes,
        }
    }

    /// The topic scheme, for command-topic parsing and target registration.
    #[must_use]
    pub fn scheme(&self) -> &RetainedTopicScheme {
        &self.scheme
    }

    /// Compose the topic for a record without publishing.
    #[must_use]
    pub fn topic(&self, address: &AssetAddress, record: &LeafRecord) -> String {
        self.scheme.topic(address, record)
    }

    /// Compose, dedupe and emit one record onto its (precomposed) topic.
    ///
    /// Returns `None` when the payload identity matches the stored hash for
    /// the topic (the publish is skipped); otherwise the store is updated
    /// and the publish returned.
    ///
    /// # Errors
    ///
    /// Returns error if the hash store fails.
    pub fn publish(
        &mut self,
        topic: &str,
        record: &LeafRecord,
        pointer: Option<&ContextPointer>,
    ) -> Result<Option<RetainedPublish>, StateError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let topic = topic.to_string();
        let (payload, identity) = compose_payload(record, pointer, self.config.payload_mode);

        if !self.hashes.has_changed(&topic, &identity) {
            tracing::trace!(topic, "Payload unchanged, skipping retained publish");
            return Ok(None);
        }

        self.hashes.update(&topic, &identity)?;
        Ok(Some(RetainedPublish { topic, payload }))
    }

    /// Forget the stored hash for a topic whose retained state was cleared.
    ///
    /// # Errors
    ///
    /// Returns error if the hash store fails.
    pub fn forget(&mut self, topic: &str) -> Result<(), StateError> {
        self.hashes.forget(topic)
    }

    /// Number of deduplicated topics.
    #[must_use]
    pub fn tracked_topics(&self) -> usize {
        self.hashes.len()
    }

    /// Hash-store evictions since open.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.hashes.evictions()
    }
}

/// Build the payload bytes and the identity hash for a record.
///
/// The identity hash is the SHA-256 over the payload with the `timestamp`
/// field removed: equal content maps to equal identity across restarts.
#[must_use]
pub fn compose_payload(
    record: &LeafRecord,
    pointer: Option<&ContextPointer>,
    mode: PayloadMode,
) -> (Vec<u8>, String) {
    let mut fields = serde_json::Map::new();
    fields.insert("value".to_string(), record.value.to_json());
    fields.insert(
        "timestamp".to_string(),
        serde_json::Value::from(record.source_timestamp_ms),
    );

    let inline = matches!(mode, PayloadMode::Inline | PayloadMode::Hybrid)
        || (matches!(mode, PayloadMode::Pointer) && pointer.is_none());
    if inline {
        fields.insert(
            "semanticId".to_string(),
            record
                .semantic_id
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::from),
        );
        fields.insert(
            "unit".to_string(),
            record
                .unit
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::from),
        );
        fields.insert("source".to_string(), serde_json::Value::from(SOURCE_NAME));
        fields.insert(
            "originUri".to_string(),
            serde_json::Value::from(record.origin_uri.clone()),
        );
    }
    if let (Some(pointer), PayloadMode::Pointer | PayloadMode::Hybrid) = (pointer, mode) {
        fields.insert("ctx".to_string(), serde_json::Value::from(pointer.hash.clone()));
    }

    let payload = serde_json::Value::Object(fields.clone()).to_string().into_bytes();

    fields.remove("timestamp");
    let identity_input = serde_json::Value::Object(fields).to_string();
    let mut hasher = Sha256::new();
    hasher.update(identity_input.as_bytes());
    let identity = format!("{:x}", hasher.finalize());

    (payload, identity)
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

    fn record(value: MetricValue, timestamp_ms: i64) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:example:asset:robot7".into(),
            submodel_id: "urn:example:sm:tech".into(),
            submodel_id_short: "TechData".into(),
            path: vec!["Temp".into()],
            kind: LeafKind::Property,
            value,
            value_type: "xs:double".into(),
            semantic_id: Some("0173-1#02-AAO677#002".into()),
            unit: Some("degC".into()),
            submodel_semantic_id: None,
            source_timestamp_ms: timestamp_ms,
            origin_uri: "file:///watch/robot.json".into(),
        }
    }

    fn publisher(mode: PayloadMode) -> RetainedPublisher {
        let config = UnsConfig {
            payload_mode: mode,
            ..Default::default()
        };
        RetainedPublisher::new(config, HashStore::in_memory().unwrap())
    }

    #[test]
    fn inline_payload_has_all_fields() {
        let (payload, _) = compose_payload(&record(MetricValue::Float(25.5), 42), None, PayloadMode::Inline);
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["value"], 25.5);
        assert_eq!(parsed["timestamp"], 42);
        assert_eq!(parsed["semanticId"], "0173-1#02-AAO677#002");
        assert_eq!(parsed["unit"], "degC");
        assert_eq!(parsed["source"], SOURCE_NAME);
        assert_eq!(parsed["originUri"], "file:///watch/robot.json");
        assert!(parsed.get("ctx").is_none());
    }

    #[test]
    fn pointer_payload_is_minimal() {
        let pointer = ContextPointer {
            hash: "a1b2c3d4e5f60718".into(),
            dictionary: "ECLASS".into(),
        };
        let (payload, _) =
            compose_payload(&record(MetricValue::Float(25.5), 42), Some(&pointer), PayloadMode::Pointer);
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["ctx"], "a1b2c3d4e5f60718");
        assert!(parsed.get("semanticId").is_none());
        assert!(parsed.get("source").is_none());
    }

    #[test]
    fn hybrid_payload_has_fields_and_pointer() {
        let pointer = ContextPointer {
            hash: "a1b2c3d4e5f60718".into(),
            dictionary: "ECLASS".into(),
        };
        let (payload, _) =
            compose_payload(&record(MetricValue::Float(25.5), 42), Some(&pointer), PayloadMode::Hybrid);
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["ctx"], "a1b2c3d4e5f60718");
        assert_eq!(parsed["semanticId"], "0173-1#02-AAO677#002");
    }

    #[test]
    fn pointer_mode_without_pointer_falls_back_to_inline() {
        let (payload, _) = compose_payload(&record(MetricValue::Float(1.0), 1), None, PayloadMode::Pointer);
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["semanticId"], "0173-1#02-AAO677#002");
    }

    #[test]
    fn identity_ignores_timestamp() {
        let (_, first) = compose_payload(&record(MetricValue::Float(25.5), 1), None, PayloadMode::Inline);
        let (_, second) = compose_payload(&record(MetricValue::Float(25.5), 2), None, PayloadMode::Inline);
        let (_, third) = compose_payload(&record(MetricValue::Float(26.0), 2), None, PayloadMode::Inline);
        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn unchanged_value_is_skipped_changed_value_published() {
        let mut publisher = publisher(PayloadMode::Inline);
        let addr = address();
        let topic = publisher.topic(&addr, &record(MetricValue::Float(25.5), 1));
        assert_eq!(topic, "Acme/Plant1/Paint/Line4/Robot7/context/TechData/Temp");

        let first = publisher
            .publish(&topic, &record(MetricValue::Float(25.5), 1), None)
            .unwrap();
        assert!(first.is_some());

        // Same value, later timestamp: deduplicated.
        let second = publisher
            .publish(&topic, &record(MetricValue::Float(25.5), 99), None)
            .unwrap();
        assert!(second.is_none());

        // Changed value: published.
        let third = publisher
            .publish(&topic, &record(MetricValue::Float(26.0), 100), None)
            .unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn consecutive_publishes_differ_in_bytes() {
        let mut publisher = publisher(PayloadMode::Inline);
        let addr = address();
        let topic = publisher.topic(&addr, &record(MetricValue::Float(25.5), 1));
        let first = publisher
            .publish(&topic, &record(MetricValue::Float(25.5), 1), None)
            .unwrap()
            .unwrap();
        let second = publisher
            .publish(&topic, &record(MetricValue::Float(26.0), 1), None)
            .unwrap()
            .unwrap();
        assert_ne!(first.payload, second.payload);
    }

    #[test]
    fn disabled_plane_publishes_nothing() {
        let config = UnsConfig {
            enabled: false,
            ..Default::default()
        };
        let mut publisher = RetainedPublisher::new(config, HashStore::in_memory().unwrap());
        let out = publisher
            .publish("a/b", &record(MetricValue::Float(1.0), 1), None)
            .unwrap();
        assert!(out.is_none());
    }
}
