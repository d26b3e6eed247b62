//! Sparkplug B payload construction and decoding.

use crate::sparkplug::{metric, property_value, Metric, Payload, PropertySet, PropertyValue};
use crate::types::{value_to_datatype, xsd_to_datatype, DataType};
use aas_uplink_core::{LeafRecord, MetricValue};
use prost::Message;

/// Name of the session-correlation metric carried by NBIRTH and NDEATH.
pub const BDSEQ_METRIC: &str = "bdSeq";

/// Name of the node-control rebirth metric announced in NBIRTH.
pub const REBIRTH_METRIC: &str = "Node Control/Rebirth";

/// Property keys attached to birth metrics for AAS metadata.
pub const PROP_SEMANTIC_ID: &str = "aas:semanticId";
/// Unit property key.
pub const PROP_UNIT: &str = "aas:unit";
/// Origin URI property key.
pub const PROP_ORIGIN: &str = "aas:originUri";

/// Errors for payload encode/decode.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// Protobuf decoding failed
    #[error("payload decode error: {0}")]
    Decode(String),
}

/// Builder for Sparkplug B payloads.
pub struct PayloadBuilder {
    payload: Payload,
}

impl PayloadBuilder {
    /// Create a builder with the given payload timestamp.
    #[must_use]
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            payload: Payload {
                timestamp: Some(timestamp_ms),
                metrics: Vec::new(),
                seq: None,
                uuid: None,
                body: None,
            },
        }
    }

    /// Set the session sequence number (wraps on transmit).
    #[must_use]
    pub fn seq(mut self, seq: u8) -> Self {
        self.payload.seq = Some(u64::from(seq));
        self
    }

    /// Add the `bdSeq` metric (transmitted as the low 8 bits of the
    /// persistent counter).
    #[must_use]
    pub fn bd_seq(mut self, bd_seq: u64) -> Self {
        self.payload.metrics.push(Metric {
            name: Some(BDSEQ_METRIC.to_string()),
            alias: None,
            timestamp: self.payload.timestamp,
            datatype: Some(DataType::Int64.as_u32()),
            is_historical: None,
            is_transient: None,
            is_null: None,
            properties: None,
            value: Some(metric::Value::LongValue(bd_seq % 256)),
        });
        self
    }

    /// Add the node-control rebirth metric (NBIRTH only).
    #[must_use]
    pub fn rebirth_control(mut self) -> Self {
        self.payload.metrics.push(Metric {
            name: Some(REBIRTH_METRIC.to_string()),
            alias: None,
            timestamp: self.payload.timestamp,
            datatype: Some(DataType::Boolean.as_u32()),
            is_historical: None,
            is_transient: None,
            is_null: None,
            properties: None,
            value: Some(metric::Value::BooleanValue(false)),
        });
        self
    }

    /// Add a full metric from a leaf record (birth messages: name + alias +
    /// metadata properties).
    #[must_use]
    pub fn birth_metric(mut self, record: &LeafRecord, alias: u64) -> Self {
        let datatype = resolved_datatype(record);
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for (key, value) in [
            (PROP_SEMANTIC_ID, record.semantic_id.as_deref()),
            (PROP_UNIT, record.unit.as_deref()),
            (PROP_ORIGIN, Some(record.origin_uri.as_str())),
        ] {
            let Some(value) = value else { continue };
            keys.push(key.to_string());
            values.push(PropertyValue {
                r#type: Some(DataType::String.as_u32()),
                is_null: Some(false),
                value: Some(property_value::Value::StringValue(value.to_string())),
            });
        }
        let properties =
            (!keys.is_empty()).then_some(PropertySet { keys, values });

        self.payload.metrics.push(Metric {
            name: Some(record.qualified_name()),
            alias: Some(alias),
            timestamp: Some(record.source_timestamp_ms.max(0) as u64),
            datatype: Some(datatype.as_u32()),
            is_historical: None,
            is_transient: None,
            is_null: Some(record.value.is_null()),
            properties,
            value: encode_value(&record.value, datatype),
        });
        self
    }

    /// Add an alias-only metric (data messages after birth).
    #[must_use]
    pub fn data_metric(mut self, record: &LeafRecord, alias: u64) -> Self {
        let datatype = resolved_datatype(record);
        self.payload.metrics.push(Metric {
            name: None,
            alias: Some(alias),
            timestamp: Some(record.source_timestamp_ms.max(0) as u64),
            datatype: Some(datatype.as_u32()),
            is_historical: None,
            is_transient: None,
            is_null: Some(record.value.is_null()),
            properties: None,
            value: encode_value(&record.value, datatype),
        });
        self
    }

    /// Number of metrics added so far.
    #[must_use]
    pub fn metric_count(&self) -> usize {
        self.payload.metrics.len()
    }

    /// Serialise to wire bytes.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.payload.encode_to_vec()
    }

    /// The raw payload, for tests and the birth cache.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

/// Build the NDEATH payload registered as the broker last-will.
///
/// Carries only the session `bdSeq`; NDEATH takes no `seq` field of its own
/// beyond the envelope default.
#[must_use]
pub fn ndeath_payload(bd_seq: u64, timestamp_ms: u64) -> Vec<u8> {
    PayloadBuilder::new(timestamp_ms).bd_seq(bd_seq).build()
}

/// Decode wire bytes to a payload.
///
/// # Errors
///
/// Returns error if the bytes are not a valid Sparkplug B payload.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, PayloadError> {
    Payload::decode(bytes).map_err(|e| PayloadError::Decode(e.to_string()))
}

/// Extract a metric's value as a [`MetricValue`], dispatching on the
/// datatype byte.
#[must_use]
pub fn decode_metric_value(metric: &Metric) -> MetricValue {
    if metric.is_null.unwrap_or(false) {
        return MetricValue::Null;
    }
    match &metric.value {
        None => MetricValue::Null,
        Some(metric::Value::IntValue(v)) => MetricValue::Int(i64::from(*v)),
        Some(metric::Value::LongValue(v)) => MetricValue::Int(*v as i64),
        Some(metric::Value::FloatValue(v)) => MetricValue::Float(f64::from(*v)),
        Some(metric::Value::DoubleValue(v)) => MetricValue::Float(*v),
        Some(metric::Value::BooleanValue(v)) => MetricValue::Bool(*v),
        Some(metric::Value::StringValue(v)) => MetricValue::Text(v.clone()),
        Some(metric::Value::BytesValue(v)) => MetricValue::Bytes(v.clone()),
    }
}

/// True when a decoded NCMD payload carries a rebirth request.
#[must_use]
pub fn is_rebirth_command(payload: &Payload) -> bool {
    payload.metrics.iter().any(|m| {
        m.name.as_deref() == Some(REBIRTH_METRIC)
            && matches!(m.value, Some(metric::Value::BooleanValue(true)))
    })
}

fn resolved_datatype(record: &LeafRecord) -> DataType {
    let from_xsd = xsd_to_datatype(&record.value_type);
    if from_xsd == DataType::String && !matches!(record.value, MetricValue::Text(_)) {
        // File/Blob carry MIME types here; fall back to the value shape.
        value_to_datatype(&record.value)
    } else {
        from_xsd
    }
}

fn encode_value(value: &MetricValue, datatype: DataType) -> Option<metric::Value> {
    match value {
        MetricValue::Null => None,
        MetricValue::Bool(b) => Some(metric::Value::BooleanValue(*b)),
        MetricValue::Int(i) => match datatype {
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::UInt8
            | DataType::UInt16 | DataType::UInt32 => {
                Some(metric::Value::IntValue(*i as u32))
            }
            _ => Some(metric::Value::LongValue(*i as u64)),
        },
        MetricValue::Float(f) => match datatype {
            DataType::Float => Some(metric::Value::FloatValue(*f as f32)),
            _ => Some(metric::Value::DoubleValue(*f)),
        },
        MetricValue::Text(s) => Some(metric::Value::StringValue(s.clone())),
        MetricValue::Bytes(b) => Some(metric::Value::BytesValue(b.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aas_uplink_core::LeafKind;

    fn record(path: &str, value: MetricValue, xsd: &str) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:example:asset:1".into(),
            submodel_id: "urn:example:sm:tech".into(),
            submodel_id_short: "TechData".into(),
            path: path.split('.').map(str::to_string).collect(),
            kind: LeafKind::Property,
            value,
            value_type: xsd.into(),
            semantic_id: Some("0173-1#02-AAO677#002".into()),
            unit: Some("degC".into()),
            submodel_semantic_id: None,
            source_timestamp_ms: 1_704_067_200_000,
            origin_uri: "file:///watch/pump.json".into(),
        }
    }

    #[test]
    fn encode_decode_roundtrip_preserves_metrics() {
        let bytes = PayloadBuilder::new(1_704_067_200_000)
            .seq(1)
            .birth_metric(&record("Serial", MetricValue::Text("AB123456".into()), "xs:string"), 0)
            .birth_metric(&record("Temp", MetricValue::Float(25.5), "xs:double"), 1)
            .build();

        let decoded = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.seq, Some(1));
        assert_eq!(decoded.metrics.len(), 2);

        assert_eq!(decoded.metrics[0].name.as_deref(), Some("TechData.Serial"));
        assert_eq!(decoded.metrics[0].alias, Some(0));
        assert_eq!(
            decode_metric_value(&decoded.metrics[0]),
            MetricValue::Text("AB123456".into())
        );

        assert_eq!(decoded.metrics[1].alias, Some(1));
        assert_eq!(decode_metric_value(&decoded.metrics[1]), MetricValue::Float(25.5));
        assert_eq!(
            decoded.metrics[1].datatype,
            Some(DataType::Double.as_u32())
        );
    }

    #[test]
    fn birth_metric_carries_metadata_properties() {
        let bytes = PayloadBuilder::new(1)
            .birth_metric(&record("Temp", MetricValue::Float(25.5), "xs:double"), 4)
            .build();
        let decoded = decode_payload(&bytes).unwrap();
        let props = decoded.metrics[0].properties.as_ref().unwrap();
        assert!(props.keys.contains(&PROP_SEMANTIC_ID.to_string()));
        assert!(props.keys.contains(&PROP_UNIT.to_string()));
        assert_eq!(props.keys.len(), props.values.len());
    }

    #[test]
    fn data_metric_is_alias_only() {
        let bytes = PayloadBuilder::new(1)
            .seq(2)
            .data_metric(&record("Temp", MetricValue::Float(26.0), "xs:double"), 1)
            .build();
        let decoded = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.metrics[0].name, None);
        assert_eq!(decoded.metrics[0].alias, Some(1));
        assert!(decoded.metrics[0].properties.is_none());
    }

    #[test]
    fn bdseq_wraps_on_transmit() {
        let decoded = decode_payload(&ndeath_payload(257, 1)).unwrap();
        let bd = decoded
            .metrics
            .iter()
            .find(|m| m.name.as_deref() == Some(BDSEQ_METRIC))
            .unwrap();
        assert_eq!(decode_metric_value(bd), MetricValue::Int(1));
    }

    #[test]
    fn rebirth_command_detection() {
        let mut payload = Payload {
            timestamp: Some(1),
            metrics: vec![Metric {
                name: Some(REBIRTH_METRIC.to_string()),
                alias: None,
                timestamp: Some(1),
                datatype: Some(DataType::Boolean.as_u32()),
                is_historical: None,
                is_transient: None,
                is_null: None,
                properties: None,
                value: Some(metric::Value::BooleanValue(true)),
            }],
            seq: None,
            uuid: None,
            body: None,
        };
        assert!(is_rebirth_command(&payload));

        payload.metrics[0].value = Some(metric::Value::BooleanValue(false));
        assert!(!is_rebirth_command(&payload));
    }

    #[test]
    fn null_value_roundtrip() {
        let bytes = PayloadBuilder::new(1)
            .birth_metric(&record("Empty", MetricValue::Null, "xs:string"), 9)
            .build();
        let decoded = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.metrics[0].is_null, Some(true));
        assert_eq!(decode_metric_value(&decoded.metrics[0]), MetricValue::Null);
    }
}
