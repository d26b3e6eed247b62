//! Schema-drift detection against stored fingerprints.
//!
//! Per asset, the stored fingerprint is the set of `(path, value_type)`
//! pairs (plus unit and semantic id) of the most recent full snapshot.
//! Diffing a new snapshot yields `metric_added`, `metric_removed` and
//! `type_changed` events, emitted as JSON alerts on
//! `UNS/Sys/DriftAlerts/{assetId}`.

use aas_uplink_core::LeafRecord;
use aas_uplink_state::{FingerprintRow, SemanticStore, StateError};
use serde::Deserialize;
use std::collections::HashMap;

/// Alert severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Low,
    /// Worth monitoring
    Medium,
    /// Needs attention
    High,
    /// Needs action
    Critical,
}

impl Severity {
    /// Wire name of the severity.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Kinds of schema drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftEventType {
    /// A metric appeared that the stored fingerprint lacks
    MetricAdded,
    /// A fingerprinted metric disappeared
    MetricRemoved,
    /// A metric's value type changed
    TypeChanged,
    /// A streaming value anomaly (emitted by the streaming detector)
    ValueAnomaly,
}

impl DriftEventType {
    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftEventType::MetricAdded => "metric_added",
            DriftEventType::MetricRemoved => "metric_removed",
            DriftEventType::TypeChanged => "type_changed",
            DriftEventType::ValueAnomaly => "value_anomaly",
        }
    }
}

/// Drift detection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DriftRules {
    /// Master switch
    pub enabled: bool,
    /// Severity of `metric_added`
    pub added_severity: Severity,
    /// Severity of `metric_removed`
    pub removed_severity: Severity,
    /// Severity of `type_changed`
    pub type_changed_severity: Severity,
}

impl Default for DriftRules {
    fn default() -> Self {
        // Removal breaks downstream consumers, type changes corrupt them,
        // additions are benign.
        Self {
            enabled: true,
            added_severity: Severity::Low,
            removed_severity: Severity::High,
            type_changed_severity: Severity::Medium,
        }
    }
}

/// A detected drift event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftEvent {
    /// Event kind
    pub event_type: DriftEventType,
    /// Affected asset
    pub asset_id: String,
    /// Affected metric path (dot form)
    pub metric_path: String,
    /// Detection time (Unix ms)
    pub timestamp_ms: i64,
    /// Configured severity
    pub severity: Severity,
}

impl DriftEvent {
    /// JSON alert payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "type": self.event_type.as_str(),
            "asset_id": self.asset_id,
            "metric_path": self.metric_path,
            "timestamp": self.timestamp_ms,
            "severity": self.severity.as_str(),
        });
        value.to_string().into_bytes()
    }
}

/// Fingerprint-based drift detector.
pub struct DriftDetector {
    rules: DriftRules,
}

impl DriftDetector {
    /// Create a detector.
    #[must_use]
    pub fn new(rules: DriftRules) -> Self {
        Self { rules }
    }

    /// True when detection is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.rules.enabled
    }

    /// Diff a full snapshot against the stored fingerprint and replace it.
    ///
    /// The first snapshot of an asset establishes the fingerprint without
    /// emitting events.
    ///
    /// # Errors
    ///
    /// Returns error if the fingerprint store fails.
    pub fn observe_snapshot(
        &self,
        store: &mut SemanticStore,
        asset_id: &str,
        records: &[LeafRecord],
        timestamp_ms: i64,
    ) -> Result<Vec<DriftEvent>, StateError> {
        if !self.rules.enabled {
            return Ok(Vec::new());
        }

        let current: HashMap<String, FingerprintRow> = records
            .iter()
            .map(|r| {
                let path = r.qualified_name();
                (
                    path.clone(),
                    FingerprintRow {
                        path,
                        value_type: r.value_type.clone(),
                        unit: r.unit.clone(),
                        semantic_id: r.semantic_id.clone(),
                    },
                )
            })
            .collect();

        let stored = store.fingerprints(asset_id)?;
        let mut events = Vec::new();

        if !stored.is_empty() {
            for path in current.keys() {
                if !stored.contains_key(path) {
                    events.push(DriftEvent {
                        event_type: DriftEventType::MetricAdded,
                        asset_id: asset_id.to_string(),
                        metric_path: path.clone(),
                        timestamp_ms,
                        severity: self.rules.added_severity,
                    });
                }
            }
            for path in stored.keys() {
                if !current.contains_key(path) {
                    events.push(DriftEvent {
                        event_type: DriftEventType::MetricRemoved,
                        asset_id: asset_id.to_string(),
                        metric_path: path.clone(),
                        timestamp_ms,
                        severity: self.rules.removed_severity,
                    });
                }
            }
            for (path, row) in &current {
                let Some(previous) = stored.get(path) else { continue };
                if previous.value_type != row.value_type {
                    events.push(DriftEvent {
                        event_type: DriftEventType::TypeChanged,
                        asset_id: asset_id.to_string(),
                        metric_path: path.clone(),
                        timestamp_ms,
                        severity: self.rules.type_changed_severity,
                    });
                }
            }
            // Stable event order for identical inputs.
            events.sort_by(|a, b| {
                (a.event_type.as_str(), &a.metric_path).cmp(&(b.event_type.as_str(), &b.metric_path))
            });
        }

        let rows: Vec<FingerprintRow> = current.into_values().collect();
        store.replace_fingerprints(asset_id, &rows)?;

        if !events.is_empty() {
            tracing::info!(asset_id, events = events.len(), "Schema drift detected");
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aas_uplink_core::{LeafKind, MetricValue};

    fn record(path: &str, value_type: &str) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:x:asset".into(),
            submodel_id: "urn:x:sm".into(),
            submodel_id_short: "Tech".into(),
            path: path.split('.').map(str::to_string).collect(),
            kind: LeafKind::Property,
            value: MetricValue::Int(1),
            value_type: value_type.into(),
            semantic_id: None,
            unit: None,
            submodel_semantic_id: None,
            source_timestamp_ms: 0,
            origin_uri: String::new(),
        }
    }

    #[test]
    fn first_snapshot_emits_nothing() {
        let mut store = SemanticStore::in_memory().unwrap();
        let detector = DriftDetector::new(DriftRules::default());
        let events = detector
            .observe_snapshot(&mut store, "asset1", &[record("Temp", "xs:double")], 1)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn added_removed_and_type_changed() {
        let mut store = SemanticStore::in_memory().unwrap();
        let detector = DriftDetector::new(DriftRules::default());

        detector
            .observe_snapshot(
                &mut store,
                "asset1",
                &[record("Temp", "xs:double"), record("Serial", "xs:string")],
                1,
            )
            .unwrap();

        let events = detector
            .observe_snapshot(
                &mut store,
                "asset1",
                &[record("Temp", "xs:int"), record("Pressure", "xs:double")],
                2,
            )
            .unwrap();

        let kinds: Vec<(&str, &str)> = events
            .iter()
            .map(|e| (e.event_type.as_str(), e.metric_path.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("metric_added", "Tech.Pressure"),
                ("metric_removed", "Tech.Serial"),
                ("type_changed", "Tech.Temp"),
            ]
        );
        assert_eq!(events[1].severity, Severity::High);
        assert_eq!(events[2].severity, Severity::Medium);
    }

    #[test]
    fn alert_payload_shape() {
        let event = DriftEvent {
            event_type: DriftEventType::MetricRemoved,
            asset_id: "asset1".into(),
            metric_path: "Temp".into(),
            timestamp_ms: 42,
            severity: Severity::High,
        };
        let parsed: serde_json::Value = serde_json::from_slice(&event.to_payload()).unwrap();
        assert_eq!(parsed["type"], "metric_removed");
        assert_eq!(parsed["severity"], "high");
        assert_eq!(parsed["asset_id"], "asset1");
        assert_eq!(parsed["timestamp"], 42);
    }

    #[test]
    fn unchanged_snapshot_is_quiet() {
        let mut store = SemanticStore::in_memory().unwrap();
        let detector = DriftDetector::new(DriftRules::default());
        let snapshot = [record("Temp", "xs:double")];
        detector.observe_snapshot(&mut store, "asset1", &snapshot, 1).unwrap();
        let events = detector.observe_snapshot(&mut store, "asset1", &snapshot, 2).unwrap();
        assert!(events.is_empty());
    }
}
