//! Fidelity scoring of the AAS-to-broker transformation.
//!
//! Three scores per snapshot per asset, each in [0, 1]:
//! - structural: fraction of AAS leaves that reached a publisher
//! - semantic: fraction of published leaves keeping a non-null semantic id
//! - entropy: one minus the normalised Shannon-entropy loss between the
//!   source value distribution and the published value distribution
//!
//! The overall score is the configured weighted mean; scores below the alert
//! threshold emit an alert event.

use aas_uplink_core::LeafRecord;
use aas_uplink_state::{SemanticStore, StateError};
use serde::Deserialize;
use std::collections::HashMap;

/// Fidelity configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FidelityRules {
    /// Master switch
    pub enabled: bool,
    /// Weight of the structural score
    pub structural_weight: f64,
    /// Weight of the semantic score
    pub semantic_weight: f64,
    /// Weight of the entropy score
    pub entropy_weight: f64,
    /// Overall scores below this emit an alert
    pub alert_threshold: f64,
}

impl Default for FidelityRules {
    fn default() -> Self {
        Self {
            enabled: false,
            structural_weight: 0.3,
            semantic_weight: 0.5,
            entropy_weight: 0.2,
            alert_threshold: 0.6,
        }
    }
}

/// Fidelity report for one snapshot of one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct FidelityReport {
    /// The asset evaluated
    pub asset_id: String,
    /// Weighted mean of the three scores
    pub overall: f64,
    /// Fraction of source leaves that reached a publisher
    pub structural: f64,
    /// Fraction of published leaves with a semantic id
    pub semantic: f64,
    /// One minus normalised entropy loss
    pub entropy: f64,
    /// Number of published leaves
    pub metric_count: usize,
    /// True when `overall` fell below the alert threshold
    pub alert: bool,
}

impl FidelityReport {
    /// JSON alert payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "asset_id": self.asset_id,
            "overall": self.overall,
            "structural": self.structural,
            "semantic": self.semantic,
            "entropy": self.entropy,
            "metric_count": self.metric_count,
        });
        value.to_string().into_bytes()
    }
}

/// Fidelity calculator.
pub struct FidelityCalculator {
    rules: FidelityRules,
}

impl FidelityCalculator {
    /// Create a calculator.
    #[must_use]
    pub fn new(rules: FidelityRules) -> Self {
        Self { rules }
    }

    /// True when scoring is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.rules.enabled
    }

    /// Score one snapshot: `source` is every leaf the traversal produced
    /// (errors excluded), `published` the subset that reached a publisher.
    ///
    /// The report is appended to the persistent fidelity history.
    ///
    /// # Errors
    ///
    /// Returns error if the history cannot be written.
    pub fn score_snapshot(
        &self,
        store: &mut SemanticStore,
        asset_id: &str,
        source_count: usize,
        published: &[LeafRecord],
    ) -> Result<FidelityReport, StateError> {
        let structural = if source_count == 0 {
            1.0
        } else {
            (published.len() as f64 / source_count as f64).clamp(0.0, 1.0)
        };

        let semantic = if published.is_empty() {
            1.0
        } else {
            published.iter().filter(|r| r.semantic_id.is_some()).count() as f64
                / published.len() as f64
        };

        let entropy = entropy_retention(published, source_count);

        let weight_sum =
            self.rules.structural_weight + self.rules.semantic_weight + self.rules.entropy_weight;
        let overall = if weight_sum <= 0.0 {
            1.0
        } else {
            (self.rules.structural_weight * structural
                + self.rules.semantic_weight * semantic
                + self.rules.entropy_weight * entropy)
                / weight_sum
        };

        let report = FidelityReport {
            asset_id: asset_id.to_string(),
            overall,
            structural,
            semantic,
            entropy,
            metric_count: published.len(),
            alert: overall < self.rules.alert_threshold,
        };

        store.append_fidelity(
            asset_id,
            report.overall,
            report.structural,
            report.semantic,
            report.entropy,
            report.metric_count,
        )?;

        if report.alert {
            tracing::warn!(
                asset_id,
                overall = report.overall,
                threshold = self.rules.alert_threshold,
                "Fidelity below threshold"
            );
        }
        Ok(report)
    }
}

/// Shannon entropy of the value distribution, in bits.
fn value_entropy(values: impl Iterator<Item = String>) -> (f64, usize) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return (0.0, 0);
    }
    let entropy = counts
        .values()
        .map(|&count| {
            let p = count as f64 / total as f64;
            -p * p.log2()
        })
        .sum();
    (entropy, total)
}

/// One minus the normalised entropy loss between source and published value
/// distributions.
///
/// The published set is a subset of the source leaves, so the source
/// distribution's entropy is bounded by `log2(source_count)`; dropping
/// distinct values loses information proportionally.
fn entropy_retention(published: &[LeafRecord], source_count: usize) -> f64 {
    if source_count == 0 || published.is_empty() {
        return 1.0;
    }

    let (published_entropy, _) =
        value_entropy(published.iter().map(|r| r.value.to_json().to_string()));
    let max_entropy = (source_count as f64).log2();
    if max_entropy <= 0.0 {
        return 1.0;
    }

    // Full retention when the published set is as diverse as a complete
    // snapshot could be; the loss grows as distinct values disappear.
    let distinct_possible = (published.len() as f64).log2().max(0.0);
    if distinct_possible <= 0.0 {
        return 1.0;
    }
    (published_entropy / distinct_possible).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aas_uplink_core::{LeafKind, MetricValue};

    fn record(path: &str, value: MetricValue, semantic: bool) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:x:asset".into(),
            submodel_id: "urn:x:sm".into(),
            submodel_id_short: "Tech".into(),
            path: vec![path.to_string()],
            kind: LeafKind::Property,
            value,
            value_type: "xs:string".into(),
            semantic_id: semantic.then(|| "sem:x".to_string()),
            unit: None,
            submodel_semantic_id: None,
            source_timestamp_ms: 0,
            origin_uri: String::new(),
        }
    }

    fn calculator() -> FidelityCalculator {
        FidelityCalculator::new(FidelityRules {
            enabled: true,
            ..Default::default()
        })
    }

    #[test]
    fn perfect_passthrough_scores_high() {
        let mut store = SemanticStore::in_memory().unwrap();
        let published = vec![
            record("a", MetricValue::Text("x".into()), true),
            record("b", MetricValue::Text("y".into()), true),
        ];
        let report = calculator()
            .score_snapshot(&mut store, "asset1", 2, &published)
            .unwrap();
        assert!((report.structural - 1.0).abs() < 1e-9);
        assert!((report.semantic - 1.0).abs() < 1e-9);
        assert!(report.overall > 0.9);
        assert!(!report.alert);
    }

    #[test]
    fn dropped_leaves_lower_structural_score() {
        let mut store = SemanticStore::in_memory().unwrap();
        let published = vec![record("a", MetricValue::Int(1), true)];
        let report = calculator()
            .score_snapshot(&mut store, "asset1", 4, &published)
            .unwrap();
        assert!((report.structural - 0.25).abs() < 1e-9);
    }

    #[test]
    fn missing_semantic_ids_lower_semantic_score() {
        let mut store = SemanticStore::in_memory().unwrap();
        let published = vec![
            record("a", MetricValue::Int(1), true),
            record("b", MetricValue::Int(2), false),
        ];
        let report = calculator()
            .score_snapshot(&mut store, "asset1", 2, &published)
            .unwrap();
        assert!((report.semantic - 0.5).abs() < 1e-9);
    }

    #[test]
    fn poor_snapshot_raises_alert_and_persists() {
        let mut store = SemanticStore::in_memory().unwrap();
        let published = vec![record("a", MetricValue::Int(1), false)];
        let report = calculator()
            .score_snapshot(&mut store, "asset1", 10, &published)
            .unwrap();
        assert!(report.alert);
        assert!(store.last_fidelity("asset1").unwrap().is_some());
    }

    #[test]
    fn empty_snapshot_is_neutral() {
        let mut store = SemanticStore::in_memory().unwrap();
        let report = calculator()
            .score_snapshot(&mut store, "asset1", 0, &[])
            .unwrap();
        assert!((report.overall - 1.0).abs() < 1e-9);
        assert!(!report.alert);
    }
}
