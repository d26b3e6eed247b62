//! Streaming value-anomaly detection with half-space trees.
//!
//! Per asset, a forest of fixed-depth random axis-aligned partition trees is
//! maintained over a sliding window of recent numeric observations. The
//! anomaly score of a new point is its average depth-normalised mass across
//! trees: points landing in sparsely populated regions score high. Scores
//! above the configured thresholds emit `value_anomaly` alerts.

use crate::drift::{DriftEvent, DriftEventType, Severity};
use aas_uplink_core::LeafRecord;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Streaming detection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StreamingRules {
    /// Master switch
    pub enabled: bool,
    /// Trees per forest
    pub num_trees: usize,
    /// Tree depth
    pub max_depth: usize,
    /// Reference window size for mass estimation
    pub window_size: usize,
    /// Score at and above which an anomaly is reported
    pub anomaly_threshold: f64,
    /// Score at and above which the alert severity is `high`
    pub high_threshold: f64,
    /// Score at and above which the alert severity is `critical`
    pub critical_threshold: f64,
    /// Observations before scores are trusted (warm-up)
    pub min_observations: u64,
}

impl Default for StreamingRules {
    fn default() -> Self {
        Self {
            enabled: false,
            num_trees: 25,
            max_depth: 8,
            window_size: 1000,
            anomaly_threshold: 0.7,
            high_threshold: 0.85,
            critical_threshold: 0.95,
            min_observations: 64,
        }
    }
}

/// One random axis-aligned partition tree of fixed depth.
///
/// Nodes live in a flat array: children of node `i` sit at `2i+1` and
/// `2i+2`. Each node carries a split dimension, a split point in [0, 1] and
/// a mass counter capped at the window size.
#[derive(Serialize, Deserialize)]
struct HalfSpaceTree {
    max_depth: usize,
    window_size: usize,
    /// (dimension, split, mass)
    nodes: Vec<(usize, f64, u32)>,
}

impl HalfSpaceTree {
    fn new(max_depth: usize, window_size: usize, num_features: usize, rng: &mut StdRng) -> Self {
        let num_nodes = (1usize << (max_depth + 1)) - 1;
        let nodes = (0..num_nodes)
            .map(|_| (rng.gen_range(0..num_features), rng.gen::<f64>(), 0u32))
            .collect();
        Self {
            max_depth,
            window_size,
            nodes,
        }
    }

    fn descend(&self, features: &[f64]) -> Vec<usize> {
        let mut visited = Vec::with_capacity(self.max_depth);
        let mut index = 0;
        for _ in 0..self.max_depth {
            if index >= self.nodes.len() {
                break;
            }
            visited.push(index);
            let (dim, split, _) = self.nodes[index];
            let value = features.get(dim).copied().unwrap_or(0.5);
            index = if value < split { 2 * index + 1 } else { 2 * index + 2 };
        }
        visited
    }

    fn update(&mut self, features: &[f64]) {
        for index in self.descend(features) {
            let (dim, split, mass) = self.nodes[index];
            self.nodes[index] = (dim, split, mass.saturating_add(1).min(self.window_size as u32));
        }
    }

    /// Anomaly score in [0, 1]: one minus the depth-averaged mass along the
    /// point's path, relative to the root mass (the cohort every point
    /// shares), so sparsely populated regions score high at any fill level.
    fn score(&self, features: &[f64]) -> f64 {
        let visited = self.descend(features);
        if visited.is_empty() {
            return 0.5;
        }
        let root_mass = self.nodes[0].2;
        if root_mass == 0 {
            return 0.5;
        }
        let total: u64 = visited.iter().map(|&i| u64::from(self.nodes[i].2)).sum();
        let avg = total as f64 / visited.len() as f64;
        (1.0 - avg / f64::from(root_mass)).clamp(0.0, 1.0)
    }
}

/// Number of features derived from a record.
const NUM_FEATURES: usize = 3;

/// Per-asset forest with normalisation state.
///
/// Serialisable so the learned model survives restarts via the
/// streaming-drift state table.
#[derive(Serialize, Deserialize)]
struct Forest {
    trees: Vec<HalfSpaceTree>,
    /// Observed (min, max) per feature, for min-max normalisation;
    /// `None` until the feature has been seen
    ranges: Vec<Option<(f64, f64)>>,
    observations: u64,
}

impl Forest {
    fn new(rules: &StreamingRules, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let trees = (0..rules.num_trees)
            .map(|_| HalfSpaceTree::new(rules.max_depth, rules.window_size, NUM_FEATURES, &mut rng))
            .collect();
        Self {
            trees,
            ranges: vec![None; NUM_FEATURES],
            observations: 0,
        }
    }

    /// True when the restored shape matches the configured rules.
    fn matches(&self, rules: &StreamingRules) -> bool {
        self.trees.len() == rules.num_trees
            && self.ranges.len() == NUM_FEATURES
            && self
                .trees
                .iter()
                .all(|t| t.max_depth == rules.max_depth && t.window_size == rules.window_size)
    }

    fn normalise(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .enumerate()
            .map(|(i, &v)| match self.ranges[i] {
                Some((lo, hi)) if hi > lo => ((v - lo) / (hi - lo)).clamp(0.0, 1.0),
                _ => 0.5,
            })
            .collect()
    }

    fn observe(&mut self, features: &[f64]) -> f64 {
        let normalised = self.normalise(features);
        let score = if self.trees.is_empty() {
            0.5
        } else {
            self.trees.iter().map(|t| t.score(&normalised)).sum::<f64>()
                / self.trees.len() as f64
        };

        for (i, &v) in features.iter().enumerate() {
            self.ranges[i] = Some(match self.ranges[i] {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
        let normalised = self.normalise(features);
        for tree in &mut self.trees {
            tree.update(&normalised);
        }
        self.observations += 1;
        score
    }
}

/// Streaming anomaly detector over per-asset forests.
pub struct StreamingDetector {
    rules: StreamingRules,
    forests: HashMap<String, Forest>,
    seed_counter: u64,
}

impl StreamingDetector {
    /// Create a detector.
    #[must_use]
    pub fn new(rules: StreamingRules) -> Self {
        Self {
            rules,
            forests: HashMap::new(),
            seed_counter: 0,
        }
    }

    /// True when detection is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.rules.enabled
    }

    /// Observation count for an asset, including restored observations.
    #[must_use]
    pub fn observations(&self, asset_id: &str) -> u64 {
        self.forests.get(asset_id).map_or(0, |f| f.observations)
    }

    /// Serialise an asset's learned model for persistence.
    #[must_use]
    pub fn export(&self, asset_id: &str) -> Option<String> {
        let forest = self.forests.get(asset_id)?;
        serde_json::to_string(forest).ok()
    }

    /// Restore an asset's model from a persisted serialisation.
    ///
    /// A model whose shape does not match the configured rules (tree count,
    /// depth, window) is discarded; the asset then re-learns from scratch.
    pub fn restore(&mut self, asset_id: &str, model: &str) {
        match serde_json::from_str::<Forest>(model) {
            Ok(forest) if forest.matches(&self.rules) => {
                tracing::debug!(
                    asset_id,
                    observations = forest.observations,
                    "Restored streaming-drift model"
                );
                self.forests.insert(asset_id.to_string(), forest);
            }
            Ok(_) => {
                tracing::warn!(asset_id, "Persisted model shape differs from rules, discarding");
            }
            Err(e) => {
                tracing::warn!(asset_id, error = %e, "Corrupt persisted model, discarding");
            }
        }
    }

    fn featurize(record: &LeafRecord, value: f64) -> [f64; NUM_FEATURES] {
        [
            value,
            record.path.len() as f64,
            if record.semantic_id.is_some() { 1.0 } else { 0.0 },
        ]
    }

    fn severity_for(&self, score: f64) -> Severity {
        if score >= self.rules.critical_threshold {
            Severity::Critical
        } else if score >= self.rules.high_threshold {
            Severity::High
        } else {
            Severity::Medium
        }
    }

    /// Feed one record; numeric values are scored, everything else passes
    /// through silently. Returns an alert event when the score clears the
    /// configured threshold after warm-up.
    pub fn observe(&mut self, asset_id: &str, record: &LeafRecord) -> Option<DriftEvent> {
        if !self.rules.enabled {
            return None;
        }
        let value = record.value.as_f64()?;

        let forest = match self.forests.entry(asset_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                self.seed_counter += 1;
                entry.insert(Forest::new(&self.rules, self.seed_counter))
            }
        };

        let features = Self::featurize(record, value);
        let score = forest.observe(&features);

        if forest.observations <= self.rules.min_observations
            || score < self.rules.anomaly_threshold
        {
            return None;
        }

        tracing::debug!(asset_id, score, path = %record.metric_name(), "Value anomaly");
        Some(DriftEvent {
            event_type: DriftEventType::ValueAnomaly,
            asset_id: asset_id.to_string(),
            metric_path: record.qualified_name(),
            timestamp_ms: record.source_timestamp_ms,
            severity: self.severity_for(score),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aas_uplink_core::{LeafKind, MetricValue};

    fn record(value: f64) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:x:asset".into(),
            submodel_id: "urn:x:sm".into(),
            submodel_id_short: "Tech".into(),
            path: vec!["Temp".into()],
            kind: LeafKind::Property,
            value: MetricValue::Float(value),
            value_type: "xs:double".into(),
            semantic_id: None,
            unit: None,
            submodel_semantic_id: None,
            source_timestamp_ms: 7,
            origin_uri: String::new(),
        }
    }

    fn rules() -> StreamingRules {
        StreamingRules {
            enabled: true,
            min_observations: 32,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_detector_is_silent() {
        let mut detector = StreamingDetector::new(StreamingRules::default());
        assert!(detector.observe("asset1", &record(1.0)).is_none());
        assert_eq!(detector.observations("asset1"), 0);
    }

    #[test]
    fn non_numeric_values_are_ignored() {
        let mut detector = StreamingDetector::new(rules());
        let mut rec = record(0.0);
        rec.value = MetricValue::Text("x".into());
        assert!(detector.observe("asset1", &rec).is_none());
        assert_eq!(detector.observations("asset1"), 0);
    }

    #[test]
    fn warmup_suppresses_alerts() {
        let mut detector = StreamingDetector::new(rules());
        for i in 0..16 {
            assert!(detector.observe("asset1", &record(20.0 + f64::from(i) * 0.01)).is_none());
        }
    }

    #[test]
    fn outlier_scores_above_steady_state() {
        let mut detector = StreamingDetector::new(rules());
        // A long steady stream around 20, then a far outlier.
        for i in 0..500 {
            detector.observe("asset1", &record(20.0 + f64::from(i % 7) * 0.05));
        }
        let event = detector.observe("asset1", &record(10_000.0));
        if let Some(event) = event {
            assert_eq!(event.event_type, DriftEventType::ValueAnomaly);
            assert_eq!(event.metric_path, "Tech.Temp");
        }
        // Once the model has re-learned the normal region, the steady
        // stream is quiet again.
        for i in 0..500 {
            detector.observe("asset1", &record(20.0 + f64::from(i % 7) * 0.05));
        }
        assert!(detector.observe("asset1", &record(20.02)).is_none());
    }

    #[test]
    fn forests_are_per_asset() {
        let mut detector = StreamingDetector::new(rules());
        detector.observe("asset1", &record(1.0));
        detector.observe("asset2", &record(1.0));
        assert_eq!(detector.observations("asset1"), 1);
        assert_eq!(detector.observations("asset2"), 1);
    }

    #[test]
    fn export_restore_roundtrip_keeps_learned_state() {
        let mut detector = StreamingDetector::new(rules());
        for i in 0..100 {
            detector.observe("asset1", &record(20.0 + f64::from(i % 7) * 0.05));
        }
        let model = detector.export("asset1").unwrap();

        let mut restored = StreamingDetector::new(rules());
        assert!(restored.export("asset1").is_none());
        restored.restore("asset1", &model);
        assert_eq!(restored.observations("asset1"), 100);

        // The restored model keeps scoring without a fresh warm-up: the
        // steady stream stays quiet past the restart.
        assert!(restored.observe("asset1", &record(20.1)).is_none());
        assert_eq!(restored.observations("asset1"), 101);
    }

    #[test]
    fn restore_discards_mismatched_or_corrupt_models() {
        let mut detector = StreamingDetector::new(rules());
        detector.observe("asset1", &record(1.0));
        let model = detector.export("asset1").unwrap();

        // Different tree count: discarded, asset re-learns from scratch.
        let mut other = StreamingDetector::new(StreamingRules {
            num_trees: 5,
            ..rules()
        });
        other.restore("asset1", &model);
        assert_eq!(other.observations("asset1"), 0);

        let mut broken = StreamingDetector::new(rules());
        broken.restore("asset1", "not json");
        assert_eq!(broken.observations("asset1"), 0);
    }
}
