//! Per-asset lifecycle tracking: online, stale, offline.
//!
//! Every processed snapshot marks its asset online. A periodic tick (1 s
//! resolution) moves assets Online→Stale after `stale_threshold` without
//! data and Stale→Offline after three times that. Transitions are emitted
//! as JSON events on `UNS/Sys/Lifecycle/{assetId}`; going offline can
//! optionally clear the asset's retained topics.

use aas_uplink_state::{LifecycleRow, SemanticStore, StateError};
use serde::Deserialize;
use std::collections::HashMap;
use std::collections::HashSet;

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LifecycleRules {
    /// Master switch
    pub enabled: bool,
    /// Seconds without data before an asset turns stale
    pub stale_threshold_seconds: u64,
    /// Publish transition events
    pub publish_events: bool,
    /// Publish empty retained payloads for an asset's topics on Offline
    pub clear_retained_on_offline: bool,
}

impl Default for LifecycleRules {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_threshold_seconds: 300,
            publish_events: true,
            clear_retained_on_offline: false,
        }
    }
}

/// Lifecycle states of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    /// Data seen within the stale threshold
    Online,
    /// No data beyond the stale threshold
    Stale,
    /// No data beyond three times the stale threshold
    Offline,
}

impl AssetState {
    /// Wire name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::Online => "online",
            AssetState::Stale => "stale",
            AssetState::Offline => "offline",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "stale" => AssetState::Stale,
            "offline" => AssetState::Offline,
            _ => AssetState::Online,
        }
    }
}

/// A state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Affected asset
    pub asset_id: String,
    /// New state
    pub state: AssetState,
    /// Previous state (`None` on first sight)
    pub previous_state: Option<AssetState>,
    /// Transition time (Unix ms)
    pub timestamp_ms: i64,
    /// Seconds since the last observed publish
    pub stale_duration_seconds: u64,
    /// Retained topics to clear (populated on Offline when configured)
    pub topics_to_clear: Vec<String>,
}

impl LifecycleEvent {
    /// JSON event payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "state": self.state.as_str(),
            "previous_state": self.previous_state.map(|s| s.as_str()),
            "asset_id": self.asset_id,
            "timestamp": self.timestamp_ms,
            "stale_duration_seconds": self.stale_duration_seconds,
        });
        value.to_string().into_bytes()
    }
}

struct TrackedAsset {
    state: AssetState,
    last_seen_ms: i64,
    last_change_ms: i64,
    topics: HashSet<String>,
}

/// Lifecycle tracker over the persistent lifecycle table.
pub struct LifecycleTracker {
    rules: LifecycleRules,
    assets: HashMap<String, TrackedAsset>,
}

impl LifecycleTracker {
    /// Create a tracker, restoring persisted state.
    ///
    /// # Errors
    ///
    /// Returns error if the lifecycle table cannot be read.
    pub fn new(rules: LifecycleRules, store: &SemanticStore) -> Result<Self, StateError> {
        let mut assets = HashMap::new();
        for row in store.lifecycle_rows()? {
            assets.insert(
                row.asset_id.clone(),
                TrackedAsset {
                    state: AssetState::parse(&row.state),
                    last_seen_ms: row.last_seen_ms,
                    last_change_ms: row.last_change_ms,
                    topics: row.topics.into_iter().collect(),
                },
            );
        }
        tracing::info!(assets = assets.len(), "Restored lifecycle state");
        Ok(Self { rules, assets })
    }

    /// True when tracking is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.rules.enabled
    }

    /// Record data for an asset and remember its retained topics.
    ///
    /// Returns a transition event when the asset was not online before.
    ///
    /// # Errors
    ///
    /// Returns error if persisting the row fails.
    pub fn mark_seen(
        &mut self,
        store: &mut SemanticStore,
        asset_id: &str,
        topics: &[String],
        now_ms: i64,
    ) -> Result<Option<LifecycleEvent>, StateError> {
        if !self.rules.enabled {
            return Ok(None);
        }

        let entry = self.assets.entry(asset_id.to_string());
        let (event, asset) = match entry {
            std::collections::hash_map::Entry::Occupied(occupied) => {
                let asset = occupied.into_mut();
                let previous = asset.state;
                asset.last_seen_ms = now_ms;
                asset.topics.extend(topics.iter().cloned());
                let event = if previous != AssetState::Online {
                    asset.state = AssetState::Online;
                    asset.last_change_ms = now_ms;
                    Some(LifecycleEvent {
                        asset_id: asset_id.to_string(),
                        state: AssetState::Online,
                        previous_state: Some(previous),
                        timestamp_ms: now_ms,
                        stale_duration_seconds: 0,
                        topics_to_clear: Vec::new(),
                    })
                } else {
                    None
                };
                (event, asset)
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let asset = vacant.insert(TrackedAsset {
                    state: AssetState::Online,
                    last_seen_ms: now_ms,
                    last_change_ms: now_ms,
                    topics: topics.iter().cloned().collect(),
                });
                let event = Some(LifecycleEvent {
                    asset_id: asset_id.to_string(),
                    state: AssetState::Online,
                    previous_state: None,
                    timestamp_ms: now_ms,
                    stale_duration_seconds: 0,
                    topics_to_clear: Vec::new(),
                });
                (event, asset)
            }
        };

        store.upsert_lifecycle(&LifecycleRow {
            asset_id: asset_id.to_string(),
            state: asset.state.as_str().to_string(),
            last_seen_ms: asset.last_seen_ms,
            last_change_ms: asset.last_change_ms,
            topics: asset.topics.iter().cloned().collect(),
        })?;

        if let Some(event) = &event {
            tracing::info!(
                asset_id,
                previous = ?event.previous_state.map(|s| s.as_str()),
                "Asset online"
            );
        }
        Ok(event)
    }

    /// Evaluate stale and offline transitions. Called on the 1-second timer.
    ///
    /// # Errors
    ///
    /// Returns error if persisting a row fails.
    pub fn tick(
        &mut self,
        store: &mut SemanticStore,
        now_ms: i64,
    ) -> Result<Vec<LifecycleEvent>, StateError> {
        if !self.rules.enabled {
            return Ok(Vec::new());
        }

        let stale_ms = (self.rules.stale_threshold_seconds * 1000) as i64;
        let offline_ms = stale_ms * 3;
        let mut events = Vec::new();

        for (asset_id, asset) in &mut self.assets {
            let silent_ms = now_ms - asset.last_seen_ms;
            let target = match asset.state {
                AssetState::Online if silent_ms > stale_ms => AssetState::Stale,
                AssetState::Stale if silent_ms > offline_ms => AssetState::Offline,
                _ => continue,
            };

            let previous = asset.state;
            asset.state = target;
            asset.last_change_ms = now_ms;

            let topics_to_clear = if target == AssetState::Offline
                && self.rules.clear_retained_on_offline
            {
                asset.topics.iter().cloned().collect()
            } else {
                Vec::new()
            };

            store.upsert_lifecycle(&LifecycleRow {
                asset_id: asset_id.clone(),
                state: asset.state.as_str().to_string(),
                last_seen_ms: asset.last_seen_ms,
                last_change_ms: asset.last_change_ms,
                topics: asset.topics.iter().cloned().collect(),
            })?;

            tracing::warn!(
                asset_id = %asset_id,
                state = target.as_str(),
                silent_seconds = silent_ms / 1000,
                "Asset lifecycle transition"
            );
            events.push(LifecycleEvent {
                asset_id: asset_id.clone(),
                state: target,
                previous_state: Some(previous),
                timestamp_ms: now_ms,
                stale_duration_seconds: (silent_ms / 1000).max(0) as u64,
                topics_to_clear,
            });
        }

        events.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        Ok(events)
    }

    /// Number of assets currently in `state`.
    #[must_use]
    pub fn count(&self, state: AssetState) -> usize {
        self.assets.values().filter(|a| a.state == state).count()
    }
}
