//! ISA-95 hierarchy mapping from asset URIs to addresses.
//!
//! Resolution order: exact match in the asset table, first match against the
//! ordered glob patterns, then the default. Exactly one source always
//! succeeds. Resolved addresses are memoised per asset URI, so repeated
//! resolution during one process lifetime is stable.

use crate::model::AssetAddress;
use crate::sanitize::{asset_name_from_uri, sanitize_segment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use wildmatch::WildMatch;

/// One configured hierarchy level set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HierarchyLevels {
    /// Level 4: enterprise (required)
    pub enterprise: String,
    /// Level 3: site
    #[serde(default)]
    pub site: String,
    /// Level 2: area
    #[serde(default)]
    pub area: String,
    /// Level 1: line
    #[serde(default)]
    pub line: String,
    /// Equipment identifier; derived from the asset URI when empty
    #[serde(default)]
    pub asset: String,
}

/// A glob pattern with its hierarchy levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternMapping {
    /// Glob pattern matched against the asset URI (`*` and `?`)
    pub pattern: String,
    /// Level 4: enterprise (required)
    pub enterprise: String,
    /// Level 3: site
    #[serde(default)]
    pub site: String,
    /// Level 2: area
    #[serde(default)]
    pub area: String,
    /// Level 1: line
    #[serde(default)]
    pub line: String,
    /// Equipment identifier
    #[serde(default)]
    pub asset: String,
}

/// Mapping table: default levels, exact asset entries, ordered patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingConfig {
    /// Fallback levels when nothing else matches
    pub default: HierarchyLevels,
    /// Exact matches keyed by asset URI
    #[serde(default)]
    pub assets: HashMap<String, HierarchyLevels>,
    /// Ordered pattern matches (first match wins)
    #[serde(default)]
    pub patterns: Vec<PatternMapping>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            default: HierarchyLevels {
                enterprise: "Default".to_string(),
                site: String::new(),
                area: String::new(),
                line: String::new(),
                asset: String::new(),
            },
            assets: HashMap::new(),
            patterns: Vec::new(),
        }
    }
}

impl MappingConfig {
    /// Load the mapping table from a YAML file.
    ///
    /// A missing file yields the default table (everything under the
    /// `Default` enterprise).
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn from_yaml(path: &Path) -> Result<Self, MappingError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Mappings file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| MappingError::Read(path.display().to_string(), e.to_string()))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| MappingError::Parse(path.display().to_string(), e.to_string()))
    }
}

/// Errors loading the mapping table.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MappingError {
    /// File could not be read
    #[error("failed to read mappings {0}: {1}")]
    Read(String, String),
    /// File could not be parsed
    #[error("failed to parse mappings {0}: {1}")]
    Parse(String, String),
}

/// Resolves asset URIs to ISA-95 addresses, memoised per URI.
pub struct AddressResolver {
    config: MappingConfig,
    patterns: Vec<(WildMatch, usize)>,
    cache: Mutex<HashMap<String, AssetAddress>>,
}

impl AddressResolver {
    /// Create a resolver over a mapping table.
    #[must_use]
    pub fn new(config: MappingConfig) -> Self {
        let patterns = config
            .patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (WildMatch::new(&p.pattern), i))
            .collect();
        Self {
            config,
            patterns,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the address for an asset URI. Always succeeds.
    ///
    /// The result is cached; repeated calls during one process lifetime
    /// return the same address.
    #[must_use]
    pub fn resolve(&self, asset_uri: &str) -> AssetAddress {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(asset_uri)
        {
            return cached.clone();
        }

        let levels = self.lookup(asset_uri);
        let asset = if levels.asset.is_empty() {
            asset_name_from_uri(asset_uri)
        } else {
            sanitize_segment(&levels.asset)
        };

        let address = AssetAddress {
            enterprise: sanitize_segment(&levels.enterprise),
            site: non_empty_or(&levels.site, "site"),
            area: non_empty_or(&levels.area, "area"),
            line: non_empty_or(&levels.line, "line"),
            asset,
        };

        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(asset_uri.to_string(), address.clone());
        address
    }

    fn lookup(&self, asset_uri: &str) -> HierarchyLevels {
        if let Some(exact) = self.config.assets.get(asset_uri) {
            return exact.clone();
        }

        for (matcher, index) in &self.patterns {
            if matcher.matches(asset_uri) {
                let p = &self.config.patterns[*index];
                return HierarchyLevels {
                    enterprise: p.enterprise.clone(),
                    site: p.site.clone(),
                    area: p.area.clone(),
                    line: p.line.clone(),
                    asset: p.asset.clone(),
                };
            }
        }

        self.config.default.clone()
    }
}

fn non_empty_or(level: &str, fallback: &str) -> String {
    if level.is_empty() {
        fallback.to_string()
    } else {
        sanitize_segment(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> AddressResolver {
        let yaml = r#"
default:
  enterprise: Acme
assets:
  "urn:example:asset:press":
    enterprise: Acme
    site: Plant2
    area: Stamping
    line: Line1
    asset: Press02
patterns:
  - pattern: "urn:example:asset:robot*"
    enterprise: Acme
    site: Plant1
    area: Welding
    line: Line3
  - pattern: "urn:example:*"
    enterprise: Acme
    site: Plant1
    area: Misc
    line: Line0
"#;
        let config: MappingConfig = serde_yaml::from_str(yaml).unwrap();
        AddressResolver::new(config)
    }

    #[test]
    fn exact_match_wins() {
        let addr = resolver().resolve("urn:example:asset:press");
        assert_eq!(addr.site, "Plant2");
        assert_eq!(addr.asset, "Press02");
    }

    #[test]
    fn first_pattern_wins_in_order() {
        let addr = resolver().resolve("urn:example:asset:robot7");
        assert_eq!(addr.area, "Welding");
        // Asset segment derived from the URI tail when unset.
        assert_eq!(addr.asset, "robot7");
    }

    #[test]
    fn default_applies_when_nothing_matches() {
        let addr = resolver().resolve("urn:other:asset:x");
        assert_eq!(addr.enterprise, "Acme");
        assert_eq!(addr.site, "site");
        assert_eq!(addr.asset, "x");
    }

    #[test]
    fn resolution_is_stable_across_calls() {
        let r = resolver();
        let first = r.resolve("urn:example:asset:robot7");
        let second = r.resolve("urn:example:asset:robot7");
        assert_eq!(first, second);
    }

    #[test]
    fn segments_are_topic_safe() {
        let config: MappingConfig = serde_yaml::from_str(
            r#"
default:
  enterprise: "Acme Corp"
  site: "Plant/1"
  area: "A+B"
"#,
        )
        .unwrap();
        let addr = AddressResolver::new(config).resolve("urn:x:y");
        assert_eq!(addr.enterprise, "Acme_Corp");
        assert_eq!(addr.site, "Plant_1");
        assert_eq!(addr.area, "A_B");
        for seg in [&addr.enterprise, &addr.site, &addr.area, &addr.line, &addr.asset] {
            assert!(!seg.contains(['/', '+', '#']));
            assert!(!seg.is_empty());
        }
    }

    #[test]
    fn unknown_mapping_key_is_rejected() {
        let result: Result<MappingConfig, _> = serde_yaml::from_str(
            r#"
default:
  enterprise: Acme
  factory: nope
"#,
        );
        assert!(result.is_err());
    }
}
