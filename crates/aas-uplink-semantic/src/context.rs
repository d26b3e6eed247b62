//! Context pointers: content-addressed metadata compression.
//!
//! In pointer mode the per-message metadata bundle is replaced by a short
//! content hash; the full bundle is published once, retained, to
//! `UNS/Sys/Context/{dictionary}/{hash}` so late subscribers can resolve
//! pointers without waiting for republication.

use aas_uplink_core::LeafRecord;
use aas_uplink_state::{SemanticStore, StateError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Hex length of a context hash.
pub const CONTEXT_HASH_LEN: usize = 16;

/// A compact reference to a context bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPointer {
    /// Truncated SHA-256 over the bundle
    pub hash: String,
    /// Source dictionary element of the context topic
    pub dictionary: String,
}

/// The metadata bundle a pointer stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBundle {
    /// Primary semantic identifier
    pub semantic_id: Option<String>,
    /// Unit of measurement
    pub unit: Option<String>,
    /// Publishing system identifier
    pub source: String,
    /// Where the leaf came from
    pub origin_uri: String,
    /// Detected source dictionary (ECLASS, IEC_CDD, IDTA, IRI, custom)
    pub dictionary: String,
    /// Dictionary version, when encoded in the identifier
    pub version: String,
}

impl ContextBundle {
    /// Build the bundle for a leaf record.
    #[must_use]
    pub fn from_record(record: &LeafRecord, source: &str) -> Self {
        let dictionary = detect_dictionary(record.semantic_id.as_deref());
        let version = extract_version(record.semantic_id.as_deref());
        Self {
            semantic_id: record.semantic_id.clone(),
            unit: record.unit.clone(),
            source: source.to_string(),
            origin_uri: record.origin_uri.clone(),
            dictionary,
            version,
        }
    }

    /// Content hash of the bundle (truncated SHA-256 hex).
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.semantic_id.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(self.unit.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(self.source.as_bytes());
        hasher.update(b"|");
        hasher.update(self.origin_uri.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..CONTEXT_HASH_LEN].to_string()
    }

    /// Pointer for this bundle.
    #[must_use]
    pub fn pointer(&self) -> ContextPointer {
        ContextPointer {
            hash: self.hash(),
            dictionary: self.dictionary.clone(),
        }
    }

    /// JSON payload published on the context topic.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Detect the semantic dictionary from an identifier.
#[must_use]
pub fn detect_dictionary(semantic_id: Option<&str>) -> String {
    let Some(id) = semantic_id else {
        return "unknown".to_string();
    };
    if id.starts_with("0173-1#") || id.starts_with("0173-1---") {
        return "ECLASS".to_string();
    }
    if id.starts_with("0112/") {
        return "IEC_CDD".to_string();
    }
    if id.starts_with("http://") || id.starts_with("https://") {
        let lower = id.to_ascii_lowercase();
        if lower.contains("eclass") {
            return "ECLASS".to_string();
        }
        if lower.contains("iec") || lower.contains("cdd") {
            return "IEC_CDD".to_string();
        }
        if id.contains("admin-shell.io") {
            return "IDTA".to_string();
        }
        return "IRI".to_string();
    }
    "custom".to_string()
}

/// Extract a version suffix from an IRDI (`#NNN`), defaulting to `1.0`.
#[must_use]
pub fn extract_version(semantic_id: Option<&str>) -> String {
    let Some(id) = semantic_id else {
        return "1.0".to_string();
    };
    let parts: Vec<&str> = id.split('#').collect();
    if parts.len() >= 3 {
        parts[parts.len() - 1].to_string()
    } else {
        "1.0".to_string()
    }
}

/// In-memory pointer cache over the persistent context dictionary.
///
/// Queried on every record before payload composition when pointer or hybrid
/// mode is active. A miss inserts the bundle and schedules a context-topic
/// publish; per-session publish tracking makes the side effect idempotent.
pub struct PointerCache {
    session_published: HashSet<String>,
    known: HashSet<String>,
}

impl PointerCache {
    /// Create a cache, warming `known` from the persistent dictionary.
    ///
    /// # Errors
    ///
    /// Returns error if the dictionary cannot be read.
    pub fn new(store: &SemanticStore) -> Result<Self, StateError> {
        let known = store
            .contexts()?
            .into_iter()
            .map(|(hash, _)| hash)
            .collect();
        Ok(Self {
            session_published: HashSet::new(),
            known,
        })
    }

    /// Resolve the pointer for a record, persisting the bundle on first
    /// sight. Returns the pointer plus the bundle payload to publish when
    /// this session has not yet announced it.
    ///
    /// # Errors
    ///
    /// Returns error if persisting a new bundle fails.
    pub fn resolve(
        &mut self,
        store: &mut SemanticStore,
        record: &LeafRecord,
        source: &str,
    ) -> Result<(ContextPointer, Option<Vec<u8>>), StateError> {
        let bundle = ContextBundle::from_record(record, source);
        let pointer = bundle.pointer();

        if !self.known.contains(&pointer.hash) {
            store.put_context(&pointer.hash, &String::from_utf8_lossy(&bundle.to_payload()))?;
            self.known.insert(pointer.hash.clone());
        }

        let payload = if self.session_published.contains(&pointer.hash) {
            None
        } else {
            self.session_published.insert(pointer.hash.clone());
            Some(bundle.to_payload())
        };
        Ok((pointer, payload))
    }

    /// Forget per-session publish tracking (after reconnect the retained
    /// context topics may have been lost with a clean broker).
    pub fn reset_session(&mut self) {
        self.session_published.clear();
    }

    /// Number of known context bundles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// True when no bundle is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aas_uplink_core::{LeafKind, MetricValue};

    fn record(semantic_id: Option<&str>) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:x:asset".into(),
            submodel_id: "urn:x:sm".into(),
            submodel_id_short: "Tech".into(),
            path: vec!["Temp".into()],
            kind: LeafKind::Property,
            value: MetricValue::Float(1.0),
            value_type: "xs:double".into(),
            semantic_id: semantic_id.map(str::to_string),
            unit: Some("degC".into()),
            submodel_semantic_id: None,
            source_timestamp_ms: 0,
            origin_uri: "file:///a.json".into(),
        }
    }

    #[test]
    fn dictionary_detection() {
        assert_eq!(detect_dictionary(Some("0173-1#02-AAO677#002")), "ECLASS");
        assert_eq!(detect_dictionary(Some("0112/2///61987#ABA574#007")), "IEC_CDD");
        assert_eq!(
            detect_dictionary(Some("https://admin-shell.io/zvei/nameplate/2/0")),
            "IDTA"
        );
        assert_eq!(detect_dictionary(Some("https://example.org/x")), "IRI");
        assert_eq!(detect_dictionary(Some("my-company-id")), "custom");
        assert_eq!(detect_dictionary(None), "unknown");
    }

    #[test]
    fn version_extraction() {
        assert_eq!(extract_version(Some("0173-1#02-AAO677#002")), "002");
        assert_eq!(extract_version(Some("https://example.org/x")), "1.0");
    }

    #[test]
    fn hash_is_stable_and_short() {
        let bundle = ContextBundle::from_record(&record(Some("0173-1#02-AAO677#002")), "uplink");
        let hash = bundle.hash();
        assert_eq!(hash.len(), CONTEXT_HASH_LEN);
        assert_eq!(hash, bundle.hash());
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn first_resolve_publishes_then_idempotent() {
        let mut store = SemanticStore::in_memory().unwrap();
        let mut cache = PointerCache::new(&store).unwrap();
        let rec = record(Some("0173-1#02-AAO677#002"));

        let (pointer, payload) = cache.resolve(&mut store, &rec, "uplink").unwrap();
        assert!(payload.is_some());
        assert_eq!(pointer.dictionary, "ECLASS");

        let (again, payload) = cache.resolve(&mut store, &rec, "uplink").unwrap();
        assert_eq!(pointer, again);
        assert!(payload.is_none());

        // A new session re-announces retained bundles once.
        cache.reset_session();
        let (_, payload) = cache.resolve(&mut store, &rec, "uplink").unwrap();
        assert!(payload.is_some());
    }

    #[test]
    fn bundles_survive_in_dictionary() {
        let mut store = SemanticStore::in_memory().unwrap();
        let mut cache = PointerCache::new(&store).unwrap();
        let (pointer, _) = cache
            .resolve(&mut store, &record(Some("0173-1#02-AAO677#002")), "uplink")
            .unwrap();
        assert!(store.context(&pointer.hash).unwrap().is_some());
    }
}
