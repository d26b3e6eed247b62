//! Recursive traversal of AAS submodels into flat leaf records.
//!
//! The traversal is deterministic: depth-first, child order as encountered in
//! the source document, so identical input yields an identical record stream
//! across runs. A malformed element produces an error event carrying the path
//! walked so far; siblings are still visited.

use crate::aas::{unit_from_specs, Element, Environment, Submodel};
use crate::model::{LeafKind, LeafRecord, MetricValue, TraversalError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Result of flattening one submodel.
#[derive(Debug, Default)]
pub struct SubmodelStream {
    /// Leaf records in traversal order
    pub records: Vec<LeafRecord>,
    /// Per-element errors (traversal continued past each)
    pub errors: Vec<TraversalError>,
}

struct Walker<'a> {
    asset_uri: &'a str,
    submodel_id: &'a str,
    submodel_id_short: &'a str,
    submodel_semantic_id: Option<String>,
    origin_uri: &'a str,
    timestamp_ms: i64,
    preferred_lang: &'a str,
    out: SubmodelStream,
}

impl Walker<'_> {
    fn record(
        &mut self,
        path: Vec<String>,
        kind: LeafKind,
        value: MetricValue,
        value_type: String,
        semantic_id: Option<String>,
        unit: Option<String>,
    ) {
        self.out.records.push(LeafRecord {
            asset_uri: self.asset_uri.to_string(),
            submodel_id: self.submodel_id.to_string(),
            submodel_id_short: self.submodel_id_short.to_string(),
            path,
            kind,
            value,
            value_type,
            semantic_id,
            unit,
            submodel_semantic_id: self.submodel_semantic_id.clone(),
            source_timestamp_ms: self.timestamp_ms,
            origin_uri: self.origin_uri.to_string(),
        });
    }

    fn error(&mut self, path: &[String], reason: impl Into<String>) {
        self.out.errors.push(TraversalError {
            asset_uri: self.asset_uri.to_string(),
            submodel_id: self.submodel_id.to_string(),
            path: path.to_vec(),
            reason: reason.into(),
        });
    }

    fn walk(&mut self, element: &Element, prefix: &[String]) {
        let name = element.id_short().unwrap_or("unnamed").to_string();
        self.walk_named(element, prefix, name);
    }

    /// Walk an element under an explicit segment name.
    ///
    /// List children without an idShort are addressed by position, so the
    /// caller supplies the segment instead of the element naming itself.
    fn walk_named(&mut self, element: &Element, prefix: &[String], name: String) {
        let mut path = prefix.to_vec();
        path.push(name);

        match element {
            Element::Property {
                value_type,
                value,
                semantic_id,
                embedded_data_specifications,
                ..
            } => {
                let xsd = value_type.clone().unwrap_or_else(|| "xs:string".to_string());
                match parse_typed_value(value.as_deref(), &xsd) {
                    Ok(parsed) => self.record(
                        path,
                        LeafKind::Property,
                        parsed,
                        xsd,
                        semantic_id.as_ref().and_then(crate::aas::Reference::primary_key),
                        unit_from_specs(embedded_data_specifications),
                    ),
                    Err(reason) => self.error(&path, reason),
                }
            }
            Element::MultiLanguageProperty {
                value,
                semantic_id,
                embedded_data_specifications,
                ..
            } => {
                // Preferred language first, first available otherwise.
                let text = value
                    .iter()
                    .find(|ls| ls.language == self.preferred_lang)
                    .or_else(|| value.first())
                    .map(|ls| ls.text.clone());
                self.record(
                    path,
                    LeafKind::Property,
                    text.map_or(MetricValue::Null, MetricValue::Text),
                    "xs:string".to_string(),
                    semantic_id.as_ref().and_then(crate::aas::Reference::primary_key),
                    unit_from_specs(embedded_data_specifications),
                );
            }
            Element::Range {
                value_type,
                min,
                max,
                semantic_id,
                embedded_data_specifications,
                ..
            } => {
                let xsd = value_type.clone().unwrap_or_else(|| "xs:double".to_string());
                let semantic = semantic_id.as_ref().and_then(crate::aas::Reference::primary_key);
                let unit = unit_from_specs(embedded_data_specifications);
                for (bound, raw) in [("min", min), ("max", max)] {
                    let Some(raw) = raw else { continue };
                    let mut bound_path = path.clone();
                    bound_path.push(bound.to_string());
                    match parse_typed_value(Some(raw.as_str()), &xsd) {
                        Ok(parsed) => self.record(
                            bound_path,
                            LeafKind::Range,
                            parsed,
                            xsd.clone(),
                            semantic.clone(),
                            unit.clone(),
                        ),
                        Err(reason) => self.error(&bound_path, reason),
                    }
                }
            }
            Element::SubmodelElementCollection { value, .. } => {
                for child in value {
                    self.walk(child, &path);
                }
            }
            Element::SubmodelElementList { value, .. } => {
                for (index, child) in value.iter().enumerate() {
                    let name = child
                        .id_short()
                        .map_or_else(|| format!("idx_{index}"), str::to_string);
                    self.walk_named(child, &path, name);
                }
            }
            Element::Entity {
                entity_type,
                global_asset_id,
                statements,
                semantic_id,
                ..
            } => {
                let semantic = semantic_id.as_ref().and_then(crate::aas::Reference::primary_key);
                let mut type_path = path.clone();
                type_path.push("entityType".to_string());
                self.record(
                    type_path,
                    LeafKind::Entity,
                    MetricValue::Text(
                        entity_type.clone().unwrap_or_else(|| "SelfManagedEntity".to_string()),
                    ),
                    "xs:string".to_string(),
                    semantic.clone(),
                    None,
                );
                if let Some(asset_id) = global_asset_id {
                    let mut id_path = path.clone();
                    id_path.push("globalAssetId".to_string());
                    self.record(
                        id_path,
                        LeafKind::Entity,
                        MetricValue::Text(asset_id.clone()),
                        "xs:string".to_string(),
                        semantic.clone(),
                        None,
                    );
                }
                for statement in statements {
                    self.walk(statement, &path);
                }
            }
            Element::ReferenceElement { value, semantic_id, .. } => {
                self.record(
                    path,
                    LeafKind::ReferenceElement,
                    value
                        .as_ref()
                        .filter(|r| !r.keys.is_empty())
                        .map_or(MetricValue::Null, |r| MetricValue::Text(r.joined())),
                    "xs:string".to_string(),
                    semantic_id.as_ref().and_then(crate::aas::Reference::primary_key),
                    None,
                );
            }
            Element::RelationshipElement { first, second, semantic_id, .. } => {
                let first_ref = first.as_ref().map(crate::aas::Reference::joined).unwrap_or_default();
                let second_ref =
                    second.as_ref().map(crate::aas::Reference::joined).unwrap_or_default();
                self.record(
                    path,
                    LeafKind::Relationship,
                    MetricValue::Text(format!("{first_ref} -> {second_ref}")),
                    "xs:string".to_string(),
                    semantic_id.as_ref().and_then(crate::aas::Reference::primary_key),
                    None,
                );
            }
            Element::File { content_type, value, semantic_id, .. } => {
                self.record(
                    path,
                    LeafKind::File,
                    value.clone().map_or(MetricValue::Null, MetricValue::Text),
                    content_type.clone().unwrap_or_else(|| "application/octet-stream".to_string()),
                    semantic_id.as_ref().and_then(crate::aas::Reference::primary_key),
                    None,
                );
            }
            Element::Blob { content_type, value, semantic_id, .. } => {
                // Raw bytes are not forwarded; publish a content hash instead.
                let digest = value.as_deref().map(|content| {
                    let mut hasher = Sha256::new();
                    hasher.update(content.as_bytes());
                    format!("{:x}", hasher.finalize())
                });
                self.record(
                    path,
                    LeafKind::Blob,
                    digest.map_or(MetricValue::Null, MetricValue::Text),
                    content_type.clone().unwrap_or_else(|| "application/octet-stream".to_string()),
                    semantic_id.as_ref().and_then(crate::aas::Reference::primary_key),
                    None,
                );
            }
            Element::Unknown => {
                self.error(&path, "unsupported model type");
            }
        }
    }

}

/// Parse a string-serialised AAS value according to its XSD type.
fn parse_typed_value(raw: Option<&str>, xsd_type: &str) -> Result<MetricValue, String> {
    let Some(raw) = raw else {
        return Ok(MetricValue::Null);
    };

    match xsd_type {
        "xs:boolean" => raw
            .parse::<bool>()
            .map(MetricValue::Bool)
            .map_err(|_| format!("invalid boolean literal '{raw}'")),
        "xs:byte" | "xs:short" | "xs:int" | "xs:integer" | "xs:long" | "xs:unsignedByte"
        | "xs:unsignedShort" | "xs:unsignedInt" => raw
            .parse::<i64>()
            .map(MetricValue::Int)
            .map_err(|_| format!("invalid integer literal '{raw}'")),
        "xs:float" | "xs:double" | "xs:decimal" => raw
            .parse::<f64>()
            .map(MetricValue::Float)
            .map_err(|_| format!("invalid floating-point literal '{raw}'")),
        _ => Ok(MetricValue::Text(raw.to_string())),
    }
}

/// Flatten a submodel into an ordered stream of leaf records.
///
/// The order is deterministic given identical input: depth-first, child order
/// as encountered. Element errors are collected, never fatal.
#[must_use]
pub fn flatten_submodel(
    submodel: &Submodel,
    asset_uri: &str,
    origin_uri: &str,
    timestamp_ms: i64,
    preferred_lang: &str,
) -> SubmodelStream {
    let id_short = submodel.id_short.clone().unwrap_or_else(|| "unnamed".to_string());
    let mut walker = Walker {
        asset_uri,
        submodel_id: &submodel.id,
        submodel_id_short: &id_short,
        submodel_semantic_id: submodel.primary_semantic_id(),
        origin_uri,
        timestamp_ms,
        preferred_lang,
        out: SubmodelStream::default(),
    };

    for element in &submodel.submodel_elements {
        walker.walk(element, &[]);
    }

    tracing::debug!(
        submodel_id = %submodel.id,
        records = walker.out.records.len(),
        errors = walker.out.errors.len(),
        "Flattened submodel"
    );
    walker.out
}

/// Iterate submodels of an environment with the asset URI each belongs to.
///
/// The shell's submodel references are matched by their primary key against
/// submodel identifiers; submodels not referenced by any shell yield `None`.
pub fn iter_submodels(env: &Environment) -> impl Iterator<Item = (&Submodel, Option<&str>)> {
    let mut submodel_to_asset: HashMap<&str, &str> = HashMap::new();
    for shell in &env.asset_administration_shells {
        let Some(asset_uri) = shell.global_asset_id() else { continue };
        for reference in &shell.submodels {
            if let Some(key) = reference.keys.first() {
                submodel_to_asset.insert(key.value.as_str(), asset_uri);
            }
        }
    }

    env.submodels
        .iter()
        .map(move |sm| (sm, submodel_to_asset.get(sm.id.as_str()).copied()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aas::Environment;

    fn tech_data_submodel() -> Submodel {
        serde_json::from_value(serde_json::json!({
            "id": "urn:example:sm:tech",
            "idShort": "TechData",
            "semanticId": {"keys": [{"type": "GlobalReference",
                                     "value": "0173-1#01-AFZ615#016"}]},
            "submodelElements": [
                {"modelType": "Property", "idShort": "Serial",
                 "valueType": "xs:string", "value": "AB123456"},
                {"modelType": "Property", "idShort": "Temp",
                 "valueType": "xs:double", "value": "25.5",
                 "embeddedDataSpecifications": [
                     {"dataSpecificationContent": {"unit": "degC"}}]},
                {"modelType": "SubmodelElementCollection", "idShort": "Limits",
                 "value": [
                     {"modelType": "Range", "idShort": "TempRange",
                      "valueType": "xs:double", "min": "0", "max": "100"}]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn flatten_is_depth_first_and_ordered() {
        let sm = tech_data_submodel();
        let stream = flatten_submodel(&sm, "urn:example:asset:1", "file:///a.json", 1000, "en");

        let paths: Vec<String> = stream.records.iter().map(LeafRecord::metric_name).collect();
        assert_eq!(
            paths,
            vec![
                "Serial",
                "Temp",
                "Limits.TempRange.min",
                "Limits.TempRange.max",
            ]
        );
        assert!(stream.errors.is_empty());
    }

    #[test]
    fn flatten_parses_typed_values_and_units() {
        let sm = tech_data_submodel();
        let stream = flatten_submodel(&sm, "urn:example:asset:1", "file:///a.json", 1000, "en");

        let temp = &stream.records[1];
        assert_eq!(temp.value, MetricValue::Float(25.5));
        assert_eq!(temp.unit.as_deref(), Some("degC"));
        assert_eq!(temp.submodel_semantic_id.as_deref(), Some("0173-1#01-AFZ615#016"));

        let range_min = &stream.records[2];
        assert_eq!(range_min.kind, LeafKind::Range);
        assert_eq!(range_min.value, MetricValue::Float(0.0));
    }

    #[test]
    fn flatten_is_deterministic() {
        let sm = tech_data_submodel();
        let a = flatten_submodel(&sm, "u", "o", 1, "en");
        let b = flatten_submodel(&sm, "u", "o", 1, "en");
        assert_eq!(a.records, b.records);
    }

    #[test]
    fn malformed_value_yields_error_and_continues() {
        let sm: Submodel = serde_json::from_value(serde_json::json!({
            "id": "urn:example:sm:bad",
            "idShort": "Bad",
            "submodelElements": [
                {"modelType": "Property", "idShort": "Broken",
                 "valueType": "xs:int", "value": "not-a-number"},
                {"modelType": "Property", "idShort": "Fine",
                 "valueType": "xs:int", "value": "7"}
            ]
        }))
        .unwrap();

        let stream = flatten_submodel(&sm, "u", "o", 1, "en");
        assert_eq!(stream.errors.len(), 1);
        assert_eq!(stream.errors[0].path, vec!["Broken".to_string()]);
        assert_eq!(stream.records.len(), 1);
        assert_eq!(stream.records[0].value, MetricValue::Int(7));
    }

    #[test]
    fn entity_emits_synthetic_leaves_and_statements() {
        let sm: Submodel = serde_json::from_value(serde_json::json!({
            "id": "urn:example:sm:bom",
            "idShort": "Bom",
            "submodelElements": [
                {"modelType": "Entity", "idShort": "Motor",
                 "entityType": "SelfManagedEntity",
                 "globalAssetId": "urn:example:asset:motor1",
                 "statements": [
                     {"modelType": "Property", "idShort": "Power",
                      "valueType": "xs:int", "value": "400"}]}
            ]
        }))
        .unwrap();

        let stream = flatten_submodel(&sm, "u", "o", 1, "en");
        let paths: Vec<String> = stream.records.iter().map(LeafRecord::metric_name).collect();
        assert_eq!(
            paths,
            vec!["Motor.entityType", "Motor.globalAssetId", "Motor.Power"]
        );
        assert_eq!(stream.records[0].kind, LeafKind::Entity);
    }

    #[test]
    fn list_children_get_positional_paths() {
        let sm: Submodel = serde_json::from_value(serde_json::json!({
            "id": "urn:example:sm:list",
            "idShort": "Phases",
            "submodelElements": [
                {"modelType": "SubmodelElementList", "idShort": "Voltages",
                 "value": [
                     {"modelType": "Property", "valueType": "xs:double", "value": "230.1"},
                     {"modelType": "Property", "valueType": "xs:double", "value": "229.8"}]}
            ]
        }))
        .unwrap();

        let stream = flatten_submodel(&sm, "u", "o", 1, "en");
        let paths: Vec<String> = stream.records.iter().map(LeafRecord::metric_name).collect();
        assert_eq!(paths, vec!["Voltages.idx_0", "Voltages.idx_1"]);
    }

    #[test]
    fn blob_value_is_content_hash() {
        let sm: Submodel = serde_json::from_value(serde_json::json!({
            "id": "urn:example:sm:doc",
            "idShort": "Docs",
            "submodelElements": [
                {"modelType": "Blob", "idShort": "Thumbnail",
                 "contentType": "image/png", "value": "aGVsbG8="}
            ]
        }))
        .unwrap();

        let stream = flatten_submodel(&sm, "u", "o", 1, "en");
        assert_eq!(stream.records.len(), 1);
        let record = &stream.records[0];
        assert_eq!(record.kind, LeafKind::Blob);
        assert_eq!(record.value_type, "image/png");
        match &record.value {
            MetricValue::Text(hash) => assert_eq!(hash.len(), 64),
            other => panic!("expected hash text, got {other:?}"),
        }
    }

    #[test]
    fn iter_submodels_links_assets() {
        let env: Environment = serde_json::from_value(serde_json::json!({
            "assetAdministrationShells": [{
                "id": "urn:example:aas:1",
                "assetInformation": {"globalAssetId": "urn:example:asset:1"},
                "submodels": [{"keys": [{"type": "Submodel",
                                         "value": "urn:example:sm:tech"}]}]
            }],
            "submodels": [
                {"id": "urn:example:sm:tech", "idShort": "TechData"},
                {"id": "urn:example:sm:orphan", "idShort": "Orphan"}
            ]
        }))
        .unwrap();

        let pairs: Vec<(String, Option<String>)> = iter_submodels(&env)
            .map(|(sm, asset)| (sm.id.clone(), asset.map(str::to_string)))
            .collect();
        assert_eq!(pairs[0].1.as_deref(), Some("urn:example:asset:1"));
        assert_eq!(pairs[1].1, None);
    }
}
