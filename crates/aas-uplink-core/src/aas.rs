//! Serde model of the AAS JSON environment.
//!
//! Covers the subset of the AAS v3 metamodel the daemon navigates: shells
//! with asset information, submodels, and the submodel element hierarchy.
//! Package parsing (AASX containers) is left to the ingest adapters; this
//! model deserialises the JSON environment serialisation.

use serde::{Deserialize, Serialize};

/// Top-level AAS environment document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Environment {
    /// Asset administration shells
    pub asset_administration_shells: Vec<Shell>,
    /// Submodels
    pub submodels: Vec<Submodel>,
}

/// An asset administration shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shell {
    /// Globally unique shell identifier
    pub id: String,
    /// Short identifier
    #[serde(default)]
    pub id_short: Option<String>,
    /// Asset information (carries the global asset id)
    #[serde(default)]
    pub asset_information: Option<AssetInformation>,
    /// References to the shell's submodels
    #[serde(default)]
    pub submodels: Vec<Reference>,
}

impl Shell {
    /// The globalAssetId, if present.
    #[must_use]
    pub fn global_asset_id(&self) -> Option<&str> {
        self.asset_information
            .as_ref()
            .and_then(|info| info.global_asset_id.as_deref())
    }
}

/// Asset information block of a shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetInformation {
    /// Global asset identifier (typically an IRI)
    #[serde(default)]
    pub global_asset_id: Option<String>,
    /// Asset kind (Instance / Type)
    #[serde(default)]
    pub asset_kind: Option<String>,
}

/// A submodel: a named sub-tree of related elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submodel {
    /// Globally unique submodel identifier
    pub id: String,
    /// Short identifier
    #[serde(default)]
    pub id_short: Option<String>,
    /// Semantic reference of the submodel template
    #[serde(default)]
    pub semantic_id: Option<Reference>,
    /// Element tree
    #[serde(default)]
    pub submodel_elements: Vec<Element>,
}

impl Submodel {
    /// Primary semantic key of the submodel, if any.
    #[must_use]
    pub fn primary_semantic_id(&self) -> Option<String> {
        self.semantic_id.as_ref().and_then(Reference::primary_key)
    }
}

/// A reference: an ordered chain of keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// Reference type (ModelReference / ExternalReference)
    #[serde(default, rename = "type")]
    pub reference_type: Option<String>,
    /// Key chain
    #[serde(default)]
    pub keys: Vec<Key>,
}

impl Reference {
    /// First key value, used as the primary identifier.
    #[must_use]
    pub fn primary_key(&self) -> Option<String> {
        self.keys.first().map(|k| k.value.clone())
    }

    /// Slash-joined key chain for reference-valued leaves.
    #[must_use]
    pub fn joined(&self) -> String {
        self.keys
            .iter()
            .map(|k| k.value.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A single key within a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    /// Key type (Submodel, GlobalReference, ...)
    #[serde(default, rename = "type")]
    pub key_type: Option<String>,
    /// Key value
    pub value: String,
}

/// A language-tagged string of a multi-language property.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LangString {
    /// BCP-47 language code
    pub language: String,
    /// Text in that language
    pub text: String,
}

/// A submodel element, discriminated by `modelType`.
///
/// Unrecognised model types deserialise to [`Element::Unknown`]; traversal
/// reports them as element errors and continues with siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "modelType")]
pub enum Element {
    /// A single typed value
    #[serde(rename_all = "camelCase")]
    Property {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// XSD value type (e.g. `xs:double`)
        #[serde(default)]
        value_type: Option<String>,
        /// Value in its string serialisation
        #[serde(default)]
        value: Option<String>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
        /// Embedded data specifications (carry the IEC 61360 unit)
        #[serde(default)]
        embedded_data_specifications: Vec<DataSpecification>,
    },
    /// A value with one string per language
    #[serde(rename_all = "camelCase")]
    MultiLanguageProperty {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// Language-tagged strings
        #[serde(default)]
        value: Vec<LangString>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
        /// Embedded data specifications
        #[serde(default)]
        embedded_data_specifications: Vec<DataSpecification>,
    },
    /// A min/max range
    #[serde(rename_all = "camelCase")]
    Range {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// XSD value type of both bounds
        #[serde(default)]
        value_type: Option<String>,
        /// Lower bound
        #[serde(default)]
        min: Option<String>,
        /// Upper bound
        #[serde(default)]
        max: Option<String>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
        /// Embedded data specifications
        #[serde(default)]
        embedded_data_specifications: Vec<DataSpecification>,
    },
    /// A named collection of child elements
    #[serde(rename_all = "camelCase")]
    SubmodelElementCollection {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// Children
        #[serde(default)]
        value: Vec<Element>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
    },
    /// An ordered list of child elements
    #[serde(rename_all = "camelCase")]
    SubmodelElementList {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// Children, addressed by position
        #[serde(default)]
        value: Vec<Element>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
    },
    /// An entity with statements and an own asset identity
    #[serde(rename_all = "camelCase")]
    Entity {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// SelfManagedEntity / CoManagedEntity
        #[serde(default)]
        entity_type: Option<String>,
        /// The entity's own global asset id
        #[serde(default)]
        global_asset_id: Option<String>,
        /// Statement elements
        #[serde(default)]
        statements: Vec<Element>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
    },
    /// A reference-valued element
    #[serde(rename_all = "camelCase")]
    ReferenceElement {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// Target reference
        #[serde(default)]
        value: Option<Reference>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
    },
    /// A directed relationship between two references
    #[serde(rename_all = "camelCase")]
    RelationshipElement {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// Source reference
        #[serde(default)]
        first: Option<Reference>,
        /// Target reference
        #[serde(default)]
        second: Option<Reference>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
    },
    /// An external file reference
    #[serde(rename_all = "camelCase")]
    File {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// MIME type
        #[serde(default)]
        content_type: Option<String>,
        /// File path or URI
        #[serde(default)]
        value: Option<String>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
    },
    /// Inline binary content (base64)
    #[serde(rename_all = "camelCase")]
    Blob {
        /// Short identifier
        #[serde(default)]
        id_short: Option<String>,
        /// MIME type
        #[serde(default)]
        content_type: Option<String>,
        /// Base64-encoded content
        #[serde(default)]
        value: Option<String>,
        /// Semantic reference
        #[serde(default)]
        semantic_id: Option<Reference>,
    },
    /// Any model type this daemon does not navigate
    #[serde(other)]
    Unknown,
}

impl Element {
    /// idShort of the element, where the variant carries one.
    #[must_use]
    pub fn id_short(&self) -> Option<&str> {
        match self {
            Element::Property { id_short, .. }
            | Element::MultiLanguageProperty { id_short, .. }
            | Element::Range { id_short, .. }
            | Element::SubmodelElementCollection { id_short, .. }
            | Element::SubmodelElementList { id_short, .. }
            | Element::Entity { id_short, .. }
            | Element::ReferenceElement { id_short, .. }
            | Element::RelationshipElement { id_short, .. }
            | Element::File { id_short, .. }
            | Element::Blob { id_short, .. } => id_short.as_deref(),
            Element::Unknown => None,
        }
    }

    /// Primary semantic key of the element, where present.
    #[must_use]
    pub fn primary_semantic_id(&self) -> Option<String> {
        match self {
            Element::Property { semantic_id, .. }
            | Element::MultiLanguageProperty { semantic_id, .. }
            | Element::Range { semantic_id, .. }
            | Element::SubmodelElementCollection { semantic_id, .. }
            | Element::SubmodelElementList { semantic_id, .. }
            | Element::Entity { semantic_id, .. }
            | Element::ReferenceElement { semantic_id, .. }
            | Element::RelationshipElement { semantic_id, .. }
            | Element::File { semantic_id, .. }
            | Element::Blob { semantic_id, .. } => {
                semantic_id.as_ref().and_then(Reference::primary_key)
            }
            Element::Unknown => None,
        }
    }
}

/// Embedded data specification wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSpecification {
    /// Specification content (IEC 61360 carries the unit)
    #[serde(default)]
    pub data_specification_content: Option<DataSpecificationContent>,
}

/// IEC 61360 data specification content subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSpecificationContent {
    /// Unit of measurement
    #[serde(default)]
    pub unit: Option<String>,
}

/// Extract the IEC 61360 unit from a specification list.
#[must_use]
pub fn unit_from_specs(specs: &[DataSpecification]) -> Option<String> {
    specs
        .iter()
        .filter_map(|s| s.data_specification_content.as_ref())
        .find_map(|c| c.unit.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_environment_with_property() {
        let doc = serde_json::json!({
            "assetAdministrationShells": [{
                "id": "urn:example:aas:pump1",
                "idShort": "Pump1",
                "assetInformation": {"globalAssetId": "urn:example:asset:pump1"},
                "submodels": [{"type": "ModelReference",
                               "keys": [{"type": "Submodel", "value": "urn:example:sm:tech"}]}]
            }],
            "submodels": [{
                "id": "urn:example:sm:tech",
                "idShort": "TechData",
                "submodelElements": [{
                    "modelType": "Property",
                    "idShort": "Temp",
                    "valueType": "xs:double",
                    "value": "25.5"
                }]
            }]
        });

        let env: Environment = serde_json::from_value(doc).unwrap();
        assert_eq!(env.asset_administration_shells.len(), 1);
        assert_eq!(
            env.asset_administration_shells[0].global_asset_id(),
            Some("urn:example:asset:pump1")
        );
        assert_eq!(env.submodels[0].submodel_elements.len(), 1);
        assert_eq!(env.submodels[0].submodel_elements[0].id_short(), Some("Temp"));
    }

    #[test]
    fn unknown_model_type_is_tolerated() {
        let doc = serde_json::json!({
            "modelType": "Capability",
            "idShort": "CanWeld"
        });
        let element: Element = serde_json::from_value(doc).unwrap();
        assert!(matches!(element, Element::Unknown));
    }

    #[test]
    fn reference_joined() {
        let reference = Reference {
            reference_type: None,
            keys: vec![
                Key { key_type: None, value: "urn:a".into() },
                Key { key_type: None, value: "urn:b".into() },
            ],
        };
        assert_eq!(reference.joined(), "urn:a/urn:b");
        assert_eq!(reference.primary_key().as_deref(), Some("urn:a"));
    }
}
