//! # AAS-Uplink Core
//!
//! Domain model and AAS processing primitives for AAS-Uplink.
//!
//! This crate provides:
//! - The flattened leaf-record model shared by both publish planes
//! - A serde model of the AAS JSON environment (shells, submodels, elements)
//! - Deterministic recursive traversal of submodels into leaf records
//! - MQTT topic-segment sanitisation
//! - ISA-95 hierarchy mapping from asset URIs to addresses

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aas;
pub mod mapping;
pub mod model;
pub mod sanitize;
pub mod traversal;

pub use mapping::{AddressResolver, MappingConfig};
pub use model::{AssetAddress, LeafKind, LeafRecord, MetricValue, TraversalError};
pub use traversal::{flatten_submodel, iter_submodels, SubmodelStream};
