//! # AAS-Uplink Proto
//!
//! Wire-level concerns of the two publish planes:
//! - Sparkplug B protobuf payload encoding/decoding (Eclipse Tahu schema)
//! - Sparkplug topic scheme (`spBv1.0/{group}/{msgType}/{edgeNode}[/{device}]`)
//! - Retained-plane topic builder and command-topic parsing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod payload;
pub mod sparkplug;
pub mod topics;
pub mod types;

pub use payload::{decode_payload, PayloadBuilder, PayloadError};
pub use sparkplug::{Metric, Payload, PropertySet, PropertyValue};
pub use topics::{CommandTopic, RetainedTopicScheme, SparkplugMessageType, SparkplugTopicScheme};
pub use types::{xsd_to_datatype, DataType};
