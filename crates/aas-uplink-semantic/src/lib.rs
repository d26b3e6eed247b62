//! # AAS-Uplink Semantic
//!
//! The pre-publish and post-publish semantic machinery:
//! - Validation of leaf records against semantic rules
//! - Context pointers ("pointer mode") with a persistent dictionary
//! - Schema-drift detection against stored fingerprints
//! - Streaming value-anomaly detection with half-space trees
//! - Per-asset lifecycle tracking (online / stale / offline)
//! - Fidelity scoring of the AAS-to-broker transformation
//! - Authorization and shaping of broker-to-AAS write commands

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod context;
pub mod drift;
pub mod fidelity;
pub mod lifecycle;
pub mod streaming;
pub mod validation;

pub use command::{CommandDecision, CommandRouter, CommandRules, WriteCommand, WriteTarget};
pub use context::{ContextBundle, ContextPointer, PointerCache};
pub use drift::{DriftDetector, DriftEvent, DriftEventType, DriftRules, Severity};
pub use fidelity::{FidelityCalculator, FidelityReport, FidelityRules};
pub use lifecycle::{AssetState, LifecycleEvent, LifecycleRules, LifecycleTracker};
pub use streaming::{StreamingDetector, StreamingRules};
pub use validation::{ValidationOutcome, ValidationRules, Validator, ValueConstraint};
