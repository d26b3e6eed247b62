//! # AAS-Uplink State
//!
//! Embedded SQLite persistence for everything that must survive restart:
//! Sparkplug aliases, the birth cache, the session counter, retained-plane
//! payload hashes, and the semantic subsystem's fingerprints, lifecycle
//! states, context dictionary, fidelity history and streaming-drift state.
//!
//! One directory per deployment, one database file per writer:
//! `sparkplug.db` (broker I/O worker), `hashes.db` (retained publisher),
//! `semantic.db` (semantic subsystem). Every file carries a schema version;
//! a mismatch refuses startup.
//!
//! All mutations commit synchronously inside one transaction. Tables have a
//! configurable `max_entries` cap; an insert at capacity evicts exactly one
//! least-recently-touched row and increments the store's eviction counter.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod db;
pub mod error;
pub mod hashes;
pub mod semantic;
pub mod sparkplug;

pub use db::SCHEMA_VERSION;
pub use error::StateError;
pub use hashes::HashStore;
pub use semantic::{FingerprintRow, LifecycleRow, SemanticStore};
pub use sparkplug::{BirthRow, SparkplugStore};
