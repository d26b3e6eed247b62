//! # AAS-Uplink AAS Adapter
//!
//! Ingress and egress against AAS sources:
//! - AAS Part 2 HTTP client (repository polling and property write-back)
//! - Identifier and idShortPath encoding per the Part 2 API rules
//! - AAS environment loader for JSON documents on disk

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod encoding;
pub mod loader;

pub use client::{RepositoryClient, RepositoryClientConfig, RepositoryError};
pub use encoding::{decode_identifier, encode_identifier, encode_id_short_path, EncodingError};
pub use loader::{load_environment, LoaderError};
