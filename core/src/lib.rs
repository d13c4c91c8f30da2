//! Core library crate.
//!
//! This crate provides the building blocks of a decentralized,
//! cryptographically-authenticated UUID registry:
//!
//! - deterministic binary primitives (`codec`),
//! - the shared signed/verified-object contract (`signed_object`),
//! - identity, signing and verification (`keys`),
//! - references to signed objects, resolved on demand (`revision`),
//! - identifier mutations (`operation`) batched into proof-of-work blocks
//!   (`block`),
//! - the in-memory fork tree over persisted blocks (`tree`),
//! - the UUID -> latest-operation mapping and head-switch procedure
//!   (`identifier`),
//! - the three-table persistent store (`store`),
//! - the top-level validate-then-persist pipeline (`ingest`),
//! - Prometheus metrics (`metrics`) and node configuration (`config`).
//!
//! `daemon` and `cli` compose these pieces into a network relay and an
//! interactive console/miner, respectively.

pub mod block;
pub mod codec;
pub mod config;
pub mod error;
pub mod identifier;
pub mod ingest;
pub mod keys;
pub mod metrics;
pub mod operation;
pub mod revision;
pub mod signed_object;
pub mod store;
pub mod tree;

// Re-export the error taxonomy at the crate root.
pub use error::{ChainKind, CoreError, CoreResult};

// Re-export the domain types.
pub use block::Block;
pub use operation::Operation;
pub use revision::Revision;
pub use signed_object::{SignedObject, Verified};
pub use tree::{BlockRecord, BlockTree};

// Re-export identity and the store.
pub use keys::{PublicKey, Signature, User};
pub use store::{MemoryBackend, RocksBackend, Store, Table, TableBackend};

// Re-export the ingest entry points.
pub use ingest::{put_block, remove_block, update_blocks};
pub use identifier::{forward_operations_chain, set_head};

// Re-export ambient-stack types.
pub use config::{MetricsConfig, MiningConfig, NetworkConfig, NodeConfig, StorageConfig};
pub use metrics::{run_prometheus_http_server, IngestMetrics, MetricsRegistry};

pub use codec::Id;
