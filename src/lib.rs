//! envelope-node: replicates per-user envelope logs across a gossip network
//!
//! Each node stores append-only envelope logs for a set of accounts,
//! learns about other nodes from seeds and peer exchange, and pulls
//! whatever envelopes it is missing from a random sample of peers.
//!
//! Module map:
//! - [`storage`]: directory layout, document IO, per-key locks
//! - [`accounts`]: account registry, reference logs, envelope naming
//! - [`peers`]: peer registry and expiry
//! - [`replication`]: peer protocol server and sync client
//! - [`ingest`], [`janitor`], [`status`]: background loops

pub mod accounts;
pub mod config;
pub mod error;
pub mod ingest;
pub mod janitor;
pub mod node;
pub mod peers;
pub mod replication;
pub mod status;
pub mod storage;

pub use config::Config;
pub use error::{ClientError, NodeError};
pub use node::{NodeContext, NodeState};

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
