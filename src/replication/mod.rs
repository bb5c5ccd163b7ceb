//! Replication - peer protocol and sync
//!
//! Handles:
//! - The HTTP protocol other nodes pull from ([`server`])
//! - Gossip, account discovery and envelope pulls ([`client`])
//! - Push hints between ingestion, the server and the client loop

pub mod client;
pub mod protocol;
pub mod server;

// Re-exports
pub use client::ReplicationClient;
pub use server::{create_router, ApiState};

/// Nudges delivered to the client loop outside its regular schedule.
///
/// Hints only shorten the time to convergence; dropping one is harmless
/// because every cycle polls anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncHint {
    /// An envelope was stored locally; tell known peers about it
    LocalEnvelope { user_id: String, sequence: u64 },

    /// A peer announced it holds `sequence` for `user_id`
    RemoteAhead {
        peer: String,
        user_id: String,
        sequence: u64,
    },
}

/// Capacity of the hint channel; excess hints are dropped.
pub const HINT_CHANNEL_CAPACITY: usize = 256;
