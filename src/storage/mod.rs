//! Storage layer - filesystem layout and persisted documents
//!
//! Handles:
//! - Mapping user ids to (optionally anonymized) storage keys
//! - The storage / inbound / system directory roots
//! - Atomic JSON document reads and writes
//! - Per-key locks for read-modify-write of shared documents

pub mod document;
pub mod locks;
pub mod resolver;

// Re-exports
pub use locks::KeyedLocks;
pub use resolver::StorageResolver;
