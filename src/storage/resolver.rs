//! User id to filesystem location mapping

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::error::NodeError;

const STORAGE_DIR: &str = "storage";
const INBOUND_DIR: &str = "inbound";
const SYSTEM_DIR: &str = "system";

/// Resolves where a user's envelopes and inbound drops live.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    base_storage: PathBuf,
    base_inbound: PathBuf,
    base_system: PathBuf,
    anonymize: bool,
}

impl StorageResolver {
    /// Create the resolver and the three base directories.
    ///
    /// Failing here means the node cannot store anything and must not start.
    pub async fn new(data_dir: &Path, anonymize: bool) -> Result<Self, NodeError> {
        let resolver = Self {
            base_storage: data_dir.join(STORAGE_DIR),
            base_inbound: data_dir.join(INBOUND_DIR),
            base_system: data_dir.join(SYSTEM_DIR),
            anonymize,
        };

        for dir in [&resolver.base_storage, &resolver.base_inbound, &resolver.base_system] {
            fs::create_dir_all(dir).await?;
        }

        info!(
            data_dir = %data_dir.display(),
            anonymize,
            "Storage layout initialized"
        );
        Ok(resolver)
    }

    /// Storage key for a user: the id itself, or its SHA-256 hex digest.
    pub fn resolve(&self, user_id: &str) -> String {
        storage_key(user_id, self.anonymize)
    }

    /// Durable envelope directory for a user (created if absent).
    pub async fn storage_path(&self, user_id: &str) -> Result<PathBuf, NodeError> {
        let path = self.base_storage.join(self.resolve(user_id));
        fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Inbound drop directory for a user (created if absent).
    pub async fn inbound_path(&self, user_id: &str) -> Result<PathBuf, NodeError> {
        let path = self.base_inbound.join(self.resolve(user_id));
        fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Storage directory without creating it, for read-only lookups.
    pub fn existing_storage_path(&self, user_id: &str) -> PathBuf {
        self.base_storage.join(self.resolve(user_id))
    }

    pub fn system_path(&self, name: &str) -> PathBuf {
        self.base_system.join(name)
    }

    pub fn storage_root(&self) -> &Path {
        &self.base_storage
    }

    pub fn inbound_root(&self) -> &Path {
        &self.base_inbound
    }
}

/// Pure form of [`StorageResolver::resolve`].
pub fn storage_key(user_id: &str, anonymize: bool) -> String {
    if anonymize {
        hex::encode(Sha256::digest(user_id.as_bytes()))
    } else {
        user_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_is_stable() {
        assert_eq!(storage_key("alice", false), "alice");
        assert_eq!(storage_key("alice", true), storage_key("alice", true));
        assert_ne!(storage_key("alice", true), storage_key("alice", false));
        assert_ne!(storage_key("alice", true), storage_key("bob", true));
    }

    #[test]
    fn test_anonymized_key_is_sha256_hex() {
        // SHA-256("alice")
        assert_eq!(
            storage_key("alice", true),
            "2bd806c97f0e00af1a1fc3328fa763a9269723c8db8fac4f93af71db186d6e90"
        );
    }

    #[tokio::test]
    async fn test_paths_are_created() {
        let dir = TempDir::new().unwrap();
        let resolver = StorageResolver::new(dir.path(), false).await.unwrap();

        let storage = resolver.storage_path("alice").await.unwrap();
        let inbound = resolver.inbound_path("alice").await.unwrap();

        assert_eq!(storage, dir.path().join("storage").join("alice"));
        assert_eq!(inbound, dir.path().join("inbound").join("alice"));
        assert!(storage.is_dir());
        assert!(inbound.is_dir());
        assert!(dir.path().join("system").is_dir());
    }

    #[tokio::test]
    async fn test_unwritable_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        assert!(StorageResolver::new(&blocker, true).await.is_err());
    }
}
