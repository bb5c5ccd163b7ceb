//! Garbage collector
//!
//! Two independent sweeps on one timer:
//! - orphan storage: user folders whose key no registered account maps to
//! - stale inbound: drops that sat unprocessed past the retention window
//!
//! A failed delete is logged and the sweep moves on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::node::NodeContext;

pub struct GarbageCollector {
    node: Arc<NodeContext>,
    interval: Duration,
    retention: Duration,
}

impl GarbageCollector {
    pub fn new(node: Arc<NodeContext>) -> Self {
        let interval = Duration::from_secs(node.config.gc.interval_secs);
        let retention = Duration::from_secs(node.config.gc.inbound_retention_secs);
        Self { node, interval, retention }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Garbage collector started"
        );
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let orphans = self.sweep_orphans().await;
                    let stale = self.sweep_stale_inbound(SystemTime::now()).await;
                    debug!(orphans, stale, "Garbage collection pass");
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Garbage collector stopped");
    }

    /// Remove storage folders that belong to no registered account.
    pub async fn sweep_orphans(&self) -> usize {
        let valid: HashSet<String> = self.node.accounts.storage_keys().await.into_iter().collect();
        let root = self.node.resolver.storage_root();

        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Cannot list storage root");
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_dir || valid.contains(&name) {
                continue;
            }

            // Writers hold the folder lock; an account registered since the
            // snapshot shows up here or recreates the folder after us.
            let _guard = self.node.references.lock_folder(&name).await;
            if self.node.accounts.storage_keys().await.contains(&name) {
                debug!(folder = %name, "Folder claimed by a new account, keeping it");
                continue;
            }

            info!(folder = %name, "Removing orphaned storage folder");
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(folder = %name, error = %e, "Failed to remove orphaned folder"),
            }
        }
        removed
    }

    /// Remove inbound files last modified before `now - retention`,
    /// whichever account they belong to.
    pub async fn sweep_stale_inbound(&self, now: SystemTime) -> usize {
        let Some(threshold) = now.checked_sub(self.retention) else {
            return 0;
        };
        let root = self.node.resolver.inbound_root();

        let mut folders = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Cannot list inbound root");
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(folder)) = folders.next_entry().await {
            if !folder.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let mut files = match fs::read_dir(folder.path()).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(path = %folder.path().display(), error = %e, "Cannot list inbound folder");
                    continue;
                }
            };

            while let Ok(Some(file)) = files.next_entry().await {
                let modified = match file.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) => {
                        warn!(path = %file.path().display(), error = %e, "Cannot stat inbound file");
                        continue;
                    }
                };
                if modified >= threshold {
                    continue;
                }

                info!(path = %file.path().display(), "Removing stale inbound file");
                match fs::remove_file(file.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %file.path().display(), error = %e, "Failed to remove stale inbound file"),
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn node(dir: &TempDir) -> Arc<NodeContext> {
        let mut config = Config::default();
        config.node.data_dir = dir.path().to_path_buf();
        config.initial_account.user_id = "alice".into();
        NodeContext::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_orphan_sweep_keeps_registered_users() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        node.accounts.add(Account::new("bob")).await.unwrap();

        let alice = node.resolver.storage_path("alice").await.unwrap();
        let bob = node.resolver.storage_path("bob").await.unwrap();
        let removed_user = node.resolver.storage_path("mallory").await.unwrap();
        std::fs::write(removed_user.join("00000001_x.env"), b"old").unwrap();

        let gc = GarbageCollector::new(node.clone());
        assert_eq!(gc.sweep_orphans().await, 1);

        assert!(alice.exists());
        assert!(bob.exists());
        assert!(!removed_user.exists());
    }

    #[tokio::test]
    async fn test_orphan_sweep_rechecks_under_folder_lock() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        let bob_folder = node.resolver.storage_path("bob").await.unwrap();
        let bob_key = node.resolver.resolve("bob");

        // Bob registers while the sweep waits on his folder
        let guard = node.references.lock_folder(&bob_key).await;
        let gc = GarbageCollector::new(node.clone());
        let sweep = tokio::spawn(async move { gc.sweep_orphans().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.accounts.add(Account::new("bob")).await.unwrap();
        drop(guard);

        assert_eq!(sweep.await.unwrap(), 0);
        assert!(bob_folder.exists());
    }

    #[tokio::test]
    async fn test_stale_inbound_sweep_uses_retention() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        let inbound = node.resolver.inbound_path("alice").await.unwrap();
        let orphan_inbound = node.resolver.inbound_path("ghost").await.unwrap();
        std::fs::write(inbound.join("stuck"), b"x").unwrap();
        std::fs::write(orphan_inbound.join("stuck"), b"y").unwrap();

        let gc = GarbageCollector::new(node.clone());

        // Fresh files survive
        assert_eq!(gc.sweep_stale_inbound(SystemTime::now()).await, 0);

        // A day and an hour later both are gone, registered or not
        let later = SystemTime::now() + Duration::from_secs(25 * 60 * 60);
        assert_eq!(gc.sweep_stale_inbound(later).await, 2);
        assert!(!inbound.join("stuck").exists());
        assert!(!orphan_inbound.join("stuck").exists());
    }
}
