//! Peer registry
//!
//! Known peer addresses with last-seen timestamps. Seeds come from
//! configuration and are never evicted; everything else is learned through
//! handshakes and expires when it stops showing up.

pub mod expiry;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Loaded, NodeError};
use crate::now_secs;
use crate::storage::document::{read_json, write_json};

pub const PEERS_FILE: &str = "peers.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub address: String,
    pub last_seen: u64,
}

/// On-disk shape. Older nodes wrote a bare list of addresses.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerDocument {
    Map(BTreeMap<String, u64>),
    List(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Inserted,
    Refreshed,
    Invalid,
    SelfAddress,
}

/// `host:port` with a non-empty host and a non-zero port.
pub fn is_valid_address(address: &str) -> bool {
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    let host_ok = if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        !inner.is_empty() && inner.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    } else {
        !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    };
    host_ok && matches!(port.parse::<u16>(), Ok(p) if p != 0)
}

pub struct PeerRegistry {
    path: PathBuf,
    self_address: String,
    peers: RwLock<HashMap<String, u64>>,
}

impl PeerRegistry {
    /// Load `peers.json`, or seed a fresh registry and persist it at once.
    pub async fn load_or_bootstrap(
        path: PathBuf,
        self_address: String,
        seeds: &[String],
    ) -> Result<Self, NodeError> {
        let now = now_secs();

        let peers: HashMap<String, u64> = match read_json::<PeerDocument>(&path).await? {
            Loaded::Present(PeerDocument::Map(map)) => map.into_iter().collect(),
            Loaded::Present(PeerDocument::List(list)) => {
                list.into_iter().map(|address| (address, now)).collect()
            }
            Loaded::Absent | Loaded::Corrupt(_) => {
                let peers: HashMap<String, u64> = seeds
                    .iter()
                    .filter(|s| is_valid_address(s) && **s != self_address)
                    .map(|s| (s.clone(), now))
                    .collect();
                write_json(&path, &to_document(&peers)).await?;
                info!(seeds = peers.len(), "Peer registry seeded");
                peers
            }
        };

        info!(count = peers.len(), "Peer registry loaded");
        Ok(Self {
            path,
            self_address,
            peers: RwLock::new(peers),
        })
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// All known addresses, in no particular order.
    pub async fn targets(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.peers.read().await.contains_key(address)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(address, last_seen)| PeerRecord {
                address: address.clone(),
                last_seen: *last_seen,
            })
            .collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    /// Record that `address` is alive.
    pub async fn touch(&self, address: &str) -> TouchOutcome {
        self.touch_at(address, now_secs()).await
    }

    /// Like [`touch`](Self::touch) with an explicit clock. Only new
    /// addresses are flushed to disk; refreshes stay in memory until the
    /// next flush.
    pub async fn touch_at(&self, address: &str, now: u64) -> TouchOutcome {
        if !is_valid_address(address) {
            debug!(address, "Ignoring malformed peer address");
            return TouchOutcome::Invalid;
        }
        if address == self.self_address {
            return TouchOutcome::SelfAddress;
        }

        let mut peers = self.peers.write().await;
        if let Some(last_seen) = peers.get_mut(address) {
            *last_seen = (*last_seen).max(now);
            return TouchOutcome::Refreshed;
        }

        peers.insert(address.to_string(), now);
        info!(address, "New peer added");
        if let Err(e) = write_json(&self.path, &to_document(&peers)).await {
            warn!(error = %e, "Failed to persist peer registry");
        }
        TouchOutcome::Inserted
    }

    /// Remove non-seed peers not seen within `expiry`.
    pub async fn evict_stale(&self, expiry: Duration, seeds: &HashSet<String>) -> usize {
        self.evict_stale_at(now_secs(), expiry, seeds).await
    }

    pub async fn evict_stale_at(
        &self,
        now: u64,
        expiry: Duration,
        seeds: &HashSet<String>,
    ) -> usize {
        let expiry = expiry.as_secs();
        let mut peers = self.peers.write().await;
        let before = peers.len();

        peers.retain(|address, last_seen| {
            let stale = now.saturating_sub(*last_seen) > expiry;
            if stale && !seeds.contains(address) {
                info!(address = %address, idle_secs = now.saturating_sub(*last_seen), "Peer evicted");
                false
            } else {
                true
            }
        });

        let evicted = before - peers.len();
        if evicted > 0 {
            if let Err(e) = write_json(&self.path, &to_document(&peers)).await {
                warn!(error = %e, "Failed to persist peer registry after eviction");
            }
        }
        evicted
    }

    /// Write the in-memory state, including refreshed timestamps.
    pub async fn flush(&self) -> Result<(), NodeError> {
        let peers = self.peers.read().await;
        write_json(&self.path, &to_document(&peers)).await
    }
}

fn to_document(peers: &HashMap<String, u64>) -> BTreeMap<&str, u64> {
    peers.iter().map(|(k, v)| (k.as_str(), *v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SELF: &str = "127.0.0.1:3000";

    async fn registry(dir: &TempDir, seeds: &[&str]) -> PeerRegistry {
        let seeds: Vec<String> = seeds.iter().map(|s| s.to_string()).collect();
        PeerRegistry::load_or_bootstrap(dir.path().join(PEERS_FILE), SELF.into(), &seeds)
            .await
            .unwrap()
    }

    #[test]
    fn test_address_validation() {
        for good in ["127.0.0.1:3000", "node-a.local:80", "[::1]:3001", "seed_1:9"] {
            assert!(is_valid_address(good), "{good}");
        }
        for bad in ["", "host", ":3000", "host:", "host:0", "host:70000", "a b:1", "http://x:1"] {
            assert!(!is_valid_address(bad), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_bootstrap_from_seeds_is_persisted() {
        let dir = TempDir::new().unwrap();
        let peers = registry(&dir, &["10.0.0.1:3000", SELF, "garbage"]).await;

        assert_eq!(peers.targets().await, vec!["10.0.0.1:3000".to_string()]);
        assert!(dir.path().join(PEERS_FILE).exists());

        // Second start reads from disk and ignores the seed list
        let reloaded = registry(&dir, &["10.0.0.9:3000"]).await;
        assert_eq!(reloaded.targets().await, vec!["10.0.0.1:3000".to_string()]);
    }

    #[tokio::test]
    async fn test_legacy_list_document() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PEERS_FILE), br#"["10.0.0.2:3000"]"#).unwrap();

        let peers = registry(&dir, &[]).await;
        assert!(peers.contains("10.0.0.2:3000").await);
    }

    #[tokio::test]
    async fn test_touch_outcomes() {
        let dir = TempDir::new().unwrap();
        let peers = registry(&dir, &[]).await;

        assert_eq!(peers.touch("10.0.0.3:3000").await, TouchOutcome::Inserted);
        assert_eq!(peers.touch("10.0.0.3:3000").await, TouchOutcome::Refreshed);
        assert_eq!(peers.touch(SELF).await, TouchOutcome::SelfAddress);
        assert_eq!(peers.touch("nonsense").await, TouchOutcome::Invalid);
        assert_eq!(peers.len().await, 1);
    }

    #[tokio::test]
    async fn test_eviction_spares_seeds() {
        let dir = TempDir::new().unwrap();
        let peers = registry(&dir, &[]).await;
        let seed = "10.0.0.1:3000".to_string();
        let seeds: HashSet<String> = [seed.clone()].into_iter().collect();

        peers.touch_at(&seed, 1_000).await;
        peers.touch_at("10.0.0.2:3000", 1_000).await;
        peers.touch_at("10.0.0.3:3000", 1_550).await;

        let evicted = peers
            .evict_stale_at(1_700, Duration::from_secs(600), &seeds)
            .await;
        assert_eq!(evicted, 0);

        let evicted = peers
            .evict_stale_at(2_000, Duration::from_secs(600), &seeds)
            .await;
        assert_eq!(evicted, 1);
        assert!(peers.contains(&seed).await);
        assert!(!peers.contains("10.0.0.2:3000").await);
        assert!(peers.contains("10.0.0.3:3000").await);

        // Eviction was flushed
        let reloaded = registry(&dir, &[]).await;
        assert!(!reloaded.contains("10.0.0.2:3000").await);
    }

    #[tokio::test]
    async fn test_refresh_keeps_peer_alive() {
        let dir = TempDir::new().unwrap();
        let peers = registry(&dir, &[]).await;
        let none = HashSet::new();

        peers.touch_at("10.0.0.4:3000", 100).await;
        peers.touch_at("10.0.0.4:3000", 900).await;

        let evicted = peers.evict_stale_at(1_000, Duration::from_secs(600), &none).await;
        assert_eq!(evicted, 0);
        assert_eq!(peers.snapshot().await[0].last_seen, 900);
    }
}
