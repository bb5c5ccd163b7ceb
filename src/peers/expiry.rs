//! Background peer expiry

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::PeerRegistry;

/// Periodically evicts stale peers until shutdown.
pub struct PeerExpiry {
    registry: Arc<PeerRegistry>,
    interval: Duration,
    expiry: Duration,
    seeds: HashSet<String>,
}

impl PeerExpiry {
    pub fn new(
        registry: Arc<PeerRegistry>,
        interval: Duration,
        expiry: Duration,
        seeds: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            registry,
            interval,
            expiry,
            seeds: seeds.into_iter().collect(),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            expiry_secs = self.expiry.as_secs(),
            "Peer expiry started"
        );
        let mut timer = tokio::time::interval(self.interval);
        // The first tick fires immediately; nothing can be stale yet.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let evicted = self.registry.evict_stale(self.expiry, &self.seeds).await;
                    let remaining = self.registry.len().await;
                    debug!(evicted, remaining, "Peer expiry pass");
                }
                _ = shutdown.recv() => break,
            }
        }

        // Keep refreshed timestamps across restarts
        if let Err(e) = self.registry.flush().await {
            warn!(error = %e, "Failed to flush peer registry on shutdown");
        }
        info!("Peer expiry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_secs;
    use tempfile::TempDir;

    const SELF: &str = "127.0.0.1:3000";
    const SEED: &str = "10.0.0.1:3000";

    #[tokio::test]
    async fn test_loop_evicts_on_timer_and_flushes_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("peers.json");
        let registry = Arc::new(
            PeerRegistry::load_or_bootstrap(path.clone(), SELF.into(), &[SEED.to_string()])
                .await
                .unwrap(),
        );
        registry.touch_at("10.0.0.2:3000", 1).await;
        registry.touch("10.0.0.3:3000").await;
        let refreshed_at = now_secs() + 1_000;
        registry.touch_at("10.0.0.3:3000", refreshed_at).await;

        let (tx, rx) = broadcast::channel(1);
        let expiry = PeerExpiry::new(
            registry.clone(),
            Duration::from_millis(20),
            Duration::from_secs(60),
            vec![SEED.to_string()],
        );
        let handle = tokio::spawn(expiry.run(rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!registry.contains("10.0.0.2:3000").await);
        assert!(registry.contains(SEED).await);

        tx.send(()).unwrap();
        handle.await.unwrap();

        let reloaded = PeerRegistry::load_or_bootstrap(path, SELF.into(), &[]).await.unwrap();
        let records = reloaded.snapshot().await;
        let addresses: Vec<&str> = records.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec![SEED, "10.0.0.3:3000"]);
        assert_eq!(records[1].last_seen, refreshed_at);
    }
}
