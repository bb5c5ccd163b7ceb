//! Node context and lifecycle
//!
//! Owns the guarded stores every loop and handler shares. Nothing outside
//! this struct touches the accounts, peers or reference documents directly.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::accounts::{AccountRegistry, ReferenceStore};
use crate::config::Config;
use crate::error::NodeError;
use crate::peers::{PeerRegistry, PEERS_FILE};
use crate::storage::StorageResolver;

/// Lifecycle state reported on `/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Starting,
    Ready,
    Stopping,
}

pub struct NodeContext {
    pub config: Config,
    pub resolver: Arc<StorageResolver>,
    pub accounts: AccountRegistry,
    pub references: ReferenceStore,
    pub peers: Arc<PeerRegistry>,
    state: RwLock<NodeState>,
    started_at: Instant,
}

impl NodeContext {
    /// Create the directory layout and load every persisted document.
    ///
    /// Errors here are fatal: the node cannot serve without its storage.
    pub async fn open(config: Config) -> Result<Arc<Self>, NodeError> {
        config.validate()?;

        let resolver = Arc::new(
            StorageResolver::new(&config.node.data_dir, config.storage.use_anonymized_names)
                .await?,
        );
        let accounts =
            AccountRegistry::load_or_bootstrap(resolver.clone(), &config.initial_account).await?;
        let references = ReferenceStore::new(resolver.clone());
        let peers = Arc::new(
            PeerRegistry::load_or_bootstrap(
                resolver.system_path(PEERS_FILE),
                config.self_address(),
                &config.peers.seeds,
            )
            .await?,
        );

        let (account_count, peer_count) = (accounts.len().await, peers.len().await);
        info!(
            node_id = %config.node.id,
            accounts = account_count,
            peers = peer_count,
            "Node context opened"
        );

        Ok(Arc::new(Self {
            config,
            resolver,
            accounts,
            references,
            peers,
            state: RwLock::new(NodeState::Starting),
            started_at: Instant::now(),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    pub fn self_address(&self) -> &str {
        self.peers.self_address()
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: NodeState) {
        let mut current = self.state.write().await;
        if *current != state {
            info!(from = ?*current, to = ?state, "Node state changed");
            *current = state;
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
