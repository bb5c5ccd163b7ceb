//! Status snapshot writer
//!
//! Writes `system/status.json` for external dashboards: this node's own
//! entry plus a reachability probe of every known peer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{ClientError, NodeError};
use crate::node::{NodeContext, NodeState};
use crate::replication::protocol::StatusResponse;
use crate::storage::document::write_json;

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub address: String,
    pub status: Reachability,
    pub latency_ms: Option<u64>,
    pub peers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub node_id: String,
    pub hostname: String,
    pub state: NodeState,
    pub last_update: u64,
    pub nodes: BTreeMap<String, NodeEntry>,
}

pub struct StatusReporter {
    node: Arc<NodeContext>,
    http: reqwest::Client,
    interval: Duration,
    hostname: String,
}

impl StatusReporter {
    pub fn new(node: Arc<NodeContext>) -> Result<Self, ClientError> {
        let status = &node.config.status;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(status.probe_timeout_ms))
            .build()?;
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            interval: Duration::from_secs(status.interval_secs),
            http,
            hostname,
            node,
        })
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Status reporter started");
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.write_snapshot().await {
                        warn!(error = %e, "Failed to write status snapshot");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Status reporter stopped");
    }

    pub async fn write_snapshot(&self) -> Result<StatusSnapshot, NodeError> {
        let snapshot = self.collect().await;
        write_json(&self.node.resolver.system_path(STATUS_FILE), &snapshot).await?;
        debug!(nodes = snapshot.nodes.len(), "Status snapshot written");
        Ok(snapshot)
    }

    pub async fn collect(&self) -> StatusSnapshot {
        let node = &self.node;
        let mut nodes = BTreeMap::new();
        nodes.insert(
            node.node_id().to_string(),
            NodeEntry {
                address: node.self_address().to_string(),
                status: Reachability::Online,
                latency_ms: Some(0),
                peers: Some(node.peers.len().await),
            },
        );

        let probes = node.peers.targets().await.into_iter().map(|address| self.probe(address));
        for (key, entry) in futures::future::join_all(probes).await {
            nodes.insert(key, entry);
        }

        StatusSnapshot {
            node_id: node.node_id().to_string(),
            hostname: self.hostname.clone(),
            state: node.state().await,
            last_update: crate::now_secs(),
            nodes,
        }
    }

    /// Probe a peer's `/status`. Keyed by its node id when it answers,
    /// by address otherwise.
    async fn probe(&self, address: String) -> (String, NodeEntry) {
        let started = Instant::now();
        let url = format!("http://{}/status", address);

        let result = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                response.json::<StatusResponse>().await.ok()
            }
            _ => None,
        };

        match result {
            Some(status) => {
                let entry = NodeEntry {
                    address,
                    status: Reachability::Online,
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                    peers: Some(status.peers_count),
                };
                (status.node_id, entry)
            }
            None => {
                let entry = NodeEntry {
                    address: address.clone(),
                    status: Reachability::Offline,
                    latency_ms: None,
                    peers: None,
                };
                (address, entry)
            }
        }
    }
}
