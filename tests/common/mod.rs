//! Shared harness: real nodes on ephemeral loopback ports

#![allow(dead_code)]

use std::sync::Arc;

use envelope_node::replication::{server, ApiState, ReplicationClient, SyncHint, HINT_CHANNEL_CAPACITY};
use envelope_node::{Config, NodeContext, NodeState};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub struct TestNode {
    pub node: Arc<NodeContext>,
    pub client: ReplicationClient,
    pub address: String,
    pub hints: mpsc::Receiver<SyncHint>,
    pub dir: TempDir,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl TestNode {
    /// Start a node serving the peer protocol. `configure` runs after the
    /// port is known, before the node opens its storage.
    pub async fn start(id: &str, configure: impl FnOnce(&mut Config)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.node.id = id.to_string();
        config.node.host = "127.0.0.1".to_string();
        config.node.port = port;
        config.node.data_dir = dir.path().to_path_buf();
        config.sync.connect_timeout_secs = 1;
        config.sync.request_timeout_secs = 2;
        config.sync.download_timeout_secs = 2;
        configure(&mut config);

        let node = NodeContext::open(config).await.unwrap();
        node.set_state(NodeState::Ready).await;

        let (hint_tx, hints) = mpsc::channel(HINT_CHANNEL_CAPACITY);
        let (shutdown, mut shutdown_rx) = broadcast::channel::<()>(1);
        let state = ApiState {
            node: node.clone(),
            hints: hint_tx,
        };
        let server = tokio::spawn(server::serve(listener, state, async move {
            let _ = shutdown_rx.recv().await;
        }));

        let client = ReplicationClient::new(node.clone()).unwrap();
        Self {
            address: node.self_address().to_string(),
            node,
            client,
            hints,
            dir,
            shutdown,
            server,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }
}
