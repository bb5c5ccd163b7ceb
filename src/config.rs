//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::NodeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub peers: PeerConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub initial_account: InitialAccountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Host this node advertises to peers and binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port for the peer protocol
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root of the storage, inbound and system directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between sync cycles
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Peers contacted per cycle
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for metadata requests (handshake, accounts, references)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for envelope downloads
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Largest sequence lead a peer may claim over us in one pull
    #[serde(default = "default_max_gap")]
    pub max_gap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Name user folders by SHA-256 of the user id instead of the id itself.
    /// Changing this on an existing data dir orphans every user folder.
    #[serde(default = "default_true")]
    pub use_anonymized_names: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Bootstrap addresses (`host:port`), never evicted
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Peers not seen for this long are evicted
    #[serde(default = "default_peer_expiry")]
    pub expiry_secs: u64,

    #[serde(default = "default_peer_expiry_check")]
    pub expiry_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,

    /// Inbound files older than this are deleted
    #[serde(default = "default_inbound_retention")]
    pub inbound_retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_interval")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Seconds between status snapshot writes
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,

    /// Per-peer probe timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

/// Account created when no accounts document exists yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialAccountConfig {
    #[serde(default = "default_admin_user")]
    pub user_id: String,

    #[serde(default)]
    pub display_name: Option<String>,
}

// Defaults
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 3000 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_sync_interval() -> u64 { 30 }
fn default_fanout() -> usize { 3 }
fn default_connect_timeout() -> u64 { 3 }
fn default_request_timeout() -> u64 { 5 }
fn default_download_timeout() -> u64 { 15 }
fn default_max_gap() -> u64 { 10_000 }
fn default_true() -> bool { true }
fn default_peer_expiry() -> u64 { 600 }
fn default_peer_expiry_check() -> u64 { 600 }
fn default_gc_interval() -> u64 { 60 }
fn default_inbound_retention() -> u64 { 24 * 60 * 60 }
fn default_ingest_interval() -> u64 { 2000 }
fn default_status_interval() -> u64 { 10 }
fn default_probe_timeout() -> u64 { 1500 }
fn default_admin_user() -> String { "admin".to_string() }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            fanout: default_fanout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            download_timeout_secs: default_download_timeout(),
            max_gap: default_max_gap(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { use_anonymized_names: default_true() }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            expiry_secs: default_peer_expiry(),
            expiry_check_interval_secs: default_peer_expiry_check(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval(),
            inbound_retention_secs: default_inbound_retention(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { interval_ms: default_ingest_interval() }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_status_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for InitialAccountConfig {
    fn default() -> Self {
        Self {
            user_id: default_admin_user(),
            display_name: Some("Administrator".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                id: "NODE-DEFAULT".to_string(),
                host: default_host(),
                port: default_port(),
                data_dir: default_data_dir(),
            },
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            peers: PeerConfig::default(),
            gc: GcConfig::default(),
            ingest: IngestConfig::default(),
            status: StatusConfig::default(),
            initial_account: InitialAccountConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, NodeError> {
        let config: Config =
            toml::from_str(content).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.node.id.trim().is_empty() {
            return Err(NodeError::Config("node.id must not be empty".into()));
        }
        if self.sync.fanout == 0 {
            return Err(NodeError::Config("sync.fanout must be at least 1".into()));
        }
        let periods = [
            ("sync.interval_secs", self.sync.interval_secs),
            ("sync.max_gap", self.sync.max_gap),
            ("peers.expiry_check_interval_secs", self.peers.expiry_check_interval_secs),
            ("gc.interval_secs", self.gc.interval_secs),
            ("ingest.interval_ms", self.ingest.interval_ms),
            ("status.interval_secs", self.status.interval_secs),
            ("status.probe_timeout_ms", self.status.probe_timeout_ms),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(NodeError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.initial_account.user_id.trim().is_empty() {
            return Err(NodeError::Config("initial_account.user_id must not be empty".into()));
        }
        for seed in &self.peers.seeds {
            if !crate::peers::is_valid_address(seed) {
                return Err(NodeError::InvalidAddress(seed.clone()));
            }
        }
        Ok(())
    }

    /// Address this node advertises, used to skip itself in peer lists
    pub fn self_address(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }
}
