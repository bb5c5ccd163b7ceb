//! Replication client - gossip and envelope sync
//!
//! Each cycle samples a few known peers and, for each one:
//! 1. exchanges peer lists (handshake / PEX)
//! 2. learns accounts it does not know yet
//! 3. diffs every account's reference log and pulls missing envelopes
//!
//! A failing peer is logged and skipped; polling on the next cycle is the
//! only retry.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::protocol::{
    AccountsPayload, AnnounceRequest, HandshakeRequest, HandshakeResponse, RemoteAccount,
    HANDSHAKE_ACCEPTED,
};
use super::SyncHint;
use crate::accounts::envelope::{envelope_filename, sequence_filename};
use crate::accounts::{Account, PersistOutcome, ReferenceLog};
use crate::error::ClientError;
use crate::node::NodeContext;
use crate::peers::TouchOutcome;

/// Totals for one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub peers_contacted: usize,
    pub peers_failed: usize,
    pub envelopes_stored: usize,
}

/// Totals for one peer within a cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerReport {
    pub peers_learned: usize,
    pub accounts_added: usize,
    pub envelopes_stored: usize,
}

pub struct ReplicationClient {
    node: Arc<NodeContext>,
    http: reqwest::Client,
    download_timeout: Duration,
    fanout: usize,
    max_gap: u64,
}

impl ReplicationClient {
    pub fn new(node: Arc<NodeContext>) -> Result<Self, ClientError> {
        let sync = &node.config.sync;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(sync.connect_timeout_secs))
            .timeout(Duration::from_secs(sync.request_timeout_secs))
            .build()?;

        Ok(Self {
            download_timeout: Duration::from_secs(sync.download_timeout_secs),
            fanout: sync.fanout,
            max_gap: sync.max_gap,
            http,
            node,
        })
    }

    /// Run until shutdown: announce to seeds, then cycle on the configured
    /// interval and react to hints in between.
    pub async fn run(
        self: Arc<Self>,
        mut hints: mpsc::Receiver<SyncHint>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let interval = self.node.config.sync_interval();
        info!(interval_secs = interval.as_secs(), fanout = self.fanout, "Replication client started");

        self.announce_to_seeds().await;

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.run_cycle().await;
                }
                Some(hint) = hints.recv() => {
                    self.handle_hint(hint).await;
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Replication client stopped");
    }

    /// Handshake with every configured seed. Unreachable seeds are ignored.
    pub async fn announce_to_seeds(&self) {
        for seed in &self.node.config.peers.seeds {
            if seed == self.node.self_address() {
                continue;
            }
            match self.handshake(seed).await {
                Ok(learned) => info!(seed = %seed, learned, "Announced to seed"),
                Err(e) => debug!(seed = %seed, error = %e, "Seed unreachable"),
            }
        }
    }

    /// One gossip + sync pass over a random sample of known peers.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let targets = self.node.peers.targets().await;
        if targets.is_empty() {
            debug!("No known peers, skipping sync cycle");
            return report;
        }

        let sample = sample_targets(&targets, self.node.self_address(), self.fanout);
        for target in sample {
            report.peers_contacted += 1;
            match self.sync_with_peer(&target).await {
                Ok(peer) => report.envelopes_stored += peer.envelopes_stored,
                Err(e) => {
                    report.peers_failed += 1;
                    warn!(peer = %target, error = %e, "Sync with peer failed");
                }
            }
        }

        info!(
            contacted = report.peers_contacted,
            failed = report.peers_failed,
            stored = report.envelopes_stored,
            "Sync cycle complete"
        );
        report
    }

    /// Full exchange with one peer.
    ///
    /// A failed handshake does not stop account and envelope sync; only an
    /// unreachable account listing fails the peer.
    pub async fn sync_with_peer(&self, target: &str) -> Result<PeerReport, ClientError> {
        let mut report = PeerReport::default();

        match self.handshake(target).await {
            Ok(learned) => report.peers_learned = learned,
            Err(e) => warn!(peer = %target, error = %e, "Handshake failed"),
        }

        let remote_accounts = self.fetch_accounts(target).await?;
        for remote in remote_accounts {
            match self.ensure_account(target, remote).await {
                Ok((user_id, added)) => {
                    if added {
                        report.accounts_added += 1;
                    }
                    match self.sync_user(target, &user_id).await {
                        Ok(stored) => report.envelopes_stored += stored,
                        Err(e) => warn!(peer = %target, user = %user_id, error = %e, "User sync failed"),
                    }
                }
                Err(e) => warn!(peer = %target, error = %e, "Account discovery failed"),
            }
        }

        Ok(report)
    }

    /// Exchange peer lists. Returns how many addresses were new to us.
    pub async fn handshake(&self, target: &str) -> Result<usize, ClientError> {
        let request = HandshakeRequest {
            listen_port: self.node.config.node.port,
            known_peers: self.node.peers.targets().await,
        };
        let url = peer_url(target, &["handshake"])?;
        let response = self.http.post(url.clone()).json(&request).send().await?;
        let response: HandshakeResponse = decode(url, response).await?;

        if response.status != HANDSHAKE_ACCEPTED {
            return Err(ClientError::Payload(format!(
                "handshake {} by {}",
                response.status, response.node_id
            )));
        }

        self.node.peers.touch(target).await;
        let mut learned = 0;
        for address in &response.known_peers {
            if self.node.peers.touch(address).await == TouchOutcome::Inserted {
                learned += 1;
            }
        }
        debug!(peer = %target, remote_node = %response.node_id, learned, "Handshake complete");
        Ok(learned)
    }

    /// `GET /accounts`, normalized.
    pub async fn fetch_accounts(&self, target: &str) -> Result<Vec<RemoteAccount>, ClientError> {
        let url = peer_url(target, &["accounts"])?;
        let response = self.http.get(url.clone()).send().await?;
        let payload: AccountsPayload = decode(url, response).await?;
        Ok(payload.normalize())
    }

    /// Make sure a remote account exists locally. Returns the id and whether
    /// it was newly added.
    async fn ensure_account(
        &self,
        target: &str,
        remote: RemoteAccount,
    ) -> Result<(String, bool), ClientError> {
        let user_id = remote.user_id;
        if self.node.accounts.contains(&user_id).await {
            return Ok((user_id, false));
        }

        let account = match remote.record {
            Some(record) => record,
            None => self.fetch_account(target, &user_id).await?,
        };

        let added = self
            .node
            .accounts
            .add(account)
            .await
            .map_err(|e| ClientError::Payload(format!("could not register {}: {}", user_id, e)))?;
        if added {
            if let Err(e) = self.node.resolver.inbound_path(&user_id).await {
                warn!(user = %user_id, error = %e, "Could not create inbound directory");
            }
        }
        Ok((user_id, added))
    }

    /// `GET /accounts/{id}`; a peer that cannot describe the account still
    /// yields a bare record so its envelopes can be replicated.
    async fn fetch_account(&self, target: &str, user_id: &str) -> Result<Account, ClientError> {
        let url = peer_url(target, &["accounts", user_id])?;
        let response = self.http.get(url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Account::new(user_id));
        }
        let mut account: Account = decode(url, response).await?;
        account.user_id = user_id.to_string();
        Ok(account)
    }

    /// Pull every envelope the peer has for `user_id` that we lack.
    ///
    /// Sequences above our own are fetched even when the peer's file list
    /// is missing them; holes below our sequence are only backfilled when
    /// the peer lists them. A peer claiming a lead beyond `sync.max_gap`
    /// is treated as a malformed payload.
    pub async fn sync_user(&self, target: &str, user_id: &str) -> Result<usize, ClientError> {
        let url = peer_url(target, &["accounts", user_id, "references"])?;
        let response = self.http.get(url.clone()).send().await?;
        let remote: ReferenceLog = decode(url, response).await?;

        let local = self.node.references.load(user_id).await;
        let lead = remote.sequence.saturating_sub(local.sequence);
        if lead > self.max_gap {
            return Err(ClientError::Payload(format!(
                "{} claims sequence {} for {}, {} ahead of ours",
                target, remote.sequence, user_id, lead
            )));
        }

        let wanted = local.pull_plan(&remote);
        if wanted.is_empty() {
            return Ok(0);
        }
        info!(
            peer = %target,
            user = %user_id,
            local = local.sequence,
            remote = remote.sequence,
            missing = wanted.len(),
            "Peer has envelopes we lack"
        );

        let mut stored = 0;
        for (seq, hash) in wanted {
            let hash = hash.as_deref();
            let data = match self.fetch_envelope(target, user_id, seq, hash).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(peer = %target, user = %user_id, seq, error = %e, "Envelope download failed");
                    continue;
                }
            };

            match self.node.references.persist_envelope(user_id, &data, seq, hash).await {
                Ok(PersistOutcome::Stored) => stored += 1,
                Ok(outcome) => debug!(user = %user_id, seq, ?outcome, "Envelope not applied"),
                Err(e) => warn!(peer = %target, user = %user_id, seq, error = %e, "Envelope not persisted"),
            }
        }
        Ok(stored)
    }

    /// Download one envelope by its canonical name, or by sequence when the
    /// peer did not tell us the hash.
    pub async fn fetch_envelope(
        &self,
        target: &str,
        user_id: &str,
        seq: u64,
        hash: Option<&str>,
    ) -> Result<Vec<u8>, ClientError> {
        let filename = match hash {
            Some(hash) => envelope_filename(seq, hash),
            None => sequence_filename(seq),
        };
        let url = peer_url(target, &["accounts", user_id, "download", filename.as_str()])?;
        let response = self
            .http
            .get(url.clone())
            .timeout(self.download_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn handle_hint(&self, hint: SyncHint) {
        match hint {
            SyncHint::LocalEnvelope { user_id, sequence } => {
                self.broadcast_envelope(user_id, sequence).await;
            }
            SyncHint::RemoteAhead { peer, user_id, sequence } => {
                if self.node.references.local_sequence(&user_id).await >= sequence {
                    return;
                }
                debug!(peer = %peer, user = %user_id, sequence, "Following announce hint");
                let remote = RemoteAccount { user_id: user_id.clone(), record: None };
                if let Err(e) = self.ensure_account(&peer, remote).await {
                    warn!(peer = %peer, user = %user_id, error = %e, "Announced account unavailable");
                    return;
                }
                if let Err(e) = self.sync_user(&peer, &user_id).await {
                    warn!(peer = %peer, user = %user_id, error = %e, "Hinted sync failed");
                }
            }
        }
    }

    /// Tell every known peer a new envelope exists. Fire-and-forget: the
    /// posts run in the background and failures are only logged.
    pub async fn broadcast_envelope(&self, user_id: String, sequence: u64) {
        let targets: Vec<String> = self
            .node
            .peers
            .targets()
            .await
            .into_iter()
            .filter(|t| t != self.node.self_address())
            .collect();
        if targets.is_empty() {
            return;
        }

        let http = self.http.clone();
        let body = AnnounceRequest {
            sequence,
            listen_port: self.node.config.node.port,
        };
        tokio::spawn(async move {
            let posts = targets.iter().map(|target| {
                let http = http.clone();
                let body = body.clone();
                let user_id = user_id.clone();
                async move {
                    let url = peer_url(target, &["accounts", user_id.as_str(), "announce"])?;
                    http.post(url).json(&body).send().await?;
                    Ok::<_, ClientError>(())
                }
            });
            let results = futures::future::join_all(posts).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            debug!(user = %user_id, sequence, peers = results.len(), failed, "Envelope announced");
        });
    }
}

/// Up to `fanout` distinct random targets, never ourselves.
pub fn sample_targets(targets: &[String], self_address: &str, fanout: usize) -> Vec<String> {
    let candidates: Vec<&String> = targets.iter().filter(|t| *t != self_address).collect();
    let mut rng = rand::thread_rng();
    candidates
        .choose_multiple(&mut rng, fanout)
        .map(|t| (*t).clone())
        .collect()
}

/// `http://{target}/{segments...}` with each segment percent-encoded.
fn peer_url(target: &str, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = Url::parse(&format!("http://{}/", target))
        .map_err(|e| ClientError::Payload(format!("bad peer address {}: {}", target, e)))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::Payload(format!("bad peer address {}", target)))?
        .clear()
        .extend(segments);
    Ok(url)
}

async fn decode<T: DeserializeOwned>(url: Url, response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Payload(format!("{}: {}", url, e)))
}
