//! Inbound watcher
//!
//! Promotes files dropped into `inbound/{key}/` into sequenced envelopes in
//! the owner's log, deletes the drop, and hints the replication client so
//! peers hear about it before their next poll.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::accounts::PersistOutcome;
use crate::error::NodeError;
use crate::node::NodeContext;
use crate::replication::SyncHint;

pub struct InboundWatcher {
    node: Arc<NodeContext>,
    hints: mpsc::Sender<SyncHint>,
    interval: Duration,
}

impl InboundWatcher {
    pub fn new(node: Arc<NodeContext>, hints: mpsc::Sender<SyncHint>) -> Self {
        let interval = Duration::from_millis(node.config.ingest.interval_ms);
        Self { node, hints, interval }
    }

    /// Create an inbound directory for every known account.
    pub async fn ensure_inbound_dirs(&self) -> Result<(), NodeError> {
        for user_id in self.node.accounts.user_ids().await {
            self.node.resolver.inbound_path(&user_id).await?;
        }
        Ok(())
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.ensure_inbound_dirs().await {
            error!(error = %e, "Failed to prepare inbound directories");
        }
        info!(interval_ms = self.interval.as_millis() as u64, "Inbound watcher started");

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.scan_once().await;
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Inbound watcher stopped");
    }

    /// Scan every account's inbound directory once. Returns how many files
    /// became envelopes.
    pub async fn scan_once(&self) -> usize {
        let mut ingested = 0;

        for user_id in self.node.accounts.user_ids().await {
            let inbound = match self.node.resolver.inbound_path(&user_id).await {
                Ok(path) => path,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Inbound directory unavailable");
                    continue;
                }
            };

            let mut entries = match fs::read_dir(&inbound).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %inbound.display(), error = %e, "Cannot list inbound directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %inbound.display(), error = %e, "Inbound listing interrupted");
                        break;
                    }
                };

                let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                // Dotfiles are partial writes from whoever is dropping the file
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !is_file || hidden {
                    continue;
                }

                if self.ingest_file(&user_id, &entry.path()).await {
                    ingested += 1;
                }
            }
        }

        if ingested > 0 {
            debug!(ingested, "Inbound scan complete");
        }
        ingested
    }

    async fn ingest_file(&self, user_id: &str, path: &Path) -> bool {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read inbound file");
                return false;
            }
        };

        let (sequence, hash, outcome) = match self.node.references.append_local(user_id, &data).await {
            Ok(result) => result,
            Err(e) => {
                error!(user = %user_id, path = %path.display(), error = %e, "Ingestion failed, will retry");
                return false;
            }
        };

        if outcome != PersistOutcome::Stored {
            warn!(user = %user_id, sequence, ?outcome, "Inbound file not stored");
            return false;
        }

        // Deletion failure means the same bytes are ingested again next tick
        // under a new sequence; an operator has to reconcile that by hand.
        if let Err(e) = fs::remove_file(path).await {
            error!(path = %path.display(), error = %e, "Stored envelope but could not remove inbound file");
        }
        info!(user = %user_id, sequence, hash = %hash, "Inbound file ingested");

        let hint = SyncHint::LocalEnvelope {
            user_id: user_id.to_string(),
            sequence,
        };
        if let Err(e) = self.hints.try_send(hint) {
            debug!(error = %e, "Dropping local envelope hint");
        }
        true
    }
}
