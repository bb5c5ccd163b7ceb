//! Per-user reference logs
//!
//! A reference log records which envelopes are materialized locally and the
//! highest sequence seen. It is the only document written concurrently by
//! several loops (ingestion, sync, inbound hints), so every read-modify-write
//! happens under the user's entry in a [`KeyedLocks`] table.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use super::envelope::{content_hash, envelope_filename, EnvelopeName};
use crate::error::{Loaded, NodeError};
use crate::now_secs;
use crate::storage::document::{read_json, write_atomic, write_json};
use crate::storage::{KeyedLocks, StorageResolver};

const REFERENCES_FILE: &str = "references.json";

/// One materialized envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub seq: u64,
    /// Content hash; peers with stale metadata may omit it
    #[serde(default)]
    pub hash: Option<String>,
    /// Unix seconds when this node recorded the envelope
    #[serde(default)]
    pub ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceLog {
    #[serde(alias = "user")]
    pub user_id: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub last_sync: u64,
}

impl ReferenceLog {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            sequence: 0,
            files: Vec::new(),
            last_sync: 0,
        }
    }

    pub fn record(&self, seq: u64) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.seq == seq)
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.record(seq).is_some()
    }

    pub fn hash_for(&self, seq: u64) -> Option<&str> {
        self.record(seq).and_then(|f| f.hash.as_deref())
    }

    /// Envelopes to pull from `remote`, ascending, each with the hash the
    /// peer recorded for it.
    ///
    /// Sequences above ours are wanted even when the peer's file list omits
    /// them; holes below ours only when the peer lists them. Callers bound
    /// `remote.sequence - self.sequence` before asking.
    pub fn pull_plan(&self, remote: &ReferenceLog) -> Vec<(u64, Option<String>)> {
        let have: HashSet<u64> = self.files.iter().map(|f| f.seq).collect();

        let mut wanted: BTreeMap<u64, Option<String>> = remote
            .files
            .iter()
            .filter(|f| f.seq > 0 && !have.contains(&f.seq))
            .map(|f| (f.seq, f.hash.clone()))
            .collect();

        if remote.sequence > self.sequence {
            for seq in self.sequence + 1..=remote.sequence {
                if !have.contains(&seq) {
                    wanted.entry(seq).or_insert(None);
                }
            }
        }
        wanted.into_iter().collect()
    }
}

/// Result of applying one envelope to a reference log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Written and recorded; state advanced
    Stored,
    /// Same seq and hash already recorded; nothing changed
    Duplicate,
    /// Seq already recorded with a different hash; rejected
    Conflict { existing: Option<String> },
    /// Declared hash does not match the bytes; rejected
    HashMismatch { declared: String, actual: String },
}

impl PersistOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, PersistOutcome::Stored)
    }
}

/// Guarded access to every user's reference log and envelope files.
pub struct ReferenceStore {
    resolver: Arc<StorageResolver>,
    locks: KeyedLocks,
}

impl ReferenceStore {
    pub fn new(resolver: Arc<StorageResolver>) -> Self {
        Self {
            resolver,
            locks: KeyedLocks::new(),
        }
    }

    /// Exclusive access to one storage folder, keyed by storage key.
    ///
    /// Every write to a user's folder holds this guard.
    pub async fn lock_folder(&self, storage_key: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(storage_key).await
    }

    /// Current log for a user. Absent, corrupt and unreadable logs all
    /// degrade to an empty log.
    pub async fn load(&self, user_id: &str) -> ReferenceLog {
        match self.read_log(user_id).await {
            Ok(log) => log,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Could not read reference log");
                ReferenceLog::empty(user_id)
            }
        }
    }

    pub async fn local_sequence(&self, user_id: &str) -> u64 {
        self.load(user_id).await.sequence
    }

    /// Sequence the next locally produced envelope would take.
    pub async fn next_sequence(&self, user_id: &str) -> u64 {
        self.local_sequence(user_id).await + 1
    }

    /// Apply an envelope received from a peer (or produced locally).
    ///
    /// `hash` may be `None` when the peer's metadata lacked it; it is then
    /// computed from the bytes. Only [`PersistOutcome::Stored`] advances state.
    pub async fn persist_envelope(
        &self,
        user_id: &str,
        data: &[u8],
        seq: u64,
        hash: Option<&str>,
    ) -> Result<PersistOutcome, NodeError> {
        let _guard = self.lock_folder(&self.resolver.resolve(user_id)).await;
        let mut log = self.read_log(user_id).await?;

        let result = self.apply_locked(user_id, &mut log, data, seq, hash).await;
        if let Err(e) = &result {
            error!(user = %user_id, seq, error = %e, "Failed to persist envelope");
        }
        result
    }

    /// Store locally produced bytes under the next free sequence.
    ///
    /// Allocation and write share one critical section, so two producers for
    /// the same user can never claim the same sequence.
    pub async fn append_local(
        &self,
        user_id: &str,
        data: &[u8],
    ) -> Result<(u64, String, PersistOutcome), NodeError> {
        let _guard = self.lock_folder(&self.resolver.resolve(user_id)).await;
        let mut log = self.read_log(user_id).await?;

        let seq = log.sequence + 1;
        let hash = content_hash(data);
        let outcome = self
            .apply_locked(user_id, &mut log, data, seq, Some(&hash))
            .await?;
        Ok((seq, hash, outcome))
    }

    /// Path of a stored envelope addressed by download filename.
    ///
    /// A bare `{seq}.env` name is resolved through the reference log.
    pub async fn envelope_path(
        &self,
        user_id: &str,
        filename: &str,
    ) -> Result<Option<PathBuf>, NodeError> {
        let name = EnvelopeName::parse(filename)?;
        let dir = self.resolver.existing_storage_path(user_id);

        let path = match name.hash {
            Some(hash) => dir.join(envelope_filename(name.seq, &hash)),
            None => {
                let log = self.load(user_id).await;
                match log.hash_for(name.seq) {
                    Some(hash) => dir.join(envelope_filename(name.seq, hash)),
                    None => return Ok(None),
                }
            }
        };

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_log(&self, user_id: &str) -> Result<ReferenceLog, NodeError> {
        let path = self.resolver.existing_storage_path(user_id).join(REFERENCES_FILE);
        let log = match read_json::<ReferenceLog>(&path).await? {
            Loaded::Present(log) => log,
            Loaded::Absent | Loaded::Corrupt(_) => ReferenceLog::empty(user_id),
        };
        Ok(log)
    }

    async fn apply_locked(
        &self,
        user_id: &str,
        log: &mut ReferenceLog,
        data: &[u8],
        seq: u64,
        hash: Option<&str>,
    ) -> Result<PersistOutcome, NodeError> {
        let actual = content_hash(data);
        if let Some(declared) = hash {
            if !declared.eq_ignore_ascii_case(&actual) {
                warn!(user = %user_id, seq, declared, actual = %actual, "Envelope hash mismatch, rejected");
                return Ok(PersistOutcome::HashMismatch {
                    declared: declared.to_string(),
                    actual,
                });
            }
        }

        if let Some(existing) = log.record(seq) {
            if existing.hash.as_deref() == Some(actual.as_str()) {
                debug!(user = %user_id, seq, "Envelope already recorded");
                return Ok(PersistOutcome::Duplicate);
            }
            warn!(
                user = %user_id,
                seq,
                existing = ?existing.hash,
                incoming = %actual,
                "Sequence conflict, keeping the recorded envelope"
            );
            return Ok(PersistOutcome::Conflict {
                existing: existing.hash.clone(),
            });
        }

        let dir = self.resolver.storage_path(user_id).await?;
        let filename = envelope_filename(seq, &actual);
        write_atomic(&dir.join(&filename), data).await?;

        let now = now_secs();
        log.user_id = user_id.to_string();
        log.sequence = log.sequence.max(seq);
        log.files.push(FileRecord {
            seq,
            hash: Some(actual),
            ts: now,
        });
        log.last_sync = now;
        write_json(&dir.join(REFERENCES_FILE), log).await?;

        info!(user = %user_id, seq, file = %filename, "Envelope stored");
        Ok(PersistOutcome::Stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> ReferenceStore {
        let resolver = StorageResolver::new(dir.path(), false).await.unwrap();
        ReferenceStore::new(Arc::new(resolver))
    }

    #[tokio::test]
    async fn test_unknown_user_has_sequence_zero() {
        let dir = TempDir::new().unwrap();
        let refs = store(&dir).await;
        assert_eq!(refs.local_sequence("ghost").await, 0);
        assert_eq!(refs.next_sequence("ghost").await, 1);
        assert_eq!(refs.load("ghost").await, ReferenceLog::empty("ghost"));
    }

    #[tokio::test]
    async fn test_sequence_is_max_of_accepted() {
        let dir = TempDir::new().unwrap();
        let refs = store(&dir).await;

        for seq in [3u64, 1, 5, 2] {
            let body = format!("payload-{seq}");
            let outcome = refs.persist_envelope("alice", body.as_bytes(), seq, None).await.unwrap();
            assert_eq!(outcome, PersistOutcome::Stored);
        }

        let log = refs.load("alice").await;
        assert_eq!(log.sequence, 5);
        assert_eq!(log.files.len(), 4);

        let mut remote = ReferenceLog::empty("alice");
        remote.sequence = 5;
        let plan: Vec<u64> = log.pull_plan(&remote).into_iter().map(|(seq, _)| seq).collect();
        assert!(plan.is_empty(), "holes below our sequence need a listing");

        remote.files.push(FileRecord { seq: 4, hash: Some("ab".into()), ts: 0 });
        remote.sequence = 7;
        assert_eq!(
            log.pull_plan(&remote),
            vec![(4, Some("ab".to_string())), (6, None), (7, None)]
        );
    }

    #[test]
    fn test_pull_plan_when_in_sync_is_empty() {
        let files: Vec<FileRecord> = (1..=20_000u64)
            .map(|seq| FileRecord { seq, hash: None, ts: 0 })
            .collect();
        let local = ReferenceLog {
            user_id: "alice".into(),
            sequence: 20_000,
            files: files.clone(),
            last_sync: 0,
        };
        let remote = local.clone();
        assert!(local.pull_plan(&remote).is_empty());
    }

    #[tokio::test]
    async fn test_reapply_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let refs = store(&dir).await;
        let hash = content_hash(b"hello");

        let first = refs.persist_envelope("alice", b"hello", 1, Some(&hash)).await.unwrap();
        let second = refs.persist_envelope("alice", b"hello", 1, Some(&hash)).await.unwrap();

        assert_eq!(first, PersistOutcome::Stored);
        assert_eq!(second, PersistOutcome::Duplicate);
        let log = refs.load("alice").await;
        assert_eq!(log.sequence, 1);
        assert_eq!(log.files.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_hash_is_rejected() {
        let dir = TempDir::new().unwrap();
        let refs = store(&dir).await;

        refs.persist_envelope("alice", b"first", 1, None).await.unwrap();
        let outcome = refs.persist_envelope("alice", b"second", 1, None).await.unwrap();

        assert!(matches!(outcome, PersistOutcome::Conflict { .. }));
        let log = refs.load("alice").await;
        assert_eq!(log.files.len(), 1);
        assert_eq!(log.hash_for(1), Some(content_hash(b"first").as_str()));
    }

    #[tokio::test]
    async fn test_declared_hash_must_match_bytes() {
        let dir = TempDir::new().unwrap();
        let refs = store(&dir).await;

        let wrong = content_hash(b"other");
        let outcome = refs.persist_envelope("alice", b"hello", 1, Some(&wrong)).await.unwrap();

        assert!(matches!(outcome, PersistOutcome::HashMismatch { .. }));
        assert_eq!(refs.local_sequence("alice").await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_log_degrades_to_zero() {
        let dir = TempDir::new().unwrap();
        let refs = store(&dir).await;
        let user_dir = dir.path().join("storage").join("alice");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(user_dir.join(REFERENCES_FILE), b"garbage").unwrap();

        assert_eq!(refs.local_sequence("alice").await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_local_appends_get_distinct_sequences() {
        let dir = TempDir::new().unwrap();
        let refs = Arc::new(store(&dir).await);

        let mut handles = Vec::new();
        for i in 0..10 {
            let refs = refs.clone();
            handles.push(tokio::spawn(async move {
                let body = format!("drop-{i}");
                refs.append_local("alice", body.as_bytes()).await.unwrap().0
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        assert_eq!(refs.load("alice").await.files.len(), 10);
    }

    #[tokio::test]
    async fn test_envelope_path_by_name_and_by_sequence() {
        let dir = TempDir::new().unwrap();
        let refs = store(&dir).await;
        refs.persist_envelope("alice", b"hello", 1, None).await.unwrap();
        let hash = content_hash(b"hello");

        let by_name = refs
            .envelope_path("alice", &envelope_filename(1, &hash))
            .await
            .unwrap()
            .unwrap();
        let by_seq = refs.envelope_path("alice", "00000001.env").await.unwrap().unwrap();

        assert_eq!(by_name, by_seq);
        assert_eq!(std::fs::read(by_name).unwrap(), b"hello");
        assert!(refs.envelope_path("alice", "00000002.env").await.unwrap().is_none());
        assert!(refs.envelope_path("alice", "references.json").await.is_err());
    }
}
