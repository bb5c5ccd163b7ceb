//! JSON document persistence
//!
//! Every persisted document (accounts, peers, reference logs, status) goes
//! through these two functions. Writes land in a sibling temp file first and
//! are renamed into place, so a crash never leaves a half-written document.

use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::warn;

use crate::error::{Loaded, NodeError};

/// Read and parse a JSON document.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>, NodeError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Absent),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Loaded::Present(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt document, treating as absent");
            Ok(Loaded::Corrupt(e.to_string()))
        }
    }
}

/// Serialize and atomically replace a JSON document.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), NodeError> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data).await
}

/// Write bytes to `path` through a temp file + rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), NodeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    fs::write(&tmp_path, data).await?;
    if let Err(e) = fs::rename(&tmp_path, path).await {
        fs::remove_file(&tmp_path).await.ok();
        return Err(e.into());
    }
    Ok(())
}
