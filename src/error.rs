//! Error types for envelope-node

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("Invalid envelope filename: {0}")]
    InvalidFilename(String),
}

/// Failures talking to a single peer. Never fatal to a sync cycle.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Malformed payload: {0}")]
    Payload(String),
}

/// Outcome of reading a persisted document.
///
/// I/O failures other than "not found" are returned as `Err` by the reader,
/// so the three cases below never need to be guessed from an exception.
#[derive(Debug)]
pub enum Loaded<T> {
    Absent,
    Corrupt(String),
    Present(T),
}

impl<T> Loaded<T> {
    /// The document, or `None` for absent and corrupt alike.
    pub fn present(self) -> Option<T> {
        match self {
            Loaded::Present(value) => Some(value),
            Loaded::Absent | Loaded::Corrupt(_) => None,
        }
    }
}
