//! Envelope naming and hashing
//!
//! Client and server share this one filename scheme:
//! `{seq:08}_{sha256-hex}.env`. A bare `{seq:08}.env` is accepted by the
//! server as a lookup by sequence, for peers that lack the hash.

use sha2::{Digest, Sha256};

use crate::error::NodeError;

const EXTENSION: &str = ".env";

/// SHA-256 of the envelope bytes, lowercase hex.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Canonical on-disk and download name of an envelope.
pub fn envelope_filename(seq: u64, hash: &str) -> String {
    format!("{:08}_{}{}", seq, hash, EXTENSION)
}

/// Download name used when only the sequence is known.
pub fn sequence_filename(seq: u64) -> String {
    format!("{:08}{}", seq, EXTENSION)
}

/// Parsed envelope filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeName {
    pub seq: u64,
    pub hash: Option<String>,
}

impl EnvelopeName {
    pub fn parse(name: &str) -> Result<Self, NodeError> {
        let invalid = || NodeError::InvalidFilename(name.to_string());

        let stem = name.strip_suffix(EXTENSION).ok_or_else(invalid)?;
        let (seq_part, hash) = match stem.split_once('_') {
            Some((seq, hash)) => {
                if !is_sha256_hex(hash) {
                    return Err(invalid());
                }
                (seq, Some(hash.to_string()))
            }
            None => (stem, None),
        };

        if seq_part.is_empty() || !seq_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let seq = seq_part.parse::<u64>().map_err(|_| invalid())?;

        Ok(Self { seq, hash })
    }
}

/// 64 lowercase hex characters.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_content_hash() {
        assert_eq!(content_hash(b"hello"), HELLO);
    }

    #[test]
    fn test_filename_parses_back() {
        let name = envelope_filename(7, HELLO);
        assert_eq!(name, format!("00000007_{}.env", HELLO));
        assert_eq!(
            EnvelopeName::parse(&name).unwrap(),
            EnvelopeName { seq: 7, hash: Some(HELLO.to_string()) }
        );
        assert_eq!(
            EnvelopeName::parse(&sequence_filename(12)).unwrap(),
            EnvelopeName { seq: 12, hash: None }
        );
    }

    #[test]
    fn test_rejects_foreign_names() {
        for name in [
            "references.json",
            "../00000001.env",
            "00000001_nothex.env",
            "_abc.env",
            "0001.dat.gz",
            "",
        ] {
            assert!(EnvelopeName::parse(name).is_err(), "{name} should be rejected");
        }
    }
}
