//! Peer protocol wire types
//!
//! Payloads from other nodes are normalized here, at the boundary, so the
//! rest of the crate only sees one canonical shape.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accounts::{is_valid_user_id, Account};
use crate::node::NodeState;

pub const HANDSHAKE_ACCEPTED: &str = "accepted";
pub const HANDSHAKE_REJECTED: &str = "rejected";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub listen_port: u16,
    #[serde(default)]
    pub known_peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub status: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub known_peers: Vec<String>,
}

/// Push hint body for `POST /accounts/{id}/announce`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceRequest {
    pub sequence: u64,
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub node_id: String,
    pub version: String,
    pub accounts_count: usize,
    #[serde(default)]
    pub peers_count: usize,
    #[serde(default)]
    pub state: Option<NodeState>,
    #[serde(default)]
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// `GET /accounts` as sent by any peer: a list (of records or bare ids,
/// possibly mixed) or a map keyed by user id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccountsPayload {
    List(Vec<Value>),
    Keyed(BTreeMap<String, Value>),
}

/// Canonical account entry learned from a peer
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAccount {
    pub user_id: String,
    /// Full record when the peer sent one
    pub record: Option<Account>,
}

impl AccountsPayload {
    /// Flatten into one entry per valid, distinct user id.
    pub fn normalize(self) -> Vec<RemoteAccount> {
        let entries: Vec<RemoteAccount> = match self {
            AccountsPayload::List(items) => items.into_iter().filter_map(from_list_item).collect(),
            AccountsPayload::Keyed(map) => map
                .into_iter()
                .map(|(user_id, value)| from_keyed_item(user_id, value))
                .collect(),
        };

        let mut seen = HashSet::new();
        entries
            .into_iter()
            .filter(|e| is_valid_user_id(&e.user_id) && seen.insert(e.user_id.clone()))
            .collect()
    }
}

fn from_list_item(item: Value) -> Option<RemoteAccount> {
    match item {
        Value::String(user_id) => Some(RemoteAccount { user_id, record: None }),
        Value::Object(_) => {
            let account: Account = serde_json::from_value(item).ok()?;
            Some(RemoteAccount {
                user_id: account.user_id.clone(),
                record: Some(account),
            })
        }
        _ => None,
    }
}

fn from_keyed_item(user_id: String, value: Value) -> RemoteAccount {
    let record = match value {
        Value::Object(mut fields) => {
            fields.remove("user");
            fields.insert("userId".into(), Value::String(user_id.clone()));
            serde_json::from_value::<Account>(Value::Object(fields)).ok()
        }
        _ => None,
    };
    RemoteAccount { user_id, record }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(json: &str) -> Vec<RemoteAccount> {
        serde_json::from_str::<AccountsPayload>(json).unwrap().normalize()
    }

    #[test]
    fn test_list_of_records() {
        let accounts = normalize(r#"[{"userId": "alice", "displayName": "Alice"}, {"user": "bob"}]"#);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].user_id, "alice");
        assert_eq!(
            accounts[0].record.as_ref().unwrap().display_name.as_deref(),
            Some("Alice")
        );
        assert_eq!(accounts[1].user_id, "bob");
    }

    #[test]
    fn test_list_of_ids() {
        let accounts = normalize(r#"["alice", "bob", "alice"]"#);
        let ids: Vec<_> = accounts.iter().map(|a| a.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert!(accounts.iter().all(|a| a.record.is_none()));
    }

    #[test]
    fn test_map_keyed_by_id() {
        let accounts = normalize(r#"{"alice": {"displayName": "Alice"}, "bob": true}"#);
        assert_eq!(accounts.len(), 2);
        let alice = accounts.iter().find(|a| a.user_id == "alice").unwrap();
        assert_eq!(alice.record.as_ref().unwrap().user_id, "alice");
        let bob = accounts.iter().find(|a| a.user_id == "bob").unwrap();
        assert!(bob.record.is_none());
    }

    #[test]
    fn test_invalid_entries_are_dropped() {
        let accounts = normalize(r#"["../etc", 42, {"displayName": "no id"}, "ok"]"#);
        let ids: Vec<_> = accounts.iter().map(|a| a.user_id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
    }

    #[test]
    fn test_handshake_wire_names() {
        let json = serde_json::to_value(HandshakeRequest {
            listen_port: 3001,
            known_peers: vec!["10.0.0.1:3000".into()],
        })
        .unwrap();
        assert_eq!(json["listenPort"], 3001);
        assert_eq!(json["knownPeers"][0], "10.0.0.1:3000");

        let response: HandshakeResponse =
            serde_json::from_str(r#"{"status": "accepted", "nodeId": "A"}"#).unwrap();
        assert!(response.known_peers.is_empty());
    }
}
