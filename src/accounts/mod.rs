//! Account registry
//!
//! Handles:
//! - The set of accounts this node stores envelopes for
//! - Bootstrapping the initial account on first run
//! - Per-user reference logs and envelope files (see [`references`])

pub mod envelope;
pub mod references;

// Re-exports
pub use references::{FileRecord, PersistOutcome, ReferenceLog, ReferenceStore};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::InitialAccountConfig;
use crate::error::{Loaded, NodeError};
use crate::storage::document::{read_json, write_json};
use crate::storage::StorageResolver;

const ACCOUNTS_FILE: &str = "accounts.json";
const MAX_USER_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(alias = "user")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
    #[serde(default)]
    pub status: AccountStatus,
}

impl Account {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            profile: None,
            status: AccountStatus::Active,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// User ids become directory names when anonymization is off, so anything
/// that could escape the storage root is refused.
pub fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && user_id != "."
        && user_id != ".."
        && !user_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
}

/// In-memory account list, flushed to `system/accounts.json` on every change.
pub struct AccountRegistry {
    resolver: Arc<StorageResolver>,
    path: PathBuf,
    accounts: RwLock<Vec<Account>>,
}

impl AccountRegistry {
    /// Load persisted accounts, or create the configured initial account.
    ///
    /// A corrupt document is treated like a missing one; after this returns
    /// the accounts document always exists.
    pub async fn load_or_bootstrap(
        resolver: Arc<StorageResolver>,
        initial: &InitialAccountConfig,
    ) -> Result<Self, NodeError> {
        let path = resolver.system_path(ACCOUNTS_FILE);

        let accounts = match read_json::<Vec<Account>>(&path).await? {
            Loaded::Present(accounts) => {
                info!(count = accounts.len(), "Accounts loaded");
                accounts
            }
            Loaded::Absent | Loaded::Corrupt(_) => {
                if !is_valid_user_id(&initial.user_id) {
                    return Err(NodeError::InvalidUserId(initial.user_id.clone()));
                }
                let mut account = Account::new(initial.user_id.clone());
                account.display_name = initial.display_name.clone();
                let accounts = vec![account];
                write_json(&path, &accounts).await?;
                info!(user = %initial.user_id, "Bootstrapped initial account");
                accounts
            }
        };

        Ok(Self {
            resolver,
            path,
            accounts: RwLock::new(accounts),
        })
    }

    /// Register a new account. Returns `Ok(false)` if the id is already known.
    pub async fn add(&self, account: Account) -> Result<bool, NodeError> {
        if !is_valid_user_id(&account.user_id) {
            return Err(NodeError::InvalidUserId(account.user_id));
        }

        let mut accounts = self.accounts.write().await;
        if accounts.iter().any(|a| a.user_id == account.user_id) {
            return Ok(false);
        }

        let user_id = account.user_id.clone();
        accounts.push(account);
        if let Err(e) = write_json(&self.path, &*accounts).await {
            accounts.pop();
            warn!(user = %user_id, error = %e, "Failed to persist accounts, change rolled back");
            return Err(e);
        }

        info!(user = %user_id, "Account registered");
        Ok(true)
    }

    pub async fn get(&self, user_id: &str) -> Option<Account> {
        self.accounts
            .read()
            .await
            .iter()
            .find(|a| a.user_id == user_id)
            .cloned()
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.accounts.read().await.iter().any(|a| a.user_id == user_id)
    }

    pub async fn list(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    pub async fn user_ids(&self) -> Vec<String> {
        self.accounts
            .read()
            .await
            .iter()
            .map(|a| a.user_id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    /// Folder names every registered account resolves to right now.
    pub async fn storage_keys(&self) -> Vec<String> {
        self.accounts
            .read()
            .await
            .iter()
            .map(|a| self.resolver.resolve(&a.user_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn resolver(dir: &TempDir) -> Arc<StorageResolver> {
        Arc::new(StorageResolver::new(dir.path(), false).await.unwrap())
    }

    fn initial() -> InitialAccountConfig {
        InitialAccountConfig {
            user_id: "admin".into(),
            display_name: Some("Admin".into()),
        }
    }

    #[tokio::test]
    async fn test_first_run_bootstraps_and_persists() {
        let dir = TempDir::new().unwrap();
        let registry = AccountRegistry::load_or_bootstrap(resolver(&dir).await, &initial())
            .await
            .unwrap();

        assert_eq!(registry.user_ids().await, vec!["admin".to_string()]);
        assert!(dir.path().join("system").join(ACCOUNTS_FILE).exists());
    }

    #[tokio::test]
    async fn test_corrupt_document_bootstraps() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir).await;
        std::fs::write(resolver.system_path(ACCOUNTS_FILE), b"[{").unwrap();

        let registry = AccountRegistry::load_or_bootstrap(resolver, &initial()).await.unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_survives_reload() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir).await;
        let registry = AccountRegistry::load_or_bootstrap(resolver.clone(), &initial())
            .await
            .unwrap();

        assert!(registry.add(Account::new("alice")).await.unwrap());
        assert!(!registry.add(Account::new("alice").with_display_name("Other")).await.unwrap());

        let reloaded = AccountRegistry::load_or_bootstrap(resolver, &initial()).await.unwrap();
        assert_eq!(reloaded.user_ids().await, vec!["admin".to_string(), "alice".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_adds_keep_one_entry() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(
            AccountRegistry::load_or_bootstrap(resolver(&dir).await, &initial())
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.add(Account::new("bob")).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_path_like_ids_are_refused() {
        let dir = TempDir::new().unwrap();
        let registry = AccountRegistry::load_or_bootstrap(resolver(&dir).await, &initial())
            .await
            .unwrap();

        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(registry.add(Account::new(bad)).await.is_err());
        }
    }

    #[test]
    fn test_legacy_user_key_is_accepted() {
        let account: Account = serde_json::from_str(r#"{"user": "carol"}"#).unwrap();
        assert_eq!(account.user_id, "carol");
        assert_eq!(account.status, AccountStatus::Active);

        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["userId"], "carol");
        assert_eq!(json["status"], "active");
    }
}
