//! Ledger store boundary
//!
//! The engine reads and writes groups, withdrawal requests, and transactions
//! through the [`LedgerStore`] trait. Group and request records carry a
//! version token; saves are compare-and-swap on that token so concurrent
//! writers cannot silently overwrite each other. Transactions are append-only
//! once completed; a pending record may be completed in place or removed.
//!
//! [`MemoryLedgerStore`] is the in-memory implementation used in tests and as
//! the reference for the versioning semantics.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{ContributionGroup, RequestStatus, Transaction, WithdrawalRequest};

/// Store-related errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Group record not found
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Request record not found
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    /// Transaction record not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// A transaction with this id was already appended
    #[error("Transaction already exists: {0}")]
    TransactionExists(String),

    /// The record was modified by another writer since it was read
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Unexpected backend error
    #[error("Store error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// The persistence boundary for the withdrawal engine
///
/// `save_group` and `save_request` succeed only when the record's `version`
/// matches the stored version, and persist the record with the version bumped
/// by one (returned). A record that has never been saved must carry version 0.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get a group by id
    async fn get_group(&self, id: &str) -> StoreResult<ContributionGroup>;

    /// Save a group, compare-and-swap on its version
    async fn save_group(&self, group: &ContributionGroup) -> StoreResult<u64>;

    /// Get a withdrawal request by id
    async fn get_request(&self, id: &str) -> StoreResult<WithdrawalRequest>;

    /// Save a withdrawal request, compare-and-swap on its version
    async fn save_request(&self, request: &WithdrawalRequest) -> StoreResult<u64>;

    /// All requests still open for voting
    async fn list_pending_requests(&self) -> StoreResult<Vec<WithdrawalRequest>>;

    /// Append a transaction record; fails if the id already exists
    async fn append_transaction(&self, tx: &Transaction) -> StoreResult<()>;

    /// Update an existing transaction record in place
    async fn update_transaction(&self, tx: &Transaction) -> StoreResult<()>;

    /// Remove a transaction record; fails if the id does not exist
    async fn remove_transaction(&self, id: &str) -> StoreResult<()>;

    /// Get a transaction by id
    async fn get_transaction(&self, id: &str) -> StoreResult<Transaction>;

    /// All transactions recorded against a group
    async fn list_transactions(&self, contribution_id: &str) -> StoreResult<Vec<Transaction>>;
}

/// In-memory ledger store
///
/// Records are held as JSON bytes keyed by id, one map per record family.
/// All version checks happen under the family's write lock, which is what
/// gives the compare-and-swap its atomicity.
pub struct MemoryLedgerStore {
    groups: RwLock<HashMap<String, Vec<u8>>>,
    requests: RwLock<HashMap<String, Vec<u8>>>,
    transactions: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryLedgerStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            requests: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
        }
    }

    fn to_json<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_json<T: DeserializeOwned>(data: &[u8]) -> StoreResult<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_group(&self, id: &str) -> StoreResult<ContributionGroup> {
        let groups = self.groups.read().await;
        let data = groups
            .get(id)
            .ok_or_else(|| StoreError::GroupNotFound(id.to_string()))?;
        Self::from_json(data)
    }

    async fn save_group(&self, group: &ContributionGroup) -> StoreResult<u64> {
        let mut groups = self.groups.write().await;

        let stored_version = match groups.get(&group.id) {
            Some(data) => Self::from_json::<ContributionGroup>(data)?.version,
            None => 0,
        };

        if group.version != stored_version {
            return Err(StoreError::VersionConflict {
                key: format!("group/{}", group.id),
                expected: group.version,
                actual: stored_version,
            });
        }

        let mut persisted = group.clone();
        persisted.version += 1;
        groups.insert(group.id.clone(), Self::to_json(&persisted)?);

        Ok(persisted.version)
    }

    async fn get_request(&self, id: &str) -> StoreResult<WithdrawalRequest> {
        let requests = self.requests.read().await;
        let data = requests
            .get(id)
            .ok_or_else(|| StoreError::RequestNotFound(id.to_string()))?;
        Self::from_json(data)
    }

    async fn save_request(&self, request: &WithdrawalRequest) -> StoreResult<u64> {
        let mut requests = self.requests.write().await;

        let stored_version = match requests.get(&request.id) {
            Some(data) => Self::from_json::<WithdrawalRequest>(data)?.version,
            None => 0,
        };

        if request.version != stored_version {
            return Err(StoreError::VersionConflict {
                key: format!("request/{}", request.id),
                expected: request.version,
                actual: stored_version,
            });
        }

        let mut persisted = request.clone();
        persisted.version += 1;
        requests.insert(request.id.clone(), Self::to_json(&persisted)?);

        Ok(persisted.version)
    }

    async fn list_pending_requests(&self) -> StoreResult<Vec<WithdrawalRequest>> {
        let requests = self.requests.read().await;
        let mut pending = Vec::new();
        for data in requests.values() {
            let request: WithdrawalRequest = Self::from_json(data)?;
            if request.status == RequestStatus::Pending {
                pending.push(request);
            }
        }
        // Oldest first, so long-waiting requests are swept before fresh ones
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn append_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.id) {
            return Err(StoreError::TransactionExists(tx.id.clone()));
        }
        transactions.insert(tx.id.clone(), Self::to_json(tx)?);
        Ok(())
    }

    async fn update_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        if !transactions.contains_key(&tx.id) {
            return Err(StoreError::TransactionNotFound(tx.id.clone()));
        }
        transactions.insert(tx.id.clone(), Self::to_json(tx)?);
        Ok(())
    }

    async fn remove_transaction(&self, id: &str) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        transactions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::TransactionNotFound(id.to_string()))
    }

    async fn get_transaction(&self, id: &str) -> StoreResult<Transaction> {
        let transactions = self.transactions.read().await;
        let data = transactions
            .get(id)
            .ok_or_else(|| StoreError::TransactionNotFound(id.to_string()))?;
        Self::from_json(data)
    }

    async fn list_transactions(&self, contribution_id: &str) -> StoreResult<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        let mut matching = Vec::new();
        for data in transactions.values() {
            let tx: Transaction = Self::from_json(data)?;
            if tx.contribution_id == contribution_id {
                matching.push(tx);
            }
        }
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }
}
