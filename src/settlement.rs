//! Settlement of approved withdrawals and recording of contributions
//!
//! Both paths that touch `current_amount` live here. Each one is a
//! compare-and-swap retry loop against the group record: load, re-validate,
//! mutate, save, and start over if another writer got there first. The
//! balance is never read-modify-written outside this discipline.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{LedgerStore, StoreError};
use crate::{
    timestamp_secs, EngineConfig, EngineError, EngineResult, Transaction, TransactionStatus,
    TransactionType,
};

/// Executes the balance-affecting side of the withdrawal lifecycle
pub struct SettlementExecutor {
    /// Ledger store for groups and transactions
    store: Arc<dyn LedgerStore>,
    /// Configuration
    config: EngineConfig,
}

impl SettlementExecutor {
    /// Create a new settlement executor
    pub fn new(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Deterministic transaction id for a request's settlement
    ///
    /// One id per request is what makes settlement idempotent: a second call
    /// for the same request finds the existing record and does not debit.
    pub fn settlement_tx_id(request_id: &str) -> String {
        format!("wd-{}", request_id)
    }

    /// Debit the group balance for an approved request and record the withdrawal
    ///
    /// A pending reservation under the deterministic transaction id is
    /// appended before the debit and is the serialization point: of two
    /// concurrent callers for the same request, exactly one wins the append
    /// and debits, the other fails with `SettlementInProgress`. The balance is
    /// re-checked at execution time, not trusted from request creation.
    /// Returns the id of the withdrawal transaction.
    pub async fn settle(
        &self,
        contribution_id: &str,
        request_id: &str,
        amount: f64,
    ) -> EngineResult<String> {
        let tx_id = Self::settlement_tx_id(request_id);

        match self.store.get_transaction(&tx_id).await {
            Ok(tx) if tx.status == TransactionStatus::Completed => {
                debug!("Settlement of request {} already recorded, skipping debit", request_id);
                return Ok(tx_id);
            }
            Ok(_) => {
                return Err(EngineError::SettlementInProgress(request_id.to_string()));
            }
            Err(StoreError::TransactionNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let request = self
            .store
            .get_request(request_id)
            .await
            .map_err(|e| match e {
                StoreError::RequestNotFound(id) => EngineError::RequestNotFound(id),
                other => other.into(),
            })?;

        let mut tx = Transaction::pending(
            &tx_id,
            &request.requester_id,
            contribution_id,
            TransactionType::Withdrawal,
            amount,
            &format!("Withdrawal: {}", request.purpose),
        );

        match self.store.append_transaction(&tx).await {
            Ok(()) => {}
            Err(StoreError::TransactionExists(_)) => {
                // Lost the append race; the winner's record decides
                return match self.store.get_transaction(&tx_id).await {
                    Ok(existing) if existing.status == TransactionStatus::Completed => Ok(tx_id),
                    Ok(_) => Err(EngineError::SettlementInProgress(request_id.to_string())),
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.debit_group(contribution_id, amount).await {
            // Release the reservation so a later sweep can retry
            if let Err(remove_err) = self.store.remove_transaction(&tx_id).await {
                warn!("Failed to release reservation {}: {}", tx_id, remove_err);
            }
            return Err(e);
        }

        tx.status = TransactionStatus::Completed;
        self.store.update_transaction(&tx).await?;

        debug!("Settled request {} for {}", request_id, amount);
        Ok(tx_id)
    }

    /// Record a contribution: accumulate the contributor entry and grow the balance
    ///
    /// This is the guarded increase path; it keeps the denormalized
    /// contributor list (the voting-eligibility source of truth) in sync with
    /// the balance. Returns the id of the contribution transaction.
    pub async fn record_contribution(
        &self,
        group_id: &str,
        user_id: &str,
        amount: f64,
        anonymous: bool,
    ) -> EngineResult<String> {
        if amount <= 0.0 {
            return Err(EngineError::InvalidAmount(amount));
        }

        let mut attempts = 0;
        loop {
            let mut group = self.store.get_group(group_id).await.map_err(|e| match e {
                StoreError::GroupNotFound(id) => EngineError::GroupNotFound(id),
                other => other.into(),
            })?;

            group.record_contribution(user_id, amount, anonymous, timestamp_secs());

            match self.store.save_group(&group).await {
                Ok(_) => break,
                Err(StoreError::VersionConflict { .. }) => {
                    attempts += 1;
                    if attempts > self.config.settlement_max_retries {
                        return Err(EngineError::RetryLimitExceeded(format!(
                            "contribution to group {}",
                            group_id
                        )));
                    }
                    debug!("Contribution write conflict on group {}, retry {}", group_id, attempts);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let tx_id = format!("ct-{}", Uuid::new_v4());
        let tx = Transaction::completed(
            &tx_id,
            user_id,
            group_id,
            TransactionType::Contribution,
            amount,
            "Group contribution",
        );
        self.store.append_transaction(&tx).await?;

        Ok(tx_id)
    }

    /// Compare-and-swap debit of the group balance
    async fn debit_group(&self, group_id: &str, amount: f64) -> EngineResult<()> {
        let mut attempts = 0;
        loop {
            let mut group = self.store.get_group(group_id).await.map_err(|e| match e {
                StoreError::GroupNotFound(id) => EngineError::GroupNotFound(id),
                other => other.into(),
            })?;

            // Re-validated on every attempt: a conflicting writer may have
            // drained the balance since the last read
            if amount > group.current_amount {
                return Err(EngineError::InsufficientGroupFunds {
                    requested: amount,
                    available: group.current_amount,
                });
            }

            group.current_amount -= amount;
            group.updated_at = timestamp_secs();

            match self.store.save_group(&group).await {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => {
                    attempts += 1;
                    if attempts > self.config.settlement_max_retries {
                        return Err(EngineError::RetryLimitExceeded(format!(
                            "debit of group {}",
                            group_id
                        )));
                    }
                    debug!("Debit write conflict on group {}, retry {}", group_id, attempts);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLedgerStore, StoreResult};
    use crate::{ContributionGroup, WithdrawalRequest};
    use async_trait::async_trait;
    use tokio::sync::Barrier;

    /// Store that holds request reads until both racers arrive, forcing two
    /// concurrent settlements past the already-settled check together
    struct GatedStore {
        inner: MemoryLedgerStore,
        gate: Barrier,
    }

    #[async_trait]
    impl LedgerStore for GatedStore {
        async fn get_group(&self, id: &str) -> StoreResult<ContributionGroup> {
            self.inner.get_group(id).await
        }

        async fn save_group(&self, group: &ContributionGroup) -> StoreResult<u64> {
            self.inner.save_group(group).await
        }

        async fn get_request(&self, id: &str) -> StoreResult<WithdrawalRequest> {
            self.gate.wait().await;
            self.inner.get_request(id).await
        }

        async fn save_request(&self, request: &WithdrawalRequest) -> StoreResult<u64> {
            self.inner.save_request(request).await
        }

        async fn list_pending_requests(&self) -> StoreResult<Vec<WithdrawalRequest>> {
            self.inner.list_pending_requests().await
        }

        async fn append_transaction(&self, tx: &Transaction) -> StoreResult<()> {
            self.inner.append_transaction(tx).await
        }

        async fn update_transaction(&self, tx: &Transaction) -> StoreResult<()> {
            self.inner.update_transaction(tx).await
        }

        async fn remove_transaction(&self, id: &str) -> StoreResult<()> {
            self.inner.remove_transaction(id).await
        }

        async fn get_transaction(&self, id: &str) -> StoreResult<Transaction> {
            self.inner.get_transaction(id).await
        }

        async fn list_transactions(&self, contribution_id: &str) -> StoreResult<Vec<Transaction>> {
            self.inner.list_transactions(contribution_id).await
        }
    }

    async fn setup(balance: f64) -> (Arc<MemoryLedgerStore>, SettlementExecutor) {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut group = ContributionGroup::new("g1", "alice", "Trip fund", 10_000.0);
        group.current_amount = balance;
        store.save_group(&group).await.unwrap();

        let request = WithdrawalRequest::new("r1", "g1", "alice", 0.0, "supplies", 100);
        store.save_request(&request).await.unwrap();

        let executor = SettlementExecutor::new(store.clone(), EngineConfig::default());
        (store, executor)
    }

    #[tokio::test]
    async fn test_settle_debits_and_records() {
        let (store, executor) = setup(1000.0).await;

        let tx_id = executor.settle("g1", "r1", 400.0).await.unwrap();

        let group = store.get_group("g1").await.unwrap();
        assert_eq!(group.current_amount, 600.0);

        let tx = store.get_transaction(&tx_id).await.unwrap();
        assert_eq!(tx.tx_type, TransactionType::Withdrawal);
        assert_eq!(tx.amount, 400.0);
        assert_eq!(tx.user_id, "alice");
    }

    #[tokio::test]
    async fn test_settle_twice_debits_once() {
        let (store, executor) = setup(1000.0).await;

        let first = executor.settle("g1", "r1", 400.0).await.unwrap();
        let second = executor.settle("g1", "r1", 400.0).await.unwrap();
        assert_eq!(first, second);

        let group = store.get_group("g1").await.unwrap();
        assert_eq!(group.current_amount, 600.0);

        let txs = store.list_transactions("g1").await.unwrap();
        assert_eq!(txs.len(), 1);
    }

    #[tokio::test]
    async fn test_settle_insufficient_balance() {
        let (store, executor) = setup(300.0).await;

        let result = executor.settle("g1", "r1", 400.0).await;
        assert!(matches!(
            result,
            Err(EngineError::InsufficientGroupFunds { .. })
        ));

        // Balance untouched, nothing recorded
        let group = store.get_group("g1").await.unwrap();
        assert_eq!(group.current_amount, 300.0);
        assert!(store.list_transactions("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_settle_same_request_debits_once() {
        let inner = MemoryLedgerStore::new();
        let mut group = ContributionGroup::new("g1", "alice", "Trip fund", 10_000.0);
        group.current_amount = 1000.0;
        inner.save_group(&group).await.unwrap();
        let request = WithdrawalRequest::new("r1", "g1", "alice", 400.0, "supplies", 100);
        inner.save_request(&request).await.unwrap();

        let store = Arc::new(GatedStore {
            inner,
            gate: Barrier::new(2),
        });
        let executor = SettlementExecutor::new(store.clone(), EngineConfig::default());

        // Both callers pass the already-settled check before either appends
        let (a, b) = tokio::join!(
            executor.settle("g1", "r1", 400.0),
            executor.settle("g1", "r1", 400.0),
        );

        assert!(a.is_ok() || b.is_ok());
        for result in [&a, &b] {
            if let Err(e) = result {
                assert!(matches!(e, EngineError::SettlementInProgress(_)));
            }
        }

        // Exactly one debit, one completed transaction
        let loaded = store.get_group("g1").await.unwrap();
        assert_eq!(loaded.current_amount, 600.0);
        let txs = store.list_transactions("g1").await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_record_contribution_updates_group_and_ledger() {
        let (store, executor) = setup(0.0).await;

        executor
            .record_contribution("g1", "bob", 250.0, false)
            .await
            .unwrap();

        let group = store.get_group("g1").await.unwrap();
        assert_eq!(group.current_amount, 250.0);
        assert!(group.has_contributed("bob"));

        let txs = store.list_transactions("g1").await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].tx_type, TransactionType::Contribution);
    }

    #[tokio::test]
    async fn test_record_contribution_rejects_non_positive() {
        let (_store, executor) = setup(0.0).await;
        let result = executor.record_contribution("g1", "bob", 0.0, false).await;
        assert!(matches!(result, Err(EngineError::InvalidAmount(_))));
    }
}
