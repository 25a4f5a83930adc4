//! Withdrawal request submission and vote casting
//!
//! The engine validates every mutation through the eligibility checks and
//! persists through compare-and-swap saves, re-validating after each conflict
//! so that the first ballot for a user wins and later duplicates fail with
//! `AlreadyVoted`. Casting a vote never resolves the request, even when it
//! completes quorum; resolution belongs to the sweeper alone, which the engine
//! also invokes opportunistically whenever request data is loaded.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::eligibility;
use crate::notifier::{NotificationEvent, NotificationKind, Notifier};
use crate::store::{LedgerStore, StoreError};
use crate::sweeper::DeadlineSweeper;
use crate::voting::{self, VoteTally};
use crate::{
    timestamp_secs, Ballot, ContributionGroup, EngineConfig, EngineError, EngineResult,
    VoteChoice, WithdrawalRequest,
};

/// Entry point for withdrawal requests and votes
pub struct VotingEngine {
    /// Ledger store for groups and requests
    store: Arc<dyn LedgerStore>,
    /// Sink for engine events
    notifier: Arc<dyn Notifier>,
    /// Sweeper invoked opportunistically on reads
    sweeper: Arc<DeadlineSweeper>,
    /// Configuration
    config: EngineConfig,
}

impl VotingEngine {
    /// Create a new voting engine
    pub fn new(
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        sweeper: Arc<DeadlineSweeper>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            sweeper,
            config,
        }
    }

    /// Submit a withdrawal request against a group's pooled balance
    ///
    /// Only the group creator may submit, and only up to the balance as it
    /// stands now. The request opens in `Pending` with a full voting window.
    pub async fn submit_request(
        &self,
        requester_id: &str,
        contribution_id: &str,
        amount: f64,
        purpose: &str,
    ) -> EngineResult<WithdrawalRequest> {
        let group = self.load_group(contribution_id).await?;
        eligibility::can_request_withdrawal(requester_id, &group, amount)?;

        let now = timestamp_secs();
        let request = WithdrawalRequest::new(
            &format!("wr-{}", Uuid::new_v4()),
            contribution_id,
            requester_id,
            amount,
            purpose,
            now + self.config.deadline_window_secs,
        );

        self.store.save_request(&request).await?;

        debug!(
            "Request {} submitted against group {} for {}",
            request.id, contribution_id, amount
        );

        self.emit(NotificationEvent {
            user_id: requester_id.to_string(),
            message: format!("Withdrawal request for \"{}\" submitted", purpose),
            kind: NotificationKind::StatusChange,
            related_id: request.id.clone(),
        })
        .await;

        Ok(request)
    }

    /// Cast a ballot on a pending request
    ///
    /// Re-validates eligibility immediately before the write on every retry,
    /// so concurrent duplicates resolve to one recorded ballot and an
    /// `AlreadyVoted` failure for the loser. Completing quorum does not
    /// finalize the request; the next sweep does.
    pub async fn cast_vote(
        &self,
        request_id: &str,
        user_id: &str,
        choice: VoteChoice,
    ) -> EngineResult<()> {
        // Defensive deadline re-check before accepting the ballot
        self.sweeper
            .sweep_request(request_id, timestamp_secs())
            .await?;

        let mut attempts = 0;
        loop {
            let request = self.load_request(request_id).await?;
            if request.is_final() {
                return Err(EngineError::RequestClosed(
                    request_id.to_string(),
                    request.status,
                ));
            }

            let group = self.load_group(&request.contribution_id).await?;
            eligibility::can_vote(user_id, &group, &request)?;

            let mut updated = request;
            updated.votes.push(Ballot {
                user_id: user_id.to_string(),
                choice,
                cast_at: timestamp_secs(),
            });

            match self.store.save_request(&updated).await {
                Ok(_) => {
                    debug!(
                        "Vote {:?} by {} recorded on request {}",
                        choice, user_id, request_id
                    );
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    attempts += 1;
                    if attempts > self.config.vote_max_retries {
                        return Err(EngineError::RetryLimitExceeded(format!(
                            "vote on request {}",
                            request_id
                        )));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Load a request, sweeping it first if its deadline has passed
    pub async fn get_request(&self, request_id: &str) -> EngineResult<WithdrawalRequest> {
        self.sweeper
            .sweep_request(request_id, timestamp_secs())
            .await?;
        self.load_request(request_id).await
    }

    /// Current tally of a request's ballots
    pub async fn tally(&self, request_id: &str) -> EngineResult<VoteTally> {
        let request = self.load_request(request_id).await?;
        let group = self.load_group(&request.contribution_id).await?;
        Ok(voting::tally(&group, &request))
    }

    /// Remind every group member who has not yet voted on the request
    ///
    /// Returns the number of reminders emitted.
    pub async fn ping_non_voters(&self, request_id: &str) -> EngineResult<usize> {
        let request = self.load_request(request_id).await?;
        let group = self.load_group(&request.contribution_id).await?;

        let missing = request.non_voters(&group);
        for member in &missing {
            self.emit(NotificationEvent {
                user_id: member.clone(),
                message: format!(
                    "A withdrawal of {} for \"{}\" is awaiting your vote",
                    request.amount, request.purpose
                ),
                kind: NotificationKind::VoteReminder,
                related_id: request.contribution_id.clone(),
            })
            .await;
        }

        Ok(missing.len())
    }

    async fn load_group(&self, id: &str) -> EngineResult<ContributionGroup> {
        self.store.get_group(id).await.map_err(|e| match e {
            StoreError::GroupNotFound(id) => EngineError::GroupNotFound(id),
            other => other.into(),
        })
    }

    async fn load_request(&self, id: &str) -> EngineResult<WithdrawalRequest> {
        self.store.get_request(id).await.map_err(|e| match e {
            StoreError::RequestNotFound(id) => EngineError::RequestNotFound(id),
            other => other.into(),
        })
    }

    /// Emit an event; delivery failures are logged, never propagated
    async fn emit(&self, event: NotificationEvent) {
        if let Err(e) = self.notifier.emit(event).await {
            tracing::warn!("Notification delivery failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RecordingNotifier;
    use crate::settlement::SettlementExecutor;
    use crate::store::MemoryLedgerStore;
    use crate::RequestStatus;

    fn build_engine(store: Arc<MemoryLedgerStore>) -> (VotingEngine, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = EngineConfig::default();
        let settlement = Arc::new(SettlementExecutor::new(store.clone(), config.clone()));
        let sweeper = Arc::new(DeadlineSweeper::new(
            store.clone(),
            notifier.clone(),
            settlement,
            config.clone(),
        ));
        (
            VotingEngine::new(store, notifier.clone(), sweeper, config),
            notifier,
        )
    }

    async fn seeded_store() -> Arc<MemoryLedgerStore> {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut group = ContributionGroup::new("g1", "alice", "Trip fund", 10_000.0);
        group.record_contribution("alice", 600.0, false, 1);
        group.record_contribution("bob", 400.0, false, 1);
        store.save_group(&group).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_submit_and_vote() {
        let store = seeded_store().await;
        let (engine, _notifier) = build_engine(store.clone());

        let request = engine
            .submit_request("alice", "g1", 500.0, "supplies")
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.deadline > request.created_at);

        engine
            .cast_vote(&request.id, "bob", VoteChoice::Approve)
            .await
            .unwrap();

        let loaded = engine.get_request(&request.id).await.unwrap();
        assert_eq!(loaded.votes.len(), 1);
        // Still pending: quorum completion does not finalize until a sweep
        assert_eq!(loaded.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_vote_on_missing_request() {
        let store = seeded_store().await;
        let (engine, _notifier) = build_engine(store);

        let result = engine.cast_vote("missing", "bob", VoteChoice::Approve).await;
        assert!(matches!(result, Err(EngineError::RequestNotFound(_))));
    }

    #[tokio::test]
    async fn test_ping_non_voters_counts_missing_ballots() {
        let store = seeded_store().await;
        let (engine, notifier) = build_engine(store);

        let request = engine
            .submit_request("alice", "g1", 500.0, "supplies")
            .await
            .unwrap();
        engine
            .cast_vote(&request.id, "alice", VoteChoice::Approve)
            .await
            .unwrap();

        let pinged = engine.ping_non_voters(&request.id).await.unwrap();
        assert_eq!(pinged, 1);

        let reminders = notifier
            .events_of_kind(NotificationKind::VoteReminder)
            .await;
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].user_id, "bob");
        assert_eq!(reminders[0].related_id, "g1");
    }
}
