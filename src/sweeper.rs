//! Deadline sweeper for pending withdrawal requests
//!
//! The sweeper is the only component that resolves requests. On every pass it
//! re-evaluates each pending request whose deadline has passed: quorum missed
//! means the deadline is extended and non-voters are reminded; quorum met
//! means the request finalizes to approved or rejected. Approval is only made
//! visible after settlement has succeeded, and a settlement that fails on
//! insufficient funds forces rejection rather than leaving the request stuck.
//!
//! Votes never resolve a request directly; callers get the same behavior by
//! invoking [`DeadlineSweeper::sweep_request`] opportunistically when they
//! load request data.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::notifier::{NotificationEvent, NotificationKind, Notifier};
use crate::settlement::SettlementExecutor;
use crate::store::{LedgerStore, StoreError};
use crate::voting::{self, VoteTally};
use crate::{
    timestamp_secs, ContributionGroup, EngineConfig, EngineError, EngineResult, RequestStatus,
    TransactionStatus, WithdrawalRequest,
};

/// What one sweep pass did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepStats {
    /// Pending requests examined
    pub examined: usize,
    /// Deadlines extended for missed quorum
    pub extended: usize,
    /// Requests approved and settled
    pub approved: usize,
    /// Requests rejected
    pub rejected: usize,
}

/// Outcome of sweeping a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Not due, already final, or advanced by another actor
    Skipped,
    /// Deadline extended for missed quorum
    Extended,
    /// Finalized to approved
    Approved,
    /// Finalized to rejected
    Rejected,
}

/// Periodically resolves pending requests against their deadlines
pub struct DeadlineSweeper {
    /// Ledger store for requests and groups
    store: Arc<dyn LedgerStore>,
    /// Sink for reminders and status changes
    notifier: Arc<dyn Notifier>,
    /// Settlement executor invoked on approval
    settlement: Arc<SettlementExecutor>,
    /// Configuration
    config: EngineConfig,
    /// Whether the background loop is running
    is_running: Arc<RwLock<bool>>,
}

impl DeadlineSweeper {
    /// Create a new sweeper
    pub fn new(
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        settlement: Arc<SettlementExecutor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            settlement,
            config,
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the recurring sweep loop in a background task
    ///
    /// No-op if the loop is already running. Callers keep their own handle:
    /// `Arc::clone(&sweeper).start().await`.
    pub async fn start(self: Arc<Self>) {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return;
        }
        *is_running = true;
        drop(is_running);

        let sweeper = self;
        let interval_secs = sweeper.config.sweep_interval_secs;

        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(interval_secs));

            loop {
                interval.tick().await;

                let running = *sweeper.is_running.read().await;
                if !running {
                    break;
                }

                if let Err(e) = sweeper.sweep(timestamp_secs()).await {
                    error!("Sweep pass failed: {}", e);
                }
            }
        });
    }

    /// Stop the background loop after its current tick
    pub async fn stop(&self) {
        let mut is_running = self.is_running.write().await;
        *is_running = false;
    }

    /// Evaluate every pending request against `now`
    ///
    /// Per-request failures are logged and leave that request pending for the
    /// next pass; they never abort the sweep.
    pub async fn sweep(&self, now: u64) -> EngineResult<SweepStats> {
        let pending = self.store.list_pending_requests().await?;
        let mut stats = SweepStats::default();

        for request in &pending {
            stats.examined += 1;
            match self.sweep_request(&request.id, now).await {
                Ok(SweepAction::Extended) => stats.extended += 1,
                Ok(SweepAction::Approved) => stats.approved += 1,
                Ok(SweepAction::Rejected) => stats.rejected += 1,
                Ok(SweepAction::Skipped) => {}
                Err(e) => {
                    // Left pending; the next interval retries
                    error!("Failed to sweep request {}: {}", request.id, e);
                }
            }
        }

        if stats.extended + stats.approved + stats.rejected > 0 {
            info!(
                "Sweep pass: {} examined, {} extended, {} approved, {} rejected",
                stats.examined, stats.extended, stats.approved, stats.rejected
            );
        }

        Ok(stats)
    }

    /// Re-evaluate a single request's deadline
    ///
    /// Idempotent: a request that is already final, or whose deadline has not
    /// passed, is left untouched. Safe to call opportunistically on every
    /// read of request data.
    pub async fn sweep_request(&self, request_id: &str, now: u64) -> EngineResult<SweepAction> {
        let mut request = self
            .store
            .get_request(request_id)
            .await
            .map_err(|e| match e {
                StoreError::RequestNotFound(id) => EngineError::RequestNotFound(id),
                other => other.into(),
            })?;

        if request.is_final() || request.deadline >= now {
            return Ok(SweepAction::Skipped);
        }

        let group = self
            .store
            .get_group(&request.contribution_id)
            .await
            .map_err(|e| match e {
                StoreError::GroupNotFound(id) => EngineError::GroupNotFound(id),
                other => other.into(),
            })?;

        let tally = voting::tally(&group, &request);

        if !tally.quorum_met {
            return self.extend_deadline(request, &group, &tally, now).await;
        }

        if tally.approved {
            self.finalize_approved(request, &tally, now).await
        } else {
            self.finalize_rejected(request, &tally, now).await
        }
    }

    /// Quorum missed: push the deadline out and remind the members yet to vote
    async fn extend_deadline(
        &self,
        mut request: WithdrawalRequest,
        group: &ContributionGroup,
        tally: &VoteTally,
        now: u64,
    ) -> EngineResult<SweepAction> {
        request.deadline = now + self.config.deadline_window_secs;

        match self.store.save_request(&request).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                debug!("Request {} advanced by another writer", request.id);
                return Ok(SweepAction::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        debug!(
            "Extended deadline of request {}: {}/{} votes",
            request.id, tally.total_votes, tally.quorum_needed
        );

        for member in request.non_voters(group) {
            self.emit(NotificationEvent {
                user_id: member,
                message: format!(
                    "A withdrawal of {} for \"{}\" is awaiting your vote",
                    request.amount, request.purpose
                ),
                kind: NotificationKind::VoteReminder,
                related_id: request.contribution_id.clone(),
            })
            .await;
        }

        Ok(SweepAction::Extended)
    }

    /// Quorum met and threshold cleared: settle first, then make it visible
    async fn finalize_approved(
        &self,
        mut request: WithdrawalRequest,
        tally: &VoteTally,
        now: u64,
    ) -> EngineResult<SweepAction> {
        let settled = self
            .settlement
            .settle(&request.contribution_id, &request.id, request.amount)
            .await;

        match settled {
            Ok(tx_id) => {
                request.status = RequestStatus::Approved;
                request.settlement_tx = Some(tx_id);
                request.resolved_at = Some(now);
                request.resolution =
                    Some(format!("Approved with {:.1}% approval", tally.approval_pct));
                self.persist_final(request).await
            }
            Err(e @ EngineError::InsufficientGroupFunds { .. }) => {
                // The balance was drained since creation; reject rather than
                // leave an approved-but-unsettled request around forever
                warn!("Settlement of request {} failed: {}", request.id, e);
                request.status = RequestStatus::Rejected;
                request.resolved_at = Some(now);
                request.resolution = Some(format!("Settlement failed: {}", e));
                self.persist_final(request).await
            }
            Err(e) => Err(e),
        }
    }

    /// Quorum met but the threshold was not cleared
    ///
    /// A prior finalize may have settled and then lost its save to a late
    /// ballot, and the late ballot may have dragged the tally below the
    /// threshold. The money has already moved in that case, so the request
    /// finalizes to approved regardless of the new tally.
    async fn finalize_rejected(
        &self,
        mut request: WithdrawalRequest,
        tally: &VoteTally,
        now: u64,
    ) -> EngineResult<SweepAction> {
        let tx_id = SettlementExecutor::settlement_tx_id(&request.id);
        match self.store.get_transaction(&tx_id).await {
            Ok(tx) if tx.status == TransactionStatus::Completed => {
                request.status = RequestStatus::Approved;
                request.settlement_tx = Some(tx_id);
                request.resolved_at = Some(now);
                request.resolution = Some("Approved: settlement already applied".to_string());
                return self.persist_final(request).await;
            }
            // A reservation is in flight; let the next pass decide
            Ok(_) => return Ok(SweepAction::Skipped),
            Err(StoreError::TransactionNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        request.status = RequestStatus::Rejected;
        request.resolved_at = Some(now);
        request.resolution = Some(format!(
            "Rejected: {:.1}% approval below {}% threshold",
            tally.approval_pct, tally.threshold
        ));
        self.persist_final(request).await
    }

    /// Persist a finalized request and announce the status change
    async fn persist_final(&self, request: WithdrawalRequest) -> EngineResult<SweepAction> {
        match self.store.save_request(&request).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                // Another actor advanced the request. If settlement already
                // ran, its transaction is deterministic per request, so a
                // later sweep converges without a second debit.
                debug!("Request {} advanced by another writer", request.id);
                return Ok(SweepAction::Skipped);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Request {} finalized: {:?} ({})",
            request.id,
            request.status,
            request.resolution.as_deref().unwrap_or("")
        );

        self.emit(NotificationEvent {
            user_id: request.requester_id.clone(),
            message: format!(
                "Your withdrawal request for \"{}\" was {}",
                request.purpose,
                match request.status {
                    RequestStatus::Approved => "approved",
                    RequestStatus::Rejected => "rejected",
                    RequestStatus::Pending => "updated",
                }
            ),
            kind: NotificationKind::StatusChange,
            related_id: request.id.clone(),
        })
        .await;

        match request.status {
            RequestStatus::Approved => Ok(SweepAction::Approved),
            _ => Ok(SweepAction::Rejected),
        }
    }

    /// Emit an event; delivery failures are logged, never propagated
    async fn emit(&self, event: NotificationEvent) {
        if let Err(e) = self.notifier.emit(event).await {
            warn!("Notification delivery failed: {}", e);
        }
    }
}
