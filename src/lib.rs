//! Withdrawal voting and settlement engine for pooled contribution groups
//!
//! This crate implements the core lifecycle of a group withdrawal: the group
//! creator submits a request against the pooled balance, contributing members
//! vote to approve or reject it, a periodic sweeper resolves requests whose
//! deadline has passed (extending the deadline when quorum was missed), and an
//! approved outcome is settled by atomically debiting the group balance and
//! writing an audit transaction.
//!
//! Storage and notification delivery are injected collaborators behind the
//! [`store::LedgerStore`] and [`notifier::Notifier`] traits, so the engine can
//! run against an in-memory fake in tests and a real database in production.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Error types for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Only the group creator may request a withdrawal
    #[error("User {0} is not the creator of group {1}")]
    NotGroupCreator(String, String),

    /// Requested amount exceeds the pooled balance at creation time
    #[error("Requested amount {requested} exceeds available balance {available}")]
    InsufficientFunds { requested: f64, available: f64 },

    /// Group balance no longer covers the amount at settlement time
    #[error("Settlement of {requested} exceeds group balance {available}")]
    InsufficientGroupFunds { requested: f64, available: f64 },

    /// Voter is not a member of the group
    #[error("User {0} is not a member of group {1}")]
    NotAMember(String, String),

    /// Voter has no contribution on record for the group
    #[error("User {0} has no contribution on record for group {1}")]
    NoContributionOnRecord(String, String),

    /// Voter already has a ballot on this request
    #[error("User {0} has already voted on request {1}")]
    AlreadyVoted(String, String),

    /// Withdrawal request not found
    #[error("Withdrawal request not found: {0}")]
    RequestNotFound(String),

    /// Contribution group not found
    #[error("Contribution group not found: {0}")]
    GroupNotFound(String),

    /// Request has already been finalized
    #[error("Request {0} is no longer open: {1:?}")]
    RequestClosed(String, RequestStatus),

    /// Another writer holds the settlement reservation for this request
    #[error("Settlement already in progress for request {0}")]
    SettlementInProgress(String),

    /// Amount must be positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    /// Too many concurrent writers; the operation gave up after retrying
    #[error("Conflict retry limit exceeded for {0}")]
    RetryLimitExceeded(String),

    /// Error from the ledger store
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Configuration for the withdrawal engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Voting window in seconds, also the extension granted on a missed quorum
    pub deadline_window_secs: u64,
    /// Approval percentage (0-100) applied to groups created without one
    pub default_voting_threshold: u8,
    /// How often the background sweeper runs, in seconds
    pub sweep_interval_secs: u64,
    /// How many times settlement retries a conflicting balance write
    pub settlement_max_retries: u32,
    /// How many times a vote retries a conflicting request write
    pub vote_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deadline_window_secs: 86_400, // 24 hours
            default_voting_threshold: 51,
            sweep_interval_secs: 60,
            settlement_max_retries: 3,
            vote_max_retries: 3,
        }
    }
}

/// Current unix time in seconds
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// A single contributor entry on a group
///
/// One logical entry per contributing user; repeated contributions accumulate
/// into the same entry. This denormalized list is the source of truth for
/// voting eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    /// The contributing user
    pub user_id: String,
    /// Accumulated amount contributed by this user
    pub amount: f64,
    /// When the user last contributed
    pub date: u64,
    /// Whether the contribution is hidden from other members
    pub anonymous: bool,
}

/// A pooled contribution group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionGroup {
    /// Unique identifier for this group
    pub id: String,
    /// The user that owns the group; only this identity may request withdrawals
    pub creator_id: String,
    /// Display name for the group
    pub name: String,
    /// Fundraising goal
    pub target_amount: f64,
    /// The pooled, withdrawable balance (never negative)
    pub current_amount: f64,
    /// User ids of all group members
    pub members: HashSet<String>,
    /// Contributor entries, one per contributing user
    pub contributors: Vec<Contribution>,
    /// Minimum approval percentage (0-100) of cast votes required to approve
    pub voting_threshold: u8,
    /// Optimistic-concurrency token, bumped by the store on every save
    pub version: u64,
    /// When the group was created
    pub created_at: u64,
    /// When the group was last updated
    pub updated_at: u64,
}

impl ContributionGroup {
    /// Create a new group with the default voting threshold
    pub fn new(id: &str, creator_id: &str, name: &str, target_amount: f64) -> Self {
        let now = timestamp_secs();
        let mut members = HashSet::new();
        members.insert(creator_id.to_string());

        Self {
            id: id.to_string(),
            creator_id: creator_id.to_string(),
            name: name.to_string(),
            target_amount,
            current_amount: 0.0,
            members,
            contributors: Vec::new(),
            voting_threshold: EngineConfig::default().default_voting_threshold,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the user has a contribution on record for this group
    ///
    /// This is the sole gate for voting rights. It reads the denormalized
    /// contributor list, not the transaction history, so the contribution
    /// recording path must keep the list in sync.
    pub fn has_contributed(&self, user_id: &str) -> bool {
        self.contributors.iter().any(|c| c.user_id == user_id)
    }

    /// Number of members with a contribution on record
    pub fn contributing_member_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| self.has_contributed(m))
            .count()
    }

    /// Accumulate a contribution and grow the pooled balance
    pub fn record_contribution(&mut self, user_id: &str, amount: f64, anonymous: bool, now: u64) {
        match self.contributors.iter_mut().find(|c| c.user_id == user_id) {
            Some(entry) => {
                entry.amount += amount;
                entry.date = now;
                entry.anonymous = anonymous;
            }
            None => {
                self.contributors.push(Contribution {
                    user_id: user_id.to_string(),
                    amount,
                    date: now,
                    anonymous,
                });
            }
        }
        self.members.insert(user_id.to_string());
        self.current_amount += amount;
        self.updated_at = now;
    }
}

/// Status of a withdrawal request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Open for voting
    Pending,
    /// Approved and settled
    Approved,
    /// Rejected by vote, or failed settlement
    Rejected,
}

impl Default for RequestStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// A vote choice on a withdrawal request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    /// Approve the withdrawal
    Approve,
    /// Reject the withdrawal
    Reject,
}

/// A single member's ballot on a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    /// The voting user
    pub user_id: String,
    /// The vote cast
    pub choice: VoteChoice,
    /// When the vote was cast
    pub cast_at: u64,
}

/// A request to withdraw from a group's pooled balance
#[derive(Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Unique identifier for this request
    pub id: String,
    /// The group this request draws from
    pub contribution_id: String,
    /// The user that submitted the request (always the group creator)
    pub requester_id: String,
    /// Amount to withdraw
    pub amount: f64,
    /// What the withdrawal is for
    pub purpose: String,
    /// The current status
    pub status: RequestStatus,
    /// Ballots cast so far, at most one per user
    pub votes: Vec<Ballot>,
    /// Voting deadline; extended by the sweeper when quorum is missed
    pub deadline: u64,
    /// When the request was finalized
    pub resolved_at: Option<u64>,
    /// Human-readable outcome, including any settlement failure reason
    pub resolution: Option<String>,
    /// Id of the withdrawal transaction once settled
    pub settlement_tx: Option<String>,
    /// Optimistic-concurrency token, bumped by the store on every save
    pub version: u64,
    /// When the request was created
    pub created_at: u64,
}

impl WithdrawalRequest {
    /// Create a new pending request
    pub fn new(
        id: &str,
        contribution_id: &str,
        requester_id: &str,
        amount: f64,
        purpose: &str,
        deadline: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            contribution_id: contribution_id.to_string(),
            requester_id: requester_id.to_string(),
            amount,
            purpose: purpose.to_string(),
            status: RequestStatus::Pending,
            votes: Vec::new(),
            deadline,
            resolved_at: None,
            resolution: None,
            settlement_tx: None,
            version: 0,
            created_at: timestamp_secs(),
        }
    }

    /// Whether the user already has a ballot on this request
    pub fn has_voted(&self, user_id: &str) -> bool {
        self.votes.iter().any(|b| b.user_id == user_id)
    }

    /// Whether the request has reached a terminal status
    pub fn is_final(&self) -> bool {
        self.status != RequestStatus::Pending
    }

    /// Group members who have not yet cast a ballot
    pub fn non_voters(&self, group: &ContributionGroup) -> Vec<String> {
        let mut missing: Vec<String> = group
            .members
            .iter()
            .filter(|m| !self.has_voted(m))
            .cloned()
            .collect();
        missing.sort();
        missing
    }
}

impl fmt::Debug for WithdrawalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WithdrawalRequest {{ id: {}, group: {}, amount: {}, status: {:?}, votes: {} }}",
            self.id,
            self.contribution_id,
            self.amount,
            self.status,
            self.votes.len()
        )
    }
}

/// Types of ledger transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Wallet top-up
    Deposit,
    /// Approved withdrawal from a group balance
    Withdrawal,
    /// Contribution into a group balance
    Contribution,
}

/// Status of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Created, not yet applied
    Pending,
    /// Applied to the balance
    Completed,
    /// Could not be applied
    Failed,
}

/// An append-only audit record for a balance-affecting event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique identifier for this transaction
    pub id: String,
    /// The user the transaction is attributed to
    pub user_id: String,
    /// The group whose balance was affected
    pub contribution_id: String,
    /// The type of transaction
    pub tx_type: TransactionType,
    /// The amount moved
    pub amount: f64,
    /// The current status
    pub status: TransactionStatus,
    /// Description of the event
    pub description: String,
    /// When the transaction was created
    pub created_at: u64,
}

impl Transaction {
    fn with_status(
        id: &str,
        user_id: &str,
        contribution_id: &str,
        tx_type: TransactionType,
        amount: f64,
        description: &str,
        status: TransactionStatus,
    ) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            contribution_id: contribution_id.to_string(),
            tx_type,
            amount,
            status,
            description: description.to_string(),
            created_at: timestamp_secs(),
        }
    }

    /// Create a completed transaction record
    pub fn completed(
        id: &str,
        user_id: &str,
        contribution_id: &str,
        tx_type: TransactionType,
        amount: f64,
        description: &str,
    ) -> Self {
        Self::with_status(
            id,
            user_id,
            contribution_id,
            tx_type,
            amount,
            description,
            TransactionStatus::Completed,
        )
    }

    /// Create a pending transaction record
    pub fn pending(
        id: &str,
        user_id: &str,
        contribution_id: &str,
        tx_type: TransactionType,
        amount: f64,
        description: &str,
    ) -> Self {
        Self::with_status(
            id,
            user_id,
            contribution_id,
            tx_type,
            amount,
            description,
            TransactionStatus::Pending,
        )
    }
}

pub mod eligibility;
pub mod engine;
pub mod notifier;
pub mod settlement;
pub mod store;
pub mod sweeper;
pub mod voting;

// Re-exports
pub use engine::VotingEngine;
pub use notifier::{NotificationEvent, NotificationKind, Notifier, NullNotifier, RecordingNotifier};
pub use settlement::SettlementExecutor;
pub use store::{LedgerStore, MemoryLedgerStore};
pub use sweeper::{DeadlineSweeper, SweepAction, SweepStats};
pub use voting::VoteTally;
