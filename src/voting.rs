//! Vote tallying for withdrawal requests
//!
//! The quorum condition counts ballots against the group's contributing
//! members; the approval condition compares the approve share of cast ballots
//! against the group's voting threshold. Both are evaluated together by
//! [`tally`], which the sweeper uses to resolve requests whose deadline has
//! passed.

use serde::{Deserialize, Serialize};

use crate::{ContributionGroup, VoteChoice, WithdrawalRequest};

/// Result of tallying the ballots on a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteTally {
    /// Number of approve ballots
    pub approve_votes: usize,
    /// Number of reject ballots
    pub reject_votes: usize,
    /// Total ballots cast
    pub total_votes: usize,
    /// Members eligible to vote (members with a contribution on record)
    pub eligible_voters: usize,
    /// Ballots required for quorum
    pub quorum_needed: usize,
    /// Whether enough ballots were cast
    pub quorum_met: bool,
    /// Percentage of approve ballots out of all ballots (0.0 to 100.0)
    pub approval_pct: f64,
    /// Approval percentage required by the group (0 to 100)
    pub threshold: u8,
    /// Whether the request passes: quorum met and approval at or above threshold
    pub approved: bool,
}

/// Ballots required for quorum given the number of contributing members
///
/// Half the contributing members, rounded up.
pub fn quorum_needed(contributing_members: usize) -> usize {
    contributing_members.div_ceil(2)
}

/// Tally the ballots on a request against its group's rules
pub fn tally(group: &ContributionGroup, request: &WithdrawalRequest) -> VoteTally {
    let approve_votes = request
        .votes
        .iter()
        .filter(|b| b.choice == VoteChoice::Approve)
        .count();
    let reject_votes = request
        .votes
        .iter()
        .filter(|b| b.choice == VoteChoice::Reject)
        .count();
    let total_votes = approve_votes + reject_votes;

    let eligible_voters = group.contributing_member_count();
    let needed = quorum_needed(eligible_voters);
    let quorum_met = total_votes >= needed;

    // Zero cast ballots tally as 0% approval, forcing rejection
    let approval_pct = if total_votes > 0 {
        approve_votes as f64 / total_votes as f64 * 100.0
    } else {
        0.0
    };

    let approved = quorum_met && approval_pct >= group.voting_threshold as f64;

    VoteTally {
        approve_votes,
        reject_votes,
        total_votes,
        eligible_voters,
        quorum_needed: needed,
        quorum_met,
        approval_pct,
        threshold: group.voting_threshold,
        approved,
    }
}
