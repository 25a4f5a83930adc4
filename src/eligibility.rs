//! Eligibility checks for withdrawal requests and votes
//!
//! Pure read/validate functions with no side effects. Voting rights come from
//! the group's denormalized contributor list, never from transaction history.

use crate::{ContributionGroup, EngineError, EngineResult, WithdrawalRequest};

/// Whether `user_id` may submit a withdrawal request of `amount` against the group
///
/// Only the group creator may request, and only up to the pooled balance as it
/// stands at creation time. The balance is re-checked again at settlement time.
pub fn can_request_withdrawal(
    user_id: &str,
    group: &ContributionGroup,
    amount: f64,
) -> EngineResult<()> {
    if amount <= 0.0 {
        return Err(EngineError::InvalidAmount(amount));
    }

    if user_id != group.creator_id {
        return Err(EngineError::NotGroupCreator(
            user_id.to_string(),
            group.id.clone(),
        ));
    }

    if amount > group.current_amount {
        return Err(EngineError::InsufficientFunds {
            requested: amount,
            available: group.current_amount,
        });
    }

    Ok(())
}

/// Whether `user_id` may cast a ballot on the request
///
/// Checks run in order: membership, then contribution on record, then
/// absence of a prior ballot.
pub fn can_vote(
    user_id: &str,
    group: &ContributionGroup,
    request: &WithdrawalRequest,
) -> EngineResult<()> {
    if !group.members.contains(user_id) {
        return Err(EngineError::NotAMember(
            user_id.to_string(),
            group.id.clone(),
        ));
    }

    if !group.has_contributed(user_id) {
        return Err(EngineError::NoContributionOnRecord(
            user_id.to_string(),
            group.id.clone(),
        ));
    }

    if request.has_voted(user_id) {
        return Err(EngineError::AlreadyVoted(
            user_id.to_string(),
            request.id.clone(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ballot, VoteChoice};

    fn group_with_funds() -> ContributionGroup {
        let mut group = ContributionGroup::new("g1", "alice", "Trip fund", 5000.0);
        group.record_contribution("alice", 600.0, false, 1);
        group.record_contribution("bob", 400.0, false, 1);
        group
    }

    #[test]
    fn test_creator_can_request_within_balance() {
        let group = group_with_funds();
        assert!(can_request_withdrawal("alice", &group, 1000.0).is_ok());
    }

    #[test]
    fn test_non_creator_cannot_request() {
        let group = group_with_funds();
        let result = can_request_withdrawal("bob", &group, 100.0);
        assert!(matches!(result, Err(EngineError::NotGroupCreator(_, _))));
    }

    #[test]
    fn test_request_over_balance_rejected() {
        let group = group_with_funds();
        let result = can_request_withdrawal("alice", &group, 1000.01);
        assert!(matches!(result, Err(EngineError::InsufficientFunds { .. })));
    }

    #[test]
    fn test_request_non_positive_amount_rejected() {
        let group = group_with_funds();
        assert!(matches!(
            can_request_withdrawal("alice", &group, 0.0),
            Err(EngineError::InvalidAmount(_))
        ));
        assert!(matches!(
            can_request_withdrawal("alice", &group, -5.0),
            Err(EngineError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_contributing_member_can_vote() {
        let group = group_with_funds();
        let request = WithdrawalRequest::new("r1", "g1", "alice", 100.0, "supplies", 100);
        assert!(can_vote("bob", &group, &request).is_ok());
    }

    #[test]
    fn test_non_member_cannot_vote() {
        let group = group_with_funds();
        let request = WithdrawalRequest::new("r1", "g1", "alice", 100.0, "supplies", 100);
        let result = can_vote("mallory", &group, &request);
        assert!(matches!(result, Err(EngineError::NotAMember(_, _))));
    }

    #[test]
    fn test_member_without_contribution_cannot_vote() {
        let mut group = group_with_funds();
        group.members.insert("carol".to_string());
        let request = WithdrawalRequest::new("r1", "g1", "alice", 100.0, "supplies", 100);
        let result = can_vote("carol", &group, &request);
        assert!(matches!(
            result,
            Err(EngineError::NoContributionOnRecord(_, _))
        ));
    }

    #[test]
    fn test_double_vote_rejected() {
        let group = group_with_funds();
        let mut request = WithdrawalRequest::new("r1", "g1", "alice", 100.0, "supplies", 100);
        request.votes.push(Ballot {
            user_id: "bob".to_string(),
            choice: VoteChoice::Approve,
            cast_at: 2,
        });

        let result = can_vote("bob", &group, &request);
        assert!(matches!(result, Err(EngineError::AlreadyVoted(_, _))));
    }
}
