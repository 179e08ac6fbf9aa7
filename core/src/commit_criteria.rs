//! Commit criteria: once a bucket has triggered, may it go straight to
//! generation or does a human have to approve it?

use crate::config::{CommitCriteria, CommitMode};
use crate::model::Bucket;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitDecision {
    AutoGenerate,
    RequireApproval,
}

/// No applicable criteria means approval is required.
///
/// HYBRID auto-generates only when the bucket is under both configured
/// limits. An unset limit places no constraint.
pub fn decide(bucket: &Bucket, criteria: Option<&CommitCriteria>) -> CommitDecision {
    let Some(criteria) = criteria else {
        return CommitDecision::RequireApproval;
    };
    match criteria.mode {
        CommitMode::Auto => CommitDecision::AutoGenerate,
        CommitMode::Manual => CommitDecision::RequireApproval,
        CommitMode::Hybrid => {
            let under_amount = criteria
                .auto_commit_threshold
                .map_or(true, |limit| bucket.total_amount < limit);
            let under_count = criteria
                .manual_approval_threshold
                .map_or(true, |limit| bucket.claim_count < limit);
            if under_amount && under_count {
                CommitDecision::AutoGenerate
            } else {
                CommitDecision::RequireApproval
            }
        }
    }
}

/// True when `roles` satisfies the criteria's approver requirement.
pub fn actor_may_approve(criteria: Option<&CommitCriteria>, roles: &[String]) -> bool {
    match criteria {
        Some(c) if !c.required_roles.is_empty() => {
            c.required_roles.iter().any(|required| roles.contains(required))
        }
        _ => true,
    }
}
