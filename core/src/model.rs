//! Persistent records: buckets, the append-only logs, and generated files.
//!
//! These are plain data. Relationships (bucket → rule, file → bucket) are
//! id references resolved through the store, never live object graphs.

use crate::types::{text_enum, BucketId, ClaimId, FileId, Money, RuleId, ThresholdId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Bucket ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketStatus {
    Accumulating,
    PendingApproval,
    MissingConfiguration,
    Generating,
    Completed,
    Failed,
    /// Folded into a newer accumulating bucket for the same key after a rejection.
    Merged,
}

text_enum!(BucketStatus {
    Accumulating => "accumulating",
    PendingApproval => "pending_approval",
    MissingConfiguration => "missing_configuration",
    Generating => "generating",
    Completed => "completed",
    Failed => "failed",
    Merged => "merged",
});

impl BucketStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Merged)
    }
}

/// Which sub-condition of a threshold fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    ClaimCount,
    Amount,
    Elapsed,
}

text_enum!(TriggerCondition {
    ClaimCount => "claim_count",
    Amount => "amount",
    Elapsed => "elapsed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub bucket_id: BucketId,
    pub rule_id: RuleId,
    pub grouping_key: String,
    pub payer_id: String,
    pub payee_id: String,
    pub bin_number: Option<String>,
    pub pcn_number: Option<String>,
    pub status: BucketStatus,
    pub claim_count: u64,
    pub total_amount: Money,
    pub rejection_count: u32,
    /// Compare-and-swap counter, bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only while the bucket sits in PENDING_APPROVAL.
    pub awaiting_approval_since: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub scheduled_generation_at: Option<DateTime<Utc>>,
    pub payment_instrument_id: Option<String>,
    pub trigger_threshold_id: Option<ThresholdId>,
    pub trigger_condition: Option<TriggerCondition>,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub generation_completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub merged_into_bucket_id: Option<BucketId>,
}

// ── Claim processing log ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimLogOutcome {
    /// Aggregated into a bucket.
    Processed,
    /// Included in a generated file.
    Accepted,
    Rejected,
}

text_enum!(ClaimLogOutcome {
    Processed => "processed",
    Accepted => "accepted",
    Rejected => "rejected",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimLogEntry {
    pub id: i64,
    pub claim_id: ClaimId,
    pub bucket_id: Option<BucketId>,
    pub outcome: ClaimLogOutcome,
    pub reason: Option<String>,
    pub payer_id: Option<String>,
    pub payee_id: Option<String>,
    pub amount: Option<Money>,
    pub logged_at: DateTime<Utc>,
}

// ── Bucket approval log ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalAction {
    Approve,
    Reject,
    Override,
}

text_enum!(ApprovalAction {
    Approve => "approve",
    Reject => "reject",
    Override => "override",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalLogEntry {
    pub id: i64,
    pub bucket_id: BucketId,
    pub action: ApprovalAction,
    pub actor: String,
    pub comments: Option<String>,
    pub scheduled_generation_at: Option<DateTime<Utc>>,
    pub logged_at: DateTime<Utc>,
}

// ── File generation history ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Retry,
}

text_enum!(DeliveryStatus {
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
    Retry => "retry",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileGenerationRecord {
    pub file_id: FileId,
    pub bucket_id: BucketId,
    pub file_name: String,
    pub destination: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    /// Snapshot of the bucket counters at generation time.
    pub claim_count: u64,
    pub total_amount: Money,
    pub delivery_status: DeliveryStatus,
    pub delivery_attempt_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
    pub version: i64,
}
