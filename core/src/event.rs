//! Lifecycle events: the audit stream of everything the engine decides.
//!
//! RULE: every event is appended inside the same unit of work as the state
//! change it describes, so the log never disagrees with the bucket row.

use crate::model::{BucketStatus, DeliveryStatus, TriggerCondition};
use crate::types::{BucketId, FileId, Money, RuleId, ThresholdId};
use serde::{Deserialize, Serialize};

/// Every event emitted by the engine.
/// Variants are only ever added, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    // ── Aggregation ────────────────────────────────
    BucketOpened {
        bucket_id: BucketId,
        rule_id: RuleId,
        grouping_key: String,
    },
    ThresholdTriggered {
        bucket_id: BucketId,
        threshold_id: ThresholdId,
        condition: TriggerCondition,
        claim_count: u64,
        total_amount: Money,
    },

    // ── State machine ──────────────────────────────
    BucketTransitioned {
        bucket_id: BucketId,
        from: BucketStatus,
        to: BucketStatus,
    },
    BucketMerged {
        bucket_id: BucketId,
        into_bucket_id: BucketId,
        claim_count: u64,
        total_amount: Money,
    },

    // ── Generation ─────────────────────────────────
    FileGenerated {
        bucket_id: BucketId,
        file_id: FileId,
        claim_count: u64,
        total_amount: Money,
    },
    GenerationFailed {
        bucket_id: BucketId,
        message: String,
    },

    // ── Delivery ───────────────────────────────────
    DeliveryAttempted {
        file_id: FileId,
        attempt: u32,
        succeeded: bool,
        status: DeliveryStatus,
        error: Option<String>,
    },
    DeliveryOverridden {
        file_id: FileId,
        actor: String,
        status: DeliveryStatus,
    },
}

impl LifecycleEvent {
    /// Stable name for the event_type column.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BucketOpened { .. } => "bucket_opened",
            Self::ThresholdTriggered { .. } => "threshold_triggered",
            Self::BucketTransitioned { .. } => "bucket_transitioned",
            Self::BucketMerged { .. } => "bucket_merged",
            Self::FileGenerated { .. } => "file_generated",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::DeliveryAttempted { .. } => "delivery_attempted",
            Self::DeliveryOverridden { .. } => "delivery_overridden",
        }
    }

    /// The bucket or file this event is about, for the subject column.
    pub fn subject(&self) -> &str {
        match self {
            Self::BucketOpened { bucket_id, .. }
            | Self::ThresholdTriggered { bucket_id, .. }
            | Self::BucketTransitioned { bucket_id, .. }
            | Self::BucketMerged { bucket_id, .. }
            | Self::FileGenerated { bucket_id, .. }
            | Self::GenerationFailed { bucket_id, .. } => bucket_id,
            Self::DeliveryAttempted { file_id, .. }
            | Self::DeliveryOverridden { file_id, .. } => file_id,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub subject: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized LifecycleEvent
    pub created_at: i64,
}
