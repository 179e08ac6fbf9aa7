//! Claim aggregator: applies one change event.
//!
//! A structurally valid claim runs as one unit of work: duplicate check,
//! rule resolution, fetch-or-create of the accumulating bucket, counter
//! update, PROCESSED log row, threshold evaluation, and the resulting
//! transition. The unit holds the database write lock from the start, so
//! two claims for the same key can never both create a bucket, and the
//! partial unique index on (rule, key) backs that up.
//!
//! Invalid claims are logged REJECTED and never touch a bucket.

use crate::{
    bucketing_resolver::resolve,
    claim::{Claim, ClaimEvent, ClaimRejection},
    engine::EngineContext,
    error::EngineResult,
    event::LifecycleEvent,
    lifecycle_controller::{Advance, GenerationOutcome, LifecycleController},
    model::{Bucket, BucketStatus, ClaimLogEntry, ClaimLogOutcome},
    types::{ClaimId, Money},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Processed { advance: Advance },
    Rejected { reason: String },
    /// Already aggregated once; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimReceipt {
    pub claim_id: ClaimId,
    pub outcome: ClaimOutcome,
    /// The bucket the claim landed in, as it stands after this event.
    pub bucket: Option<Bucket>,
    pub generation: Option<GenerationOutcome>,
}

impl ClaimReceipt {
    fn rejected(claim_id: &str, rejection: &ClaimRejection) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            outcome: ClaimOutcome::Rejected {
                reason: rejection.to_string(),
            },
            bucket: None,
            generation: None,
        }
    }
}

pub struct ClaimAggregator<'a> {
    ctx: &'a EngineContext,
    lifecycle: LifecycleController<'a>,
}

impl<'a> ClaimAggregator<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self {
            ctx,
            lifecycle: LifecycleController::new(ctx),
        }
    }

    pub fn apply(&self, event: &ClaimEvent) -> EngineResult<ClaimReceipt> {
        let now = self.ctx.now();
        let claim = match event.validate() {
            Ok(claim) => claim,
            Err(rejection) => {
                self.log_rejection(event, &rejection, now)?;
                return Ok(ClaimReceipt::rejected(event.claim_id.trim(), &rejection));
            }
        };

        let store = &self.ctx.store;
        let policy = self.ctx.policy.current();
        let tx = store.unit_of_work()?;

        if store.claim_already_processed(&claim.claim_id)? {
            log::debug!("claim={} aggregator: duplicate event ignored", claim.claim_id);
            return Ok(ClaimReceipt {
                claim_id: claim.claim_id,
                outcome: ClaimOutcome::Duplicate,
                bucket: None,
                generation: None,
            });
        }

        let Some(resolution) = resolve(&policy, &claim) else {
            let rejection = ClaimRejection::NoMatchingRule;
            self.log_rejection(event, &rejection, now)?;
            tx.commit()?;
            return Ok(ClaimReceipt::rejected(&claim.claim_id, &rejection));
        };

        let bucket_id = match store.find_accumulating_bucket(&resolution.rule.rule_id, &resolution.grouping_key)? {
            Some(existing) => existing.bucket_id,
            None => self.open_bucket(&claim, &resolution.rule.rule_id, &resolution.grouping_key, now)?,
        };
        let mut bucket = store.add_claim_to_bucket(&bucket_id, claim.charge_amount, now)?;
        store.append_claim_log(&ClaimLogEntry {
            id: 0,
            claim_id: claim.claim_id.clone(),
            bucket_id: Some(bucket_id.clone()),
            outcome: ClaimLogOutcome::Processed,
            reason: None,
            payer_id: Some(claim.payer_id.clone()),
            payee_id: Some(claim.payee_id.clone()),
            amount: Some(claim.charge_amount),
            logged_at: now,
        })?;
        log::debug!(
            "claim={} aggregator: into bucket={} ({} claims, {})",
            claim.claim_id,
            bucket_id,
            bucket.claim_count,
            bucket.total_amount
        );

        let advance = self.lifecycle.evaluate_and_advance(&mut bucket, &policy, now)?;
        tx.commit()?;

        let generation = match advance {
            Advance::Generate => Some(self.lifecycle.generate_after_commit(&bucket_id)),
            _ => None,
        };
        Ok(ClaimReceipt {
            claim_id: claim.claim_id,
            outcome: ClaimOutcome::Processed { advance },
            bucket: Some(store.require_bucket(&bucket_id)?),
            generation,
        })
    }

    fn open_bucket(
        &self,
        claim: &Claim,
        rule_id: &str,
        grouping_key: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<String> {
        let bucket = Bucket {
            bucket_id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule_id.to_string(),
            grouping_key: grouping_key.to_string(),
            payer_id: claim.payer_id.clone(),
            payee_id: claim.payee_id.clone(),
            bin_number: claim.bin_number.clone(),
            pcn_number: claim.pcn_number.clone(),
            status: BucketStatus::Accumulating,
            claim_count: 0,
            total_amount: Money::ZERO,
            rejection_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            awaiting_approval_since: None,
            approved_by: None,
            approved_at: None,
            scheduled_generation_at: None,
            payment_instrument_id: None,
            trigger_threshold_id: None,
            trigger_condition: None,
            generation_started_at: None,
            generation_completed_at: None,
            failure_reason: None,
            merged_into_bucket_id: None,
        };
        self.ctx.store.insert_bucket(&bucket)?;
        self.ctx.store.append_event(
            &LifecycleEvent::BucketOpened {
                bucket_id: bucket.bucket_id.clone(),
                rule_id: bucket.rule_id.clone(),
                grouping_key: bucket.grouping_key.clone(),
            },
            now,
        )?;
        log::info!(
            "bucket={} aggregator: opened for rule {} key {}",
            bucket.bucket_id,
            rule_id,
            grouping_key
        );
        Ok(bucket.bucket_id)
    }

    fn log_rejection(
        &self,
        event: &ClaimEvent,
        rejection: &ClaimRejection,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.ctx.store.append_claim_log(&ClaimLogEntry {
            id: 0,
            claim_id: event.claim_id.trim().to_string(),
            bucket_id: None,
            outcome: ClaimLogOutcome::Rejected,
            reason: Some(rejection.to_string()),
            payer_id: event.payer_id.clone(),
            payee_id: event.payee_id.clone(),
            amount: None,
            logged_at: now,
        })?;
        log::debug!("claim={} aggregator: rejected: {rejection}", event.claim_id);
        Ok(())
    }
}
