//! Bucket lifecycle controller: owns the state machine and the generation
//! handoff.
//!
//! TRANSITIONS (anything else is rejected and the bucket left untouched):
//!   accumulating          -> pending_approval | generating | missing_configuration
//!   pending_approval      -> generating | missing_configuration | accumulating | failed | merged
//!   generating            -> completed | failed
//!   missing_configuration -> pending_approval
//!   failed                -> pending_approval   (operator reset)
//!
//! Every transition is a compare-and-swap on the bucket version plus a
//! `BucketTransitioned` event, both inside the caller's unit of work.
//! Generation is the exception: it opens its own unit of work after the
//! composer has run, so the composer never holds the write lock.

use crate::{
    commit_criteria::{decide, CommitDecision},
    config::PolicySet,
    delivery_retry::{DeliveryOutcome, DeliveryRetryCoordinator},
    engine::EngineContext,
    error::{EngineError, EngineResult},
    event::LifecycleEvent,
    model::{Bucket, BucketStatus, DeliveryStatus, FileGenerationRecord},
    threshold_evaluator::{evaluate, Trigger},
    types::{FileId, Money},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

impl BucketStatus {
    pub fn can_transition_to(self, to: BucketStatus) -> bool {
        use BucketStatus::*;
        matches!(
            (self, to),
            (Accumulating, PendingApproval | Generating | MissingConfiguration)
                | (
                    PendingApproval,
                    Generating | MissingConfiguration | Accumulating | Failed | Merged
                )
                | (Generating, Completed | Failed)
                | (MissingConfiguration, PendingApproval)
                | (Failed, PendingApproval)
        )
    }
}

/// Where a bucket went after an evaluation or approval step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Advance {
    /// Nothing fired; still accumulating.
    Stay,
    AwaitApproval,
    MissingConfiguration,
    /// Moved to GENERATING; the caller runs `generate` after committing.
    Generate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "generation", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Completed {
        file_id: FileId,
        claim_count: u64,
        total_amount: Money,
        delivery: Option<DeliveryOutcome>,
    },
    Failed {
        reason: String,
    },
    /// The result could not be recorded. The bucket is still GENERATING
    /// and the monitor sweep runs the generation again after the grace period.
    Stalled {
        reason: String,
    },
}

pub struct LifecycleController<'a> {
    ctx: &'a EngineContext,
}

impl<'a> LifecycleController<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Move `bucket` to `to`. On error `bucket` is left as it was.
    pub(crate) fn transition(
        &self,
        bucket: &mut Bucket,
        to: BucketStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let from = bucket.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                bucket_id: bucket.bucket_id.clone(),
                from,
                to,
            });
        }

        let mut next = bucket.clone();
        next.status = to;
        next.updated_at = now;
        next.awaiting_approval_since = match to {
            BucketStatus::PendingApproval => Some(now),
            _ => None,
        };
        match to {
            BucketStatus::Generating => next.generation_started_at = Some(now),
            BucketStatus::Completed => next.generation_completed_at = Some(now),
            BucketStatus::Failed if from == BucketStatus::Generating => {
                next.generation_completed_at = Some(now)
            }
            _ => {}
        }

        self.ctx.store.save_bucket(&mut next)?;
        self.ctx.store.append_event(
            &LifecycleEvent::BucketTransitioned {
                bucket_id: next.bucket_id.clone(),
                from,
                to,
            },
            now,
        )?;
        log::info!("bucket={} lifecycle: {from} -> {to}", next.bucket_id);
        *bucket = next;
        Ok(())
    }

    /// Run the thresholds against an ACCUMULATING bucket and apply whatever
    /// fires. Must run inside the caller's unit of work.
    pub(crate) fn evaluate_and_advance(
        &self,
        bucket: &mut Bucket,
        policy: &PolicySet,
        now: DateTime<Utc>,
    ) -> EngineResult<Advance> {
        if bucket.status != BucketStatus::Accumulating {
            return Ok(Advance::Stay);
        }
        let thresholds = policy.thresholds_for_rule(&bucket.rule_id);
        match evaluate(bucket, &thresholds, now) {
            Some(trigger) => self.advance_on_trigger(bucket, &trigger, policy, now),
            None => Ok(Advance::Stay),
        }
    }

    fn advance_on_trigger(
        &self,
        bucket: &mut Bucket,
        trigger: &Trigger,
        policy: &PolicySet,
        now: DateTime<Utc>,
    ) -> EngineResult<Advance> {
        bucket.trigger_threshold_id = Some(trigger.threshold_id.clone());
        bucket.trigger_condition = Some(trigger.condition);
        self.ctx.store.append_event(
            &LifecycleEvent::ThresholdTriggered {
                bucket_id: bucket.bucket_id.clone(),
                threshold_id: trigger.threshold_id.clone(),
                condition: trigger.condition,
                claim_count: bucket.claim_count,
                total_amount: bucket.total_amount,
            },
            now,
        )?;
        log::info!(
            "bucket={} threshold: {} fired on {} ({} claims, {})",
            bucket.bucket_id,
            trigger.threshold_id,
            trigger.condition,
            bucket.claim_count,
            bucket.total_amount
        );

        match decide(bucket, policy.criteria_for_rule(&bucket.rule_id)) {
            CommitDecision::AutoGenerate => self.release_for_generation(bucket, now),
            CommitDecision::RequireApproval => {
                self.transition(bucket, BucketStatus::PendingApproval, now)?;
                Ok(Advance::AwaitApproval)
            }
        }
    }

    /// GENERATING if the payer and payee are configured, otherwise
    /// MISSING_CONFIGURATION.
    pub(crate) fn release_for_generation(
        &self,
        bucket: &mut Bucket,
        now: DateTime<Utc>,
    ) -> EngineResult<Advance> {
        if self.ctx.directory.is_configured(&bucket.payer_id, &bucket.payee_id) {
            self.transition(bucket, BucketStatus::Generating, now)?;
            Ok(Advance::Generate)
        } else {
            log::warn!(
                "bucket={} lifecycle: payer {} / payee {} not configured",
                bucket.bucket_id,
                bucket.payer_id,
                bucket.payee_id
            );
            self.transition(bucket, BucketStatus::MissingConfiguration, now)?;
            Ok(Advance::MissingConfiguration)
        }
    }

    /// Fold a rejected bucket into the newer accumulating bucket for the
    /// same key. The source becomes MERGED; the target gains its counters.
    pub(crate) fn merge_into(
        &self,
        source: &mut Bucket,
        target: &mut Bucket,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let total = target
            .total_amount
            .checked_add(source.total_amount)
            .ok_or_else(|| EngineError::Validation(format!("bucket {} total overflows", target.bucket_id)))?;
        let mut grown = target.clone();
        grown.claim_count += source.claim_count;
        grown.total_amount = total;
        grown.updated_at = now;
        self.ctx.store.save_bucket(&mut grown)?;

        source.merged_into_bucket_id = Some(target.bucket_id.clone());
        self.transition(source, BucketStatus::Merged, now)?;
        self.ctx.store.append_event(
            &LifecycleEvent::BucketMerged {
                bucket_id: source.bucket_id.clone(),
                into_bucket_id: target.bucket_id.clone(),
                claim_count: source.claim_count,
                total_amount: source.total_amount,
            },
            now,
        )?;
        log::info!(
            "bucket={} lifecycle: merged into {} ({} claims)",
            source.bucket_id,
            target.bucket_id,
            source.claim_count
        );
        *target = grown;
        Ok(())
    }

    // ── Generation handoff ─────────────────────────────────────

    /// `generate` for callers whose move to GENERATING has already
    /// committed. Their operation stands either way, so a failure to record
    /// the generation comes back as `Stalled` rather than as an error.
    pub(crate) fn generate_after_commit(&self, bucket_id: &str) -> GenerationOutcome {
        match self.generate(bucket_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("bucket={bucket_id} generation: not recorded, left for the monitor: {e}");
                GenerationOutcome::Stalled { reason: e.to_string() }
            }
        }
    }

    /// Compose the file for a GENERATING bucket and record the result:
    /// COMPLETED plus a PENDING file record, or FAILED and no record.
    /// Called once, right after the unit of work that moved the bucket to
    /// GENERATING has committed.
    pub(crate) fn generate(&self, bucket_id: &str) -> EngineResult<GenerationOutcome> {
        let store = &self.ctx.store;
        let bucket = store.require_bucket(bucket_id)?;
        if bucket.status != BucketStatus::Generating {
            return Err(EngineError::InvalidState {
                bucket_id: bucket.bucket_id,
                status: bucket.status,
                operation: "generate",
            });
        }
        let claims = store.claims_for_bucket(bucket_id)?;
        let composed = self.ctx.composer.compose(&bucket, &claims);

        let now = self.ctx.now();
        let tx = store.unit_of_work()?;
        let mut current = store.require_bucket(bucket_id)?;
        if current.version != bucket.version {
            return Err(EngineError::ConcurrentModification {
                bucket_id: bucket.bucket_id,
                expected: bucket.version,
            });
        }

        let outcome = match composed {
            Ok(file) => {
                self.transition(&mut current, BucketStatus::Completed, now)?;
                let record = FileGenerationRecord {
                    file_id: uuid::Uuid::new_v4().to_string(),
                    bucket_id: current.bucket_id.clone(),
                    file_name: file.file_name,
                    destination: file.destination,
                    content: file.content,
                    claim_count: current.claim_count,
                    total_amount: current.total_amount,
                    delivery_status: DeliveryStatus::Pending,
                    delivery_attempt_count: 0,
                    last_error: None,
                    last_attempt_at: None,
                    next_attempt_at: Some(now),
                    delivered_at: None,
                    generated_at: now,
                    version: 0,
                };
                store.insert_file_record(&record)?;
                let accepted = store.accept_bucket_claims(&current.bucket_id, now)?;
                store.append_event(
                    &LifecycleEvent::FileGenerated {
                        bucket_id: current.bucket_id.clone(),
                        file_id: record.file_id.clone(),
                        claim_count: record.claim_count,
                        total_amount: record.total_amount,
                    },
                    now,
                )?;
                log::info!(
                    "bucket={} generation: file {} ({}, {accepted} claims accepted)",
                    current.bucket_id,
                    record.file_name,
                    record.total_amount
                );
                GenerationOutcome::Completed {
                    file_id: record.file_id,
                    claim_count: record.claim_count,
                    total_amount: record.total_amount,
                    delivery: None,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                current.failure_reason = Some(reason.clone());
                self.transition(&mut current, BucketStatus::Failed, now)?;
                store.append_event(
                    &LifecycleEvent::GenerationFailed {
                        bucket_id: current.bucket_id.clone(),
                        message: reason.clone(),
                    },
                    now,
                )?;
                log::warn!("bucket={} generation: {reason}", current.bucket_id);
                GenerationOutcome::Failed { reason }
            }
        };
        tx.commit()?;

        match outcome {
            GenerationOutcome::Completed {
                file_id,
                claim_count,
                total_amount,
                ..
            } if self.ctx.config.delivery.deliver_on_generation => {
                let delivery = match DeliveryRetryCoordinator::new(self.ctx).attempt_delivery(&file_id) {
                    Ok(delivery) => Some(delivery),
                    Err(e) => {
                        // The delivery sweep picks the file up again.
                        log::warn!("file={file_id} delivery: first attempt not recorded: {e}");
                        None
                    }
                };
                Ok(GenerationOutcome::Completed {
                    file_id,
                    claim_count,
                    total_amount,
                    delivery,
                })
            }
            other => Ok(other),
        }
    }
}
