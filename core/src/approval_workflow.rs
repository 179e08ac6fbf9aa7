//! Approval workflow: the human-in-the-loop transitions.
//!
//! Every operation is one unit of work on one bucket, so a bucket can
//! never be approved and rejected at the same time. Approval and reset
//! decisions go to the append-only approval log in that same unit.

use crate::{
    collaborators::AssignmentError,
    commit_criteria::actor_may_approve,
    config::RejectPolicy,
    engine::EngineContext,
    error::{EngineError, EngineResult},
    lifecycle_controller::{Advance, GenerationOutcome, LifecycleController},
    model::{ApprovalAction, ApprovalLogEntry, Bucket, BucketStatus},
    types::BucketId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who is acting, and under which approver roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Generated(GenerationOutcome),
    /// Approved; the sweep generates it once `at` has passed.
    Scheduled { at: DateTime<Utc> },
    MissingConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalReceipt {
    pub bucket: Bucket,
    pub outcome: ApprovalOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub bucket_id: BucketId,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkApproveReport {
    pub approved: Vec<BucketId>,
    pub failed: Vec<BulkFailure>,
}

impl BulkApproveReport {
    pub fn success_count(&self) -> usize {
        self.approved.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

pub struct ApprovalWorkflow<'a> {
    ctx: &'a EngineContext,
    lifecycle: LifecycleController<'a>,
}

impl<'a> ApprovalWorkflow<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self {
            ctx,
            lifecycle: LifecycleController::new(ctx),
        }
    }

    fn log(
        &self,
        bucket_id: &str,
        action: ApprovalAction,
        actor: &Actor,
        comments: Option<&str>,
        scheduled_generation_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.ctx.store.append_approval_log(&ApprovalLogEntry {
            id: 0,
            bucket_id: bucket_id.to_string(),
            action,
            actor: actor.name.clone(),
            comments: comments.map(str::to_string),
            scheduled_generation_at,
            logged_at: now,
        })?;
        Ok(())
    }

    fn require_status(
        bucket: &Bucket,
        status: BucketStatus,
        operation: &'static str,
    ) -> EngineResult<()> {
        if bucket.status == status {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                bucket_id: bucket.bucket_id.clone(),
                status: bucket.status,
                operation,
            })
        }
    }

    fn require_role(&self, bucket: &Bucket, actor: &Actor) -> EngineResult<()> {
        let policy = self.ctx.policy.current();
        let criteria = policy.criteria_for_rule(&bucket.rule_id);
        if actor_may_approve(criteria, &actor.roles) {
            return Ok(());
        }
        let required = criteria
            .map(|c| c.required_roles.join(" or "))
            .unwrap_or_default();
        Err(EngineError::Unauthorized {
            actor: actor.name.clone(),
            required,
        })
    }

    // ── Approve ────────────────────────────────────────────────

    /// Approve a PENDING_APPROVAL bucket.
    ///
    /// If the bucket needs a payment instrument, one is assigned first. A
    /// failed assignment aborts the whole approval: nothing is written and
    /// the error says whether the pool was empty or assignment broke.
    pub fn approve(
        &self,
        bucket_id: &str,
        actor: &Actor,
        comments: Option<&str>,
        generate_at: Option<DateTime<Utc>>,
    ) -> EngineResult<ApprovalReceipt> {
        let now = self.ctx.now();
        let store = &self.ctx.store;
        let tx = store.unit_of_work()?;
        let mut bucket = store.require_bucket(bucket_id)?;
        Self::require_status(&bucket, BucketStatus::PendingApproval, "approve")?;
        if bucket.approved_at.is_some() {
            // Already approved and waiting on its scheduled generation time.
            return Err(EngineError::InvalidState {
                bucket_id: bucket.bucket_id,
                status: bucket.status,
                operation: "re-approve",
            });
        }
        self.require_role(&bucket, actor)?;

        let assigned = self.assign_instrument(&bucket)?;
        if let Some(instrument_id) = &assigned {
            bucket.payment_instrument_id = Some(instrument_id.clone());
        }

        let committed = self
            .record_approval(&mut bucket, actor, comments, generate_at, now)
            .and_then(|advance| {
                tx.commit()?;
                Ok(advance)
            });
        let advance = match committed {
            Ok(advance) => advance,
            Err(e) => {
                if let Some(instrument_id) = &assigned {
                    self.ctx.allocator.release(&bucket, instrument_id);
                    log::warn!("bucket={bucket_id} approval: released instrument {instrument_id} after rollback");
                }
                return Err(e);
            }
        };

        let outcome = match advance {
            Advance::Generate => ApprovalOutcome::Generated(self.lifecycle.generate_after_commit(bucket_id)),
            Advance::MissingConfiguration => ApprovalOutcome::MissingConfiguration,
            Advance::AwaitApproval | Advance::Stay => ApprovalOutcome::Scheduled {
                at: bucket.scheduled_generation_at.unwrap_or(now),
            },
        };
        Ok(ApprovalReceipt {
            bucket: store.require_bucket(bucket_id)?,
            outcome,
        })
    }

    fn assign_instrument(&self, bucket: &Bucket) -> EngineResult<Option<String>> {
        if bucket.payment_instrument_id.is_some() || !self.ctx.allocator.requires_instrument(bucket) {
            return Ok(None);
        }
        match self.ctx.allocator.assign(bucket) {
            Ok(instrument_id) => {
                log::debug!("bucket={} approval: instrument {instrument_id} assigned", bucket.bucket_id);
                Ok(Some(instrument_id))
            }
            Err(AssignmentError::NoneAvailable) => {
                log::warn!("bucket={} approval: no payment instrument available", bucket.bucket_id);
                Err(EngineError::NoInstrumentAvailable {
                    bucket_id: bucket.bucket_id.clone(),
                })
            }
            Err(AssignmentError::Failed(message)) => {
                log::warn!("bucket={} approval: instrument assignment failed: {message}", bucket.bucket_id);
                Err(EngineError::InstrumentAssignment {
                    bucket_id: bucket.bucket_id.clone(),
                    message,
                })
            }
        }
    }

    fn record_approval(
        &self,
        bucket: &mut Bucket,
        actor: &Actor,
        comments: Option<&str>,
        generate_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<Advance> {
        bucket.approved_by = Some(actor.name.clone());
        bucket.approved_at = Some(now);
        bucket.scheduled_generation_at = generate_at.filter(|at| *at > now);
        self.log(
            &bucket.bucket_id,
            ApprovalAction::Approve,
            actor,
            comments,
            bucket.scheduled_generation_at,
            now,
        )?;
        log::info!("bucket={} approval: approved by {}", bucket.bucket_id, actor.name);

        if let Some(at) = bucket.scheduled_generation_at {
            if self.ctx.directory.is_configured(&bucket.payer_id, &bucket.payee_id) {
                bucket.updated_at = now;
                self.ctx.store.save_bucket(bucket)?;
                log::info!("bucket={} approval: generation scheduled for {at}", bucket.bucket_id);
                return Ok(Advance::AwaitApproval);
            }
        }
        self.lifecycle.release_for_generation(bucket, now)
    }

    /// Approve each bucket on its own. One failure never undoes another.
    pub fn bulk_approve(
        &self,
        bucket_ids: &[String],
        actor: &Actor,
        comments: Option<&str>,
    ) -> BulkApproveReport {
        let mut report = BulkApproveReport::default();
        for bucket_id in bucket_ids {
            match self.approve(bucket_id, actor, comments, None) {
                Ok(_) => report.approved.push(bucket_id.clone()),
                Err(e) => {
                    log::warn!("bucket={bucket_id} approval: bulk item failed: {e}");
                    report.failed.push(BulkFailure {
                        bucket_id: bucket_id.clone(),
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }
        log::info!(
            "approval: bulk approve by {}: {} approved, {} failed",
            actor.name,
            report.success_count(),
            report.failure_count()
        );
        report
    }

    // ── Reject ─────────────────────────────────────────────────

    /// Reject a PENDING_APPROVAL bucket. Under the default policy it goes
    /// back to accumulating with its claims; if another bucket has started
    /// accumulating for the same key meanwhile, it is folded into that one.
    pub fn reject(&self, bucket_id: &str, actor: &Actor, reason: &str) -> EngineResult<Bucket> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation("a rejection reason is required".into()));
        }
        let now = self.ctx.now();
        let store = &self.ctx.store;
        let policy = self.ctx.policy.current();
        let tx = store.unit_of_work()?;
        let mut bucket = store.require_bucket(bucket_id)?;
        Self::require_status(&bucket, BucketStatus::PendingApproval, "reject")?;
        self.require_role(&bucket, actor)?;

        self.log(bucket_id, ApprovalAction::Reject, actor, Some(reason), None, now)?;
        bucket.rejection_count += 1;
        bucket.approved_by = None;
        bucket.approved_at = None;
        bucket.scheduled_generation_at = None;
        bucket.trigger_threshold_id = None;
        bucket.trigger_condition = None;

        let mut follow_up = None;
        match self.ctx.config.approval.reject_policy {
            RejectPolicy::Fail => {
                bucket.failure_reason = Some(format!("rejected by {}: {reason}", actor.name));
                self.lifecycle.transition(&mut bucket, BucketStatus::Failed, now)?;
            }
            RejectPolicy::ReturnToAccumulating => {
                match store.find_accumulating_bucket(&bucket.rule_id, &bucket.grouping_key)? {
                    Some(mut newer) => {
                        self.lifecycle.merge_into(&mut bucket, &mut newer, now)?;
                        let advance = self.lifecycle.evaluate_and_advance(&mut newer, &policy, now)?;
                        if advance == Advance::Generate {
                            follow_up = Some(newer.bucket_id.clone());
                        }
                    }
                    None => {
                        self.lifecycle.transition(&mut bucket, BucketStatus::Accumulating, now)?;
                    }
                }
            }
        }
        tx.commit()?;
        log::info!(
            "bucket={bucket_id} approval: rejected by {} ({} rejection(s)): {reason}",
            actor.name,
            bucket.rejection_count
        );

        if let Some(target) = follow_up {
            self.lifecycle.generate_after_commit(&target);
        }
        store.require_bucket(bucket_id)
    }

    // ── Operator recovery ──────────────────────────────────────

    /// Bring a FAILED bucket back to PENDING_APPROVAL. Logged as OVERRIDE.
    pub fn reset(&self, bucket_id: &str, actor: &Actor, reason: &str) -> EngineResult<Bucket> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation("a reset reason is required".into()));
        }
        let now = self.ctx.now();
        let store = &self.ctx.store;
        let tx = store.unit_of_work()?;
        let mut bucket = store.require_bucket(bucket_id)?;
        Self::require_status(&bucket, BucketStatus::Failed, "reset")?;

        self.log(bucket_id, ApprovalAction::Override, actor, Some(reason), None, now)?;
        bucket.failure_reason = None;
        bucket.approved_by = None;
        bucket.approved_at = None;
        bucket.scheduled_generation_at = None;
        bucket.generation_started_at = None;
        bucket.generation_completed_at = None;
        self.lifecycle.transition(&mut bucket, BucketStatus::PendingApproval, now)?;
        tx.commit()?;
        log::info!("bucket={bucket_id} approval: reset by {}: {reason}", actor.name);
        Ok(bucket)
    }

    /// Move a MISSING_CONFIGURATION bucket back to PENDING_APPROVAL once its
    /// payer and payee are configured. Logged as OVERRIDE.
    pub fn resolve_configuration(&self, bucket_id: &str, actor: &Actor) -> EngineResult<Bucket> {
        let now = self.ctx.now();
        let store = &self.ctx.store;
        let tx = store.unit_of_work()?;
        let mut bucket = store.require_bucket(bucket_id)?;
        Self::require_status(&bucket, BucketStatus::MissingConfiguration, "resolve configuration for")?;
        if !self.ctx.directory.is_configured(&bucket.payer_id, &bucket.payee_id) {
            return Err(EngineError::ConfigurationMissing(bucket.bucket_id));
        }

        self.log(
            bucket_id,
            ApprovalAction::Override,
            actor,
            Some("payer/payee configuration supplied"),
            None,
            now,
        )?;
        recover_configuration(&self.lifecycle, &mut bucket, now)?;
        tx.commit()?;
        log::info!("bucket={bucket_id} approval: configuration resolved by {}", actor.name);
        Ok(bucket)
    }
}

/// Shared by the operator path and the scheduled sweep. A recovered
/// bucket needs a fresh approval.
pub(crate) fn recover_configuration(
    lifecycle: &LifecycleController<'_>,
    bucket: &mut Bucket,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    bucket.approved_by = None;
    bucket.approved_at = None;
    bucket.scheduled_generation_at = None;
    lifecycle.transition(bucket, BucketStatus::PendingApproval, now)
}
