//! The bucket engine: the one entry point every worker goes through.
//!
//! PIPELINE (fixed, documented, never reordered):
//!   1. Bucketing resolver     picks the rule and grouping key
//!   2. Claim aggregator       adds the claim to the accumulating bucket
//!   3. Threshold evaluator    decides whether the bucket fires
//!   4. Commit criteria        auto-generate or require approval
//!   5. Lifecycle controller   applies the transition, hands off to the composer
//!   6. Delivery retry         moves the generated file, with backoff
//!
//! RULES:
//!   - Every worker (event consumer, monitor thread, operator call) owns
//!     its own engine handle from `fork()`, and with it its own connection.
//!   - Steps 1 to 5 for one claim run in one unit of work.
//!   - Composition and upload never run inside a unit of work.
//!   - Every state change is recorded in the event log.

use crate::{
    approval_workflow::{Actor, ApprovalReceipt, ApprovalWorkflow, BulkApproveReport},
    claim::ClaimEvent,
    claim_aggregator::{ClaimAggregator, ClaimReceipt},
    clock::{Clock, SystemClock},
    collaborators::{
        AllPartiesConfigured, DeliveryTransport, FileComposer, InstrumentAllocator,
        NoInstrumentRequired, PartyDirectory,
    },
    config::{EngineConfig, PolicyCache, PolicySet},
    delivery_retry::{DeliveryOutcome, DeliveryRetryCoordinator, DeliverySweepReport},
    error::{EngineError, EngineResult},
    event::LifecycleEvent,
    model::{ApprovalLogEntry, Bucket, BucketStatus, ClaimLogEntry, FileGenerationRecord},
    scheduled_monitor::{ScheduledMonitor, SweepReport},
    store::Store,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Everything a component needs, built once by `EngineBuilder` and passed
/// down by reference. Collaborators are shared; the store is not.
pub struct EngineContext {
    pub(crate) store:     Store,
    pub(crate) policy:    PolicyCache,
    pub(crate) config:    EngineConfig,
    pub(crate) clock:     Arc<dyn Clock>,
    pub(crate) composer:  Arc<dyn FileComposer>,
    pub(crate) transport: Arc<dyn DeliveryTransport>,
    pub(crate) directory: Arc<dyn PartyDirectory>,
    pub(crate) allocator: Arc<dyn InstrumentAllocator>,
}

impl EngineContext {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub struct EngineBuilder {
    store:     Store,
    policy:    PolicySet,
    config:    EngineConfig,
    clock:     Arc<dyn Clock>,
    composer:  Option<Arc<dyn FileComposer>>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    directory: Arc<dyn PartyDirectory>,
    allocator: Arc<dyn InstrumentAllocator>,
}

impl EngineBuilder {
    pub fn new(store: Store, policy: PolicySet) -> Self {
        Self {
            store,
            policy,
            config:    EngineConfig::default(),
            clock:     Arc::new(SystemClock),
            composer:  None,
            transport: None,
            directory: Arc::new(AllPartiesConfigured),
            allocator: Arc::new(NoInstrumentRequired),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn composer(mut self, composer: Arc<dyn FileComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn PartyDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn InstrumentAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Validate the policy, migrate the store, and wire the engine.
    pub fn build(self) -> EngineResult<BucketEngine> {
        let composer = self
            .composer
            .ok_or_else(|| EngineError::Config("no file composer configured".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| EngineError::Config("no delivery transport configured".into()))?;
        let policy = PolicyCache::new(self.policy)?;
        self.store.migrate()?;
        log::info!(
            "engine: built (schema v{}, store {})",
            self.store.schema_version()?,
            self.store.path().unwrap_or(":memory:")
        );
        Ok(BucketEngine {
            ctx: EngineContext {
                store: self.store,
                policy,
                config: self.config,
                clock: self.clock,
                composer,
                transport,
                directory: self.directory,
                allocator: self.allocator,
            },
        })
    }
}

pub struct BucketEngine {
    ctx: EngineContext,
}

impl BucketEngine {
    /// A second handle on the same database and collaborators, with its own
    /// connection. Give one to every worker thread.
    pub fn fork(&self) -> EngineResult<Self> {
        let ctx = &self.ctx;
        Ok(Self {
            ctx: EngineContext {
                store:     ctx.store.reopen()?,
                policy:    ctx.policy.clone(),
                config:    ctx.config.clone(),
                clock:     Arc::clone(&ctx.clock),
                composer:  Arc::clone(&ctx.composer),
                transport: Arc::clone(&ctx.transport),
                directory: Arc::clone(&ctx.directory),
                allocator: Arc::clone(&ctx.allocator),
            },
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &Store {
        &self.ctx.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.ctx.now()
    }

    pub fn policy(&self) -> Arc<PolicySet> {
        self.ctx.policy.current()
    }

    /// Swap in a new policy set. Applies from the next evaluation on.
    pub fn replace_policy(&self, policy: PolicySet) -> EngineResult<()> {
        self.ctx.policy.replace(policy)
    }

    // ── Ingestion ──────────────────────────────────────────────

    pub fn apply_claim(&self, event: &ClaimEvent) -> EngineResult<ClaimReceipt> {
        ClaimAggregator::new(&self.ctx).apply(event)
    }

    // ── Evaluation ─────────────────────────────────────────────

    /// Manually re-evaluate one bucket's thresholds.
    pub fn evaluate_bucket(&self, bucket_id: &str) -> EngineResult<Bucket> {
        let monitor = ScheduledMonitor::new(&self.ctx);
        monitor.evaluate_bucket(bucket_id, self.ctx.now())?;
        self.ctx.store.require_bucket(bucket_id)
    }

    /// Manually re-evaluate every accumulating bucket.
    pub fn evaluate_all(&self) -> EngineResult<SweepReport> {
        ScheduledMonitor::new(&self.ctx).evaluate_accumulating(self.ctx.now())
    }

    /// One full monitor pass: accumulating buckets, due scheduled
    /// approvals, and buckets whose configuration has been supplied.
    pub fn run_monitor_sweep(&self) -> EngineResult<SweepReport> {
        ScheduledMonitor::new(&self.ctx).sweep(self.ctx.now())
    }

    // ── Approval ───────────────────────────────────────────────

    pub fn approve(
        &self,
        bucket_id: &str,
        actor: &Actor,
        comments: Option<&str>,
    ) -> EngineResult<ApprovalReceipt> {
        ApprovalWorkflow::new(&self.ctx).approve(bucket_id, actor, comments, None)
    }

    /// Approve now, generate at `generate_at` (picked up by the sweep).
    pub fn approve_scheduled(
        &self,
        bucket_id: &str,
        actor: &Actor,
        comments: Option<&str>,
        generate_at: DateTime<Utc>,
    ) -> EngineResult<ApprovalReceipt> {
        ApprovalWorkflow::new(&self.ctx).approve(bucket_id, actor, comments, Some(generate_at))
    }

    pub fn reject(&self, bucket_id: &str, actor: &Actor, reason: &str) -> EngineResult<Bucket> {
        ApprovalWorkflow::new(&self.ctx).reject(bucket_id, actor, reason)
    }

    pub fn bulk_approve(
        &self,
        bucket_ids: &[String],
        actor: &Actor,
        comments: Option<&str>,
    ) -> BulkApproveReport {
        ApprovalWorkflow::new(&self.ctx).bulk_approve(bucket_ids, actor, comments)
    }

    pub fn reset(&self, bucket_id: &str, actor: &Actor, reason: &str) -> EngineResult<Bucket> {
        ApprovalWorkflow::new(&self.ctx).reset(bucket_id, actor, reason)
    }

    pub fn resolve_configuration(&self, bucket_id: &str, actor: &Actor) -> EngineResult<Bucket> {
        ApprovalWorkflow::new(&self.ctx).resolve_configuration(bucket_id, actor)
    }

    // ── Delivery ───────────────────────────────────────────────

    /// "Deliver now": one attempt through the regular gate.
    pub fn attempt_delivery(&self, file_id: &str) -> EngineResult<DeliveryOutcome> {
        DeliveryRetryCoordinator::new(&self.ctx).attempt_delivery(file_id)
    }

    pub fn mark_delivered(&self, file_id: &str, actor: &Actor) -> EngineResult<DeliveryOutcome> {
        DeliveryRetryCoordinator::new(&self.ctx).mark_delivered(file_id, actor)
    }

    pub fn retry_all_failed(&self) -> EngineResult<DeliverySweepReport> {
        DeliveryRetryCoordinator::new(&self.ctx).retry_all_failed()
    }

    pub fn run_delivery_sweep(&self) -> EngineResult<DeliverySweepReport> {
        DeliveryRetryCoordinator::new(&self.ctx).sweep(self.ctx.now())
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn bucket(&self, bucket_id: &str) -> EngineResult<Bucket> {
        self.ctx.store.require_bucket(bucket_id)
    }

    pub fn buckets_with_status(&self, status: BucketStatus) -> EngineResult<Vec<Bucket>> {
        self.ctx.store.buckets_with_status(status)
    }

    pub fn accumulating_bucket(&self, rule_id: &str, grouping_key: &str) -> EngineResult<Option<Bucket>> {
        self.ctx.store.find_accumulating_bucket(rule_id, grouping_key)
    }

    pub fn claims_in_bucket(&self, bucket_id: &str) -> EngineResult<Vec<ClaimLogEntry>> {
        self.ctx.store.claims_for_bucket(bucket_id)
    }

    pub fn claim_history(&self, claim_id: &str) -> EngineResult<Vec<ClaimLogEntry>> {
        self.ctx.store.claim_log_for_claim(claim_id)
    }

    pub fn approval_history(&self, bucket_id: &str) -> EngineResult<Vec<ApprovalLogEntry>> {
        self.ctx.store.approval_log_for_bucket(bucket_id)
    }

    pub fn file(&self, file_id: &str) -> EngineResult<FileGenerationRecord> {
        self.ctx.store.require_file_record(file_id)
    }

    pub fn file_for_bucket(&self, bucket_id: &str) -> EngineResult<Option<FileGenerationRecord>> {
        self.ctx.store.file_record_for_bucket(bucket_id)
    }

    pub fn events(&self, subject: &str) -> EngineResult<Vec<LifecycleEvent>> {
        self.ctx.store.lifecycle_events(subject)
    }
}
