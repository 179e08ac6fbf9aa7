//! Scheduled monitor: the periodic sweep that does not wait for claims.
//!
//! Each pass:
//!   1. re-evaluates every ACCUMULATING bucket (TIME conditions fire here),
//!   2. releases approved buckets whose scheduled generation time has come,
//!   3. returns MISSING_CONFIGURATION buckets to PENDING_APPROVAL once their
//!      payer and payee are configured,
//!   4. runs generation again for GENERATING buckets that have had no file
//!      record for longer than the grace period.
//!
//! Every bucket gets its own unit of work. A bucket that errors is logged
//! and skipped; the pass carries on. Running a pass twice is harmless:
//! each step re-checks the bucket's status inside its unit of work.

use crate::{
    approval_workflow::recover_configuration,
    config::EngineConfig,
    engine::{BucketEngine, EngineContext},
    error::{EngineError, EngineResult},
    lifecycle_controller::{Advance, GenerationOutcome, LifecycleController},
    model::BucketStatus,
    types::BucketId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub triggered: usize,
    pub awaiting_approval: usize,
    pub generated: usize,
    pub generation_failed: usize,
    pub missing_configuration: usize,
    pub scheduled_released: usize,
    pub configuration_recovered: usize,
    pub generation_stalled: usize,
    pub stalled_recovered: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record_advance(&mut self, advance: Advance) {
        match advance {
            Advance::Stay => {}
            Advance::AwaitApproval => {
                self.triggered += 1;
                self.awaiting_approval += 1;
            }
            Advance::MissingConfiguration => {
                self.triggered += 1;
                self.missing_configuration += 1;
            }
            Advance::Generate => self.triggered += 1,
        }
    }

    fn record_generation(&mut self, outcome: &GenerationOutcome) {
        match outcome {
            GenerationOutcome::Completed { .. } => self.generated += 1,
            GenerationOutcome::Failed { .. } => self.generation_failed += 1,
            GenerationOutcome::Stalled { .. } => self.generation_stalled += 1,
        }
    }

    pub fn transitions(&self) -> usize {
        self.triggered + self.scheduled_released + self.configuration_recovered + self.stalled_recovered
    }
}

pub struct ScheduledMonitor<'a> {
    ctx: &'a EngineContext,
    lifecycle: LifecycleController<'a>,
}

impl<'a> ScheduledMonitor<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self {
            ctx,
            lifecycle: LifecycleController::new(ctx),
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let mut report = self.evaluate_accumulating(now)?;
        self.release_scheduled(now, &mut report)?;
        self.recover_configured(now, &mut report)?;
        self.recover_stalled(now, &mut report)?;
        log::info!(
            "monitor: sweep evaluated={} triggered={} generated={} released={} recovered={} restarted={} errors={}",
            report.evaluated,
            report.triggered,
            report.generated,
            report.scheduled_released,
            report.configuration_recovered,
            report.stalled_recovered,
            report.errors
        );
        Ok(report)
    }

    /// Step 1 on its own; also the manual "evaluate all" operation.
    pub fn evaluate_accumulating(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();
        for bucket_id in self.ctx.store.bucket_ids_with_status(BucketStatus::Accumulating)? {
            report.evaluated += 1;
            match self.evaluate_bucket(&bucket_id, now) {
                Ok((advance, generation)) => {
                    report.record_advance(advance);
                    if let Some(outcome) = &generation {
                        report.record_generation(outcome);
                    }
                }
                Err(e) => self.skip(&bucket_id, "evaluate", &e, &mut report),
            }
        }
        Ok(report)
    }

    /// Re-evaluate one bucket in its own unit of work. A bucket that is no
    /// longer accumulating is left alone.
    pub fn evaluate_bucket(
        &self,
        bucket_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<(Advance, Option<GenerationOutcome>)> {
        let policy = self.ctx.policy.current();
        let tx = self.ctx.store.unit_of_work()?;
        let mut bucket = self.ctx.store.require_bucket(bucket_id)?;
        let advance = self.lifecycle.evaluate_and_advance(&mut bucket, &policy, now)?;
        tx.commit()?;
        let generation = match advance {
            Advance::Generate => Some(self.lifecycle.generate_after_commit(bucket_id)),
            _ => None,
        };
        Ok((advance, generation))
    }

    fn release_scheduled(&self, now: DateTime<Utc>, report: &mut SweepReport) -> EngineResult<()> {
        for bucket_id in self.ctx.store.due_scheduled_generations(now)? {
            match self.release_one(&bucket_id, now) {
                Ok(Some(advance)) => {
                    report.scheduled_released += 1;
                    if advance == Advance::MissingConfiguration {
                        report.missing_configuration += 1;
                    } else {
                        let outcome = self.lifecycle.generate_after_commit(&bucket_id);
                        report.record_generation(&outcome);
                    }
                }
                Ok(None) => {}
                Err(e) => self.skip(&bucket_id, "release", &e, report),
            }
        }
        Ok(())
    }

    fn release_one(&self, bucket_id: &str, now: DateTime<Utc>) -> EngineResult<Option<Advance>> {
        let tx = self.ctx.store.unit_of_work()?;
        let mut bucket = self.ctx.store.require_bucket(bucket_id)?;
        let due = bucket.status == BucketStatus::PendingApproval
            && bucket.approved_at.is_some()
            && bucket.scheduled_generation_at.is_some_and(|at| at <= now);
        if !due {
            return Ok(None);
        }
        log::info!("bucket={bucket_id} monitor: scheduled generation is due");
        let advance = self.lifecycle.release_for_generation(&mut bucket, now)?;
        tx.commit()?;
        Ok(Some(advance))
    }

    fn recover_configured(&self, now: DateTime<Utc>, report: &mut SweepReport) -> EngineResult<()> {
        for bucket_id in self.ctx.store.bucket_ids_with_status(BucketStatus::MissingConfiguration)? {
            match self.recover_one(&bucket_id, now) {
                Ok(true) => report.configuration_recovered += 1,
                Ok(false) => {}
                Err(e) => self.skip(&bucket_id, "recover", &e, report),
            }
        }
        Ok(())
    }

    fn recover_one(&self, bucket_id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        let tx = self.ctx.store.unit_of_work()?;
        let mut bucket = self.ctx.store.require_bucket(bucket_id)?;
        if bucket.status != BucketStatus::MissingConfiguration
            || !self.ctx.directory.is_configured(&bucket.payer_id, &bucket.payee_id)
        {
            return Ok(false);
        }
        recover_configuration(&self.lifecycle, &mut bucket, now)?;
        tx.commit()?;
        Ok(true)
    }

    fn recover_stalled(&self, now: DateTime<Utc>, report: &mut SweepReport) -> EngineResult<()> {
        let grace_secs = i64::try_from(self.ctx.config.monitor.generation_grace_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1_000);
        let grace = chrono::Duration::seconds(grace_secs);
        let started_before = now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC);
        for bucket_id in self.ctx.store.stalled_generations(started_before)? {
            log::warn!("bucket={bucket_id} monitor: generation never recorded, running it again");
            match self.lifecycle.generate(&bucket_id) {
                Ok(outcome) => {
                    report.stalled_recovered += 1;
                    report.record_generation(&outcome);
                }
                Err(e) => self.skip(&bucket_id, "regenerate", &e, report),
            }
        }
        Ok(())
    }

    fn skip(&self, bucket_id: &BucketId, step: &str, error: &EngineError, report: &mut SweepReport) {
        log::warn!("bucket={bucket_id} monitor: {step} skipped: {error}");
        report.errors += 1;
    }
}

// ── Background loop ────────────────────────────────────────────────

/// How often the monitor thread runs each of its two sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSchedule {
    pub bucket_interval: Duration,
    pub delivery_interval: Duration,
}

impl MonitorSchedule {
    /// Both sweeps on the same interval.
    pub fn every(interval: Duration) -> Self {
        Self {
            bucket_interval: interval,
            delivery_interval: interval,
        }
    }

    /// `monitor.sweep_interval_secs` and `delivery.sweep_interval_secs`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            bucket_interval: Duration::from_secs(config.monitor.sweep_interval_secs.max(1)),
            delivery_interval: Duration::from_secs(config.delivery.sweep_interval_secs.max(1)),
        }
    }
}

/// The monitor thread. Runs the bucket sweep and the delivery sweep, each
/// on its own cadence, until `stop` is called.
pub struct MonitorHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    /// `engine` should be a `fork()` dedicated to the monitor. Both sweeps
    /// run once straight away.
    pub fn spawn(engine: BucketEngine, schedule: MonitorSchedule) -> EngineResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("scheduled-monitor".into())
            .spawn(move || {
                log::info!(
                    "monitor: started, buckets every {}ms, deliveries every {}ms",
                    schedule.bucket_interval.as_millis(),
                    schedule.delivery_interval.as_millis()
                );
                let mut next_buckets = Instant::now();
                let mut next_deliveries = Instant::now();
                loop {
                    if Instant::now() >= next_buckets {
                        if let Err(e) = engine.run_monitor_sweep() {
                            log::warn!("monitor: bucket sweep failed: {e}");
                        }
                        next_buckets = Instant::now() + schedule.bucket_interval;
                    }
                    if Instant::now() >= next_deliveries {
                        if let Err(e) = engine.run_delivery_sweep() {
                            log::warn!("monitor: delivery sweep failed: {e}");
                        }
                        next_deliveries = Instant::now() + schedule.delivery_interval;
                    }
                    let wait = next_buckets
                        .min(next_deliveries)
                        .saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::info!("monitor: stopped");
            })
            .map_err(|e| EngineError::Other(anyhow::anyhow!("cannot spawn monitor thread: {e}")))?;
        Ok(Self { stop_tx, thread })
    }

    /// Signal the loop and wait for the in-flight pass to finish.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            log::warn!("monitor: thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_reads_both_cadences_from_config() {
        let mut config = EngineConfig::default();
        config.monitor.sweep_interval_secs = 60;
        config.delivery.sweep_interval_secs = 0;

        let schedule = MonitorSchedule::from_config(&config);
        assert_eq!(schedule.bucket_interval, Duration::from_secs(60));
        assert_eq!(schedule.delivery_interval, Duration::from_secs(1));
    }
}
