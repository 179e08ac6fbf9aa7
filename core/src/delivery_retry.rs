//! Delivery retry coordinator: the state machine on a generated file's
//! delivery status.
//!
//!   pending -> delivered
//!   pending -> retry -> ... -> retry -> failed
//!
//! After the n-th failed attempt the next one becomes due
//! `base_delay * 2^(n-1)` later. Once the failures exceed `max_retries`
//! the file is FAILED and only an operator override moves it again.
//!
//! The upload runs with no unit of work open. The outcome is then written
//! as a compare-and-swap on the file record, so two workers racing on the
//! same file cannot both record an attempt.

use crate::{
    approval_workflow::Actor,
    collaborators::{DeliveryRequest, TransportError},
    engine::EngineContext,
    error::{EngineError, EngineResult},
    event::LifecycleEvent,
    model::{DeliveryStatus, FileGenerationRecord},
    types::FileId,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Delay before the attempt that follows the `failures`-th failure.
pub fn retry_delay(base_delay_ms: u64, failures: u32) -> Duration {
    let factor = 1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX);
    let ms = base_delay_ms.saturating_mul(factor).min(i64::MAX as u64);
    Duration::milliseconds(ms as i64)
}

/// What one delivery attempt (or override) left the file in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub file_id: FileId,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl DeliveryOutcome {
    fn of(record: &FileGenerationRecord) -> Self {
        Self {
            file_id: record.file_id.clone(),
            status: record.delivery_status,
            attempts: record.delivery_attempt_count,
            last_error: record.last_error.clone(),
            next_attempt_at: record.next_attempt_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySweepReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub errors: usize,
}

impl DeliverySweepReport {
    fn record(&mut self, result: &EngineResult<DeliveryOutcome>) {
        match result {
            Ok(outcome) => {
                self.attempted += 1;
                match outcome.status {
                    DeliveryStatus::Delivered => self.delivered += 1,
                    DeliveryStatus::Retry | DeliveryStatus::Pending => self.retrying += 1,
                    DeliveryStatus::Failed => self.failed += 1,
                }
            }
            Err(_) => self.errors += 1,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// PENDING or RETRY with attempts left.
    Regular,
    /// Anything not yet delivered; operator recovery.
    Override,
}

pub struct DeliveryRetryCoordinator<'a> {
    ctx: &'a EngineContext,
}

impl<'a> DeliveryRetryCoordinator<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// The single entry point for "deliver now" and the sweep.
    pub fn attempt_delivery(&self, file_id: &str) -> EngineResult<DeliveryOutcome> {
        self.attempt(file_id, Gate::Regular)
    }

    fn attempt(&self, file_id: &str, gate: Gate) -> EngineResult<DeliveryOutcome> {
        let settings = &self.ctx.config.delivery;
        let record = self.ctx.store.require_file_record(file_id)?;
        let eligible = match gate {
            Gate::Regular => {
                matches!(record.delivery_status, DeliveryStatus::Pending | DeliveryStatus::Retry)
                    && record.delivery_attempt_count <= settings.max_retries
            }
            Gate::Override => record.delivery_status != DeliveryStatus::Delivered,
        };
        if !eligible {
            return Err(EngineError::DeliveryNotEligible {
                file_id: record.file_id,
                status: record.delivery_status,
                attempts: record.delivery_attempt_count,
            });
        }

        let result = self.ctx.transport.upload(&DeliveryRequest {
            file_name: &record.file_name,
            destination: &record.destination,
            content: &record.content,
        });
        self.record_attempt(record, result)
    }

    fn record_attempt(
        &self,
        mut record: FileGenerationRecord,
        result: Result<(), TransportError>,
    ) -> EngineResult<DeliveryOutcome> {
        let settings = &self.ctx.config.delivery;
        let now = self.ctx.now();
        let attempt = record.delivery_attempt_count + 1;
        record.delivery_attempt_count = attempt;
        record.last_attempt_at = Some(now);

        let error = match result {
            Ok(()) => {
                record.delivery_status = DeliveryStatus::Delivered;
                record.delivered_at = Some(now);
                record.next_attempt_at = None;
                None
            }
            Err(e) => {
                let message = e.to_string();
                record.last_error = Some(message.clone());
                if attempt > settings.max_retries {
                    record.delivery_status = DeliveryStatus::Failed;
                    record.next_attempt_at = None;
                } else {
                    record.delivery_status = DeliveryStatus::Retry;
                    let delay = retry_delay(settings.base_delay_ms, attempt);
                    record.next_attempt_at =
                        Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
                }
                Some(message)
            }
        };

        let tx = self.ctx.store.unit_of_work()?;
        self.ctx.store.save_file_record(&mut record)?;
        self.ctx.store.append_event(
            &LifecycleEvent::DeliveryAttempted {
                file_id: record.file_id.clone(),
                attempt,
                succeeded: error.is_none(),
                status: record.delivery_status,
                error: error.clone(),
            },
            now,
        )?;
        tx.commit()?;

        match &error {
            None => log::info!("file={} delivery: delivered on attempt {attempt}", record.file_id),
            Some(e) => log::warn!(
                "file={} delivery: attempt {attempt} failed, now {}: {e}",
                record.file_id,
                record.delivery_status
            ),
        }
        Ok(DeliveryOutcome::of(&record))
    }

    /// Operator override: record the file as delivered without uploading.
    pub fn mark_delivered(&self, file_id: &str, actor: &Actor) -> EngineResult<DeliveryOutcome> {
        let now = self.ctx.now();
        let tx = self.ctx.store.unit_of_work()?;
        let mut record = self.ctx.store.require_file_record(file_id)?;
        if record.delivery_status == DeliveryStatus::Delivered {
            return Err(EngineError::DeliveryNotEligible {
                file_id: record.file_id,
                status: record.delivery_status,
                attempts: record.delivery_attempt_count,
            });
        }
        record.delivery_status = DeliveryStatus::Delivered;
        record.delivered_at = Some(now);
        record.next_attempt_at = None;
        self.ctx.store.save_file_record(&mut record)?;
        self.ctx.store.append_event(
            &LifecycleEvent::DeliveryOverridden {
                file_id: record.file_id.clone(),
                actor: actor.name.clone(),
                status: record.delivery_status,
            },
            now,
        )?;
        tx.commit()?;
        log::info!("file={} delivery: marked delivered by {}", record.file_id, actor.name);
        Ok(DeliveryOutcome::of(&record))
    }

    /// Operator override: one more attempt for every FAILED file, past the
    /// retry ceiling. A file that fails again stays FAILED.
    pub fn retry_all_failed(&self) -> EngineResult<DeliverySweepReport> {
        let ids = self.ctx.store.file_ids_with_status(DeliveryStatus::Failed)?;
        let mut report = DeliverySweepReport::default();
        for file_id in ids {
            let result = self.attempt(&file_id, Gate::Override);
            if let Err(e) = &result {
                log::warn!("file={file_id} delivery: retry skipped: {e}");
            }
            report.record(&result);
        }
        log::info!(
            "delivery: retried {} failed file(s), {} delivered",
            report.attempted,
            report.delivered
        );
        Ok(report)
    }

    /// Attempt every PENDING or RETRY file whose next attempt is due.
    /// One file's error never stops the sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> EngineResult<DeliverySweepReport> {
        let ids = self.ctx.store.due_file_ids(now)?;
        let mut report = DeliverySweepReport::default();
        for file_id in ids {
            let result = self.attempt_delivery(&file_id);
            if let Err(e) = &result {
                log::warn!("file={file_id} delivery: skipped in sweep: {e}");
            }
            report.record(&result);
        }
        if report.attempted + report.errors > 0 {
            log::info!(
                "delivery: sweep attempted={} delivered={} retrying={} failed={} errors={}",
                report.attempted,
                report.delivered,
                report.retrying,
                report.failed,
                report.errors
            );
        }
        Ok(report)
    }
}
