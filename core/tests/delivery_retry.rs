//! Delivery retry tests: exponential backoff, the retry ceiling, the due
//! filter used by the sweep, and the two operator overrides.

mod common;

use chrono::Duration;
use common::*;
use remit_core::{
    approval_workflow::Actor,
    claim::ClaimEvent,
    config::{CommitCriteria, CommitMode, EngineConfig, GenerationThreshold},
    lifecycle_controller::GenerationOutcome,
    model::{BucketStatus, DeliveryStatus, FileGenerationRecord},
};

/// Every claim generates a file on its own.
fn harness(config: EngineConfig) -> Harness {
    Harness::with(
        policy(
            GenerationThreshold::claim_count("single", 1),
            CommitCriteria::new("auto", CommitMode::Auto),
        ),
        HarnessOptions {
            config,
            ..HarnessOptions::default()
        },
    )
}

fn generate_one(h: &Harness, claim_event: &ClaimEvent) -> FileGenerationRecord {
    let receipt = h.engine.apply_claim(claim_event).unwrap();
    let bucket_id = receipt.bucket.unwrap().bucket_id;
    h.engine.file_for_bucket(&bucket_id).unwrap().expect("file generated")
}

fn backoff_ms(record: &FileGenerationRecord) -> i64 {
    (record.next_attempt_at.unwrap() - record.last_attempt_at.unwrap()).num_milliseconds()
}

// ─── Test 1: generated file starts PENDING and due ────────────────────────

#[test]
fn generated_file_is_pending_and_due_immediately() {
    let h = harness(EngineConfig::default_test());
    let file = generate_one(&h, &claim("C-1", "88.00"));

    assert_eq!(file.delivery_status, DeliveryStatus::Pending);
    assert_eq!(file.delivery_attempt_count, 0);
    assert_eq!(file.next_attempt_at, Some(t0()));
    assert!(h.transport.uploads().is_empty());

    let report = h.engine.run_delivery_sweep().unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    let file = h.engine.file(&file.file_id).unwrap();
    assert_eq!(file.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(file.delivered_at, Some(t0()));
    assert_eq!(file.next_attempt_at, None);
}

// ─── Test 2: backoff doubles, then the file fails ─────────────────────────

#[test]
fn failures_back_off_exponentially_until_the_ceiling() {
    let h = harness(EngineConfig::default_test());
    let file_id = generate_one(&h, &claim("C-1", "10.00")).file_id;
    h.transport.fail_next(4);

    let outcome = h.engine.attempt_delivery(&file_id).unwrap();
    assert_eq!(outcome.status, DeliveryStatus::Retry);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(backoff_ms(&h.engine.file(&file_id).unwrap()), 5_000);

    // Not due yet: the sweep leaves it alone.
    assert_eq!(h.engine.run_delivery_sweep().unwrap().attempted, 0);

    h.clock.advance(Duration::milliseconds(5_000));
    assert_eq!(h.engine.run_delivery_sweep().unwrap().retrying, 1);
    assert_eq!(backoff_ms(&h.engine.file(&file_id).unwrap()), 10_000);

    h.clock.advance(Duration::milliseconds(10_000));
    assert_eq!(h.engine.run_delivery_sweep().unwrap().retrying, 1);
    assert_eq!(backoff_ms(&h.engine.file(&file_id).unwrap()), 20_000);

    h.clock.advance(Duration::milliseconds(20_000));
    let report = h.engine.run_delivery_sweep().unwrap();
    assert_eq!(report.failed, 1);

    let file = h.engine.file(&file_id).unwrap();
    assert_eq!(file.delivery_status, DeliveryStatus::Failed);
    assert_eq!(file.delivery_attempt_count, 4);
    assert_eq!(file.next_attempt_at, None);
    assert_eq!(file.last_error.as_deref(), Some("connection failed: connection reset by peer"));
    assert_eq!(h.transport.uploads().len(), 4);
    assert_eq!(h.engine.store().event_count("delivery_attempted").unwrap(), 4);
}

#[test]
fn failed_file_is_not_eligible_for_a_regular_attempt() {
    let mut config = EngineConfig::default_test();
    config.delivery.max_retries = 0;
    let h = harness(config);
    let file_id = generate_one(&h, &claim("C-1", "10.00")).file_id;
    h.transport.fail_next(1);

    let outcome = h.engine.attempt_delivery(&file_id).unwrap();
    assert_eq!(outcome.status, DeliveryStatus::Failed);

    let err = h.engine.attempt_delivery(&file_id).unwrap_err();
    assert_eq!(err.code(), "DELIVERY_NOT_ELIGIBLE");
    assert_eq!(h.transport.uploads().len(), 1);
    assert_eq!(h.engine.run_delivery_sweep().unwrap().attempted, 0);
}

// ─── Test 3: the sweep only picks due files ───────────────────────────────

#[test]
fn sweep_picks_only_files_whose_next_attempt_is_due() {
    let h = harness(EngineConfig::default_test());
    let waiting = generate_one(&h, &claim("C-1", "10.00")).file_id;
    h.transport.fail_next(1);
    h.engine.attempt_delivery(&waiting).unwrap();

    let fresh = generate_one(&h, &ClaimEvent::new("C-2", "PAYER-2", PAYEE, "10.00")).file_id;

    let report = h.engine.run_delivery_sweep().unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(h.engine.file(&fresh).unwrap().delivery_status, DeliveryStatus::Delivered);
    assert_eq!(h.engine.file(&waiting).unwrap().delivery_status, DeliveryStatus::Retry);

    h.clock.advance(Duration::seconds(5));
    let report = h.engine.run_delivery_sweep().unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(h.engine.file(&waiting).unwrap().delivery_status, DeliveryStatus::Delivered);
}

// ─── Test 4: operator overrides ───────────────────────────────────────────

#[test]
fn mark_delivered_records_an_override_without_uploading() {
    let h = harness(EngineConfig::default_test());
    let file_id = generate_one(&h, &claim("C-1", "10.00")).file_id;
    h.transport.fail_next(1);
    h.engine.attempt_delivery(&file_id).unwrap();

    let outcome = h.engine.mark_delivered(&file_id, &Actor::new("ops.lead")).unwrap();
    assert_eq!(outcome.status, DeliveryStatus::Delivered);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(h.transport.uploads().len(), 1);
    assert_eq!(h.engine.store().event_count("delivery_overridden").unwrap(), 1);

    let err = h.engine.mark_delivered(&file_id, &Actor::new("ops.lead")).unwrap_err();
    assert_eq!(err.code(), "DELIVERY_NOT_ELIGIBLE");
}

#[test]
fn retry_all_failed_goes_past_the_ceiling() {
    let mut config = EngineConfig::default_test();
    config.delivery.max_retries = 1;
    let h = harness(config);
    let first = generate_one(&h, &claim("C-1", "10.00")).file_id;
    let second = generate_one(&h, &ClaimEvent::new("C-2", "PAYER-2", PAYEE, "10.00")).file_id;

    h.transport.fail_next(4);
    for file_id in [&first, &second] {
        h.engine.attempt_delivery(file_id).unwrap();
    }
    h.clock.advance(Duration::seconds(5));
    let report = h.engine.run_delivery_sweep().unwrap();
    assert_eq!(report.failed, 2);

    // One more failure is scripted, so exactly one file recovers.
    h.transport.fail_next(1);
    let report = h.engine.retry_all_failed().unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);

    let statuses: Vec<_> = [&first, &second]
        .iter()
        .map(|id| h.engine.file(id).unwrap().delivery_status)
        .collect();
    assert!(statuses.contains(&DeliveryStatus::Delivered));
    assert!(statuses.contains(&DeliveryStatus::Failed));

    // Nothing failed is left once the second pass succeeds.
    let report = h.engine.retry_all_failed().unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(h.engine.store().file_count(Some(DeliveryStatus::Delivered)).unwrap(), 2);
}

// ─── Test 5: delivery straight after generation ───────────────────────────

#[test]
fn deliver_on_generation_attempts_once_and_leaves_the_bucket_completed() {
    let mut config = EngineConfig::default_test();
    config.delivery.deliver_on_generation = true;
    let h = harness(config);
    h.transport.fail_next(1);

    let receipt = h.engine.apply_claim(&claim("C-1", "42.00")).unwrap();
    let Some(GenerationOutcome::Completed { delivery: Some(delivery), .. }) = receipt.generation else {
        panic!("expected a completed generation with a delivery attempt");
    };
    assert_eq!(delivery.status, DeliveryStatus::Retry);
    assert_eq!(delivery.attempts, 1);
    assert!(delivery.last_error.is_some());
    assert_eq!(receipt.bucket.unwrap().status, BucketStatus::Completed);

    h.clock.advance(Duration::seconds(5));
    let report = h.engine.run_delivery_sweep().unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(h.transport.uploads().len(), 2);
}

// ─── Test 6: stale file writes are refused ────────────────────────────────

#[test]
fn stale_file_write_reports_the_file() {
    let h = harness(EngineConfig::default_test());
    let file = generate_one(&h, &claim("C-1", "12.00"));
    let mut first = h.engine.file(&file.file_id).unwrap();
    let mut stale = first.clone();

    first.delivery_attempt_count = 1;
    h.engine.store().save_file_record(&mut first).unwrap();

    stale.delivery_status = DeliveryStatus::Delivered;
    let err = h.engine.store().save_file_record(&mut stale).unwrap_err();
    assert_eq!(err.code(), "CONCURRENT_MODIFICATION");
    assert!(err.to_string().starts_with(&format!("File '{}'", file.file_id)));

    let stored = h.engine.file(&file.file_id).unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Pending);
    assert_eq!(stored.delivery_attempt_count, 1);
}
