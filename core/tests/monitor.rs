//! Scheduled monitor tests: sweep idempotence, mixed outcomes in one pass,
//! configuration recovery, and the background thread.

mod common;

use chrono::Duration;
use common::*;
use remit_core::{
    claim::ClaimEvent,
    config::{CommitCriteria, CommitMode, GenerationThreshold, PolicySet, TimeDuration},
    model::{BucketStatus, DeliveryStatus},
    scheduled_monitor::{MonitorHandle, MonitorSchedule},
};
use std::thread;

fn weekly_auto() -> PolicySet {
    policy(
        GenerationThreshold::time("weekly", TimeDuration::Weekly),
        CommitCriteria::new("auto", CommitMode::Auto),
    )
}

// ─── Test 1: a second sweep changes nothing ───────────────────────────────

#[test]
fn repeated_sweeps_are_idempotent() {
    let h = Harness::new(weekly_auto());
    h.apply_n("C", 2, "15.00");
    h.clock.advance(Duration::days(7));

    let first = h.engine.run_monitor_sweep().unwrap();
    assert_eq!(first.triggered, 1);
    assert_eq!(first.generated, 1);
    assert_eq!(h.only_bucket().status, BucketStatus::Completed);

    let transitions = h.engine.store().event_count("bucket_transitioned").unwrap();
    let second = h.engine.run_monitor_sweep().unwrap();
    assert_eq!(second.transitions(), 0);
    assert_eq!(second.evaluated, 0);
    assert_eq!(second.generated, 0);
    assert_eq!(h.engine.store().event_count("bucket_transitioned").unwrap(), transitions);
    assert_eq!(h.composer.calls().len(), 1);
    assert_eq!(h.engine.store().file_count(None).unwrap(), 1);
}

// ─── Test 2: one pass, several buckets, several outcomes ─────────────────

#[test]
fn sweep_handles_each_bucket_on_its_own() {
    let h = Harness::new(weekly_auto());
    h.apply_n("C", 2, "15.00");
    h.engine
        .apply_claim(&ClaimEvent::new("P2-1", "PAYER-2", PAYEE, "15.00"))
        .unwrap();
    let unconfigured = h
        .engine
        .apply_claim(&ClaimEvent::new("U-1", PAYER, "PAYEE-9", "15.00"))
        .unwrap()
        .bucket
        .unwrap()
        .bucket_id;

    h.clock.advance(Duration::days(3));
    assert_eq!(h.engine.run_monitor_sweep().unwrap().triggered, 0);

    h.clock.advance(Duration::days(4));
    let report = h.engine.run_monitor_sweep().unwrap();
    assert_eq!(report.evaluated, 3);
    assert_eq!(report.triggered, 3);
    assert_eq!(report.generated, 2);
    assert_eq!(report.missing_configuration, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(
        h.engine.bucket(&unconfigured).unwrap().status,
        BucketStatus::MissingConfiguration
    );
}

#[test]
fn composition_failure_is_counted_and_the_sweep_carries_on() {
    let h = Harness::new(weekly_auto());
    h.apply_n("C", 1, "15.00");
    h.engine
        .apply_claim(&ClaimEvent::new("P2-1", "PAYER-2", PAYEE, "15.00"))
        .unwrap();
    h.composer.fail_from_now_on();

    h.clock.advance(Duration::days(7));
    let report = h.engine.run_monitor_sweep().unwrap();
    assert_eq!(report.triggered, 2);
    assert_eq!(report.generation_failed, 2);
    assert_eq!(h.engine.buckets_with_status(BucketStatus::Failed).unwrap().len(), 2);
    assert_eq!(h.engine.store().file_count(None).unwrap(), 0);
}

// ─── Test 3: configuration recovery ───────────────────────────────────────

#[test]
fn sweep_recovers_buckets_once_configuration_appears() {
    let h = Harness::with(
        weekly_auto(),
        HarnessOptions {
            configured_parties: false,
            ..HarnessOptions::default()
        },
    );
    h.apply_n("C", 1, "15.00");
    h.clock.advance(Duration::days(7));
    h.engine.run_monitor_sweep().unwrap();
    let bucket_id = h.only_bucket().bucket_id;
    assert_eq!(h.only_bucket().status, BucketStatus::MissingConfiguration);

    // Nothing changes while the parties are still unknown.
    assert_eq!(h.engine.run_monitor_sweep().unwrap().configuration_recovered, 0);

    h.directory.configure_payer(PAYER);
    h.directory.configure_payee(PAYEE);
    let report = h.engine.run_monitor_sweep().unwrap();
    assert_eq!(report.configuration_recovered, 1);

    let bucket = h.engine.bucket(&bucket_id).unwrap();
    assert_eq!(bucket.status, BucketStatus::PendingApproval);
    assert!(h.engine.approval_history(&bucket_id).unwrap().is_empty());
}

// ─── Test 4: manual evaluate-all ──────────────────────────────────────────

#[test]
fn evaluate_all_only_touches_accumulating_buckets() {
    let h = Harness::new(policy(
        GenerationThreshold::claim_count("two", 2),
        CommitCriteria::new("manual", CommitMode::Manual),
    ));
    h.apply_n("C", 2, "1.00");
    h.engine
        .apply_claim(&ClaimEvent::new("P2-1", "PAYER-2", PAYEE, "1.00"))
        .unwrap();

    let report = h.engine.evaluate_all().unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.triggered, 0);
}

// ─── Test 5: background thread ────────────────────────────────────────────

#[test]
fn monitor_thread_generates_and_delivers_until_stopped() {
    let path = temp_db_path("monitor");
    let h = Harness::with(
        policy(
            GenerationThreshold::time("daily", TimeDuration::Daily),
            CommitCriteria::new("auto", CommitMode::Auto),
        ),
        HarnessOptions {
            db_path: Some(path.clone()),
            ..HarnessOptions::default()
        },
    );
    h.apply_n("C", 3, "20.00");
    h.clock.advance(Duration::days(1));

    let monitor = MonitorHandle::spawn(
        h.engine.fork().expect("fork"),
        MonitorSchedule::every(std::time::Duration::from_millis(20)),
    )
    .expect("monitor starts");

    let mut delivered = false;
    for _ in 0..250 {
        if h.engine.store().file_count(Some(DeliveryStatus::Delivered)).unwrap() == 1 {
            delivered = true;
            break;
        }
        thread::sleep(std::time::Duration::from_millis(20));
    }
    monitor.stop();

    assert!(delivered, "monitor never delivered the file");
    assert_eq!(h.only_bucket().status, BucketStatus::Completed);
    assert_eq!(h.composer.calls().len(), 1);
    assert_eq!(h.transport.uploads().len(), 1);

    drop(h);
    let _ = std::fs::remove_file(&path);
}

// ─── Test 6: deliveries follow their own cadence ──────────────────────────

#[test]
fn delivery_sweep_keeps_its_own_cadence() {
    let path = temp_db_path("cadence");
    let h = Harness::with(
        policy(
            GenerationThreshold::time("daily", TimeDuration::Daily),
            CommitCriteria::new("auto", CommitMode::Auto),
        ),
        HarnessOptions {
            db_path: Some(path.clone()),
            ..HarnessOptions::default()
        },
    );
    h.apply_n("C", 2, "15.00");

    // Both sweeps run once at start-up; nothing is due yet.
    let monitor = MonitorHandle::spawn(
        h.engine.fork().expect("fork"),
        MonitorSchedule {
            bucket_interval: std::time::Duration::from_millis(20),
            delivery_interval: std::time::Duration::from_secs(3_600),
        },
    )
    .expect("monitor starts");
    thread::sleep(std::time::Duration::from_millis(60));
    h.clock.advance(Duration::days(1));

    let mut generated = false;
    for _ in 0..250 {
        if h.engine.store().file_count(None).unwrap() == 1 {
            generated = true;
            break;
        }
        thread::sleep(std::time::Duration::from_millis(20));
    }
    thread::sleep(std::time::Duration::from_millis(100));
    let pending = h.engine.store().file_count(Some(DeliveryStatus::Pending)).unwrap();
    monitor.stop();

    assert!(generated, "bucket sweep never generated the file");
    assert_eq!(pending, 1, "delivery ran on the bucket cadence");
    assert!(h.transport.uploads().is_empty());

    drop(h);
    let _ = std::fs::remove_file(&path);
}
