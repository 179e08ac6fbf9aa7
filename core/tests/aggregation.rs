//! Claim aggregation tests: bucketing, rejection, duplicates, and the
//! one-accumulating-bucket-per-key guarantee under concurrent workers.

mod common;

use common::*;
use remit_core::{
    claim::ClaimEvent,
    claim_aggregator::ClaimOutcome,
    config::{BucketingRule, CommitCriteria, CommitMode, GenerationThreshold, PolicySet, RuleType},
    model::{BucketStatus, ClaimLogOutcome},
    types::Money,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn quiet_policy() -> PolicySet {
    // Threshold far out of reach: buckets only accumulate.
    policy(
        GenerationThreshold::claim_count("never", 1_000_000),
        CommitCriteria::new("auto", CommitMode::Auto),
    )
}

// ─── Test 1: first claim opens a bucket, later ones add to it ─────────────

#[test]
fn claims_for_one_key_accumulate_in_one_bucket() {
    let h = Harness::new(quiet_policy());
    h.apply_n("C", 3, "125.50");

    let bucket = h.only_bucket();
    assert_eq!(bucket.status, BucketStatus::Accumulating);
    assert_eq!(bucket.claim_count, 3);
    assert_eq!(bucket.total_amount, Money::from_cents(37_650));
    assert_eq!(bucket.grouping_key, format!("{PAYER}|{PAYEE}"));

    let claims = h.engine.claims_in_bucket(&bucket.bucket_id).unwrap();
    assert_eq!(claims.len(), 3);
    assert!(claims.iter().all(|c| c.outcome == ClaimLogOutcome::Processed));
}

// ─── Test 2: different keys get different buckets ─────────────────────────

#[test]
fn different_parties_get_separate_buckets() {
    let h = Harness::new(quiet_policy());
    h.engine.apply_claim(&claim("A-1", "10")).unwrap();
    h.engine
        .apply_claim(&ClaimEvent::new("B-1", "PAYER-2", PAYEE, "10"))
        .unwrap();
    h.engine
        .apply_claim(&ClaimEvent::new("B-2", "PAYER-2", PAYEE, "10"))
        .unwrap();

    assert_eq!(h.engine.store().bucket_count(None).unwrap(), 2);
    let other = h
        .engine
        .accumulating_bucket(RULE, &format!("PAYER-2|{PAYEE}"))
        .unwrap()
        .expect("bucket for PAYER-2");
    assert_eq!(other.claim_count, 2);
}

// ─── Test 3: structurally invalid claims never touch a bucket ─────────────

#[test]
fn invalid_claims_are_logged_rejected_without_a_bucket() {
    let h = Harness::new(quiet_policy());

    let mut no_payee = claim("BAD-1", "10.00");
    no_payee.payee_id = None;
    let negative = claim("BAD-2", "-5.00");
    let garbage = claim("BAD-3", "twelve");

    for event in [&no_payee, &negative, &garbage] {
        let receipt = h.engine.apply_claim(event).unwrap();
        assert!(matches!(receipt.outcome, ClaimOutcome::Rejected { .. }));
        assert!(receipt.bucket.is_none());
    }

    assert_eq!(h.engine.store().bucket_count(None).unwrap(), 0);
    assert_eq!(h.engine.store().claim_log_count(ClaimLogOutcome::Rejected).unwrap(), 3);
    let history = h.engine.claim_history("BAD-1").unwrap();
    assert_eq!(history[0].reason.as_deref(), Some("missing payee id"));
    assert_eq!(history[0].bucket_id, None);
}

// ─── Test 4: no rule, no bucket ───────────────────────────────────────────

#[test]
fn claim_without_a_matching_rule_is_rejected() {
    let policy = PolicySet::default()
        .with_rule(BucketingRule::new("bin-pcn", RuleType::BinPcn, 10))
        .with_criteria(CommitCriteria::new("auto", CommitMode::Auto));
    let h = Harness::new(policy);

    // No BIN/PCN on the claim, so the only rule cannot key it.
    let receipt = h.engine.apply_claim(&claim("C-1", "10")).unwrap();
    assert_eq!(
        receipt.outcome,
        ClaimOutcome::Rejected {
            reason: "no matching rule".into()
        }
    );
    assert_eq!(h.engine.store().bucket_count(None).unwrap(), 0);

    let keyed = claim("C-2", "10").with_bin_pcn("004336", "ADV");
    let receipt = h.engine.apply_claim(&keyed).unwrap();
    assert_eq!(receipt.bucket.unwrap().grouping_key, "004336|ADV");
}

// ─── Test 5: re-delivered events are applied once ─────────────────────────

#[test]
fn duplicate_claim_event_does_not_count_twice() {
    let h = Harness::new(quiet_policy());
    h.engine.apply_claim(&claim("C-1", "40.00")).unwrap();
    let again = h.engine.apply_claim(&claim("C-1", "40.00")).unwrap();

    assert_eq!(again.outcome, ClaimOutcome::Duplicate);
    let bucket = h.only_bucket();
    assert_eq!(bucket.claim_count, 1);
    assert_eq!(bucket.total_amount, Money::from_dollars(40));
    assert_eq!(h.engine.claim_history("C-1").unwrap().len(), 1);
}

// ─── Test 6: bucket opened event is recorded ──────────────────────────────

#[test]
fn opening_a_bucket_is_recorded_in_the_event_log() {
    let h = Harness::new(quiet_policy());
    let receipt = h.engine.apply_claim(&claim("C-1", "1")).unwrap();
    let bucket_id = receipt.bucket.unwrap().bucket_id;

    assert_eq!(h.engine.store().event_count("bucket_opened").unwrap(), 1);
    let events = h.engine.events(&bucket_id).unwrap();
    assert_eq!(events.len(), 1);
}

// ─── Test 7: mutual exclusion under concurrent workers ────────────────────

/// N workers, each with its own connection, all submit a claim for the same
/// key at the same moment. Exactly one bucket may come out of it, holding
/// all N claims.
#[test]
fn concurrent_claims_for_one_key_create_exactly_one_bucket() {
    const WORKERS: usize = 8;
    const CLAIMS_PER_WORKER: usize = 5;

    let path = temp_db_path("mutex");
    let h = Harness::with(
        quiet_policy(),
        HarnessOptions {
            db_path: Some(path.clone()),
            ..HarnessOptions::default()
        },
    );

    let barrier = Arc::new(Barrier::new(WORKERS));
    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let engine = h.engine.fork().expect("fork");
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..CLAIMS_PER_WORKER {
                    engine
                        .apply_claim(&claim(&format!("W{w}-{i}"), "10.00"))
                        .expect("claim applies");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    let bucket = h.only_bucket();
    assert_eq!(bucket.claim_count, (WORKERS * CLAIMS_PER_WORKER) as u64);
    assert_eq!(
        bucket.total_amount,
        Money::from_dollars(10 * (WORKERS * CLAIMS_PER_WORKER) as i64)
    );
    assert_eq!(
        h.engine.store().claim_log_count(ClaimLogOutcome::Processed).unwrap(),
        (WORKERS * CLAIMS_PER_WORKER) as i64
    );

    drop(h);
    let _ = std::fs::remove_file(&path);
}

/// Same race with a threshold in play: every bucket that leaves
/// ACCUMULATING does so exactly once, and claims are never lost.
#[test]
fn concurrent_claims_never_double_trigger() {
    const WORKERS: usize = 6;
    const CLAIMS_PER_WORKER: usize = 10;

    let path = temp_db_path("trigger");
    let h = Harness::with(
        policy(
            GenerationThreshold::claim_count("ten", 10),
            CommitCriteria::new("manual", CommitMode::Manual),
        ),
        HarnessOptions {
            db_path: Some(path.clone()),
            ..HarnessOptions::default()
        },
    );

    let barrier = Arc::new(Barrier::new(WORKERS));
    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let engine = h.engine.fork().expect("fork");
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..CLAIMS_PER_WORKER {
                    engine
                        .apply_claim(&claim(&format!("W{w}-{i}"), "1.00"))
                        .expect("claim applies");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    let pending = h.engine.buckets_with_status(BucketStatus::PendingApproval).unwrap();
    assert_eq!(pending.len(), WORKERS * CLAIMS_PER_WORKER / 10);
    assert!(pending.iter().all(|b| b.claim_count == 10));
    assert_eq!(
        h.engine.store().event_count("threshold_triggered").unwrap(),
        pending.len() as i64
    );
    assert!(h.engine.buckets_with_status(BucketStatus::Accumulating).unwrap().is_empty());

    drop(h);
    let _ = std::fs::remove_file(&path);
}
