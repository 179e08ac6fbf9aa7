//! Threshold evaluation: does any applicable threshold fire for a bucket?
//!
//! OR across thresholds, OR across the configured sub-conditions of a
//! HYBRID threshold. Thresholds are tried in declared order and within a
//! HYBRID the sub-conditions go count, amount, time. The first satisfied
//! one is reported as the trigger.
//!
//! Pure: no store access. Called after every aggregation and by the
//! scheduled sweep, which is what lets TIME conditions fire without a
//! claim arriving.

use crate::config::{GenerationThreshold, ThresholdType, TimeDuration};
use crate::model::{Bucket, TriggerCondition};
use crate::types::{Money, ThresholdId};
use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;

/// Which threshold fired and on which condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub threshold_id: ThresholdId,
    pub condition: TriggerCondition,
}

impl TimeDuration {
    /// End of the accumulation period that began at `start`. MONTHLY is a
    /// calendar month, clamped to the last day of shorter months.
    pub fn period_end(self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeDuration::Daily => start + Duration::days(1),
            TimeDuration::Weekly => start + Duration::weeks(1),
            TimeDuration::Biweekly => start + Duration::weeks(2),
            TimeDuration::Monthly => start
                .checked_add_months(Months::new(1))
                .unwrap_or(start + Duration::days(30)),
        }
    }
}

pub fn evaluate(
    bucket: &Bucket,
    thresholds: &[&GenerationThreshold],
    now: DateTime<Utc>,
) -> Option<Trigger> {
    thresholds
        .iter()
        .filter(|t| t.active)
        .find_map(|t| {
            satisfied_condition(bucket, t, now).map(|condition| Trigger {
                threshold_id: t.threshold_id.clone(),
                condition,
            })
        })
}

fn satisfied_condition(
    bucket: &Bucket,
    threshold: &GenerationThreshold,
    now: DateTime<Utc>,
) -> Option<TriggerCondition> {
    let count = || count_reached(bucket, threshold.max_claims);
    let amount = || amount_reached(bucket, threshold.max_amount);
    let time = || time_elapsed(bucket, threshold.time_duration, now);

    match threshold.threshold_type {
        ThresholdType::ClaimCount => count().then_some(TriggerCondition::ClaimCount),
        ThresholdType::Amount => amount().then_some(TriggerCondition::Amount),
        ThresholdType::Time => time().then_some(TriggerCondition::Elapsed),
        ThresholdType::Hybrid => {
            if count() {
                Some(TriggerCondition::ClaimCount)
            } else if amount() {
                Some(TriggerCondition::Amount)
            } else if time() {
                Some(TriggerCondition::Elapsed)
            } else {
                None
            }
        }
    }
}

fn count_reached(bucket: &Bucket, max_claims: Option<u64>) -> bool {
    matches!(max_claims, Some(max) if bucket.claim_count >= max)
}

fn amount_reached(bucket: &Bucket, max_amount: Option<Money>) -> bool {
    matches!(max_amount, Some(max) if bucket.total_amount >= max)
}

// An empty bucket never fires on time, however long it has been open.
fn time_elapsed(bucket: &Bucket, duration: Option<TimeDuration>, now: DateTime<Utc>) -> bool {
    match duration {
        Some(d) if bucket.claim_count > 0 => now >= d.period_end(bucket.created_at),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BucketStatus;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap()
    }

    fn bucket(claims: u64, dollars: i64) -> Bucket {
        Bucket {
            bucket_id: "b-1".into(),
            rule_id: "pp".into(),
            grouping_key: "P|E".into(),
            payer_id: "P".into(),
            payee_id: "E".into(),
            bin_number: None,
            pcn_number: None,
            status: BucketStatus::Accumulating,
            claim_count: claims,
            total_amount: Money::from_dollars(dollars),
            rejection_count: 0,
            version: 0,
            created_at: t0(),
            updated_at: t0(),
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
        }
    }

    #[test]
    fn hybrid_fires_on_amount_alone() {
        let hybrid = GenerationThreshold::hybrid("h", Some(100), Some(Money::from_dollars(50_000)), None);
        let trigger = evaluate(&bucket(45, 50_000), &[&hybrid], t0()).unwrap();
        assert_eq!(trigger.condition, TriggerCondition::Amount);
        assert_eq!(trigger.threshold_id, "h");

        assert!(evaluate(&bucket(45, 49_999), &[&hybrid], t0()).is_none());
    }

    #[test]
    fn time_threshold_never_fires_an_empty_bucket() {
        let daily = GenerationThreshold::time("t", TimeDuration::Daily);
        let much_later = t0() + Duration::days(365);
        assert!(evaluate(&bucket(0, 0), &[&daily], much_later).is_none());
        assert!(evaluate(&bucket(1, 0), &[&daily], much_later).is_some());
    }

    #[test]
    fn time_threshold_waits_for_the_full_period() {
        let weekly = GenerationThreshold::time("t", TimeDuration::Weekly);
        let b = bucket(3, 10);
        assert!(evaluate(&b, &[&weekly], t0() + Duration::days(6)).is_none());
        assert!(evaluate(&b, &[&weekly], t0() + Duration::days(7)).is_some());
    }

    #[test]
    fn monthly_period_clamps_to_month_end() {
        let end = TimeDuration::Monthly.period_end(t0());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap());
    }

    #[test]
    fn first_satisfied_threshold_in_declared_order_wins() {
        let by_amount = GenerationThreshold::amount("amt", Money::from_dollars(100));
        let by_count = GenerationThreshold::claim_count("cnt", 2);
        let b = bucket(5, 500);

        assert_eq!(evaluate(&b, &[&by_amount, &by_count], t0()).unwrap().threshold_id, "amt");
        assert_eq!(evaluate(&b, &[&by_count, &by_amount], t0()).unwrap().threshold_id, "cnt");
    }

    #[test]
    fn inactive_thresholds_are_ignored() {
        let mut off = GenerationThreshold::claim_count("off", 1);
        off.active = false;
        assert!(evaluate(&bucket(10, 10), &[&off], t0()).is_none());
    }
}
