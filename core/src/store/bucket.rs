use super::{opt_millis, opt_ts, ts, Store};
use crate::{
    error::{EngineError, EngineResult},
    model::{Bucket, BucketStatus, ClaimLogEntry},
    types::{to_millis, BucketId, Money},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const BUCKET_COLUMNS: &str = "bucket_id, rule_id, grouping_key, payer_id, payee_id, bin_number,
    pcn_number, status, claim_count, total_amount_cents, rejection_count, version,
    created_at, updated_at, awaiting_approval_since, approved_by, approved_at,
    scheduled_generation_at, payment_instrument_id, trigger_threshold_id,
    trigger_condition, generation_started_at, generation_completed_at,
    failure_reason, merged_into_bucket_id";

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<Bucket> {
    Ok(Bucket {
        bucket_id: row.get(0)?,
        rule_id: row.get(1)?,
        grouping_key: row.get(2)?,
        payer_id: row.get(3)?,
        payee_id: row.get(4)?,
        bin_number: row.get(5)?,
        pcn_number: row.get(6)?,
        status: row.get(7)?,
        claim_count: row.get::<_, i64>(8)? as u64,
        total_amount: Money::from_cents(row.get(9)?),
        rejection_count: row.get::<_, i64>(10)? as u32,
        version: row.get(11)?,
        created_at: ts(row.get(12)?)?,
        updated_at: ts(row.get(13)?)?,
        awaiting_approval_since: opt_ts(row.get(14)?)?,
        approved_by: row.get(15)?,
        approved_at: opt_ts(row.get(16)?)?,
        scheduled_generation_at: opt_ts(row.get(17)?)?,
        payment_instrument_id: row.get(18)?,
        trigger_threshold_id: row.get(19)?,
        trigger_condition: row.get(20)?,
        generation_started_at: opt_ts(row.get(21)?)?,
        generation_completed_at: opt_ts(row.get(22)?)?,
        failure_reason: row.get(23)?,
        merged_into_bucket_id: row.get(24)?,
    })
}

impl Store {
    // ── Buckets ────────────────────────────────────────────────

    pub fn insert_bucket(&self, b: &Bucket) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO bucket (
                bucket_id, rule_id, grouping_key, payer_id, payee_id, bin_number,
                pcn_number, status, claim_count, total_amount_cents, rejection_count,
                version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                b.bucket_id,
                b.rule_id,
                b.grouping_key,
                b.payer_id,
                b.payee_id,
                b.bin_number,
                b.pcn_number,
                b.status,
                b.claim_count as i64,
                b.total_amount.cents(),
                b.rejection_count as i64,
                b.version,
                to_millis(b.created_at),
                to_millis(b.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_bucket(&self, bucket_id: &str) -> EngineResult<Option<Bucket>> {
        let bucket = self
            .conn
            .query_row(
                &format!("SELECT {BUCKET_COLUMNS} FROM bucket WHERE bucket_id = ?1"),
                params![bucket_id],
                bucket_from_row,
            )
            .optional()?;
        Ok(bucket)
    }

    pub fn require_bucket(&self, bucket_id: &str) -> EngineResult<Bucket> {
        self.get_bucket(bucket_id)?
            .ok_or_else(|| EngineError::BucketNotFound(bucket_id.to_string()))
    }

    pub fn find_accumulating_bucket(
        &self,
        rule_id: &str,
        grouping_key: &str,
    ) -> EngineResult<Option<Bucket>> {
        let bucket = self
            .conn
            .query_row(
                &format!(
                    "SELECT {BUCKET_COLUMNS} FROM bucket
                     WHERE rule_id = ?1 AND grouping_key = ?2 AND status = 'accumulating'"
                ),
                params![rule_id, grouping_key],
                bucket_from_row,
            )
            .optional()?;
        Ok(bucket)
    }

    /// Add one claim to an accumulating bucket. Returns the updated row.
    pub fn add_claim_to_bucket(
        &self,
        bucket_id: &str,
        amount: Money,
        at: DateTime<Utc>,
    ) -> EngineResult<Bucket> {
        let changed = self.conn.execute(
            "UPDATE bucket
             SET claim_count = claim_count + 1,
                 total_amount_cents = total_amount_cents + ?1,
                 version = version + 1,
                 updated_at = ?2
             WHERE bucket_id = ?3 AND status = 'accumulating'",
            params![amount.cents(), to_millis(at), bucket_id],
        )?;
        let bucket = self.require_bucket(bucket_id)?;
        if changed == 0 {
            return Err(EngineError::InvalidState {
                bucket_id: bucket_id.to_string(),
                status: bucket.status,
                operation: "add a claim to",
            });
        }
        Ok(bucket)
    }

    /// Compare-and-swap write of every mutable bucket field. Succeeds only
    /// if the stored version still equals `b.version`; bumps it on success.
    pub fn save_bucket(&self, b: &mut Bucket) -> EngineResult<()> {
        let changed = self.conn.execute(
            "UPDATE bucket SET
                status = ?1, claim_count = ?2, total_amount_cents = ?3,
                rejection_count = ?4, updated_at = ?5, awaiting_approval_since = ?6,
                approved_by = ?7, approved_at = ?8, scheduled_generation_at = ?9,
                payment_instrument_id = ?10, trigger_threshold_id = ?11,
                trigger_condition = ?12, generation_started_at = ?13,
                generation_completed_at = ?14, failure_reason = ?15,
                merged_into_bucket_id = ?16, version = version + 1
             WHERE bucket_id = ?17 AND version = ?18",
            params![
                b.status,
                b.claim_count as i64,
                b.total_amount.cents(),
                b.rejection_count as i64,
                to_millis(b.updated_at),
                opt_millis(b.awaiting_approval_since),
                b.approved_by,
                opt_millis(b.approved_at),
                opt_millis(b.scheduled_generation_at),
                b.payment_instrument_id,
                b.trigger_threshold_id,
                b.trigger_condition,
                opt_millis(b.generation_started_at),
                opt_millis(b.generation_completed_at),
                b.failure_reason,
                b.merged_into_bucket_id,
                b.bucket_id,
                b.version,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::ConcurrentModification {
                bucket_id: b.bucket_id.clone(),
                expected: b.version,
            });
        }
        b.version += 1;
        Ok(())
    }

    /// Ids of every bucket in `status`, oldest first.
    pub fn bucket_ids_with_status(&self, status: BucketStatus) -> EngineResult<Vec<BucketId>> {
        let mut stmt = self.conn.prepare(
            "SELECT bucket_id FROM bucket WHERE status = ?1 ORDER BY created_at ASC, bucket_id ASC",
        )?;
        let ids = stmt
            .query_map(params![status], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn buckets_with_status(&self, status: BucketStatus) -> EngineResult<Vec<Bucket>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BUCKET_COLUMNS} FROM bucket WHERE status = ?1
             ORDER BY created_at ASC, bucket_id ASC"
        ))?;
        let buckets = stmt
            .query_map(params![status], bucket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    pub fn buckets_for_key(&self, rule_id: &str, grouping_key: &str) -> EngineResult<Vec<Bucket>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BUCKET_COLUMNS} FROM bucket WHERE rule_id = ?1 AND grouping_key = ?2
             ORDER BY created_at ASC, bucket_id ASC"
        ))?;
        let buckets = stmt
            .query_map(params![rule_id, grouping_key], bucket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    /// Approved PENDING_APPROVAL buckets whose scheduled generation time has come.
    pub fn due_scheduled_generations(&self, now: DateTime<Utc>) -> EngineResult<Vec<BucketId>> {
        let mut stmt = self.conn.prepare(
            "SELECT bucket_id FROM bucket
             WHERE status = 'pending_approval' AND approved_at IS NOT NULL
               AND scheduled_generation_at IS NOT NULL AND scheduled_generation_at <= ?1
             ORDER BY scheduled_generation_at ASC",
        )?;
        let ids = stmt
            .query_map(params![to_millis(now)], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// GENERATING buckets that entered the state at or before `started_before`
    /// and still have no file record: their generation step never recorded.
    pub fn stalled_generations(&self, started_before: DateTime<Utc>) -> EngineResult<Vec<BucketId>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.bucket_id FROM bucket b
             WHERE b.status = 'generating'
               AND b.generation_started_at IS NOT NULL AND b.generation_started_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM file_generation_history f WHERE f.bucket_id = b.bucket_id
               )
             ORDER BY b.generation_started_at ASC, b.bucket_id ASC",
        )?;
        let ids = stmt
            .query_map(params![to_millis(started_before)], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn bucket_count(&self, status: Option<BucketStatus>) -> EngineResult<i64> {
        let count = match status {
            Some(status) => self.conn.query_row(
                "SELECT COUNT(*) FROM bucket WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM bucket", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// Claims aggregated into the bucket, including those of buckets merged
    /// into it (transitively), in arrival order.
    pub fn claims_for_bucket(&self, bucket_id: &str) -> EngineResult<Vec<ClaimLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "WITH RECURSIVE members(bucket_id) AS (
                 SELECT ?1
                 UNION
                 SELECT b.bucket_id FROM bucket b
                 JOIN members m ON b.merged_into_bucket_id = m.bucket_id
             )
             SELECT {} FROM claim_processing_log
             WHERE outcome = 'processed'
               AND bucket_id IN (SELECT bucket_id FROM members)
             ORDER BY id ASC",
            super::claim_log::CLAIM_LOG_COLUMNS
        ))?;
        let claims = stmt
            .query_map(params![bucket_id], super::claim_log::claim_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(claims)
    }
}
