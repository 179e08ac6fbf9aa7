use super::{ts, Store};
use crate::{
    error::EngineResult,
    model::{ClaimLogEntry, ClaimLogOutcome},
    types::{to_millis, Money},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

pub(super) const CLAIM_LOG_COLUMNS: &str =
    "id, claim_id, bucket_id, outcome, reason, payer_id, payee_id, amount_cents, logged_at";

pub(super) fn claim_log_from_row(row: &Row<'_>) -> rusqlite::Result<ClaimLogEntry> {
    Ok(ClaimLogEntry {
        id: row.get(0)?,
        claim_id: row.get(1)?,
        bucket_id: row.get(2)?,
        outcome: row.get(3)?,
        reason: row.get(4)?,
        payer_id: row.get(5)?,
        payee_id: row.get(6)?,
        amount: row.get::<_, Option<i64>>(7)?.map(Money::from_cents),
        logged_at: ts(row.get(8)?)?,
    })
}

impl Store {
    // ── Claim processing log (append-only) ─────────────────────

    /// Append one outcome row. `entry.id` is ignored; the new id is returned.
    pub fn append_claim_log(&self, entry: &ClaimLogEntry) -> EngineResult<i64> {
        self.conn.execute(
            "INSERT INTO claim_processing_log (
                claim_id, bucket_id, outcome, reason, payer_id, payee_id, amount_cents, logged_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.claim_id,
                entry.bucket_id,
                entry.outcome,
                entry.reason,
                entry.payer_id,
                entry.payee_id,
                entry.amount.map(Money::cents),
                to_millis(entry.logged_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn claim_already_processed(&self, claim_id: &str) -> EngineResult<bool> {
        let found: i64 = self.conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM claim_processing_log
                WHERE claim_id = ?1 AND outcome = 'processed'
            )",
            params![claim_id],
            |row| row.get(0),
        )?;
        Ok(found != 0)
    }

    pub fn claim_log_for_claim(&self, claim_id: &str) -> EngineResult<Vec<ClaimLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CLAIM_LOG_COLUMNS} FROM claim_processing_log
             WHERE claim_id = ?1 ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map(params![claim_id], claim_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn claim_log_for_bucket(&self, bucket_id: &str) -> EngineResult<Vec<ClaimLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CLAIM_LOG_COLUMNS} FROM claim_processing_log
             WHERE bucket_id = ?1 ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map(params![bucket_id], claim_log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn claim_log_count(&self, outcome: ClaimLogOutcome) -> EngineResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM claim_processing_log WHERE outcome = ?1",
            params![outcome],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Record every claim of a generated bucket (merged members included)
    /// as ACCEPTED against that bucket. Returns the number of rows added.
    pub fn accept_bucket_claims(&self, bucket_id: &str, at: DateTime<Utc>) -> EngineResult<usize> {
        let added = self.conn.execute(
            "WITH RECURSIVE members(bucket_id) AS (
                 SELECT ?1
                 UNION
                 SELECT b.bucket_id FROM bucket b
                 JOIN members m ON b.merged_into_bucket_id = m.bucket_id
             )
             INSERT INTO claim_processing_log (
                claim_id, bucket_id, outcome, reason, payer_id, payee_id, amount_cents, logged_at
             )
             SELECT claim_id, ?1, 'accepted', NULL, payer_id, payee_id, amount_cents, ?2
             FROM claim_processing_log
             WHERE outcome = 'processed'
               AND bucket_id IN (SELECT bucket_id FROM members)
             ORDER BY id ASC",
            params![bucket_id, to_millis(at)],
        )?;
        Ok(added)
    }
}
