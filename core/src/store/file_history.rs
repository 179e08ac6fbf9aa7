use super::{opt_millis, opt_ts, ts, Store};
use crate::{
    error::{EngineError, EngineResult},
    model::{DeliveryStatus, FileGenerationRecord},
    types::{to_millis, FileId, Money},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const FILE_COLUMNS: &str = "file_id, bucket_id, file_name, destination, content, claim_count,
    total_amount_cents, delivery_status, delivery_attempt_count, last_error,
    last_attempt_at, next_attempt_at, delivered_at, generated_at, version";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileGenerationRecord> {
    Ok(FileGenerationRecord {
        file_id: row.get(0)?,
        bucket_id: row.get(1)?,
        file_name: row.get(2)?,
        destination: row.get(3)?,
        content: row.get(4)?,
        claim_count: row.get::<_, i64>(5)? as u64,
        total_amount: Money::from_cents(row.get(6)?),
        delivery_status: row.get(7)?,
        delivery_attempt_count: row.get::<_, i64>(8)? as u32,
        last_error: row.get(9)?,
        last_attempt_at: opt_ts(row.get(10)?)?,
        next_attempt_at: opt_ts(row.get(11)?)?,
        delivered_at: opt_ts(row.get(12)?)?,
        generated_at: ts(row.get(13)?)?,
        version: row.get(14)?,
    })
}

impl Store {
    // ── File generation history ────────────────────────────────

    pub fn insert_file_record(&self, f: &FileGenerationRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO file_generation_history (
                file_id, bucket_id, file_name, destination, content, claim_count,
                total_amount_cents, delivery_status, delivery_attempt_count, last_error,
                last_attempt_at, next_attempt_at, delivered_at, generated_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                f.file_id,
                f.bucket_id,
                f.file_name,
                f.destination,
                f.content,
                f.claim_count as i64,
                f.total_amount.cents(),
                f.delivery_status,
                f.delivery_attempt_count as i64,
                f.last_error,
                opt_millis(f.last_attempt_at),
                opt_millis(f.next_attempt_at),
                opt_millis(f.delivered_at),
                to_millis(f.generated_at),
                f.version,
            ],
        )?;
        Ok(())
    }

    pub fn get_file_record(&self, file_id: &str) -> EngineResult<Option<FileGenerationRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM file_generation_history WHERE file_id = ?1"),
                params![file_id],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn require_file_record(&self, file_id: &str) -> EngineResult<FileGenerationRecord> {
        self.get_file_record(file_id)?
            .ok_or_else(|| EngineError::FileNotFound(file_id.to_string()))
    }

    pub fn file_record_for_bucket(&self, bucket_id: &str) -> EngineResult<Option<FileGenerationRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM file_generation_history WHERE bucket_id = ?1"),
                params![bucket_id],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Compare-and-swap write of the delivery fields, keyed on `f.version`.
    pub fn save_file_record(&self, f: &mut FileGenerationRecord) -> EngineResult<()> {
        let changed = self.conn.execute(
            "UPDATE file_generation_history SET
                delivery_status = ?1, delivery_attempt_count = ?2, last_error = ?3,
                last_attempt_at = ?4, next_attempt_at = ?5, delivered_at = ?6,
                version = version + 1
             WHERE file_id = ?7 AND version = ?8",
            params![
                f.delivery_status,
                f.delivery_attempt_count as i64,
                f.last_error,
                opt_millis(f.last_attempt_at),
                opt_millis(f.next_attempt_at),
                opt_millis(f.delivered_at),
                f.file_id,
                f.version,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::FileConcurrentModification {
                file_id: f.file_id.clone(),
                expected: f.version,
            });
        }
        f.version += 1;
        Ok(())
    }

    /// PENDING and RETRY files whose next attempt is due, earliest first.
    pub fn due_file_ids(&self, now: DateTime<Utc>) -> EngineResult<Vec<FileId>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id FROM file_generation_history
             WHERE delivery_status IN ('pending', 'retry')
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY next_attempt_at ASC, file_id ASC",
        )?;
        let ids = stmt
            .query_map(params![to_millis(now)], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn file_ids_with_status(&self, status: DeliveryStatus) -> EngineResult<Vec<FileId>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id FROM file_generation_history
             WHERE delivery_status = ?1 ORDER BY generated_at ASC, file_id ASC",
        )?;
        let ids = stmt
            .query_map(params![status], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn file_count(&self, status: Option<DeliveryStatus>) -> EngineResult<i64> {
        let count = match status {
            Some(status) => self.conn.query_row(
                "SELECT COUNT(*) FROM file_generation_history WHERE delivery_status = ?1",
                params![status],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM file_generation_history",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }
}
