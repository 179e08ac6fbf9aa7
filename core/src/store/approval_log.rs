use super::{opt_millis, opt_ts, ts, Store};
use crate::{error::EngineResult, model::ApprovalLogEntry, types::to_millis};
use rusqlite::params;

impl Store {
    // ── Bucket approval log (append-only) ──────────────────────

    pub fn append_approval_log(&self, entry: &ApprovalLogEntry) -> EngineResult<i64> {
        self.conn.execute(
            "INSERT INTO bucket_approval_log (
                bucket_id, action, actor, comments, scheduled_generation_at, logged_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.bucket_id,
                entry.action,
                entry.actor,
                entry.comments,
                opt_millis(entry.scheduled_generation_at),
                to_millis(entry.logged_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn approval_log_for_bucket(&self, bucket_id: &str) -> EngineResult<Vec<ApprovalLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, bucket_id, action, actor, comments, scheduled_generation_at, logged_at
             FROM bucket_approval_log WHERE bucket_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![bucket_id], |row| {
                Ok(ApprovalLogEntry {
                    id: row.get(0)?,
                    bucket_id: row.get(1)?,
                    action: row.get(2)?,
                    actor: row.get(3)?,
                    comments: row.get(4)?,
                    scheduled_generation_at: opt_ts(row.get(5)?)?,
                    logged_at: ts(row.get(6)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
