use chrono::Utc;
use rusqlite::params;

use super::{DbError, DbSyncRun, ProfileDb, RunCounters};

impl ProfileDb {
    // =========================================================================
    // Sync run audit trail
    // =========================================================================

    /// Record the start of a sync cycle. One row per cycle; finalized by
    /// `finish_sync_run` whether the cycle completes or fails.
    pub fn start_sync_run(&self, id: &str, kind: &str, tenant: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO sync_runs (id, kind, tenant, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![id, kind, tenant, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Finalize a sync run with its outcome and counters.
    pub fn finish_sync_run(
        &self,
        id: &str,
        status: &str,
        counters: &RunCounters,
        source_digest: &str,
        error_message: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE sync_runs SET
                status = ?2,
                rows_seen = ?3,
                merged = ?4,
                skipped = ?5,
                row_errors = ?6,
                conflicts = ?7,
                pushed_rows = ?8,
                source_digest = ?9,
                error_message = ?10,
                finished_at = ?11
             WHERE id = ?1",
            params![
                id,
                status,
                counters.rows_seen,
                counters.merged,
                counters.skipped,
                counters.row_errors,
                counters.conflicts,
                counters.pushed_rows,
                source_digest,
                error_message,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_sync_run(&self, id: &str) -> Result<Option<DbSyncRun>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, tenant, status, rows_seen, merged, skipped, row_errors,
                    conflicts, pushed_rows, source_digest, error_message,
                    started_at, finished_at
             FROM sync_runs WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(DbSyncRun {
                id: row.get(0)?,
                kind: row.get(1)?,
                tenant: row.get(2)?,
                status: row.get(3)?,
                rows_seen: row.get(4)?,
                merged: row.get(5)?,
                skipped: row.get(6)?,
                row_errors: row.get(7)?,
                conflicts: row.get(8)?,
                pushed_rows: row.get(9)?,
                source_digest: row.get(10)?,
                error_message: row.get(11)?,
                started_at: row.get(12)?,
                finished_at: row.get(13)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}
