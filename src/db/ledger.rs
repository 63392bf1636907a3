use chrono::Utc;
use rusqlite::params;

use super::{DbError, DbLedgerEntry, ProfileDb};

impl ProfileDb {
    // =========================================================================
    // Bonus ledger
    // =========================================================================

    /// Mirror the numeric profile fields into the bonus ledger.
    ///
    /// Find-or-create by identity. Old imports left duplicate rows for some
    /// identities; the most recent one wins and is the row updated, so the
    /// duplicate set never grows.
    pub fn upsert_ledger(
        &self,
        user_id: i64,
        bonus_total: f64,
        current_balance: f64,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();

        match self.latest_ledger_id(user_id)? {
            Some(id) => {
                self.conn.execute(
                    "UPDATE bonus_ledger
                     SET bonus_total = ?1, current_balance = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![bonus_total, current_balance, now, id],
                )?;
            }
            None => {
                self.conn.execute(
                    "INSERT INTO bonus_ledger (user_id, bonus_total, current_balance, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![user_id, bonus_total, current_balance, now],
                )?;
            }
        }
        Ok(())
    }

    /// The most recent ledger entry for an identity, if any.
    pub fn get_ledger_entry(&self, user_id: i64) -> Result<Option<DbLedgerEntry>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, bonus_total, current_balance, updated_at
             FROM bonus_ledger WHERE user_id = ?1
             ORDER BY updated_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![user_id], |row| {
            Ok(DbLedgerEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                bonus_total: row.get(2)?,
                current_balance: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn latest_ledger_id(&self, user_id: i64) -> Result<Option<i64>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM bonus_ledger WHERE user_id = ?1
             ORDER BY updated_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}
