//! Writing resolved external rows into the shared store.
//!
//! One call per identity: the profile upsert carries the merge rules and the
//! bonus ledger is kept in step as a side effect. The reconcile loop treats a
//! per-identity error here as countable, not fatal to the rest of the batch.

use crate::db::{DbError, ProfileDb};
use crate::rows::ResolvedRow;

/// What a reconciled row did to the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
}

/// Apply one resolved row for `user_id`.
///
/// An insert derives survey completion from substantive answers; an update
/// keeps the completion flag monotonic and never blanks the recorded dates.
/// The ledger row for the identity is found-or-created and overwritten with
/// the incoming totals so there stays one live entry per subscriber.
pub fn apply_row(db: &ProfileDb, user_id: i64, row: &ResolvedRow) -> Result<RowOutcome, DbError> {
    let inserted = db.upsert_profile(user_id, row)?;
    db.upsert_ledger(user_id, row.bonus_total, row.current_balance)?;
    Ok(if inserted {
        RowOutcome::Inserted
    } else {
        RowOutcome::Updated
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    fn resolved(name: &str, bonus: f64, balance: f64) -> ResolvedRow {
        ResolvedRow {
            full_name: name.to_string(),
            bonus_total: bonus,
            current_balance: balance,
            account_status: "Работа".to_string(),
            user_status: "new".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_row_inserts_then_updates() {
        let db = test_db();
        let outcome = apply_row(&db, 100, &resolved("Иван", 50.0, 10.0)).expect("insert");
        assert_eq!(outcome, RowOutcome::Inserted);

        let outcome = apply_row(&db, 100, &resolved("Иван Петров", 75.0, 5.0)).expect("update");
        assert_eq!(outcome, RowOutcome::Updated);

        let profile = db.get_profile(100).expect("query").expect("row");
        assert_eq!(profile.full_name, "Иван Петров");
        assert_eq!(profile.bonus_total, 75.0);
    }

    #[test]
    fn test_apply_row_keeps_one_ledger_entry_in_step() {
        let db = test_db();
        apply_row(&db, 100, &resolved("Иван", 50.0, 10.0)).expect("insert");
        apply_row(&db, 100, &resolved("Иван", 80.0, 30.0)).expect("update");

        let entry = db.get_ledger_entry(100).expect("query").expect("entry");
        assert_eq!(entry.bonus_total, 80.0);
        assert_eq!(entry.current_balance, 30.0);

        let count: i64 = db
            .conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM bonus_ledger WHERE user_id = ?1",
                [100i64],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_apply_row_derives_survey_flag_only_on_insert() {
        let db = test_db();
        apply_row(&db, 200, &resolved("Анна", 0.0, 0.0)).expect("insert");
        let profile = db.get_profile(200).expect("query").expect("row");
        assert!(
            profile.has_completed_survey,
            "substantive answers on a fresh import count as a completed survey"
        );

        apply_row(&db, 201, &ResolvedRow::default()).expect("insert");
        let bare = db.get_profile(201).expect("query").expect("row");
        assert!(!bare.has_completed_survey);
    }
}
