use chrono::Utc;
use rusqlite::params;

use super::{DbError, DbProfile, ProfileDb};
use crate::rows::ResolvedRow;

impl ProfileDb {
    // =========================================================================
    // Profiles
    // =========================================================================

    /// Insert or update a profile from a resolved sheet row.
    ///
    /// Returns true if the profile was newly inserted (not updated).
    ///
    /// Merge rules, enforced in the upsert itself so they hold even when
    /// another bot process writes between our existence check and the upsert:
    /// - `has_completed_survey` only moves 0 → 1, never back. On first
    ///   insert it is also derived from substantive survey answers: a row
    ///   imported with the survey fields filled in counts as completed even
    ///   when the flag column itself was never set.
    /// - `survey_date` and `created_at` are never blanked; a non-empty
    ///   incoming value may correct them.
    /// - Everything else is last-write-wins, including blanking.
    /// - The denormalized request/order aggregates are owned by
    ///   `refresh_profile_aggregates`, not by the sheet.
    pub fn upsert_profile(&self, user_id: i64, row: &ResolvedRow) -> Result<bool, DbError> {
        let existed: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM profiles WHERE user_id = ?1)",
            params![user_id],
            |r| r.get(0),
        )?;

        let now = Utc::now().to_rfc3339();

        let survey_completed = row.survey_completed || (!existed && row.has_survey_content());

        // First insert stamps a registration time when the sheet carries none.
        // On the update path the raw (possibly empty) value is bound so the
        // sticky CASE below can preserve what the store already has.
        let created_at_bind = if !existed && row.created_at.is_empty() {
            now.clone()
        } else {
            row.created_at.clone()
        };

        // The packed sheet counters are written on insert only, so a legacy
        // import keeps its history; existing profiles get theirs recomputed
        // from the catalog tables, which are the authoritative source.
        self.conn.execute(
            "INSERT INTO profiles (
                user_id, username, full_name, city, phone, email, social_link,
                family_status, children, occupation, income_level, health_notes,
                product_interest, purchase_frequency, referral_source, wishes,
                notes, bonus_total, current_balance, has_completed_survey,
                survey_date, created_at, updated_at, account_status, user_status,
                requests_count, requests_sum, orders_count, orders_sum
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25,
                       ?26, ?27, ?28, ?29)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                full_name = excluded.full_name,
                city = excluded.city,
                phone = excluded.phone,
                email = excluded.email,
                social_link = excluded.social_link,
                family_status = excluded.family_status,
                children = excluded.children,
                occupation = excluded.occupation,
                income_level = excluded.income_level,
                health_notes = excluded.health_notes,
                product_interest = excluded.product_interest,
                purchase_frequency = excluded.purchase_frequency,
                referral_source = excluded.referral_source,
                wishes = excluded.wishes,
                notes = excluded.notes,
                bonus_total = excluded.bonus_total,
                current_balance = excluded.current_balance,
                has_completed_survey = CASE
                    WHEN excluded.has_completed_survey = 1 THEN 1
                    ELSE profiles.has_completed_survey
                END,
                survey_date = CASE
                    WHEN excluded.survey_date != '' THEN excluded.survey_date
                    ELSE profiles.survey_date
                END,
                created_at = CASE
                    WHEN excluded.created_at != '' THEN excluded.created_at
                    ELSE profiles.created_at
                END,
                updated_at = excluded.updated_at,
                account_status = excluded.account_status,
                user_status = excluded.user_status",
            params![
                user_id,
                row.username,
                row.full_name,
                row.city,
                row.phone,
                row.email,
                row.social_link,
                row.family_status,
                row.children,
                row.occupation,
                row.income_level,
                row.health_notes,
                row.product_interest,
                row.purchase_frequency,
                row.referral_source,
                row.wishes,
                row.notes,
                row.bonus_total,
                row.current_balance,
                survey_completed as i32,
                row.survey_date,
                created_at_bind,
                now,
                row.account_status,
                row.user_status,
                row.requests_count,
                row.requests_sum,
                row.orders_count,
                row.orders_sum,
            ],
        )?;

        Ok(!existed)
    }

    /// Look up a profile by canonical identity.
    pub fn get_profile(&self, user_id: i64) -> Result<Option<DbProfile>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM profiles WHERE user_id = ?1",
            PROFILE_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![user_id], Self::map_profile_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All profiles, ordered by identity. Excludes the reserved sentinel row.
    pub fn list_profiles(&self) -> Result<Vec<DbProfile>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM profiles WHERE user_id > 0 ORDER BY user_id",
            PROFILE_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::map_profile_row)?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }

    /// (identity, handle) pairs for every profile with a non-empty handle.
    /// Feeds the per-cycle handle index used for identity fallback.
    pub fn handle_entries(&self) -> Result<Vec<(i64, String)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, username FROM profiles
             WHERE user_id > 0 AND username != ''
             ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn map_profile_row(row: &rusqlite::Row) -> rusqlite::Result<DbProfile> {
        Ok(DbProfile {
            user_id: row.get(0)?,
            username: row.get(1)?,
            full_name: row.get(2)?,
            city: row.get(3)?,
            phone: row.get(4)?,
            email: row.get(5)?,
            social_link: row.get(6)?,
            family_status: row.get(7)?,
            children: row.get(8)?,
            occupation: row.get(9)?,
            income_level: row.get(10)?,
            health_notes: row.get(11)?,
            product_interest: row.get(12)?,
            purchase_frequency: row.get(13)?,
            referral_source: row.get(14)?,
            wishes: row.get(15)?,
            notes: row.get(16)?,
            bonus_total: row.get(17)?,
            current_balance: row.get(18)?,
            has_completed_survey: row.get(19)?,
            survey_date: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
            account_status: row.get(23)?,
            user_status: row.get(24)?,
            requests_count: row.get(25)?,
            requests_sum: row.get(26)?,
            orders_count: row.get(27)?,
            orders_sum: row.get(28)?,
        })
    }
}

const PROFILE_COLUMNS: &str = "user_id, username, full_name, city, phone, email, social_link,
    family_status, children, occupation, income_level, health_notes,
    product_interest, purchase_frequency, referral_source, wishes, notes,
    bonus_total, current_balance, has_completed_survey, survey_date,
    created_at, updated_at, account_status, user_status,
    requests_count, requests_sum, orders_count, orders_sum";

#[cfg(test)]
mod tests {
    use crate::db::test_utils::test_db;
    use crate::rows::ResolvedRow;

    /// A row with survey answers filled in, as a completed questionnaire
    /// import would look.
    fn survey_row(name: &str) -> ResolvedRow {
        ResolvedRow {
            username: "ivan_p".into(),
            full_name: name.into(),
            city: "Казань".into(),
            bonus_total: 120.0,
            current_balance: 35.5,
            account_status: "Работа".into(),
            user_status: "active".into(),
            ..Default::default()
        }
    }

    /// A row carrying only operational columns, no survey answers.
    fn bare_row() -> ResolvedRow {
        ResolvedRow {
            username: "ivan_p".into(),
            bonus_total: 5.0,
            account_status: "Работа".into(),
            user_status: "new".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let db = test_db();

        let inserted = db
            .upsert_profile(100, &survey_row("Иван Петров, 34"))
            .expect("insert");
        assert!(inserted);

        let updated = db
            .upsert_profile(100, &survey_row("Иван Петров, 35"))
            .expect("update");
        assert!(!updated, "second upsert should be an update");

        let profile = db.get_profile(100).expect("query").expect("present");
        assert_eq!(profile.full_name, "Иван Петров, 35");
        assert_eq!(profile.bonus_total, 120.0);
        assert!(!profile.updated_at.is_empty());
    }

    #[test]
    fn test_insert_derives_survey_flag_from_answers() {
        let db = test_db();

        db.upsert_profile(6, &survey_row("a")).expect("insert");
        assert!(
            db.get_profile(6).unwrap().unwrap().has_completed_survey,
            "substantive answers imply a completed survey"
        );
    }

    #[test]
    fn test_bare_insert_leaves_survey_flag_unset() {
        let db = test_db();

        db.upsert_profile(100, &bare_row()).expect("insert");
        let profile = db.get_profile(100).unwrap().unwrap();
        assert!(!profile.has_completed_survey);
        assert_eq!(profile.bonus_total, 5.0);
    }

    #[test]
    fn test_survey_flag_is_monotonic() {
        let db = test_db();
        db.upsert_profile(7, &bare_row()).expect("insert");
        assert!(!db.get_profile(7).unwrap().unwrap().has_completed_survey);

        let mut flagged = bare_row();
        flagged.survey_completed = true;
        db.upsert_profile(7, &flagged).expect("update");
        assert!(db.get_profile(7).unwrap().unwrap().has_completed_survey);

        // A later row without survey evidence must not clear the flag.
        db.upsert_profile(7, &bare_row()).expect("update");
        assert!(db.get_profile(7).unwrap().unwrap().has_completed_survey);
    }

    #[test]
    fn test_sticky_dates_never_blanked() {
        let db = test_db();
        let mut row = survey_row("a");
        row.survey_date = "2024-03-01".into();
        row.created_at = "2024-01-15T09:00:00+00:00".into();
        db.upsert_profile(8, &row).expect("insert");

        // Update with empty dates: both survive.
        db.upsert_profile(8, &survey_row("b")).expect("update");
        let profile = db.get_profile(8).unwrap().unwrap();
        assert_eq!(profile.survey_date, "2024-03-01");
        assert_eq!(profile.created_at, "2024-01-15T09:00:00+00:00");

        // A non-empty correction goes through.
        let mut corrected = survey_row("c");
        corrected.survey_date = "2024-03-02".into();
        db.upsert_profile(8, &corrected).expect("update");
        assert_eq!(db.get_profile(8).unwrap().unwrap().survey_date, "2024-03-02");
    }

    #[test]
    fn test_plain_fields_are_last_write_wins() {
        let db = test_db();
        db.upsert_profile(9, &survey_row("a")).expect("insert");

        let mut blanked = survey_row("a");
        blanked.city = String::new();
        db.upsert_profile(9, &blanked).expect("update");
        assert_eq!(db.get_profile(9).unwrap().unwrap().city, "");
    }

    #[test]
    fn test_insert_stamps_created_at_when_sheet_has_none() {
        let db = test_db();
        db.upsert_profile(10, &survey_row("a")).expect("insert");
        let profile = db.get_profile(10).unwrap().unwrap();
        assert!(
            profile.created_at.contains('T'),
            "expected an RFC 3339 registration stamp, got {:?}",
            profile.created_at
        );
    }

    #[test]
    fn test_handle_entries_skip_empty_usernames() {
        let db = test_db();
        db.upsert_profile(1, &survey_row("a")).expect("insert");
        let mut no_handle = survey_row("b");
        no_handle.username = String::new();
        db.upsert_profile(2, &no_handle).expect("insert");

        let entries = db.handle_entries().expect("entries");
        assert_eq!(entries, vec![(1, "ivan_p".to_string())]);
    }

    #[test]
    fn test_list_profiles_excludes_sentinel() {
        let db = test_db();
        db.conn_ref()
            .execute("INSERT INTO profiles (user_id) VALUES (0)", [])
            .expect("sentinel row");
        db.upsert_profile(3, &survey_row("a")).expect("insert");

        let ids: Vec<i64> = db
            .list_profiles()
            .expect("list")
            .iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(ids, vec![3]);
    }
}
