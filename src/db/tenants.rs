use chrono::Utc;
use rusqlite::params;

use super::{DbError, DbTenantBalance, MergedProfile, ProfileDb};

impl ProfileDb {
    // =========================================================================
    // Tenant isolation
    // =========================================================================
    //
    // The profiles table is shared infrastructure across independently-run
    // bot processes. Balance and statuses are the fields where one tenant's
    // sync must never clobber another tenant's view of the same person, so
    // they live in a (user_id, tenant) satellite and are merged at read time.

    /// Insert the satellite row if absent, with safe defaults: zero balance,
    /// working account, fresh user status. Never touches an existing row.
    pub fn ensure_tenant_row(&self, user_id: i64, tenant: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO tenant_balances
                (user_id, tenant, balance, account_status, user_status, updated_at)
             VALUES (?1, ?2, 0, 'Работа', 'new', ?3)",
            params![user_id, tenant, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Update exactly the (user_id, tenant) row. Other tenants' rows for the
    /// same identity are out of reach by construction of the WHERE clause.
    pub fn write_isolated(
        &self,
        user_id: i64,
        tenant: &str,
        balance: f64,
        account_status: &str,
        user_status: &str,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE tenant_balances
             SET balance = ?3, account_status = ?4, user_status = ?5, updated_at = ?6
             WHERE user_id = ?1 AND tenant = ?2",
            params![
                user_id,
                tenant,
                balance,
                account_status,
                user_status,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// The raw satellite row, if present.
    pub fn get_tenant_balance(
        &self,
        user_id: i64,
        tenant: &str,
    ) -> Result<Option<DbTenantBalance>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, tenant, balance, account_status, user_status, updated_at
             FROM tenant_balances WHERE user_id = ?1 AND tenant = ?2",
        )?;
        let mut rows = stmt.query_map(params![user_id, tenant], |row| {
            Ok(DbTenantBalance {
                user_id: row.get(0)?,
                tenant: row.get(1)?,
                balance: row.get(2)?,
                account_status: row.get(3)?,
                user_status: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// One identity through this tenant's eyes.
    pub fn read_merged(
        &self,
        user_id: i64,
        tenant: &str,
    ) -> Result<Option<MergedProfile>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} AND p.user_id = ?2",
            MERGED_SELECT
        ))?;
        let mut rows = stmt.query_map(params![tenant, user_id], Self::map_merged_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// The full merged view this tenant exports, ordered by identity.
    ///
    /// Balance is strictly per-tenant (absent satellite row reads as 0);
    /// statuses fall back tenant → shared → default; `bonus_total` prefers
    /// the latest ledger entry over the denormalized profile copy.
    pub fn read_merged_all(&self, tenant: &str) -> Result<Vec<MergedProfile>, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY p.user_id", MERGED_SELECT))?;
        let rows = stmt.query_map(params![tenant], Self::map_merged_row)?;
        let mut merged = Vec::new();
        for row in rows {
            merged.push(row?);
        }
        Ok(merged)
    }

    fn map_merged_row(row: &rusqlite::Row) -> rusqlite::Result<MergedProfile> {
        Ok(MergedProfile {
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
            account_status: row.get(22)?,
            user_status: row.get(23)?,
            requests_count: row.get(24)?,
            requests_sum: row.get(25)?,
            orders_count: row.get(26)?,
            orders_sum: row.get(27)?,
        })
    }
}

const MERGED_SELECT: &str = "SELECT
    p.user_id, p.username, p.full_name, p.city, p.phone, p.email, p.social_link,
    p.family_status, p.children, p.occupation, p.income_level, p.health_notes,
    p.product_interest, p.purchase_frequency, p.referral_source, p.wishes, p.notes,
    COALESCE((SELECT l.bonus_total FROM bonus_ledger l
              WHERE l.user_id = p.user_id
              ORDER BY l.updated_at DESC, l.id DESC LIMIT 1), p.bonus_total),
    COALESCE(tb.balance, 0),
    p.has_completed_survey, p.survey_date, p.created_at,
    COALESCE(tb.account_status, p.account_status, 'Работа'),
    COALESCE(tb.user_status, p.user_status, 'new'),
    p.requests_count, p.requests_sum, p.orders_count, p.orders_sum
 FROM profiles p
 LEFT JOIN tenant_balances tb ON tb.user_id = p.user_id AND tb.tenant = ?1
 WHERE p.user_id > 0";
