use chrono::Utc;
use rusqlite::params;

use super::{DbCatalogEntry, DbError, DbInvestor, DbPartner, ProfileDb};

/// Which of the two catalog tables an operation targets. They share a shape;
/// requests and orders only differ in lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogTable {
    Requests,
    Orders,
}

impl CatalogTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            CatalogTable::Requests => "catalog_requests",
            CatalogTable::Orders => "catalog_orders",
        }
    }
}

impl ProfileDb {
    // =========================================================================
    // Catalog requests/orders + rosters
    //
    // The bot processes write these tables directly. Sync pushes them out to
    // their worksheets and pulls back the operator-editable status column;
    // everything else is bot-owned and preserved on the update path.
    // =========================================================================

    /// Insert a catalog row, or merge the operator-editable status into an
    /// existing one. `created_at` is set once and never touched again.
    pub fn upsert_catalog_entry(
        &self,
        table: CatalogTable,
        entry: &DbCatalogEntry,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let created_at = if entry.created_at.is_empty() {
            now.clone()
        } else {
            entry.created_at.clone()
        };

        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, user_id, item, amount, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                table.table_name()
            ),
            params![
                entry.id,
                entry.user_id,
                entry.item,
                entry.amount,
                entry.status,
                created_at,
                now
            ],
        )?;
        Ok(())
    }

    /// All rows of a catalog table, ordered by id for a stable export.
    pub fn list_catalog_entries(&self, table: CatalogTable) -> Result<Vec<DbCatalogEntry>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, user_id, item, amount, status, created_at, updated_at
             FROM {} ORDER BY id",
            table.table_name()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(DbCatalogEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                item: row.get(2)?,
                amount: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Insert a partner, or merge the operator-editable status.
    pub fn upsert_partner(&self, partner: &DbPartner) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let joined_at = if partner.joined_at.is_empty() {
            now.clone()
        } else {
            partner.joined_at.clone()
        };

        self.conn.execute(
            "INSERT INTO partners (user_id, full_name, phone, city, status, joined_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                partner.user_id,
                partner.full_name,
                partner.phone,
                partner.city,
                partner.status,
                joined_at,
                now
            ],
        )?;
        Ok(())
    }

    pub fn list_partners(&self) -> Result<Vec<DbPartner>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, full_name, phone, city, status, joined_at, updated_at
             FROM partners ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DbPartner {
                user_id: row.get(0)?,
                full_name: row.get(1)?,
                phone: row.get(2)?,
                city: row.get(3)?,
                status: row.get(4)?,
                joined_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        let mut partners = Vec::new();
        for row in rows {
            partners.push(row?);
        }
        Ok(partners)
    }

    /// Insert an investor, or merge the operator-editable status.
    pub fn upsert_investor(&self, investor: &DbInvestor) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let joined_at = if investor.joined_at.is_empty() {
            now.clone()
        } else {
            investor.joined_at.clone()
        };

        self.conn.execute(
            "INSERT INTO investors (user_id, full_name, phone, invested_sum, status, joined_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                investor.user_id,
                investor.full_name,
                investor.phone,
                investor.invested_sum,
                investor.status,
                joined_at,
                now
            ],
        )?;
        Ok(())
    }

    pub fn list_investors(&self) -> Result<Vec<DbInvestor>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, full_name, phone, invested_sum, status, joined_at, updated_at
             FROM investors ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DbInvestor {
                user_id: row.get(0)?,
                full_name: row.get(1)?,
                phone: row.get(2)?,
                invested_sum: row.get(3)?,
                status: row.get(4)?,
                joined_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        let mut investors = Vec::new();
        for row in rows {
            investors.push(row?);
        }
        Ok(investors)
    }

    /// Recompute the denormalized request/order counters on `profiles` from
    /// the catalog tables. Runs between reconciliation and push so exported
    /// rows always carry fresh aggregates.
    pub fn refresh_profile_aggregates(&self) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE profiles SET
                requests_count = (SELECT COUNT(*) FROM catalog_requests c
                                  WHERE c.user_id = profiles.user_id),
                requests_sum = (SELECT COALESCE(SUM(c.amount), 0) FROM catalog_requests c
                                WHERE c.user_id = profiles.user_id),
                orders_count = (SELECT COUNT(*) FROM catalog_orders c
                                WHERE c.user_id = profiles.user_id),
                orders_sum = (SELECT COALESCE(SUM(c.amount), 0) FROM catalog_orders c
                              WHERE c.user_id = profiles.user_id)
             WHERE user_id > 0",
            [],
        )?;
        Ok(())
    }
}
