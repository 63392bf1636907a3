//! Shared type definitions for the database layer.

use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

impl DbError {
    /// True when the failure is SQLite lock contention from another process,
    /// which a retry with backoff can clear.
    pub fn is_locked(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            // Lock contention during a migration surfaces as a stringified
            // SQLite message; still worth retrying.
            DbError::Migration(msg) => msg.contains("locked") || msg.contains("busy"),
            _ => false,
        }
    }
}

/// A row from the `profiles` table.
#[derive(Debug, Clone, Default)]
pub struct DbProfile {
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub city: String,
    pub phone: String,
    pub email: String,
    pub social_link: String,
    pub family_status: String,
    pub children: String,
    pub occupation: String,
    pub income_level: String,
    pub health_notes: String,
    pub product_interest: String,
    pub purchase_frequency: String,
    pub referral_source: String,
    pub wishes: String,
    pub notes: String,
    pub bonus_total: f64,
    pub current_balance: f64,
    pub has_completed_survey: bool,
    pub survey_date: String,
    pub created_at: String,
    pub updated_at: String,
    pub account_status: String,
    pub user_status: String,
    pub requests_count: i64,
    pub requests_sum: f64,
    pub orders_count: i64,
    pub orders_sum: f64,
}

/// A profile as seen by one tenant: shared fields overlaid with the tenant's
/// own balance and statuses where those exist. This is the view the export
/// writes back to the spreadsheet.
#[derive(Debug, Clone, Default)]
pub struct MergedProfile {
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub city: String,
    pub phone: String,
    pub email: String,
    pub social_link: String,
    pub family_status: String,
    pub children: String,
    pub occupation: String,
    pub income_level: String,
    pub health_notes: String,
    pub product_interest: String,
    pub purchase_frequency: String,
    pub referral_source: String,
    pub wishes: String,
    pub notes: String,
    pub bonus_total: f64,
    pub current_balance: f64,
    pub has_completed_survey: bool,
    pub survey_date: String,
    pub created_at: String,
    pub account_status: String,
    pub user_status: String,
    pub requests_count: i64,
    pub requests_sum: f64,
    pub orders_count: i64,
    pub orders_sum: f64,
}

/// A row from the `bonus_ledger` table.
#[derive(Debug, Clone)]
pub struct DbLedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub bonus_total: f64,
    pub current_balance: f64,
    pub updated_at: String,
}

/// A row from the `tenant_balances` satellite table.
#[derive(Debug, Clone)]
pub struct DbTenantBalance {
    pub user_id: i64,
    pub tenant: String,
    pub balance: f64,
    pub account_status: Option<String>,
    pub user_status: Option<String>,
    pub updated_at: String,
}

/// A row from `catalog_requests` or `catalog_orders` (same shape).
#[derive(Debug, Clone, Default)]
pub struct DbCatalogEntry {
    pub id: i64,
    pub user_id: i64,
    pub item: String,
    pub amount: f64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `partners` roster.
#[derive(Debug, Clone, Default)]
pub struct DbPartner {
    pub user_id: i64,
    pub full_name: String,
    pub phone: String,
    pub city: String,
    pub status: String,
    pub joined_at: String,
    pub updated_at: String,
}

/// A row from the `investors` roster.
#[derive(Debug, Clone, Default)]
pub struct DbInvestor {
    pub user_id: i64,
    pub full_name: String,
    pub phone: String,
    pub invested_sum: f64,
    pub status: String,
    pub joined_at: String,
    pub updated_at: String,
}

/// Counters recorded when a sync run is finalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCounters {
    pub rows_seen: i64,
    pub merged: i64,
    pub skipped: i64,
    pub row_errors: i64,
    pub conflicts: i64,
    pub pushed_rows: i64,
}

/// A row from the `sync_runs` audit table.
#[derive(Debug, Clone)]
pub struct DbSyncRun {
    pub id: String,
    pub kind: String,
    pub tenant: String,
    pub status: String,
    pub rows_seen: i64,
    pub merged: i64,
    pub skipped: i64,
    pub row_errors: i64,
    pub conflicts: i64,
    pub pushed_rows: i64,
    pub source_digest: String,
    pub error_message: String,
    pub started_at: String,
    pub finished_at: String,
}
