//! Error types for sync cycles.
//!
//! Errors are classified by recoverability:
//! - Transient: lock contention, timeouts, rate limits. The next scheduled
//!   cycle may simply succeed.
//! - Persistent: configuration, schema, revoked auth. Retrying without an
//!   operator fixing something will fail the same way.

use thiserror::Error;

use crate::db::DbError;
use crate::spreadsheet::SheetError;

#[derive(Debug, Error)]
pub enum SyncError {
    // Transient errors
    #[error("Profile store is busy: {0}")]
    DbBusy(String),

    #[error("Sheet fetch timed out after {0} seconds")]
    FetchTimeout(u64),

    #[error("Sync cycle already running")]
    CycleBusy,

    // Carried through from the collaborators
    #[error("Spreadsheet error: {0}")]
    Sheet(#[from] SheetError),

    #[error("Database error: {0}")]
    Db(DbError),

    // Persistent errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl SyncError {
    /// Returns true when waiting for the next scheduled cycle is a
    /// reasonable recovery.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::DbBusy(_) | SyncError::FetchTimeout(_) | SyncError::CycleBusy => true,
            SyncError::Sheet(err) => matches!(
                err,
                SheetError::Timeout
                    | SheetError::Transport(_)
                    | SheetError::Api {
                        status: 429 | 500..=599,
                        ..
                    }
            ),
            _ => false,
        }
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        // Lock contention from a sibling bot process clears on its own;
        // everything else is a real failure.
        if err.is_locked() {
            SyncError::DbBusy(err.to_string())
        } else {
            SyncError::Db(err)
        }
    }
}
