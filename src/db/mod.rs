//! SQLite-backed profile store shared across bot processes.
//!
//! The database lives at `~/.sheetsync/profiles.db` and is the system of
//! record for subscriber profiles, bonus history, and per-tenant balances.
//! Several independently-deployed bot processes open the same file, so every
//! open path enables WAL and a busy timeout, and writers that need multi-step
//! consistency go through `with_transaction` (BEGIN IMMEDIATE).

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;

pub mod types;
pub use types::*;

pub mod catalog;
pub mod ledger;
pub mod profiles;
pub mod runs;
pub mod tenants;

/// How many times `open_with_retry` attempts to open a contended database.
const OPEN_ATTEMPTS: u32 = 3;

/// Fixed delay between open attempts when SQLite reports busy/locked.
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct ProfileDb {
    conn: Connection,
}

impl ProfileDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&Self) -> Result<T, String>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| format!("Failed to begin transaction: {e}"))?;
        match f(self) {
            Ok(val) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| format!("Failed to commit transaction: {e}"))?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.sheetsync/profiles.db` and apply
    /// pending migrations.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets the bots keep reading while a sync cycle writes; the busy
        // timeout covers short lock windows without surfacing SQLITE_BUSY.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        Ok(Self { conn })
    }

    /// Open with retries for a database another process is holding locked.
    ///
    /// Up to three attempts with a fixed two-second pause between them. Only
    /// busy/locked failures are retried; anything else (corruption, missing
    /// parent, schema mismatch) fails on the first attempt.
    pub fn open_with_retry(path: PathBuf) -> Result<Self, DbError> {
        let mut last_err: Option<DbError> = None;

        for attempt in 1..=OPEN_ATTEMPTS {
            match Self::open_at(path.clone()) {
                Ok(db) => return Ok(db),
                Err(e) if e.is_locked() => {
                    log::warn!(
                        "Profile DB locked (attempt {}/{}): {}",
                        attempt,
                        OPEN_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                    if attempt < OPEN_ATTEMPTS {
                        std::thread::sleep(OPEN_RETRY_DELAY);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(DbError::HomeDirNotFound))
    }

    /// Resolve the default database path: `~/.sheetsync/profiles.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".sheetsync").join("profiles.db"))
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::ProfileDb;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the
    /// test. Test temp dirs are cleaned up by the OS.
    pub fn test_db() -> ProfileDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        ProfileDb::open_at(path).expect("Failed to open test database")
    }
}
