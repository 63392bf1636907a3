//! Reconciliation between a shared SQLite profile store and an
//! operator-edited Google Sheets document.
//!
//! Several independently-deployed bot processes write the store; operators
//! edit the spreadsheet. Each cycle pulls the sheet, merges it into the
//! store under last-write-wins, aggregates the per-tenant view, and pushes
//! it back out from row one. [`sync::SyncEngine`] is the entry point;
//! `bin/run_sync` drives it once or on a schedule.

pub mod config;
pub mod conflict;
pub mod db;
mod error;
pub mod export;
pub mod fields;
pub mod google_api;
pub mod identity;
mod migrations;
pub mod reconcile;
pub mod rows;
pub mod spreadsheet;
pub mod sync;

pub use error::SyncError;
