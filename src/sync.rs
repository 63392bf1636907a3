//! The sync engine: pull, reconcile, aggregate, push.
//!
//! Every cycle walks a fixed phase sequence, and the push half always runs
//! the pull half first, so operator edits land in the store before the
//! store's state is written back out. A pull that fails or times out aborts
//! the cycle before any sheet mutation: the worksheet is never cleared or
//! rewritten on the strength of data we could not read.
//!
//! The engine owns no connection. Each database phase opens the shared store
//! fresh inside `spawn_blocking`, with the retry-on-locked open path, so a
//! cycle coexists with the bot processes writing to the same file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::{Config, Worksheets};
use crate::conflict::{detect_conflicts, FieldDiff};
use crate::db::catalog::CatalogTable;
use crate::db::{
    DbCatalogEntry, DbError, DbInvestor, DbPartner, ProfileDb, RunCounters,
};
use crate::error::SyncError;
use crate::export;
use crate::fields;
use crate::identity::{parse_identity, resolve_identity, HandleIndex};
use crate::reconcile;
use crate::rows::{resolve_profile_row, ExternalRow};
use crate::spreadsheet::SheetStore;

/// Where a cycle currently is, observable via [`SyncEngine::phase`].
///
/// `Failed` is entered from `PullingRemote` only. Errors in later phases
/// return the machine to `Idle`, because by then the local store already
/// holds the pulled truth and the next cycle can try the push again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CyclePhase {
    Idle,
    PullingRemote,
    Reconciling,
    Aggregating,
    PushingRemote,
    Failed,
}

/// The non-profile worksheets. They share the cycle shape: pull merges the
/// operator-editable status back into the store, push rewrites the worksheet
/// from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SecondarySheet {
    Requests,
    Orders,
    Partners,
    Investors,
}

impl SecondarySheet {
    pub const ALL: [SecondarySheet; 4] = [
        SecondarySheet::Requests,
        SecondarySheet::Orders,
        SecondarySheet::Partners,
        SecondarySheet::Investors,
    ];

    /// Run-audit kind, also the target label in a system report.
    pub fn kind(&self) -> &'static str {
        match self {
            SecondarySheet::Requests => "requests",
            SecondarySheet::Orders => "orders",
            SecondarySheet::Partners => "partners",
            SecondarySheet::Investors => "investors",
        }
    }

    fn worksheet<'a>(&self, worksheets: &'a Worksheets) -> &'a str {
        match self {
            SecondarySheet::Requests => &worksheets.requests,
            SecondarySheet::Orders => &worksheets.orders,
            SecondarySheet::Partners => &worksheets.partners,
            SecondarySheet::Investors => &worksheets.investors,
        }
    }
}

/// Everything a cycle needs: where the shared store lives, which document to
/// talk to, and which tenant this process is.
#[derive(Clone)]
pub struct SyncContext {
    pub db_path: PathBuf,
    pub sheets: Arc<dyn SheetStore>,
    pub tenant: String,
    pub worksheets: Worksheets,
    pub fetch_timeout: Duration,
}

impl SyncContext {
    pub fn from_config(config: &Config, sheets: Arc<dyn SheetStore>) -> Result<Self, SyncError> {
        let db_path = match &config.db_path {
            Some(path) => path.clone(),
            None => ProfileDb::default_path()?,
        };
        Ok(Self {
            db_path,
            sheets,
            tenant: config.tenant.clone(),
            worksheets: config.worksheets.clone(),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
        })
    }
}

/// Outcome of one completed cycle against one worksheet.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub kind: String,
    pub rows_seen: i64,
    pub merged: i64,
    pub skipped: i64,
    pub row_errors: i64,
    /// Field-level divergences observed just before the merge, keyed by
    /// identity. Observational only; the merge proceeded regardless.
    pub conflicts: HashMap<i64, Vec<FieldDiff>>,
    pub pushed_rows: i64,
    pub pull_ms: u64,
    pub push_ms: u64,
}

impl SyncReport {
    fn new(kind: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            rows_seen: 0,
            merged: 0,
            skipped: 0,
            row_errors: 0,
            conflicts: HashMap::new(),
            pushed_rows: 0,
            pull_ms: 0,
            push_ms: 0,
        }
    }

    fn absorb(&mut self, outcome: MergeOutcome) {
        self.rows_seen = outcome.rows_seen;
        self.merged = outcome.merged;
        self.skipped = outcome.skipped;
        self.row_errors = outcome.row_errors;
        self.conflicts = outcome.conflicts;
    }

    fn counters(&self) -> RunCounters {
        RunCounters {
            rows_seen: self.rows_seen,
            merged: self.merged,
            skipped: self.skipped,
            row_errors: self.row_errors,
            conflicts: self.conflicts.values().map(|v| v.len() as i64).sum(),
            pushed_rows: self.pushed_rows,
        }
    }
}

/// One target's outcome within a whole-system sync.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SyncReport>,
}

impl TargetReport {
    fn completed(target: &str, report: SyncReport) -> Self {
        Self {
            target: target.to_string(),
            status: "completed".to_string(),
            error: None,
            report: Some(report),
        }
    }

    fn failed(target: &str, err: &SyncError) -> Self {
        Self {
            target: target.to_string(),
            status: "failed".to_string(),
            error: Some(err.to_string()),
            report: None,
        }
    }
}

/// Aggregate outcome of [`SyncEngine::sync_all`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemSyncReport {
    pub targets: Vec<TargetReport>,
}

impl SystemSyncReport {
    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == name)
    }

    pub fn all_completed(&self) -> bool {
        self.targets.iter().all(|t| t.status == "completed")
    }
}

pub struct SyncEngine {
    ctx: SyncContext,
    /// Serializes cycles. `try_lock` rather than waiting: an overlapping
    /// trigger reports busy instead of queueing behind a slow pull.
    cycle_lock: tokio::sync::Mutex<()>,
    /// Never held across an await.
    phase: parking_lot::Mutex<CyclePhase>,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            cycle_lock: tokio::sync::Mutex::new(()),
            phase: parking_lot::Mutex::new(CyclePhase::Idle),
        }
    }

    /// The phase the engine is in, or the phase the last cycle stopped at.
    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock()
    }

    fn set_phase(&self, next: CyclePhase) {
        let mut guard = self.phase.lock();
        if *guard != next {
            log::debug!("sync phase {:?} -> {:?}", *guard, next);
            *guard = next;
        }
    }

    /// Open the shared store on a blocking thread and run `f` against it.
    /// Opens fresh per phase; the bots hold their own connections and the
    /// open path retries on busy/locked.
    async fn run_blocking<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&ProfileDb) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.ctx.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let db = ProfileDb::open_with_retry(path)?;
            f(&db)
        })
        .await
        .map_err(|e| SyncError::Join(e.to_string()))?
        .map_err(SyncError::from)
    }

    async fn start_run(&self, report: &SyncReport) -> Result<(), SyncError> {
        let id = report.run_id.clone();
        let kind = report.kind.clone();
        let tenant = self.ctx.tenant.clone();
        self.run_blocking(move |db| db.start_sync_run(&id, &kind, &tenant))
            .await
    }

    /// Finalize the audit row. A failure here is logged and swallowed; the
    /// cycle's own outcome stands.
    async fn finish_run(&self, report: &SyncReport, status: &str, digest: &str, error: &str) {
        let id = report.run_id.clone();
        let status_owned = status.to_string();
        let digest = digest.to_string();
        let error = error.to_string();
        let counters = report.counters();
        let outcome = self
            .run_blocking(move |db| {
                db.finish_sync_run(&id, &status_owned, &counters, &digest, &error)
            })
            .await;
        if let Err(e) = outcome {
            log::warn!("Failed to finalize sync run {}: {}", report.run_id, e);
        }
    }

    async fn fetch_rows(&self, worksheet: &str) -> Result<Vec<ExternalRow>, SyncError> {
        let fetch = self.ctx.sheets.fetch_rows(worksheet);
        match tokio::time::timeout(self.ctx.fetch_timeout, fetch).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(err)) => Err(SyncError::Sheet(err)),
            Err(_) => Err(SyncError::FetchTimeout(self.ctx.fetch_timeout.as_secs())),
        }
    }

    /// The pull half for the profile worksheet: open the audit row, fetch,
    /// reconcile. Returns the source digest for the final audit write.
    ///
    /// The audit row is opened before the fetch so an aborted pull still
    /// leaves a `failed` trail.
    async fn pull_profiles_into(&self, report: &mut SyncReport) -> Result<String, SyncError> {
        let worksheet = self.ctx.worksheets.profiles.clone();
        self.start_run(report).await?;

        self.set_phase(CyclePhase::PullingRemote);
        let started = Instant::now();
        let rows = match self.fetch_rows(&worksheet).await {
            Ok(rows) => rows,
            Err(err) => {
                self.set_phase(CyclePhase::Failed);
                log::error!("Pull of '{}' failed: {}", worksheet, err);
                self.finish_run(report, "failed", "", &err.to_string()).await;
                return Err(err);
            }
        };
        report.pull_ms = started.elapsed().as_millis() as u64;
        let digest = digest_rows(&rows);
        log::info!(
            "Pulled {} row(s) from '{}' in {}ms",
            rows.len(),
            worksheet,
            report.pull_ms
        );

        self.set_phase(CyclePhase::Reconciling);
        let tenant = self.ctx.tenant.clone();
        let outcome = self
            .run_blocking(move |db| reconcile_profile_rows(db, &tenant, &rows))
            .await;
        match outcome {
            Ok(merge) => {
                report.absorb(merge);
                Ok(digest)
            }
            Err(err) => {
                // Store-level failure; per-row errors were already absorbed
                // into the counters inside the loop.
                log::error!("Reconcile failed: {}", err);
                self.finish_run(report, "failed", &digest, &err.to_string())
                    .await;
                self.set_phase(CyclePhase::Idle);
                Err(err)
            }
        }
    }

    /// Pull the profile worksheet and merge it into the shared store,
    /// without touching the sheet.
    pub async fn pull_and_merge_profiles(&self) -> Result<SyncReport, SyncError> {
        let _cycle = self
            .cycle_lock
            .try_lock()
            .map_err(|_| SyncError::CycleBusy)?;
        let mut report = SyncReport::new("profile_pull");

        let digest = self.pull_profiles_into(&mut report).await?;
        log::info!(
            "Merged {}/{} profile row(s) ({} skipped, {} error(s), {} conflicted)",
            report.merged,
            report.rows_seen,
            report.skipped,
            report.row_errors,
            report.conflicts.len()
        );
        self.finish_run(&report, "completed", &digest, "").await;
        self.set_phase(CyclePhase::Idle);
        Ok(report)
    }

    /// Full profile cycle: pull first, unconditionally, then aggregate the
    /// merged per-tenant view and rewrite the worksheet from row one.
    pub async fn push_profiles(&self) -> Result<SyncReport, SyncError> {
        let _cycle = self
            .cycle_lock
            .try_lock()
            .map_err(|_| SyncError::CycleBusy)?;
        let mut report = SyncReport::new("profile_push");

        let digest = self.pull_profiles_into(&mut report).await?;

        self.set_phase(CyclePhase::Aggregating);
        let tenant = self.ctx.tenant.clone();
        let profiles = self
            .run_blocking(move |db| {
                db.refresh_profile_aggregates()?;
                db.read_merged_all(&tenant)
            })
            .await;
        let profiles = match profiles {
            Ok(profiles) => profiles,
            Err(err) => {
                log::error!("Aggregation failed: {}", err);
                self.finish_run(&report, "failed", &digest, &err.to_string())
                    .await;
                self.set_phase(CyclePhase::Idle);
                return Err(err);
            }
        };

        self.set_phase(CyclePhase::PushingRemote);
        let started = Instant::now();
        let mut data: Vec<Vec<String>> = Vec::with_capacity(profiles.len() + 1);
        data.push(export::header_row());
        for profile in &profiles {
            data.push(export::format_profile_row(profile));
        }

        let worksheet = self.ctx.worksheets.profiles.clone();
        if let Err(err) = self.replace_worksheet(&worksheet, data).await {
            log::error!("Push of '{}' failed: {}", worksheet, err);
            self.finish_run(&report, "failed", &digest, &err.to_string())
                .await;
            self.set_phase(CyclePhase::Idle);
            return Err(err);
        }
        report.push_ms = started.elapsed().as_millis() as u64;
        report.pushed_rows = profiles.len() as i64;
        log::info!(
            "Pushed {} profile row(s) to '{}' for tenant {} in {}ms",
            report.pushed_rows,
            worksheet,
            self.ctx.tenant,
            report.push_ms
        );

        self.finish_run(&report, "completed", &digest, "").await;
        self.set_phase(CyclePhase::Idle);
        Ok(report)
    }

    /// One secondary worksheet cycle. Same shape as the profile cycle, with
    /// a status-only merge on pull and a full rewrite on push.
    pub async fn sync_secondary(&self, sheet: SecondarySheet) -> Result<SyncReport, SyncError> {
        let _cycle = self
            .cycle_lock
            .try_lock()
            .map_err(|_| SyncError::CycleBusy)?;
        let mut report = SyncReport::new(sheet.kind());
        let worksheet = sheet.worksheet(&self.ctx.worksheets).to_string();
        self.start_run(&report).await?;

        self.set_phase(CyclePhase::PullingRemote);
        let started = Instant::now();
        let rows = match self.fetch_rows(&worksheet).await {
            Ok(rows) => rows,
            Err(err) => {
                self.set_phase(CyclePhase::Failed);
                log::error!("Pull of '{}' failed: {}", worksheet, err);
                self.finish_run(&report, "failed", "", &err.to_string()).await;
                return Err(err);
            }
        };
        report.pull_ms = started.elapsed().as_millis() as u64;
        let digest = digest_rows(&rows);

        self.set_phase(CyclePhase::Reconciling);
        let outcome = self
            .run_blocking(move |db| reconcile_secondary_rows(db, sheet, &rows))
            .await;
        match outcome {
            Ok(merge) => report.absorb(merge),
            Err(err) => {
                log::error!("Reconcile of '{}' failed: {}", worksheet, err);
                self.finish_run(&report, "failed", &digest, &err.to_string())
                    .await;
                self.set_phase(CyclePhase::Idle);
                return Err(err);
            }
        }

        self.set_phase(CyclePhase::PushingRemote);
        let started = Instant::now();
        let data = match self
            .run_blocking(move |db| export_secondary_rows(db, sheet))
            .await
        {
            Ok(data) => data,
            Err(err) => {
                log::error!("Export of '{}' failed: {}", worksheet, err);
                self.finish_run(&report, "failed", &digest, &err.to_string())
                    .await;
                self.set_phase(CyclePhase::Idle);
                return Err(err);
            }
        };
        let data_rows = (data.len() as i64) - 1;
        if let Err(err) = self.replace_worksheet(&worksheet, data).await {
            log::error!("Push of '{}' failed: {}", worksheet, err);
            self.finish_run(&report, "failed", &digest, &err.to_string())
                .await;
            self.set_phase(CyclePhase::Idle);
            return Err(err);
        }
        report.push_ms = started.elapsed().as_millis() as u64;
        report.pushed_rows = data_rows;
        log::info!(
            "Synced '{}': {} merged, {} pushed",
            worksheet,
            report.merged,
            report.pushed_rows
        );

        self.finish_run(&report, "completed", &digest, "").await;
        self.set_phase(CyclePhase::Idle);
        Ok(report)
    }

    /// Whole-system sync: the profile cycle first, then every secondary
    /// sheet in turn. A failed target is recorded and the remaining targets
    /// still run; nothing rolls back a completed profile sync.
    pub async fn sync_all(&self) -> SystemSyncReport {
        let mut targets = Vec::with_capacity(1 + SecondarySheet::ALL.len());

        targets.push(match self.push_profiles().await {
            Ok(report) => TargetReport::completed("profiles", report),
            Err(err) => {
                log::error!("Profile sync failed: {}", err);
                TargetReport::failed("profiles", &err)
            }
        });

        for sheet in SecondarySheet::ALL {
            targets.push(match self.sync_secondary(sheet).await {
                Ok(report) => TargetReport::completed(sheet.kind(), report),
                Err(err) => {
                    log::error!("{} sync failed: {}", sheet.kind(), err);
                    TargetReport::failed(sheet.kind(), &err)
                }
            });
        }

        SystemSyncReport { targets }
    }

    /// Clear the worksheet, then write the full grid starting at A1. The
    /// clear-first order means a crash between the two calls leaves an empty
    /// sheet rather than a stale tail below fresh rows.
    async fn replace_worksheet(
        &self,
        worksheet: &str,
        data: Vec<Vec<String>>,
    ) -> Result<(), SyncError> {
        self.ctx
            .sheets
            .clear(worksheet)
            .await
            .map_err(SyncError::Sheet)?;
        self.ctx
            .sheets
            .write_range(worksheet, "A1", data)
            .await
            .map_err(SyncError::Sheet)?;
        Ok(())
    }
}

/// Counters and conflicts from one reconcile pass.
#[derive(Default)]
struct MergeOutcome {
    rows_seen: i64,
    merged: i64,
    skipped: i64,
    row_errors: i64,
    conflicts: HashMap<i64, Vec<FieldDiff>>,
}

/// Merge every pulled profile row into the shared store and write the
/// balance and statuses through to this tenant's satellite row, so the next
/// push exports what the operator entered rather than the satellite
/// defaults. Row failures are absorbed into the counters; only store-level
/// failures abort the pass.
fn reconcile_profile_rows(
    db: &ProfileDb,
    tenant: &str,
    rows: &[ExternalRow],
) -> Result<MergeOutcome, DbError> {
    // Handle fallback resolves against the store state from before this
    // cycle, so a row that renames a handle cannot capture later rows in
    // the same batch.
    let handles = HandleIndex::build(&db.handle_entries()?);

    let mut outcome = MergeOutcome::default();
    for row in rows {
        outcome.rows_seen += 1;
        if row.is_blank() {
            outcome.skipped += 1;
            continue;
        }
        let Some(user_id) = resolve_identity(row, &handles) else {
            outcome.skipped += 1;
            continue;
        };

        match db.get_profile(user_id) {
            Ok(Some(existing)) => {
                let diffs = detect_conflicts(&existing, row);
                if !diffs.is_empty() {
                    log::info!(
                        "{} field(s) diverged for {} before merge: {}",
                        diffs.len(),
                        user_id,
                        diffs
                            .iter()
                            .map(|d| d.field.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    outcome.conflicts.insert(user_id, diffs);
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("Failed to load profile {}: {}", user_id, err);
                outcome.row_errors += 1;
                continue;
            }
        }

        let resolved = resolve_profile_row(row);
        let applied = reconcile::apply_row(db, user_id, &resolved).and_then(|_| {
            db.ensure_tenant_row(user_id, tenant)?;
            db.write_isolated(
                user_id,
                tenant,
                resolved.current_balance,
                &resolved.account_status,
                &resolved.user_status,
            )
        });
        match applied {
            Ok(()) => outcome.merged += 1,
            Err(err) => {
                log::warn!("Failed to reconcile row for {}: {}", user_id, err);
                outcome.row_errors += 1;
            }
        }
    }

    Ok(outcome)
}

/// Merge one secondary worksheet's rows. Only the operator-editable status
/// column survives into an existing store row; everything else is bot-owned.
fn reconcile_secondary_rows(
    db: &ProfileDb,
    sheet: SecondarySheet,
    rows: &[ExternalRow],
) -> Result<MergeOutcome, DbError> {
    let mut outcome = MergeOutcome::default();
    for row in rows {
        outcome.rows_seen += 1;
        if row.is_blank() {
            outcome.skipped += 1;
            continue;
        }
        let applied = match sheet {
            SecondarySheet::Requests => apply_catalog_row(db, CatalogTable::Requests, row),
            SecondarySheet::Orders => apply_catalog_row(db, CatalogTable::Orders, row),
            SecondarySheet::Partners => apply_partner_row(db, row),
            SecondarySheet::Investors => apply_investor_row(db, row),
        };
        match applied {
            Ok(true) => outcome.merged += 1,
            Ok(false) => outcome.skipped += 1,
            Err(err) => {
                log::warn!("Failed to reconcile {} row: {}", sheet.kind(), err);
                outcome.row_errors += 1;
            }
        }
    }

    // Catalog edits feed the packed counters on the profile sheet.
    if matches!(sheet, SecondarySheet::Requests | SecondarySheet::Orders) {
        db.refresh_profile_aggregates()?;
    }

    Ok(outcome)
}

/// A blank or unparseable status cell reads as the store default rather
/// than blanking a bot-written one.
fn status_or_default(raw: String) -> String {
    if raw.trim().is_empty() {
        "new".to_string()
    } else {
        raw.trim().to_string()
    }
}

fn apply_catalog_row(
    db: &ProfileDb,
    table: CatalogTable,
    row: &ExternalRow,
) -> Result<bool, DbError> {
    let key = match table {
        CatalogTable::Requests => &fields::REQUEST_NUMBER,
        CatalogTable::Orders => &fields::ORDER_NUMBER,
    };
    let Some(id) = parse_identity(&key.resolve(row)).filter(|id| *id > 0) else {
        return Ok(false);
    };
    let entry = DbCatalogEntry {
        id,
        user_id: parse_identity(&fields::IDENTITY.resolve(row)).unwrap_or(0),
        item: fields::ITEM.resolve(row),
        amount: fields::AMOUNT.resolve_money(row),
        status: status_or_default(fields::ENTRY_STATUS.resolve(row)),
        created_at: fields::ENTRY_DATE.resolve(row),
        updated_at: String::new(),
    };
    db.upsert_catalog_entry(table, &entry)?;
    Ok(true)
}

fn apply_partner_row(db: &ProfileDb, row: &ExternalRow) -> Result<bool, DbError> {
    let Some(user_id) = parse_identity(&fields::IDENTITY.resolve(row)).filter(|id| *id > 0) else {
        return Ok(false);
    };
    let partner = DbPartner {
        user_id,
        full_name: fields::ROSTER_NAME.resolve(row),
        phone: fields::ROSTER_PHONE.resolve(row),
        city: fields::ROSTER_CITY.resolve(row),
        status: status_or_default(fields::ENTRY_STATUS.resolve(row)),
        joined_at: fields::ROSTER_JOINED.resolve(row),
        updated_at: String::new(),
    };
    db.upsert_partner(&partner)?;
    Ok(true)
}

fn apply_investor_row(db: &ProfileDb, row: &ExternalRow) -> Result<bool, DbError> {
    let Some(user_id) = parse_identity(&fields::IDENTITY.resolve(row)).filter(|id| *id > 0) else {
        return Ok(false);
    };
    let investor = DbInvestor {
        user_id,
        full_name: fields::ROSTER_NAME.resolve(row),
        phone: fields::ROSTER_PHONE.resolve(row),
        invested_sum: fields::INVESTED_SUM.resolve_money(row),
        status: status_or_default(fields::ENTRY_STATUS.resolve(row)),
        joined_at: fields::ROSTER_JOINED.resolve(row),
        updated_at: String::new(),
    };
    db.upsert_investor(&investor)?;
    Ok(true)
}

/// Header plus every store row, formatted for the worksheet.
fn export_secondary_rows(
    db: &ProfileDb,
    sheet: SecondarySheet,
) -> Result<Vec<Vec<String>>, DbError> {
    let mut data: Vec<Vec<String>> = Vec::new();
    match sheet {
        SecondarySheet::Requests => {
            data.push(export::REQUESTS_COLUMNS.iter().map(|c| c.to_string()).collect());
            for entry in db.list_catalog_entries(CatalogTable::Requests)? {
                data.push(export::format_catalog_row(&entry));
            }
        }
        SecondarySheet::Orders => {
            data.push(export::ORDERS_COLUMNS.iter().map(|c| c.to_string()).collect());
            for entry in db.list_catalog_entries(CatalogTable::Orders)? {
                data.push(export::format_catalog_row(&entry));
            }
        }
        SecondarySheet::Partners => {
            data.push(export::PARTNERS_COLUMNS.iter().map(|c| c.to_string()).collect());
            for partner in db.list_partners()? {
                data.push(export::format_partner_row(&partner));
            }
        }
        SecondarySheet::Investors => {
            data.push(export::INVESTORS_COLUMNS.iter().map(|c| c.to_string()).collect());
            for investor in db.list_investors()? {
                data.push(export::format_investor_row(&investor));
            }
        }
    }
    Ok(data)
}

/// Content digest of the pulled rows, recorded with the run audit. Key,
/// value, and row boundaries are delimited so shifted cells cannot collide
/// with an equal concatenation.
fn digest_rows(rows: &[ExternalRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        for (key, value) in row.iter() {
            hasher.update(key.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
            hasher.update([0x1e]);
        }
        hasher.update([0x1d]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::ResolvedRow;
    use crate::spreadsheet::{rows_from_grid, SheetError};
    use std::collections::HashSet;

    fn grid(cells: &[&[&str]]) -> Vec<Vec<String>> {
        cells
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[derive(Default)]
    struct FakeSheets {
        grids: parking_lot::Mutex<HashMap<String, Vec<Vec<String>>>>,
        writes: parking_lot::Mutex<HashMap<String, Vec<Vec<String>>>>,
        fail_fetch: parking_lot::Mutex<HashSet<String>>,
        fetch_delay: parking_lot::Mutex<Option<Duration>>,
        calls: parking_lot::Mutex<Vec<String>>,
    }

    impl FakeSheets {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn seed(&self, worksheet: &str, grid: Vec<Vec<String>>) {
            self.grids.lock().insert(worksheet.to_string(), grid);
        }

        fn fail(&self, worksheet: &str) {
            self.fail_fetch.lock().insert(worksheet.to_string());
        }

        fn delay(&self, delay: Duration) {
            *self.fetch_delay.lock() = Some(delay);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn mutation_calls(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with("clear") || c.starts_with("write"))
                .collect()
        }

        fn written(&self, worksheet: &str) -> Option<Vec<Vec<String>>> {
            self.writes.lock().get(worksheet).cloned()
        }
    }

    #[async_trait::async_trait]
    impl SheetStore for FakeSheets {
        async fn fetch_rows(&self, worksheet: &str) -> Result<Vec<ExternalRow>, SheetError> {
            self.calls.lock().push(format!("fetch:{worksheet}"));
            let delay = *self.fetch_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_fetch.lock().contains(worksheet) {
                return Err(SheetError::Api {
                    status: 500,
                    message: "backend error".to_string(),
                });
            }
            let grid = self.grids.lock().get(worksheet).cloned().unwrap_or_default();
            Ok(rows_from_grid(grid))
        }

        async fn clear(&self, worksheet: &str) -> Result<(), SheetError> {
            self.calls.lock().push(format!("clear:{worksheet}"));
            Ok(())
        }

        async fn write_range(
            &self,
            worksheet: &str,
            top_left: &str,
            rows: Vec<Vec<String>>,
        ) -> Result<(), SheetError> {
            self.calls
                .lock()
                .push(format!("write:{worksheet}@{top_left}"));
            self.writes.lock().insert(worksheet.to_string(), rows);
            Ok(())
        }
    }

    fn engine_with_timeout(
        sheets: Arc<FakeSheets>,
        fetch_timeout: Duration,
    ) -> (SyncEngine, ProfileDb) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("profiles.db");
        std::mem::forget(dir);
        let db = ProfileDb::open_at(db_path.clone()).expect("open test db");
        let ctx = SyncContext {
            db_path,
            sheets,
            tenant: "shop-a".to_string(),
            worksheets: Worksheets::default(),
            fetch_timeout,
        };
        (SyncEngine::new(ctx), db)
    }

    fn engine_with(sheets: Arc<FakeSheets>) -> (SyncEngine, ProfileDb) {
        engine_with_timeout(sheets, Duration::from_secs(5))
    }

    fn run_row(db: &ProfileDb, run_id: &str) -> (String, String, i64) {
        db.conn_ref()
            .query_row(
                "SELECT status, error_message, pushed_rows FROM sync_runs WHERE id = ?1",
                [run_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .expect("run row")
    }

    #[tokio::test]
    async fn test_failed_pull_never_touches_the_sheet() {
        let sheets = FakeSheets::new();
        sheets.fail("Анкеты");
        let (engine, db) = engine_with(sheets.clone());

        let result = engine.push_profiles().await;
        assert!(result.is_err());
        assert!(
            sheets.mutation_calls().is_empty(),
            "a failed pull must never clear or rewrite the sheet"
        );
        assert_eq!(engine.phase(), CyclePhase::Failed);

        let (status, error): (String, String) = db
            .conn_ref()
            .query_row(
                "SELECT status, error_message FROM sync_runs",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("audit row");
        assert_eq!(status, "failed");
        assert!(error.contains("500"), "error was: {error}");
    }

    #[tokio::test]
    async fn test_fetch_timeout_aborts_before_any_mutation() {
        let sheets = FakeSheets::new();
        sheets.delay(Duration::from_millis(200));
        let (engine, _db) = engine_with_timeout(sheets.clone(), Duration::from_millis(20));

        let result = engine.push_profiles().await;
        assert!(matches!(result, Err(SyncError::FetchTimeout(_))));
        assert!(sheets.mutation_calls().is_empty());
        assert_eq!(engine.phase(), CyclePhase::Failed);
    }

    #[tokio::test]
    async fn test_pull_merges_numeric_identity_and_money() {
        let sheets = FakeSheets::new();
        sheets.seed(
            "Анкеты",
            grid(&[
                &["19. ID подписчика в магазине", "13. ИТОГО начислено бонусов"],
                &["100.0", "5"],
            ]),
        );
        let (engine, db) = engine_with(sheets);

        let report = engine.pull_and_merge_profiles().await.expect("pull");
        assert_eq!(report.rows_seen, 1);
        assert_eq!(report.merged, 1);
        assert!(report.conflicts.is_empty());
        assert_eq!(engine.phase(), CyclePhase::Idle);

        let profile = db.get_profile(100).expect("query").expect("merged row");
        assert_eq!(profile.bonus_total, 5.0);
        assert!(!profile.has_completed_survey);

        // The satellite row was written for this tenant; the sheet carried
        // no balance column, so it reads zero.
        let satellite = db
            .get_tenant_balance(100, "shop-a")
            .expect("query")
            .expect("ensured row");
        assert_eq!(satellite.balance, 0.0);

        let (status, _, _) = run_row(&db, &report.run_id);
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn test_divergent_field_is_reported_and_overwritten() {
        let sheets = FakeSheets::new();
        sheets.seed(
            "Анкеты",
            grid(&[
                &["19. ID подписчика в магазине", "3. Город"],
                &["100", "Казань"],
            ]),
        );
        let (engine, db) = engine_with(sheets);
        let seeded = ResolvedRow {
            city: "Москва".to_string(),
            account_status: "Работа".to_string(),
            user_status: "new".to_string(),
            ..ResolvedRow::default()
        };
        reconcile::apply_row(&db, 100, &seeded).expect("seed profile");

        let report = engine.pull_and_merge_profiles().await.expect("pull");
        let diffs = report.conflicts.get(&100).expect("conflict for 100");
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field, "city");
        assert_eq!(diffs[0].local, "Москва");
        assert_eq!(diffs[0].incoming, "Казань");

        // Reporting is observational; the sheet still won.
        let profile = db.get_profile(100).expect("query").expect("row");
        assert_eq!(profile.city, "Казань");
    }

    #[tokio::test]
    async fn test_pulled_balance_and_status_survive_the_push() {
        let sheets = FakeSheets::new();
        sheets.seed(
            "Анкеты",
            grid(&[
                &[
                    "19. ID подписчика в магазине",
                    "Текущий баланс",
                    "Статус аккаунта",
                    "Статус пользователя",
                ],
                &["100", "500", "Блокировка", "completed"],
            ]),
        );
        let (engine, db) = engine_with(sheets.clone());

        engine.push_profiles().await.expect("push");

        // The pull landed the operator's edits in this tenant's satellite
        // row, not just the shared profile.
        let satellite = db
            .get_tenant_balance(100, "shop-a")
            .expect("query")
            .expect("row");
        assert_eq!(satellite.balance, 500.0);
        assert_eq!(satellite.account_status.as_deref(), Some("Блокировка"));
        assert_eq!(satellite.user_status.as_deref(), Some("completed"));

        // The push half of the same cycle exports them back unchanged.
        let written = sheets.written("Анкеты").expect("written grid");
        assert_eq!(written[1][17], "500", "balance cell must not revert");
        assert_eq!(written[1][22], "Блокировка", "account status must not revert");
        assert_eq!(written[1][23], "completed");
    }

    #[tokio::test]
    async fn test_duplicate_identity_last_row_wins() {
        let sheets = FakeSheets::new();
        sheets.seed(
            "Анкеты",
            grid(&[
                &["19. ID подписчика в магазине", "3. Город"],
                &["100", "Казань"],
                &["100", "Сочи"],
            ]),
        );
        let (engine, db) = engine_with(sheets);

        let report = engine.pull_and_merge_profiles().await.expect("pull");
        assert_eq!(report.merged, 2);

        let profile = db.get_profile(100).expect("query").expect("row");
        assert_eq!(profile.city, "Сочи");
    }

    #[tokio::test]
    async fn test_handle_fallback_uses_the_precycle_snapshot() {
        let sheets = FakeSheets::new();
        sheets.seed(
            "Анкеты",
            grid(&[
                &["19. ID подписчика в магазине", "Ник в Telegram", "3. Город"],
                // Known handle, no id cell.
                &["", " @NICK ", "Казань"],
                // This row introduces a brand-new handle...
                &["200", "fresh", "Москва"],
                // ...which must not resolve later rows in the same batch.
                &["", "fresh", "Сочи"],
            ]),
        );
        let (engine, db) = engine_with(sheets);
        let seeded = ResolvedRow {
            username: "nick".to_string(),
            account_status: "Работа".to_string(),
            user_status: "new".to_string(),
            ..ResolvedRow::default()
        };
        reconcile::apply_row(&db, 55, &seeded).expect("seed profile");

        let report = engine.pull_and_merge_profiles().await.expect("pull");
        assert_eq!(report.merged, 2);
        assert_eq!(report.skipped, 1);

        let known = db.get_profile(55).expect("query").expect("row");
        assert_eq!(known.city, "Казань");
        let fresh = db.get_profile(200).expect("query").expect("row");
        assert_eq!(fresh.city, "Москва", "the handle-only row must not have merged");
    }

    #[tokio::test]
    async fn test_push_rewrites_header_and_rows_in_order() {
        let sheets = FakeSheets::new();
        let (engine, db) = engine_with(sheets.clone());
        let anna = ResolvedRow {
            full_name: "Анна".to_string(),
            bonus_total: 350.5,
            account_status: "Работа".to_string(),
            user_status: "active".to_string(),
            ..ResolvedRow::default()
        };
        reconcile::apply_row(&db, 101, &anna).expect("seed");
        let ivan = ResolvedRow {
            full_name: "Иван".to_string(),
            account_status: "Работа".to_string(),
            user_status: "new".to_string(),
            ..ResolvedRow::default()
        };
        reconcile::apply_row(&db, 100, &ivan).expect("seed");

        let report = engine.push_profiles().await.expect("push");
        assert_eq!(report.pushed_rows, 2);
        assert_eq!(engine.phase(), CyclePhase::Idle);

        assert_eq!(
            sheets.calls(),
            vec!["fetch:Анкеты", "clear:Анкеты", "write:Анкеты@A1"],
            "pull, then clear, then a single rewrite"
        );
        let written = sheets.written("Анкеты").expect("written grid");
        assert_eq!(written.len(), 3);
        assert_eq!(written[0], export::header_row());
        // Ordered by identity: 100 before 101.
        assert_eq!(written[1][18], "100");
        assert_eq!(written[2][18], "101");
        assert_eq!(written[2][1], "Анна");
        assert_eq!(written[2][12], "350.5");

        let (status, _, pushed) = run_row(&db, &report.run_id);
        assert_eq!(status, "completed");
        assert_eq!(pushed, 2);
    }

    #[tokio::test]
    async fn test_secondary_cycle_merges_status_and_preserves_bot_fields() {
        let sheets = FakeSheets::new();
        sheets.seed(
            "Заявки",
            grid(&[
                &["№ заявки", "ID подписчика", "Товар", "Сумма", "Статус", "Дата создания"],
                &["7", "100", "Набор", "450", "оплачен", "07.03.2024"],
            ]),
        );
        let (engine, db) = engine_with(sheets.clone());
        reconcile::apply_row(&db, 100, &ResolvedRow::default()).expect("seed profile");
        let entry = DbCatalogEntry {
            id: 7,
            user_id: 100,
            item: "Набор".to_string(),
            amount: 999.0,
            status: "new".to_string(),
            ..DbCatalogEntry::default()
        };
        db.upsert_catalog_entry(CatalogTable::Requests, &entry)
            .expect("seed request");

        let report = engine
            .sync_secondary(SecondarySheet::Requests)
            .await
            .expect("cycle");
        assert_eq!(report.merged, 1);
        assert_eq!(report.pushed_rows, 1);

        // Operator status won; the bot-owned amount did not.
        let entries = db
            .list_catalog_entries(CatalogTable::Requests)
            .expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, "оплачен");
        assert_eq!(entries[0].amount, 999.0);

        let written = sheets.written("Заявки").expect("written grid");
        assert_eq!(written[0][0], "№ заявки");
        assert_eq!(written[1][3], "999");

        // Catalog changes refreshed the packed counters on the profile.
        let profile = db.get_profile(100).expect("query").expect("row");
        assert_eq!(profile.requests_count, 1);
        assert_eq!(profile.requests_sum, 999.0);
    }

    #[tokio::test]
    async fn test_roster_cycle_round_trips_partners() {
        let sheets = FakeSheets::new();
        sheets.seed(
            "Партнёры",
            grid(&[
                &["ID подписчика", "ФИО", "Телефон", "Город", "Статус", "Дата вступления"],
                &["300.0", "Мария", "+7 900 000-00-00", "Казань", "", "01.02.2024"],
            ]),
        );
        let (engine, db) = engine_with(sheets.clone());

        let report = engine
            .sync_secondary(SecondarySheet::Partners)
            .await
            .expect("cycle");
        assert_eq!(report.merged, 1);

        let partners = db.list_partners().expect("list");
        assert_eq!(partners.len(), 1);
        assert_eq!(partners[0].user_id, 300);
        assert_eq!(partners[0].full_name, "Мария");
        assert_eq!(partners[0].status, "new", "blank status falls back to the default");

        let written = sheets.written("Партнёры").expect("written grid");
        assert_eq!(written.len(), 2);
        assert_eq!(written[1][0], "300");
    }

    #[tokio::test]
    async fn test_sync_all_isolates_a_secondary_failure() {
        let sheets = FakeSheets::new();
        sheets.fail("Заявки");
        let (engine, _db) = engine_with(sheets);

        let system = engine.sync_all().await;
        assert_eq!(system.targets.len(), 5);
        assert!(!system.all_completed());

        let profiles = system.target("profiles").expect("profiles target");
        assert_eq!(profiles.status, "completed");
        let requests = system.target("requests").expect("requests target");
        assert_eq!(requests.status, "failed");
        assert!(requests.error.as_deref().is_some_and(|e| e.contains("500")));
        for name in ["orders", "partners", "investors"] {
            let target = system.target(name).expect("target");
            assert_eq!(target.status, "completed", "{name} should still have run");
        }
    }

    #[test]
    fn test_digest_rows_is_stable_and_value_sensitive() {
        let a = rows_from_grid(grid(&[&["ID"], &["1"]]));
        let b = rows_from_grid(grid(&[&["ID"], &["1"]]));
        let c = rows_from_grid(grid(&[&["ID"], &["2"]]));
        assert_eq!(digest_rows(&a), digest_rows(&b));
        assert_ne!(digest_rows(&a), digest_rows(&c));
        assert_eq!(digest_rows(&a).len(), 64);
    }
}
