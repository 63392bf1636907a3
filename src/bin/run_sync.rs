//! Command-line entry point.
//!
//! `run_sync --once` executes a single whole-system sync and prints the
//! report as JSON. Without the flag it runs forever, firing a sync at each
//! tick of the configured cron schedule.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;

use sheetsync::config::{load_config, Config};
use sheetsync::google_api::sheets::SheetsClient;
use sheetsync::sync::{SyncContext, SyncEngine, SystemSyncReport};
use sheetsync::SyncError;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let once = std::env::args().any(|arg| arg == "--once");

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            log::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if once {
        run_once(&engine).await
    } else {
        run_scheduled(&engine, &config).await
    }
}

fn build_engine(config: &Config) -> Result<SyncEngine, SyncError> {
    let sheets = SheetsClient::new(&config.document);
    let ctx = SyncContext::from_config(config, Arc::new(sheets))?;
    Ok(SyncEngine::new(ctx))
}

async fn run_once(engine: &SyncEngine) -> ExitCode {
    let report = engine.sync_all().await;
    print_report(&report);
    if report.all_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run forever, one whole-system sync per cron tick. A failed run is logged
/// and the loop keeps going; the next tick gets a fresh attempt.
async fn run_scheduled(engine: &SyncEngine, config: &Config) -> ExitCode {
    let schedule = match parse_cron(&config.schedule) {
        Ok(schedule) => schedule,
        Err(err) => {
            log::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    let tz: Tz = match config.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            log::error!("Invalid timezone: {}", config.timezone);
            return ExitCode::FAILURE;
        }
    };
    log::info!("Scheduling sync with '{}' in {}", config.schedule, tz);

    loop {
        let Some(next) = schedule.upcoming(tz).next() else {
            log::error!("No upcoming time for '{}'", config.schedule);
            return ExitCode::FAILURE;
        };
        log::info!("Next sync at {}", next);
        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();
        tokio::time::sleep(wait).await;

        let report = engine.sync_all().await;
        for target in &report.targets {
            if target.status != "completed" {
                log::warn!(
                    "{} sync did not complete: {}",
                    target.target,
                    target.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
}

fn print_report(report: &SystemSyncReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(err) => log::warn!("Failed to render report: {}", err),
    }
}

/// The cron crate expects six fields with seconds; the config uses the
/// five-field form, so prepend a zero seconds field.
fn parse_cron(expr: &str) -> Result<Schedule, SyncError> {
    format!("0 {}", expr)
        .parse::<Schedule>()
        .map_err(|e| SyncError::Config(format!("Invalid cron expression '{}': {}", expr, e)))
}
