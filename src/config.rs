//! Configuration stored in `~/.sheetsync/config.json`.
//!
//! One file per bot deployment. The only required keys are the spreadsheet
//! and the tenant label; worksheet titles, schedule, and paths all carry
//! defaults matching the operators' standard sheet layout.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Spreadsheet to sync against: a bare id or a docs.google.com URL,
    /// whichever the operator pasted.
    #[serde(alias = "document_id", alias = "spreadsheet")]
    pub document: String,
    /// Label identifying this bot deployment inside the shared store.
    pub tenant: String,
    #[serde(default)]
    pub worksheets: Worksheets,
    /// Budget for one worksheet fetch, in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Cron expression (5-field) driving daemon mode.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// IANA timezone the schedule is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Override for the shared profile store location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

/// Worksheet titles inside the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worksheets {
    #[serde(default = "default_profiles_ws")]
    pub profiles: String,
    #[serde(default = "default_requests_ws")]
    pub requests: String,
    #[serde(default = "default_orders_ws")]
    pub orders: String,
    #[serde(default = "default_partners_ws")]
    pub partners: String,
    #[serde(default = "default_investors_ws")]
    pub investors: String,
}

impl Default for Worksheets {
    fn default() -> Self {
        Self {
            profiles: default_profiles_ws(),
            requests: default_requests_ws(),
            orders: default_orders_ws(),
            partners: default_partners_ws(),
            investors: default_investors_ws(),
        }
    }
}

fn default_profiles_ws() -> String {
    "Анкеты".to_string()
}

fn default_requests_ws() -> String {
    "Заявки".to_string()
}

fn default_orders_ws() -> String {
    "Заказы".to_string()
}

fn default_partners_ws() -> String {
    "Партнёры".to_string()
}

fn default_investors_ws() -> String {
    "Инвесторы".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_schedule() -> String {
    "*/10 * * * *".to_string()
}

fn default_timezone() -> String {
    "Europe/Moscow".to_string()
}

/// Get the canonical config file path (`~/.sheetsync/config.json`).
pub fn config_path() -> Result<PathBuf, SyncError> {
    let home = dirs::home_dir()
        .ok_or_else(|| SyncError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".sheetsync").join("config.json"))
}

/// Load configuration from `~/.sheetsync/config.json`.
pub fn load_config() -> Result<Config, SyncError> {
    let path = config_path()?;

    if !path.exists() {
        return Err(SyncError::Config(format!(
            "Config file not found at {}. Create it with: {{ \"document\": \"<spreadsheet url>\", \"tenant\": \"<bot label>\" }}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| SyncError::Config(format!("Failed to read config: {}", e)))?;

    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config, SyncError> {
    let config: Config = serde_json::from_str(content)
        .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;

    if config.document.trim().is_empty() {
        return Err(SyncError::Config(
            "Config is missing the spreadsheet document".to_string(),
        ));
    }
    if config.tenant.trim().is_empty() {
        return Err(SyncError::Config(
            "Config is missing the tenant label".to_string(),
        ));
    }

    Ok(config)
}
