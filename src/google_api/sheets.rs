//! Google Sheets API v4: worksheet fetch, clear, and bulk write.
//!
//! Implements the `SheetStore` boundary the sync engine drives. Reads use
//! `values/{range}` GET, the full-sheet rewrite uses `values/{range}:clear`
//! followed by a `values/{range}` PUT with `valueInputOption=RAW` so cells
//! land exactly as formatted by the exporter, not re-interpreted by Sheets.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{get_valid_access_token, send_with_retry, GoogleApiError, RetryPolicy};
use crate::rows::ExternalRow;
use crate::spreadsheet::{rows_from_grid, SheetError, SheetStore};

const SHEETS_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Deserialize)]
struct ValueRangeResponse {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// One Google Sheets document.
pub struct SheetsClient {
    spreadsheet_id: String,
    policy: RetryPolicy,
}

impl SheetsClient {
    /// Accepts either a bare spreadsheet id or a full docs.google.com URL,
    /// which is what operators paste into the config.
    pub fn new(document: &str) -> Self {
        Self {
            spreadsheet_id: parse_document_id(document),
            policy: RetryPolicy::default(),
        }
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    async fn bearer(&self) -> Result<String, SheetError> {
        get_valid_access_token().await.map_err(map_google_error)
    }
}

#[async_trait]
impl SheetStore for SheetsClient {
    async fn fetch_rows(&self, worksheet: &str) -> Result<Vec<ExternalRow>, SheetError> {
        let token = self.bearer().await?;
        let client = reqwest::Client::new();
        let url = format!(
            "{}/{}/values/{}",
            SHEETS_BASE,
            self.spreadsheet_id,
            quote_sheet_title(worksheet)
        );
        let request = client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("majorDimension", "ROWS")]);

        let resp = send_with_retry(request, &self.policy)
            .await
            .map_err(map_google_error)?;
        let resp = check_response(resp).await?;

        let body: ValueRangeResponse = resp
            .json()
            .await
            .map_err(|e| SheetError::InvalidResponse(e.to_string()))?;

        let grid: Vec<Vec<String>> = body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect();

        Ok(rows_from_grid(grid))
    }

    async fn clear(&self, worksheet: &str) -> Result<(), SheetError> {
        let token = self.bearer().await?;
        let client = reqwest::Client::new();
        let url = format!(
            "{}/{}/values/{}:clear",
            SHEETS_BASE,
            self.spreadsheet_id,
            quote_sheet_title(worksheet)
        );
        let request = client
            .post(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({}));

        let resp = send_with_retry(request, &self.policy)
            .await
            .map_err(map_google_error)?;
        check_response(resp).await?;
        Ok(())
    }

    async fn write_range(
        &self,
        worksheet: &str,
        top_left: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), SheetError> {
        if rows.is_empty() {
            return Ok(());
        }

        let token = self.bearer().await?;
        let client = reqwest::Client::new();
        let range = format!("{}!{}", quote_sheet_title(worksheet), top_left);
        let url = format!("{}/{}/values/{}", SHEETS_BASE, self.spreadsheet_id, range);
        let body = serde_json::json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": rows,
        });
        let request = client
            .put(&url)
            .bearer_auth(&token)
            .query(&[("valueInputOption", "RAW")])
            .json(&body);

        let resp = send_with_retry(request, &self.policy)
            .await
            .map_err(map_google_error)?;
        check_response(resp).await?;
        Ok(())
    }
}

async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, SheetError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(SheetError::Auth("access token rejected".to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SheetError::Api {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(resp)
}

fn map_google_error(err: GoogleApiError) -> SheetError {
    match err {
        GoogleApiError::AuthExpired => SheetError::Auth("token expired or revoked".to_string()),
        GoogleApiError::TokenNotFound(path) => {
            SheetError::Auth(format!("token not found at {}", path.display()))
        }
        GoogleApiError::RefreshFailed(msg) => SheetError::Auth(msg),
        GoogleApiError::ApiError { status, message } => SheetError::Api { status, message },
        GoogleApiError::Http(err) if err.is_timeout() => SheetError::Timeout,
        GoogleApiError::Http(err) => SheetError::Transport(err.to_string()),
        GoogleApiError::Io(err) => SheetError::Transport(err.to_string()),
        GoogleApiError::Json(err) => SheetError::InvalidResponse(err.to_string()),
    }
}

/// A1 notation requires sheet titles with spaces or punctuation to be
/// single-quoted; an embedded quote doubles. Quoting a plain title is
/// always accepted, so every range gets the quotes.
fn quote_sheet_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

/// Sheets returns numbers as JSON numbers when a cell holds one; everything
/// downstream works in strings, same as cells typed by an operator.
fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extract the spreadsheet id from a docs.google.com URL, or return the
/// input unchanged when it is already a bare id.
pub fn parse_document_id(document: &str) -> String {
    let trimmed = document.trim();
    if let Ok(url) = Url::parse(trimmed) {
        if url.host_str().is_some_and(|h| h.ends_with("google.com")) {
            if let Some(mut segments) = url.path_segments() {
                while let Some(segment) = segments.next() {
                    if segment == "d" {
                        if let Some(id) = segments.next().filter(|id| !id.is_empty()) {
                            return id.to_string();
                        }
                    }
                }
            }
        }
    }
    trimmed.to_string()
}
