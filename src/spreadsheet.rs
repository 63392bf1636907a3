//! The spreadsheet collaborator boundary.
//!
//! The sync engine only ever talks to a `SheetStore`: fetch a worksheet as
//! header-keyed rows, clear it, write a block of cells. The production
//! implementation lives in `google_api::sheets`; tests substitute an
//! in-memory store to drive the state machine without a network.

use async_trait::async_trait;

use crate::rows::ExternalRow;

#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Fetch timed out")]
    Timeout,
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// One worksheet-holding document, addressed by worksheet title.
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Fetch every data row of a worksheet, keyed by its header row.
    async fn fetch_rows(&self, worksheet: &str) -> Result<Vec<ExternalRow>, SheetError>;

    /// Clear the whole worksheet.
    async fn clear(&self, worksheet: &str) -> Result<(), SheetError>;

    /// Write a block of cells with its top-left corner at `top_left`
    /// (A1 notation).
    async fn write_range(
        &self,
        worksheet: &str,
        top_left: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), SheetError>;
}

/// Turn a raw cell grid into header-keyed rows.
///
/// The first row is the header; duplicated header titles keep their first
/// occurrence. Trailing all-blank rows (the tail every hand-edited sheet
/// grows) are dropped, blank rows in the middle are kept so row counts in
/// logs line up with what the operator sees.
pub fn rows_from_grid(grid: Vec<Vec<String>>) -> Vec<ExternalRow> {
    let mut iter = grid.into_iter();
    let Some(header) = iter.next() else {
        return Vec::new();
    };

    let mut rows: Vec<ExternalRow> = iter
        .map(|cells| ExternalRow::from_header_and_cells(&header, &cells))
        .collect();

    while rows.last().is_some_and(|row| row.is_blank()) {
        rows.pop();
    }

    rows
}
