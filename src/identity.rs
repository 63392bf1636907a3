//! Canonical identity resolution for external rows.
//!
//! The identity column suffers the same header drift as everything else,
//! plus value-level noise: spreadsheet numeric formatting turns `100` into
//! `"100.0"`, and some historical rows carry no identity at all, only a
//! Telegram handle. Resolution therefore walks the identity candidates
//! first and falls back to a handle lookup against a snapshot of the
//! profile store. An unresolvable row is a skip, never an error.

use std::collections::HashMap;

use crate::fields;
use crate::rows::{resolve_field, ExternalRow};

/// Normalized handle → identity map, built once per sync cycle from the
/// profile store so resolution never observes writes made earlier in the
/// same pass.
#[derive(Debug, Default)]
pub struct HandleIndex {
    map: HashMap<String, i64>,
}

impl HandleIndex {
    /// Build from (identity, handle) pairs. Entries are expected in
    /// ascending identity order; on a handle collision the first one wins.
    pub fn build(entries: &[(i64, String)]) -> Self {
        let mut map = HashMap::new();
        for (user_id, handle) in entries {
            let key = normalize_handle(handle);
            if key.is_empty() {
                continue;
            }
            map.entry(key).or_insert(*user_id);
        }
        HandleIndex { map }
    }

    pub fn lookup(&self, raw: &str) -> Option<i64> {
        self.map.get(&normalize_handle(raw)).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Handles compare case-insensitively, ignoring padding and a leading `@`.
pub fn normalize_handle(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    lowered.strip_prefix('@').unwrap_or(&lowered).to_string()
}

/// Resolve a row to a canonical identity, or `None` to skip it.
///
/// Identity `0` is the reserved sentinel row; a row naming it explicitly is
/// rejected outright rather than falling back to the handle.
pub fn resolve_identity(row: &ExternalRow, handles: &HandleIndex) -> Option<i64> {
    for candidate in fields::IDENTITY.candidates {
        let Some(value) = lookup_whitespace_insensitive(row, candidate) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match parse_identity(value) {
            Some(id) if id > 0 => return Some(id),
            Some(_) => return None,
            // Unparsable value under this header; another candidate column
            // may still carry the real identity.
            None => continue,
        }
    }

    let handle = resolve_field(row, fields::HANDLE.candidates);
    if !handle.is_empty() {
        if let Some(id) = handles.lookup(&handle) {
            if id > 0 {
                return Some(id);
            }
        }
    }

    None
}

/// Find a cell by exact key, then by comparing keys with all whitespace
/// removed from both sides.
fn lookup_whitespace_insensitive<'a>(row: &'a ExternalRow, candidate: &str) -> Option<&'a str> {
    if let Some(value) = row.get(candidate) {
        return Some(value);
    }
    let target: String = candidate.chars().filter(|c| !c.is_whitespace()).collect();
    row.iter()
        .find(|(key, _)| {
            key.chars().filter(|c| !c.is_whitespace()).eq(target.chars())
        })
        .map(|(_, value)| value)
}

/// Parse a numeric id cell robustly: strip the `.0` that spreadsheet numeric
/// formatting appends, accept plain digits, and accept a float only when it
/// is a whole number. Also used for catalog row numbers, which suffer the
/// same formatting.
pub fn parse_identity(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let cleaned = trimmed.strip_suffix(".0").unwrap_or(trimmed);

    if !cleaned.is_empty() && cleaned.chars().all(|c| c.is_ascii_digit()) {
        return cleaned.parse::<i64>().ok();
    }

    let value: f64 = cleaned.parse().ok()?;
    if value >= 0.0 && value.fract() == 0.0 && value <= i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}
