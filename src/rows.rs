//! External rows and the header-tolerant field resolver.
//!
//! A spreadsheet row arrives as flat key→string pairs with unpredictable key
//! spelling. Resolution walks three tiers, strictest first: exact key, key
//! trimmed of padding, then a normalized form (NFKC, lowercased, stripped of
//! everything non-alphanumeric). Header drift must never hard-fail a sync;
//! an unmatched field is simply empty.

use unicode_normalization::UnicodeNormalization;

use crate::fields::{self, AccountStatus, UserStatus};

/// One external row: ordered key→value pairs as they appeared in the sheet.
/// On duplicate-looking headers the first occurrence wins; later resolver
/// scans walk the pairs in insertion order, so ties stay deterministic.
/// Not persisted; consumed once per sync pass.
#[derive(Debug, Clone, Default)]
pub struct ExternalRow {
    pairs: Vec<(String, String)>,
}

impl ExternalRow {
    /// Build a row from the sheet's header row and one data row. Missing
    /// trailing cells read as empty; cells beyond the header are dropped;
    /// blank headers never become keys.
    pub fn from_header_and_cells(header: &[String], cells: &[String]) -> Self {
        let mut row = ExternalRow::default();
        for (i, key) in header.iter().enumerate() {
            if key.trim().is_empty() {
                continue;
            }
            let value = cells.get(i).cloned().unwrap_or_default();
            row.push(key.clone(), value);
        }
        row
    }

    /// Build a row from explicit pairs. Duplicate keys keep the first value.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut row = ExternalRow::default();
        for (key, value) in pairs {
            row.push(key, value);
        }
        row
    }

    fn push(&mut self, key: String, value: String) {
        if self.get(&key).is_none() {
            self.pairs.push((key, value));
        }
    }

    /// Exact-key lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    /// Key→value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// True when every cell in the row is blank. Sheets often return a tail
    /// of such rows after the real data.
    pub fn is_blank(&self) -> bool {
        self.pairs.iter().all(|(_, v)| v.trim().is_empty())
    }
}

/// Canonical key form for the loosest matching tier: NFKC, lowercase,
/// alphanumeric only. Tolerates punctuation, padding, and separator drift.
pub fn normalize_key(raw: &str) -> String {
    raw.nfkc()
        .collect::<String>()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Resolve a logical field against its header candidates. Tiers are tried in
/// order across the whole candidate list, so an exact match on a late
/// candidate still beats a normalized match on the canonical one. Returns
/// the trimmed cell value; a miss is an empty string, never an error.
pub fn resolve_field(row: &ExternalRow, candidates: &[&str]) -> String {
    // Tier 1: exact key.
    for candidate in candidates {
        if let Some(value) = row.get(candidate) {
            return value.trim().to_string();
        }
    }

    // Tier 2: row keys trimmed of accidental padding.
    for candidate in candidates {
        for (key, value) in &row.pairs {
            if key.trim() == *candidate {
                return value.trim().to_string();
            }
        }
    }

    // Tier 3: normalized comparison on both sides.
    for candidate in candidates {
        let target = normalize_key(candidate);
        if target.is_empty() {
            continue;
        }
        for (key, value) in &row.pairs {
            if normalize_key(key) == target {
                return value.trim().to_string();
            }
        }
    }

    String::new()
}

/// Numeric variant of `resolve_field`: decimal-comma tolerant float parse,
/// with `0.0` on a miss or parse failure rather than failing the row.
pub fn resolve_money(row: &ExternalRow, candidates: &[&str]) -> f64 {
    parse_money(&resolve_field(row, candidates)).unwrap_or(0.0)
}

/// Parse a monetary cell: decimal comma accepted, digit-group spaces (plain
/// or non-breaking) dropped.
pub fn parse_money(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ' ' && *c != '\u{a0}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Render a monetary value the way the sheet shows it: plain formatting,
/// no trailing `.0`. Round-trips through `parse_money`.
pub fn format_money(value: f64) -> String {
    format!("{}", value)
}

/// Completion-flag vocabulary used by the operators.
pub fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "да" | "true" | "yes")
}

/// A profile-sheet row after field resolution: typed values under internal
/// names, statuses normalized to their storage labels.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRow {
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
    pub survey_completed: bool,
    pub survey_date: String,
    pub created_at: String,
    pub account_status: String,
    pub user_status: String,
    pub requests_count: i64,
    pub requests_sum: f64,
    pub orders_count: i64,
    pub orders_sum: f64,
}

impl ResolvedRow {
    /// Any substantive survey answer present?
    pub fn has_survey_content(&self) -> bool {
        [
            &self.full_name,
            &self.city,
            &self.phone,
            &self.email,
            &self.social_link,
            &self.family_status,
            &self.children,
            &self.occupation,
            &self.income_level,
            &self.health_notes,
            &self.product_interest,
            &self.purchase_frequency,
            &self.referral_source,
            &self.wishes,
        ]
        .iter()
        .any(|v| !v.trim().is_empty())
    }
}

/// Resolve every profile field of an external row.
pub fn resolve_profile_row(row: &ExternalRow) -> ResolvedRow {
    let (requests_count, requests_sum) =
        crate::export::unpack_counter(&fields::REQUESTS.resolve(row));
    let (orders_count, orders_sum) = crate::export::unpack_counter(&fields::ORDERS.resolve(row));

    ResolvedRow {
        username: fields::HANDLE.resolve(row),
        full_name: fields::FULL_NAME.resolve(row),
        city: fields::CITY.resolve(row),
        phone: fields::PHONE.resolve(row),
        email: fields::EMAIL.resolve(row),
        social_link: fields::SOCIAL_LINK.resolve(row),
        family_status: fields::FAMILY_STATUS.resolve(row),
        children: fields::CHILDREN.resolve(row),
        occupation: fields::OCCUPATION.resolve(row),
        income_level: fields::INCOME_LEVEL.resolve(row),
        health_notes: fields::HEALTH_NOTES.resolve(row),
        product_interest: fields::PRODUCT_INTEREST.resolve(row),
        purchase_frequency: fields::PURCHASE_FREQUENCY.resolve(row),
        referral_source: fields::REFERRAL_SOURCE.resolve(row),
        wishes: fields::WISHES.resolve(row),
        notes: fields::NOTES.resolve(row),
        bonus_total: fields::BONUS_TOTAL.resolve_money(row),
        current_balance: fields::CURRENT_BALANCE.resolve_money(row),
        survey_completed: parse_flag(&fields::SURVEY_FLAG.resolve(row)),
        survey_date: fields::SURVEY_DATE.resolve(row),
        created_at: fields::CREATED_AT.resolve(row),
        account_status: AccountStatus::from_label(&fields::ACCOUNT_STATUS.resolve(row))
            .as_label()
            .to_string(),
        user_status: UserStatus::from_label(&fields::USER_STATUS.resolve(row))
            .as_label()
            .to_string(),
        requests_count,
        requests_sum,
        orders_count,
        orders_sum,
    }
}
