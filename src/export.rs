//! Formatting local state back into spreadsheet rows.
//!
//! The push half of a cycle rewrites each worksheet in full: a fixed header
//! row of canonical labels followed by one formatted row per record. Dates
//! come out in the operators' `%d.%m.%Y` convention and the request/order
//! aggregates are packed into the `"{count} (на {sum})"` cell they read on
//! the sheet. `unpack_counter` is the symmetric inverse used on ingestion.

use std::sync::OnceLock;

use regex::Regex;

use crate::db::{DbCatalogEntry, DbInvestor, DbPartner, MergedProfile};
use crate::fields::{self, FieldSpec};
use crate::rows::{format_money, parse_money};

/// Profile worksheet layout. The numbered survey labels keep their historical
/// column positions (label "2." in column 2 and so on); the bookkeeping
/// columns fill the gaps and the tail.
pub const EXPORT_COLUMNS: [FieldSpec; 26] = [
    fields::SURVEY_DATE,
    fields::FULL_NAME,
    fields::CITY,
    fields::PHONE,
    fields::EMAIL,
    fields::SOCIAL_LINK,
    fields::FAMILY_STATUS,
    fields::CHILDREN,
    fields::OCCUPATION,
    fields::INCOME_LEVEL,
    fields::HEALTH_NOTES,
    fields::PRODUCT_INTEREST,
    fields::BONUS_TOTAL,
    fields::PURCHASE_FREQUENCY,
    fields::REFERRAL_SOURCE,
    fields::WISHES,
    fields::NOTES,
    fields::CURRENT_BALANCE,
    fields::IDENTITY,
    fields::HANDLE,
    fields::SURVEY_FLAG,
    fields::CREATED_AT,
    fields::ACCOUNT_STATUS,
    fields::USER_STATUS,
    fields::REQUESTS,
    fields::ORDERS,
];

pub const REQUESTS_COLUMNS: [&str; 6] = [
    "№ заявки",
    "ID подписчика",
    "Товар",
    "Сумма",
    "Статус",
    "Дата создания",
];

pub const ORDERS_COLUMNS: [&str; 6] = [
    "№ заказа",
    "ID подписчика",
    "Товар",
    "Сумма",
    "Статус",
    "Дата создания",
];

pub const PARTNERS_COLUMNS: [&str; 6] = [
    "ID подписчика",
    "ФИО",
    "Телефон",
    "Город",
    "Статус",
    "Дата вступления",
];

pub const INVESTORS_COLUMNS: [&str; 6] = [
    "ID подписчика",
    "ФИО",
    "Телефон",
    "Сумма инвестиций",
    "Статус",
    "Дата вступления",
];

/// The header row the push writes at A1.
pub fn header_row() -> Vec<String> {
    EXPORT_COLUMNS
        .iter()
        .map(|field| field.canonical().to_string())
        .collect()
}

/// Render one merged profile in `EXPORT_COLUMNS` order.
pub fn format_profile_row(profile: &MergedProfile) -> Vec<String> {
    vec![
        normalize_date(&profile.survey_date),
        profile.full_name.clone(),
        profile.city.clone(),
        profile.phone.clone(),
        profile.email.clone(),
        profile.social_link.clone(),
        profile.family_status.clone(),
        profile.children.clone(),
        profile.occupation.clone(),
        profile.income_level.clone(),
        profile.health_notes.clone(),
        profile.product_interest.clone(),
        format_money(profile.bonus_total),
        profile.purchase_frequency.clone(),
        profile.referral_source.clone(),
        profile.wishes.clone(),
        profile.notes.clone(),
        format_money(profile.current_balance),
        profile.user_id.to_string(),
        profile.username.clone(),
        if profile.has_completed_survey {
            "1".to_string()
        } else {
            String::new()
        },
        normalize_date(&profile.created_at),
        profile.account_status.clone(),
        profile.user_status.clone(),
        pack_counter(profile.requests_count, profile.requests_sum),
        pack_counter(profile.orders_count, profile.orders_sum),
    ]
}

pub fn format_catalog_row(entry: &DbCatalogEntry) -> Vec<String> {
    vec![
        entry.id.to_string(),
        entry.user_id.to_string(),
        entry.item.clone(),
        format_money(entry.amount),
        entry.status.clone(),
        normalize_date(&entry.created_at),
    ]
}

pub fn format_partner_row(partner: &DbPartner) -> Vec<String> {
    vec![
        partner.user_id.to_string(),
        partner.full_name.clone(),
        partner.phone.clone(),
        partner.city.clone(),
        partner.status.clone(),
        normalize_date(&partner.joined_at),
    ]
}

pub fn format_investor_row(investor: &DbInvestor) -> Vec<String> {
    vec![
        investor.user_id.to_string(),
        investor.full_name.clone(),
        investor.phone.clone(),
        format_money(investor.invested_sum),
        investor.status.clone(),
        normalize_date(&investor.joined_at),
    ]
}

/// Bring any stored or operator-entered date to the sheet's `%d.%m.%Y`.
///
/// The store keeps RFC 3339 timestamps, older imports carry
/// `"%Y-%m-%d %H:%M:%S"`, and operators type either ISO dates or the target
/// format already. Anything else becomes an empty cell rather than a wrong
/// date.
pub fn normalize_date(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return dt.format("%d.%m.%Y").to_string();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return ndt.format("%d.%m.%Y").to_string();
    }
    for fmt in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(value, fmt) {
            return date.format("%d.%m.%Y").to_string();
        }
    }
    String::new()
}

/// Render a catalog aggregate as the operators' `"3 (на 1500)"` cell.
pub fn pack_counter(count: i64, sum: f64) -> String {
    format!("{} (на {})", count, format_money(sum))
}

fn packed_counter_re() -> &'static Regex {
    static PACKED_COUNTER_RE: OnceLock<Regex> = OnceLock::new();
    PACKED_COUNTER_RE.get_or_init(|| {
        Regex::new(r"^(\d+)\s*\(на\s+([0-9][0-9\s\u{a0},\.]*)\)$")
            .expect("packed counter regex should compile")
    })
}

/// Split a packed `"3 (на 1500)"` cell back into `(count, sum)`.
///
/// A bare number reads as a count with zero sum, which is what hand-edited
/// sheets usually hold. Anything else reads as `(0, 0.0)`.
pub fn unpack_counter(raw: &str) -> (i64, f64) {
    let value = raw.trim();
    if value.is_empty() {
        return (0, 0.0);
    }
    if let Some(caps) = packed_counter_re().captures(value) {
        let count = caps[1].parse().unwrap_or(0);
        let sum = parse_money(&caps[2]).unwrap_or(0.0);
        return (count, sum);
    }
    if let Ok(count) = value.parse::<i64>() {
        return (count, 0.0);
    }
    (0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::ExternalRow;

    fn merged_fixture() -> MergedProfile {
        MergedProfile {
            user_id: 100,
            username: "ivan_p".to_string(),
            full_name: "Иван Петров, 34".to_string(),
            city: "Казань".to_string(),
            bonus_total: 350.5,
            current_balance: 120.0,
            has_completed_survey: true,
            survey_date: "2024-03-07T10:15:00+00:00".to_string(),
            created_at: "2024-01-02 08:00:00".to_string(),
            account_status: "Работа".to_string(),
            user_status: "active".to_string(),
            requests_count: 2,
            requests_sum: 350.0,
            orders_count: 1,
            orders_sum: 400.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_header_round_trips_through_the_resolver() {
        let header = header_row();
        let cells: Vec<String> = (0..header.len()).map(|i| i.to_string()).collect();
        let row = ExternalRow::from_header_and_cells(&header, &cells);
        for (i, field) in EXPORT_COLUMNS.iter().enumerate() {
            assert_eq!(
                field.resolve(&row),
                i.to_string(),
                "column {} ({}) resolved to the wrong cell",
                i + 1,
                field.name
            );
        }
    }

    #[test]
    fn test_header_keeps_numbered_labels_in_position() {
        let header = header_row();
        assert_eq!(header.len(), 26);
        assert_eq!(header[0], "Дата заполнения анкеты");
        assert_eq!(header[1], "2. ФИО и возраст подписчика");
        assert_eq!(header[12], "13. ИТОГО начислено бонусов");
        assert_eq!(header[18], "19. ID подписчика в магазине");
        assert_eq!(header[25], "Заказы");
    }

    #[test]
    fn test_format_profile_row_positions() {
        let row = format_profile_row(&merged_fixture());
        assert_eq!(row.len(), 26);
        assert_eq!(row[0], "07.03.2024");
        assert_eq!(row[1], "Иван Петров, 34");
        assert_eq!(row[12], "350.5");
        assert_eq!(row[17], "120");
        assert_eq!(row[18], "100");
        assert_eq!(row[19], "ivan_p");
        assert_eq!(row[20], "1");
        assert_eq!(row[21], "02.01.2024");
        assert_eq!(row[22], "Работа");
        assert_eq!(row[23], "active");
        assert_eq!(row[24], "2 (на 350)");
        assert_eq!(row[25], "1 (на 400)");
    }

    #[test]
    fn test_format_profile_row_blanks_unset_flag_and_dates() {
        let profile = MergedProfile {
            user_id: 7,
            ..Default::default()
        };
        let row = format_profile_row(&profile);
        assert_eq!(row[0], "");
        assert_eq!(row[20], "");
        assert_eq!(row[21], "");
        assert_eq!(row[24], "0 (на 0)");
    }

    #[test]
    fn test_normalize_date_accepts_the_known_shapes() {
        assert_eq!(normalize_date("2024-03-07T10:15:00+00:00"), "07.03.2024");
        assert_eq!(normalize_date("2024-03-07T10:15:00Z"), "07.03.2024");
        assert_eq!(normalize_date("2024-03-07 10:15:00"), "07.03.2024");
        assert_eq!(normalize_date("2024-03-07"), "07.03.2024");
        assert_eq!(normalize_date(" 07.03.2024 "), "07.03.2024");
    }

    #[test]
    fn test_normalize_date_blanks_garbage() {
        assert_eq!(normalize_date(""), "");
        assert_eq!(normalize_date("   "), "");
        assert_eq!(normalize_date("вчера"), "");
        assert_eq!(normalize_date("07/03/2024"), "");
    }

    #[test]
    fn test_pack_and_unpack_are_symmetric() {
        assert_eq!(pack_counter(3, 1500.0), "3 (на 1500)");
        assert_eq!(unpack_counter("3 (на 1500)"), (3, 1500.0));
        assert_eq!(unpack_counter(&pack_counter(0, 0.0)), (0, 0.0));
        assert_eq!(unpack_counter(&pack_counter(2, 350.5)), (2, 350.5));
    }

    #[test]
    fn test_unpack_counter_tolerates_hand_edits() {
        assert_eq!(unpack_counter("5"), (5, 0.0));
        assert_eq!(unpack_counter(" 4 (на 1 200,50) "), (4, 1200.5));
        assert_eq!(unpack_counter(""), (0, 0.0));
        assert_eq!(unpack_counter("много"), (0, 0.0));
        assert_eq!(unpack_counter("на 500"), (0, 0.0));
    }

    #[test]
    fn test_catalog_row_formatting() {
        let entry = DbCatalogEntry {
            id: 12,
            user_id: 100,
            item: "Набор".to_string(),
            amount: 450.0,
            status: "paid".to_string(),
            created_at: "2024-03-07T10:15:00+00:00".to_string(),
            updated_at: String::new(),
        };
        let row = format_catalog_row(&entry);
        assert_eq!(
            row,
            vec!["12", "100", "Набор", "450", "paid", "07.03.2024"]
        );
    }

    #[test]
    fn test_roster_row_formatting() {
        let partner = DbPartner {
            user_id: 200,
            full_name: "Анна".to_string(),
            phone: "+7 900".to_string(),
            city: "Сочи".to_string(),
            status: "active".to_string(),
            joined_at: "2024-02-01".to_string(),
            updated_at: String::new(),
        };
        assert_eq!(
            format_partner_row(&partner),
            vec!["200", "Анна", "+7 900", "Сочи", "active", "01.02.2024"]
        );

        let investor = DbInvestor {
            user_id: 300,
            full_name: "Олег".to_string(),
            phone: String::new(),
            invested_sum: 10000.0,
            status: "active".to_string(),
            joined_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(
            format_investor_row(&investor),
            vec!["300", "Олег", "", "10000", "active", ""]
        );
    }
}
