//! Observational drift detection between the profile store and the sheet.
//!
//! Runs per identity just before the reconciling write and records which
//! fields differ. The result feeds the cycle report for audit and alerting;
//! it never gates or alters the write itself.

use serde::Serialize;

use crate::db::DbProfile;
use crate::fields::{AccountStatus, FieldKind, UserStatus, CONFLICT_FIELDS};
use crate::rows::{format_money, parse_money, ExternalRow};

/// Monetary values within this absolute distance are considered equal.
/// Ledger floats accumulate representation noise well below a kopeck.
pub const MONEY_TOLERANCE: f64 = 0.01;

/// One differing field: the store's value and the sheet's.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub local: String,
    pub incoming: String,
}

/// Compare a local profile against the resolved values of one external row.
///
/// Money fields compare as floats under `MONEY_TOLERANCE`; a blank cell
/// compares as the zero the writer will apply, and non-empty unparseable
/// text falls back to trimmed strings. Statuses are normalized through
/// their label vocabularies first, so a case variant the writer would
/// normalize away is not reported. Everything else is a trimmed string
/// comparison. A text column the sheet dropped resolves to empty and is
/// reported against a non-empty local value, which is exactly what the
/// write is about to do to it.
pub fn detect_conflicts(profile: &DbProfile, row: &ExternalRow) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();

    for field in &CONFLICT_FIELDS {
        let raw = field.resolve(row);
        let incoming = match field.name {
            "account_status" => AccountStatus::from_label(&raw).as_label().to_string(),
            "user_status" => UserStatus::from_label(&raw).as_label().to_string(),
            _ => raw,
        };
        let local = local_value(profile, field.name);

        let differs = match field.kind {
            FieldKind::Money => money_differs(&local, &incoming),
            _ => local.trim() != incoming.trim(),
        };

        if differs {
            diffs.push(FieldDiff {
                field: field.name.to_string(),
                local,
                incoming,
            });
        }
    }

    diffs
}

fn money_differs(local: &str, incoming: &str) -> bool {
    // A blank cell is what the writer will apply as zero, so it compares
    // as zero; only non-empty unparseable text falls back to strings.
    let incoming_value = if incoming.trim().is_empty() {
        Some(0.0)
    } else {
        parse_money(incoming)
    };
    match (parse_money(local), incoming_value) {
        (Some(a), Some(b)) => (a - b).abs() > MONEY_TOLERANCE,
        _ => local.trim() != incoming.trim(),
    }
}

fn local_value(profile: &DbProfile, name: &str) -> String {
    match name {
        "username" => profile.username.clone(),
        "full_name" => profile.full_name.clone(),
        "city" => profile.city.clone(),
        "phone" => profile.phone.clone(),
        "email" => profile.email.clone(),
        "social_link" => profile.social_link.clone(),
        "family_status" => profile.family_status.clone(),
        "children" => profile.children.clone(),
        "occupation" => profile.occupation.clone(),
        "income_level" => profile.income_level.clone(),
        "health_notes" => profile.health_notes.clone(),
        "product_interest" => profile.product_interest.clone(),
        "purchase_frequency" => profile.purchase_frequency.clone(),
        "referral_source" => profile.referral_source.clone(),
        "wishes" => profile.wishes.clone(),
        "notes" => profile.notes.clone(),
        "bonus_total" => format_money(profile.bonus_total),
        "current_balance" => format_money(profile.current_balance),
        "account_status" => profile.account_status.clone(),
        "user_status" => profile.user_status.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbProfile;
    use crate::rows::ExternalRow;

    fn profile() -> DbProfile {
        DbProfile {
            user_id: 100,
            full_name: "Иван".into(),
            bonus_total: 10.0,
            current_balance: 10.5,
            account_status: "Блокировка".into(),
            user_status: "active".into(),
            ..Default::default()
        }
    }

    fn row(pairs: &[(&str, &str)]) -> ExternalRow {
        ExternalRow::from_pairs(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn diff_fields(diffs: &[FieldDiff]) -> Vec<&str> {
        diffs.iter().map(|d| d.field.as_str()).collect()
    }

    fn full_match_row() -> ExternalRow {
        row(&[
            ("2. ФИО и возраст подписчика", "Иван"),
            ("13. ИТОГО начислено бонусов", "10"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ])
    }

    #[test]
    fn test_money_within_tolerance_is_not_a_conflict() {
        let r = row(&[
            ("2. ФИО и возраст подписчика", "Иван"),
            ("13. ИТОГО начислено бонусов", "10.004"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ]);
        let diffs = detect_conflicts(&profile(), &r);
        assert!(
            !diff_fields(&diffs).contains(&"bonus_total"),
            "0.004 apart is representation noise, got {:?}",
            diffs
        );
    }

    #[test]
    fn test_money_beyond_tolerance_is_a_conflict() {
        let r = row(&[
            ("2. ФИО и возраст подписчика", "Иван"),
            ("13. ИТОГО начислено бонусов", "10.02"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ]);
        let diffs = detect_conflicts(&profile(), &r);
        let bonus = diffs
            .iter()
            .find(|d| d.field == "bonus_total")
            .expect("bonus conflict");
        assert_eq!(bonus.local, "10");
        assert_eq!(bonus.incoming, "10.02");
    }

    #[test]
    fn test_decimal_comma_compares_equal() {
        let diffs = detect_conflicts(&profile(), &full_match_row());
        assert!(
            !diff_fields(&diffs).contains(&"current_balance"),
            "10,5 and 10.5 are the same amount"
        );
    }

    #[test]
    fn test_blank_money_cells_compare_as_zero() {
        // A sheet without the money columns resolves them to empty; the
        // write applies zero, so a zeroed local row has nothing to report.
        let mut p = profile();
        p.bonus_total = 0.0;
        p.current_balance = 0.0;
        let r = row(&[
            ("2. ФИО и возраст подписчика", "Иван"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ]);
        assert!(detect_conflicts(&p, &r).is_empty());

        // Against a nonzero local balance the same blank cell is a real
        // divergence: the write is about to zero it.
        p.current_balance = 500.0;
        let diffs = detect_conflicts(&p, &r);
        assert_eq!(diff_fields(&diffs), vec!["current_balance"]);
        assert_eq!(diffs[0].local, "500");
        assert_eq!(diffs[0].incoming, "");
    }

    #[test]
    fn test_unparsable_money_falls_back_to_string_comparison() {
        let r = row(&[
            ("2. ФИО и возраст подписчика", "Иван"),
            ("13. ИТОГО начислено бонусов", "оплачено"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ]);
        let diffs = detect_conflicts(&profile(), &r);
        assert!(diff_fields(&diffs).contains(&"bonus_total"));
    }

    #[test]
    fn test_text_comparison_is_trimmed() {
        let r = row(&[
            ("2. ФИО и возраст подписчика", "  Иван  "),
            ("13. ИТОГО начислено бонусов", "10"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ]);
        let diffs = detect_conflicts(&profile(), &r);
        assert!(!diff_fields(&diffs).contains(&"full_name"));
    }

    #[test]
    fn test_status_case_variants_are_not_conflicts() {
        let r = row(&[
            ("2. ФИО и возраст подписчика", "Иван"),
            ("13. ИТОГО начислено бонусов", "10"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", " блокировка "),
            ("Статус пользователя", "ACTIVE"),
        ]);
        let diffs = detect_conflicts(&profile(), &r);
        assert!(!diff_fields(&diffs).contains(&"account_status"));
        assert!(!diff_fields(&diffs).contains(&"user_status"));
    }

    #[test]
    fn test_changed_text_is_reported() {
        let r = row(&[
            ("2. ФИО и возраст подписчика", "Пётр"),
            ("13. ИТОГО начислено бонусов", "10"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ]);
        let diffs = detect_conflicts(&profile(), &r);
        let name = diffs
            .iter()
            .find(|d| d.field == "full_name")
            .expect("name conflict");
        assert_eq!(name.local, "Иван");
        assert_eq!(name.incoming, "Пётр");
    }

    #[test]
    fn test_dropped_column_reports_the_blanking() {
        // The sheet no longer carries the name column; the write will blank
        // it, and the report says so beforehand.
        let r = row(&[
            ("13. ИТОГО начислено бонусов", "10"),
            ("Текущий баланс", "10,5"),
            ("Статус аккаунта", "Блокировка"),
            ("Статус пользователя", "active"),
        ]);
        let diffs = detect_conflicts(&profile(), &r);
        let name = diffs
            .iter()
            .find(|d| d.field == "full_name")
            .expect("blanking conflict");
        assert_eq!(name.incoming, "");
    }
}
