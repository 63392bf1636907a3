//! The logical field catalog and status vocabularies.
//!
//! Spreadsheet headers are maintained by non-engineers and drift over time:
//! renumbering, punctuation changes, padding, partial rewording. Each logical
//! field therefore carries an ordered list of header candidates, canonical
//! first; the resolver in `rows` walks them with progressively looser
//! matching. The candidate lists are the single source of truth for both
//! directions: ingestion resolves against them and the export writes
//! `candidates[0]` back as the header row.

use crate::rows::{resolve_field, resolve_money, ExternalRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Money,
    Flag,
    Date,
}

/// One logical field: its internal name, the external headers it may appear
/// under, and the merge-relevant flags.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub candidates: &'static [&'static str],
    pub kind: FieldKind,
    /// Never blanked by an empty incoming cell.
    pub sticky: bool,
    /// Substantive survey answer; a fresh import with any of these filled
    /// counts as a completed survey.
    pub survey_indicative: bool,
}

impl FieldSpec {
    /// The canonical export header.
    pub fn canonical(&self) -> &'static str {
        self.candidates[0]
    }

    pub fn resolve(&self, row: &ExternalRow) -> String {
        resolve_field(row, self.candidates)
    }

    pub fn resolve_money(&self, row: &ExternalRow) -> f64 {
        resolve_money(row, self.candidates)
    }
}

const fn text_field(
    name: &'static str,
    candidates: &'static [&'static str],
    survey_indicative: bool,
) -> FieldSpec {
    FieldSpec {
        name,
        candidates,
        kind: FieldKind::Text,
        sticky: false,
        survey_indicative,
    }
}

// ---------------------------------------------------------------------------
// Profile sheet fields
// ---------------------------------------------------------------------------

pub const IDENTITY: FieldSpec = text_field(
    "user_id",
    &[
        "19. ID подписчика в магазине",
        "ID подписчика в магазине",
        "ID подписчика",
        "Telegram ID",
        "ID",
    ],
    false,
);

pub const HANDLE: FieldSpec = text_field("username", &["Ник в Telegram", "Ник", "Username"], false);

pub const FULL_NAME: FieldSpec = text_field(
    "full_name",
    &[
        "2. ФИО и возраст подписчика",
        "ФИО и возраст подписчика",
        "ФИО",
    ],
    true,
);

pub const CITY: FieldSpec = text_field("city", &["3. Город", "Город"], true);

pub const PHONE: FieldSpec = text_field("phone", &["4. Телефон", "Телефон", "Номер телефона"], true);

pub const EMAIL: FieldSpec = text_field(
    "email",
    &["5. Электронная почта", "Электронная почта", "E-mail", "Email"],
    true,
);

pub const SOCIAL_LINK: FieldSpec = text_field(
    "social_link",
    &["6. Ссылка на соцсети", "Ссылка на соцсети", "Соцсети"],
    true,
);

pub const FAMILY_STATUS: FieldSpec = text_field(
    "family_status",
    &["7. Семейное положение", "Семейное положение"],
    true,
);

pub const CHILDREN: FieldSpec = text_field("children", &["8. Дети", "Дети"], true);

pub const OCCUPATION: FieldSpec = text_field(
    "occupation",
    &["9. Род деятельности", "Род деятельности"],
    true,
);

pub const INCOME_LEVEL: FieldSpec =
    text_field("income_level", &["10. Уровень дохода", "Уровень дохода"], true);

pub const HEALTH_NOTES: FieldSpec = text_field(
    "health_notes",
    &["11. Заболевания", "Заболевания", "Особенности здоровья"],
    true,
);

pub const PRODUCT_INTEREST: FieldSpec = text_field(
    "product_interest",
    &[
        "12. Какие продукты интересуют",
        "Какие продукты интересуют",
        "Интересующие продукты",
    ],
    true,
);

pub const PURCHASE_FREQUENCY: FieldSpec = text_field(
    "purchase_frequency",
    &[
        "14. Как часто планируете покупки",
        "Как часто планируете покупки",
        "Частота покупок",
    ],
    true,
);

pub const REFERRAL_SOURCE: FieldSpec = text_field(
    "referral_source",
    &["15. Откуда узнали о нас", "Откуда узнали о нас"],
    true,
);

pub const WISHES: FieldSpec = text_field("wishes", &["16. Пожелания", "Пожелания"], true);

pub const NOTES: FieldSpec = text_field("notes", &["Примечания", "Комментарий"], false);

pub const BONUS_TOTAL: FieldSpec = FieldSpec {
    name: "bonus_total",
    candidates: &[
        "13. ИТОГО начислено бонусов",
        "ИТОГО начислено бонусов",
        "Бонусы",
    ],
    kind: FieldKind::Money,
    sticky: false,
    survey_indicative: false,
};

pub const CURRENT_BALANCE: FieldSpec = FieldSpec {
    name: "current_balance",
    candidates: &["Текущий баланс", "Баланс"],
    kind: FieldKind::Money,
    sticky: false,
    survey_indicative: false,
};

pub const SURVEY_FLAG: FieldSpec = FieldSpec {
    name: "has_completed_survey",
    candidates: &["Анкета заполнена", "Анкета"],
    kind: FieldKind::Flag,
    sticky: false,
    survey_indicative: false,
};

pub const SURVEY_DATE: FieldSpec = FieldSpec {
    name: "survey_date",
    candidates: &["Дата заполнения анкеты", "Дата анкеты"],
    kind: FieldKind::Date,
    sticky: true,
    survey_indicative: false,
};

pub const CREATED_AT: FieldSpec = FieldSpec {
    name: "created_at",
    candidates: &["Дата регистрации"],
    kind: FieldKind::Date,
    sticky: true,
    survey_indicative: false,
};

pub const ACCOUNT_STATUS: FieldSpec =
    text_field("account_status", &["Статус аккаунта", "Статус"], false);

pub const USER_STATUS: FieldSpec =
    text_field("user_status", &["Статус пользователя", "Статус бота"], false);

/// Packed "count (на sum)" counters. Resolved as raw text and split by the
/// export formatter's unpack, which is the symmetric inverse of its pack.
pub const REQUESTS: FieldSpec = text_field("requests", &["Заявки"], false);

pub const ORDERS: FieldSpec = text_field("orders", &["Заказы"], false);

/// Every logical field on the profile sheet.
pub const PROFILE_FIELDS: [FieldSpec; 26] = [
    IDENTITY,
    HANDLE,
    FULL_NAME,
    CITY,
    PHONE,
    EMAIL,
    SOCIAL_LINK,
    FAMILY_STATUS,
    CHILDREN,
    OCCUPATION,
    INCOME_LEVEL,
    HEALTH_NOTES,
    PRODUCT_INTEREST,
    PURCHASE_FREQUENCY,
    REFERRAL_SOURCE,
    WISHES,
    NOTES,
    BONUS_TOTAL,
    CURRENT_BALANCE,
    SURVEY_FLAG,
    SURVEY_DATE,
    CREATED_AT,
    ACCOUNT_STATUS,
    USER_STATUS,
    REQUESTS,
    ORDERS,
];

/// The fields the conflict detector compares. Identity is the key, not a
/// value; dates shift representation between the two stores; the flag and
/// the packed counters are derived. Comparing any of those only yields noise.
pub const CONFLICT_FIELDS: [FieldSpec; 20] = [
    HANDLE,
    FULL_NAME,
    CITY,
    PHONE,
    EMAIL,
    SOCIAL_LINK,
    FAMILY_STATUS,
    CHILDREN,
    OCCUPATION,
    INCOME_LEVEL,
    HEALTH_NOTES,
    PRODUCT_INTEREST,
    PURCHASE_FREQUENCY,
    REFERRAL_SOURCE,
    WISHES,
    NOTES,
    BONUS_TOTAL,
    CURRENT_BALANCE,
    ACCOUNT_STATUS,
    USER_STATUS,
];

// ---------------------------------------------------------------------------
// Secondary sheet fields
// ---------------------------------------------------------------------------

pub const REQUEST_NUMBER: FieldSpec =
    text_field("request_number", &["№ заявки", "Номер заявки"], false);

pub const ORDER_NUMBER: FieldSpec =
    text_field("order_number", &["№ заказа", "Номер заказа"], false);

pub const ITEM: FieldSpec = text_field("item", &["Товар", "Продукт"], false);

pub const AMOUNT: FieldSpec = FieldSpec {
    name: "amount",
    candidates: &["Сумма"],
    kind: FieldKind::Money,
    sticky: false,
    survey_indicative: false,
};

pub const ENTRY_STATUS: FieldSpec = text_field("status", &["Статус"], false);

pub const ENTRY_DATE: FieldSpec = FieldSpec {
    name: "created_at",
    candidates: &["Дата создания", "Дата"],
    kind: FieldKind::Date,
    sticky: true,
    survey_indicative: false,
};

pub const ROSTER_NAME: FieldSpec = text_field("full_name", &["ФИО"], false);

pub const ROSTER_PHONE: FieldSpec = text_field("phone", &["Телефон"], false);

pub const ROSTER_CITY: FieldSpec = text_field("city", &["Город"], false);

pub const ROSTER_JOINED: FieldSpec = FieldSpec {
    name: "joined_at",
    candidates: &["Дата вступления", "Дата"],
    kind: FieldKind::Date,
    sticky: true,
    survey_indicative: false,
};

pub const INVESTED_SUM: FieldSpec = FieldSpec {
    name: "invested_sum",
    candidates: &["Сумма инвестиций", "Инвестиции"],
    kind: FieldKind::Money,
    sticky: false,
    survey_indicative: false,
};

// ---------------------------------------------------------------------------
// Status vocabularies
// ---------------------------------------------------------------------------

/// Whether a subscriber account is in working order or blocked by the
/// operators. Stored and exported under the operators' labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountStatus {
    #[default]
    Active,
    Blocked,
}

impl AccountStatus {
    /// Parse an operator-facing label. Unknown input reads as `Active`;
    /// blocking someone requires the exact word, not the absence of one.
    pub fn from_label(label: &str) -> Self {
        if label.trim().to_lowercase() == "блокировка" {
            AccountStatus::Blocked
        } else {
            AccountStatus::Active
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            AccountStatus::Active => "Работа",
            AccountStatus::Blocked => "Блокировка",
        }
    }
}

/// Where a subscriber is in the bot funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserStatus {
    #[default]
    New,
    Active,
    Completed,
}

impl UserStatus {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "active" => UserStatus::Active,
            "completed" => UserStatus::Completed,
            _ => UserStatus::New,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            UserStatus::New => "new",
            UserStatus::Active => "active",
            UserStatus::Completed => "completed",
        }
    }
}
