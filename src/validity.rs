//! Document date parsing and validity-window evaluation.
//!
//! Dates arrive in whatever format the issuing organization used; we accept
//! ISO, the two common numeric Russian forms, and textual Russian months.
//! The validity window starts at the document date and runs for the number
//! of days the doc-type registry assigns.

use std::sync::LazyLock;

use chrono::{Days, FixedOffset, NaiveDate, Utc};
use regex::Regex;

use crate::doc_types::ValidityRule;

/// Numeric formats tried in order.
const NUMERIC_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"];

/// Russian month names in the genitive case, as written in dates.
const RUSSIAN_MONTHS: &[&str] = &[
    "января",
    "февраля",
    "марта",
    "апреля",
    "мая",
    "июня",
    "июля",
    "августа",
    "сентября",
    "октября",
    "ноября",
    "декабря",
];

static TEXTUAL_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,2})\s+([а-яё]+)\s+(\d{4})")
        .expect("static regex should be valid")
});

/// Parse a document date. Returns `None` on anything unrecognizable; a
/// missing or garbled date is a business outcome, not an error.
pub fn parse_doc_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    for format in NUMERIC_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }

    // Textual Russian form, e.g. "15 января 2025" or "15 января 2025 г."
    let captures = TEXTUAL_DATE.captures(trimmed)?;
    let day: u32 = captures[1].parse().ok()?;
    let month_name = captures[2].to_lowercase();
    let month = RUSSIAN_MONTHS
        .iter()
        .position(|name| *name == month_name)
        .map(|idx| idx as u32 + 1)?;
    let year: i32 = captures[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// The server's notion of "today": local date at UTC+5.
pub fn today() -> NaiveDate {
    let offset = FixedOffset::east_opt(5 * 3600).expect("fixed offset is valid");
    Utc::now().with_timezone(&offset).date_naive()
}

/// Is the document still inside its validity window as of `today`?
///
/// The window is `[doc_date, doc_date + N days]`, inclusive on both ends.
pub fn is_within_validity(doc_date: NaiveDate, rule: ValidityRule, today: NaiveDate) -> bool {
    match doc_date.checked_add_days(Days::new(u64::from(rule.days()))) {
        Some(end) => today <= end,
        // Adding the window overflowed the calendar; treat as still valid.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_iso() {
        assert_eq!(parse_doc_date("2025-11-01"), Some(date(2025, 11, 1)));
    }

    #[test]
    fn test_parse_dotted() {
        assert_eq!(parse_doc_date("01.11.2025"), Some(date(2025, 11, 1)));
    }

    #[test]
    fn test_parse_slashed() {
        assert_eq!(parse_doc_date("01/11/2025"), Some(date(2025, 11, 1)));
    }

    #[test]
    fn test_parse_textual_russian() {
        assert_eq!(parse_doc_date("15 января 2025"), Some(date(2025, 1, 15)));
        assert_eq!(parse_doc_date("3 августа 2024 г."), Some(date(2024, 8, 3)));
        assert_eq!(parse_doc_date("15 Января 2025 года"), Some(date(2025, 1, 15)));
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_doc_date(""), None);
        assert_eq!(parse_doc_date("вчера"), None);
        assert_eq!(parse_doc_date("2025-13-40"), None);
        assert_eq!(parse_doc_date("31 лютого 2025"), None);
    }

    #[test]
    fn test_window_default() {
        let rule = ValidityRule::FixedDays(40);
        let issued = date(2025, 11, 1);
        assert!(is_within_validity(issued, rule, date(2025, 11, 15)));
        // The last day of the window is still valid.
        assert!(is_within_validity(issued, rule, date(2025, 12, 11)));
        assert!(!is_within_validity(issued, rule, date(2025, 12, 12)));
    }

    #[test]
    fn test_window_override() {
        let rule = ValidityRule::FixedDays(365);
        let issued = date(2024, 11, 20);
        assert!(is_within_validity(issued, rule, date(2025, 11, 15)));
        assert!(!is_within_validity(issued, rule, date(2025, 11, 21)));
    }

    #[test]
    fn test_expired_document() {
        let rule = ValidityRule::FixedDays(40);
        assert!(!is_within_validity(date(2024, 1, 1), rule, date(2025, 11, 15)));
    }

    #[test]
    fn test_future_document_is_valid() {
        // A document dated after "today" has not expired.
        let rule = ValidityRule::FixedDays(40);
        assert!(is_within_validity(date(2025, 12, 1), rule, date(2025, 11, 15)));
    }
}
