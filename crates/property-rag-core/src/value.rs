//! Typed field values and the parsers that normalize raw model output.
//!
//! Model output is never trusted as-is: every value goes through one of
//! the `parse_*` functions below, and anything that fails to parse is
//! treated as "not found" by the schema layer.
//!
//! Number formats follow German conventions first (`1.200,50`), since the
//! corpus is German real-estate paperwork, but English grouping
//! (`1,200.50`) is recognized whenever both separators are present.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldValue {
    Text {
        value: String,
    },
    /// Amount in minor units (cents) plus ISO 4217 currency code.
    Money {
        minor_units: i64,
        currency: String,
    },
    Date {
        value: NaiveDate,
    },
    /// Percentage as a plain number: `2.5` means 2.5 %.
    Percentage {
        value: f64,
    },
    Number {
        value: f64,
        unit: Option<String>,
    },
    Boolean {
        value: bool,
    },
    /// Two bounds stated in the source, kept apart rather than averaged.
    Range {
        low: Box<FieldValue>,
        high: Box<FieldValue>,
    },
    List {
        items: Vec<FieldValue>,
    },
    Group {
        fields: BTreeMap<String, Option<FieldValue>>,
    },
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text {
            value: value.into(),
        }
    }

    pub fn money(minor_units: i64, currency: &str) -> Self {
        FieldValue::Money {
            minor_units,
            currency: currency.to_string(),
        }
    }

    /// Empty lists and groups with no filled member count as not found.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text { value } => value.trim().is_empty(),
            FieldValue::List { items } => items.is_empty(),
            FieldValue::Group { fields } => fields.values().all(Option::is_none),
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text { value } => f.write_str(value),
            FieldValue::Money {
                minor_units,
                currency,
            } => {
                let sign = if *minor_units < 0 { "-" } else { "" };
                let abs = minor_units.unsigned_abs();
                write!(f, "{sign}{}.{:02} {currency}", abs / 100, abs % 100)
            }
            FieldValue::Date { value } => write!(f, "{}", value.format("%Y-%m-%d")),
            FieldValue::Percentage { value } => write!(f, "{}%", format_number(*value)),
            FieldValue::Number { value, unit } => match unit {
                Some(u) => write!(f, "{} {u}", format_number(*value)),
                None => f.write_str(&format_number(*value)),
            },
            FieldValue::Boolean { value } => f.write_str(if *value { "yes" } else { "no" }),
            FieldValue::Range { low, high } => write!(f, "{low} - {high}"),
            FieldValue::List { items } => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join("; "))
            }
            FieldValue::Group { fields } => {
                let parts: Vec<String> = fields
                    .iter()
                    .filter_map(|(k, v)| v.as_ref().map(|v| format!("{k}: {v}")))
                    .collect();
                f.write_str(&parts.join(", "))
            }
        }
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d(?:[\d.,'\u{a0}\u{202f}]*\d)?").unwrap());

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(.*?\d.*?)\s*(?:-|–|—|\bbis\b|\bto\b)\s*(.*?\d.*?)\s*$").unwrap()
});

/// One side of a range: a bare number with an optional currency or unit.
static RANGE_BOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:€|eur|chf|sfr|\$|usd|£|gbp)?\s*[-+]?\d[\d.,'\s\u{a0}\u{202f}]*?\s*(?:€|eur|chf|sfr|\$|usd|£|gbp|m²|m2|qm|ha|%)?\.?$",
    )
    .unwrap()
});

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})").unwrap());
static DOTTED_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})\.\s?(\d{1,2})\.\s?(\d{4})\b").unwrap());
static DAY_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})\.?\s+([A-Za-zÄÖÜäöü]+\.?)\s+(\d{4})\b").unwrap()
});
static MONTH_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-zÄÖÜäöü]+)\s+(\d{1,2}),?\s+(\d{4})\b").unwrap()
});

/// Parse the first number in `raw`, honoring German and English separators.
///
/// ```rust
/// use property_rag_core::value::parse_decimal;
///
/// assert_eq!(parse_decimal("1.200,50 EUR"), Some(1200.5));
/// assert_eq!(parse_decimal("1,200.50"), Some(1200.5));
/// assert_eq!(parse_decimal("ca. 85,5 m²"), Some(85.5));
/// ```
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let m = NUMBER_RE.find(raw)?;
    let cleaned: String = m
        .as_str()
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{a0}' | '\u{202f}'))
        .collect();

    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();
    let normalized = match (commas, dots) {
        (0, 0) => cleaned,
        (c, d) if c > 0 && d > 0 => {
            let last_comma = cleaned.rfind(',').unwrap_or(0);
            let last_dot = cleaned.rfind('.').unwrap_or(0);
            if last_comma > last_dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (1, 0) => cleaned.replace(',', "."),
        (_, 0) => cleaned.replace(',', ""),
        (0, 1) => {
            let decimals = cleaned.len() - cleaned.rfind('.').unwrap_or(0) - 1;
            if decimals == 3 {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        _ => cleaned.replace('.', ""),
    };
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Detect an explicit currency marker in `raw`.
pub fn detect_currency(raw: &str) -> Option<&'static str> {
    let lower = raw.to_lowercase();
    if lower.contains('€') || lower.contains("eur") {
        Some("EUR")
    } else if lower.contains("chf") || lower.contains("sfr") {
        Some("CHF")
    } else if lower.contains('$') || lower.contains("usd") {
        Some("USD")
    } else if lower.contains('£') || lower.contains("gbp") {
        Some("GBP")
    } else {
        None
    }
}

pub fn to_minor_units(amount: f64) -> Option<i64> {
    let minor = (amount * 100.0).round();
    if minor.is_finite() && minor.abs() < i64::MAX as f64 {
        Some(minor as i64)
    } else {
        None
    }
}

/// Split `raw` into two bounds if it states a range such as `1500–1600`
/// or `1.500 bis 1.600 EUR`.
///
/// Both sides must be bare amounts. A hyphen inside surrounding prose or a
/// date (`1200 EUR (Stand 2024-01-01)`) is not a range.
pub fn split_range(raw: &str) -> Option<(&str, &str)> {
    let caps = RANGE_RE.captures(raw)?;
    let low = caps.get(1)?.as_str().trim();
    let high = caps.get(2)?.as_str().trim();
    (RANGE_BOUND_RE.is_match(low) && RANGE_BOUND_RE.is_match(high)).then_some((low, high))
}

/// Parse a money amount, or a money range, from free text.
///
/// ```rust
/// use property_rag_core::value::{parse_money, FieldValue};
///
/// assert_eq!(
///     parse_money("Kaltmiete: 1200 EUR monatlich", "EUR").unwrap().to_string(),
///     "1200.00 EUR"
/// );
/// assert!(matches!(parse_money("1500–1600 €", "EUR"), Some(FieldValue::Range { .. })));
/// ```
pub fn parse_money(raw: &str, default_currency: &str) -> Option<FieldValue> {
    let currency = detect_currency(raw).unwrap_or(default_currency);
    if let Some((low, high)) = split_range(raw) {
        if let (Some(l), Some(h)) = (parse_decimal(low), parse_decimal(high)) {
            return Some(FieldValue::Range {
                low: Box::new(FieldValue::money(to_minor_units(l)?, currency)),
                high: Box::new(FieldValue::money(to_minor_units(h)?, currency)),
            });
        }
    }
    let amount = parse_decimal(raw)?;
    Some(FieldValue::money(to_minor_units(amount)?, currency))
}

/// Parse a number (optionally a range) and attach `unit`.
pub fn parse_number(raw: &str, unit: Option<&str>) -> Option<FieldValue> {
    let make = |v: f64| FieldValue::Number {
        value: v,
        unit: unit.map(str::to_string),
    };
    if let Some((low, high)) = split_range(raw) {
        if let (Some(l), Some(h)) = (parse_decimal(low), parse_decimal(high)) {
            return Some(FieldValue::Range {
                low: Box::new(make(l)),
                high: Box::new(make(h)),
            });
        }
    }
    parse_decimal(raw).map(make)
}

pub fn parse_percentage(raw: &str) -> Option<f64> {
    parse_decimal(raw)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "ja" | "yes" | "y" | "1" | "wahr" => Some(true),
        "false" | "nein" | "no" | "n" | "0" | "falsch" => Some(false),
        _ => None,
    }
}

const MONTHS: [(&str, u32); 27] = [
    ("januar", 1),
    ("jänner", 1),
    ("january", 1),
    ("februar", 2),
    ("february", 2),
    ("märz", 3),
    ("maerz", 3),
    ("march", 3),
    ("april", 4),
    ("mai", 5),
    ("may", 5),
    ("juni", 6),
    ("june", 6),
    ("juli", 7),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("oktober", 10),
    ("october", 10),
    ("november", 11),
    ("dezember", 12),
    ("december", 12),
    ("jan", 1),
    ("feb", 2),
    ("okt", 10),
    ("oct", 10),
    ("dez", 12),
];

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    MONTHS
        .iter()
        .find(|(n, _)| *n == lower.trim_end_matches('.'))
        .map(|(_, m)| *m)
}

/// Parse a calendar date from ISO, `DD.MM.YYYY`, or month-name formats.
///
/// ```rust
/// use property_rag_core::value::parse_date;
/// use chrono::NaiveDate;
///
/// let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
/// assert_eq!(parse_date("2024-03-01"), Some(d));
/// assert_eq!(parse_date("01.03.2024"), Some(d));
/// assert_eq!(parse_date("1. März 2024"), Some(d));
/// ```
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let num = |s: &str| s.parse::<u32>().ok();

    if let Some(c) = ISO_DATE_RE.captures(raw) {
        let y = c[1].parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(y, num(&c[2])?, num(&c[3])?);
    }
    if let Some(c) = DOTTED_DATE_RE.captures(raw) {
        let y = c[3].parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(y, num(&c[2])?, num(&c[1])?);
    }
    if let Some(c) = DAY_MONTH_RE.captures(raw) {
        if let Some(m) = month_number(&c[2]) {
            let y = c[3].parse::<i32>().ok()?;
            return NaiveDate::from_ymd_opt(y, m, num(&c[1])?);
        }
    }
    if let Some(c) = MONTH_DAY_RE.captures(raw) {
        if let Some(m) = month_number(&c[1]) {
            let y = c[3].parse::<i32>().ok()?;
            return NaiveDate::from_ymd_opt(y, m, num(&c[2])?);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_formats() {
        assert_eq!(parse_decimal("1200"), Some(1200.0));
        assert_eq!(parse_decimal("1.200"), Some(1200.0));
        assert_eq!(parse_decimal("1.250.000,00 €"), Some(1_250_000.0));
        assert_eq!(parse_decimal("12,5"), Some(12.5));
        assert_eq!(parse_decimal("85.5"), Some(85.5));
        assert_eq!(parse_decimal("1,250,000"), Some(1_250_000.0));
        assert_eq!(parse_decimal("-350,20"), Some(-350.2));
        assert_eq!(parse_decimal("keine Angabe"), None);
    }

    #[test]
    fn test_money_display_and_currency() {
        let v = parse_money("EUR 1.200,50", "EUR").unwrap();
        assert_eq!(v, FieldValue::money(120_050, "EUR"));
        assert_eq!(v.to_string(), "1200.50 EUR");
        assert_eq!(
            parse_money("CHF 900", "EUR").unwrap().to_string(),
            "900.00 CHF"
        );
        assert_eq!(
            parse_money("-84,10", "EUR").unwrap().to_string(),
            "-84.10 EUR"
        );
    }

    #[test]
    fn test_money_range_is_preserved() {
        for raw in ["1500–1600 EUR", "1.500 bis 1.600 €", "1500 - 1600", "1500 to 1600"] {
            match parse_money(raw, "EUR") {
                Some(FieldValue::Range { low, high }) => {
                    assert_eq!(*low, FieldValue::money(150_000, "EUR"), "{raw}");
                    assert_eq!(*high, FieldValue::money(160_000, "EUR"), "{raw}");
                }
                other => panic!("{raw}: expected range, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_hyphen_in_prose_or_date_is_not_a_range() {
        assert_eq!(
            parse_money("2.500 EUR - fällig am 3. Werktag", "EUR"),
            Some(FieldValue::money(250_000, "EUR"))
        );
        assert_eq!(
            parse_money("1200 EUR (Stand 2024-01-01)", "EUR"),
            Some(FieldValue::money(120_000, "EUR"))
        );
        assert_eq!(split_range("80 - 95 m²"), Some(("80", "95 m²")));
        assert_eq!(split_range("Baujahr 1985 - saniert 2010"), None);
    }

    #[test]
    fn test_negative_amount_is_not_a_range() {
        assert_eq!(
            parse_money("-200 EUR", "EUR"),
            Some(FieldValue::money(-20_000, "EUR"))
        );
    }

    #[test]
    fn test_dates() {
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd);
        assert_eq!(parse_date("2023-12-31T00:00:00"), d(2023, 12, 31));
        assert_eq!(parse_date("Beginn: 1.7.2022"), d(2022, 7, 1));
        assert_eq!(parse_date("15. Dezember 2021"), d(2021, 12, 15));
        assert_eq!(parse_date("March 5, 2020"), d(2020, 3, 5));
        assert_eq!(parse_date("31.02.2024"), None);
        assert_eq!(parse_date("unbefristet"), None);
    }

    #[test]
    fn test_number_with_unit() {
        let v = parse_number("ca. 72,4 qm", Some("m²")).unwrap();
        assert_eq!(v.to_string(), "72.4 m²");
        assert_eq!(parse_number("1985", None).unwrap().to_string(), "1985");
    }

    #[test]
    fn test_bool_and_percentage() {
        assert_eq!(parse_bool("Ja"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("vielleicht"), None);
        assert_eq!(parse_percentage("2,5 %"), Some(2.5));
    }

    #[test]
    fn test_empty_values() {
        assert!(FieldValue::text("  ").is_empty());
        assert!(FieldValue::List { items: vec![] }.is_empty());
        assert!(!FieldValue::money(0, "EUR").is_empty());
    }
}
