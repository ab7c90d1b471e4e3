//! Converts persisted movements into comparable records.
//!
//! Records are rebuilt on every matching run and never cached.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::BTreeSet;

use crate::domain::Movement;

/// Coarse magnitude category used to scope candidate comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueBucket {
    Small,
    Medium,
    Large,
    VeryLarge,
}

impl ValueBucket {
    pub fn of(value: Decimal) -> Self {
        let value = value.abs();
        if value < Decimal::from(100_000) {
            ValueBucket::Small
        } else if value < Decimal::from(1_000_000) {
            ValueBucket::Medium
        } else if value < Decimal::from(10_000_000) {
            ValueBucket::Large
        } else {
            ValueBucket::VeryLarge
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComparisonRecord {
    pub movement_id: i64,
    /// `None` when no known format could read the stored date.
    pub date: Option<NaiveDate>,
    pub value: Decimal,
    pub bucket: ValueBucket,
    pub description: String,
    pub tokens: BTreeSet<String>,
}

impl ComparisonRecord {
    pub fn from_movement(movement: &Movement) -> Self {
        let value = round_value(movement.value);
        let description = clean_description(&movement.description);
        let tokens = description
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            movement_id: movement.id,
            date: parse_movement_date(&movement.date),
            value,
            bucket: ValueBucket::of(value),
            description,
            tokens,
        }
    }

    pub fn day_of_month(&self) -> Option<u32> {
        self.date.map(|d| d.day())
    }

    /// Absolute distance in days, if both sides carry a valid date.
    pub fn day_distance(&self, other: &ComparisonRecord) -> Option<i64> {
        match (self.date, other.date) {
            (Some(a), Some(b)) => Some((a - b).num_days().abs()),
            _ => None,
        }
    }
}

pub fn normalize(movements: &[Movement]) -> Vec<ComparisonRecord> {
    movements.iter().map(ComparisonRecord::from_movement).collect()
}

/// Two-decimal, sign-free, trailing-zero-free amount used as a join key.
pub fn round_value(value: Decimal) -> Decimal {
    value.abs().round_dp(2).normalize()
}

const STOP_WORDS: &[&str] = &[
    "de", "la", "el", "en", "a", "por", "con", "para", "del", "los", "las", "y", "o", "un", "una",
    "banco", "debito", "credito", "transferencia", "pago", "ref", "referencia", "mov",
    "movimiento",
];

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("static regex"));

/// Lower-cases, strips punctuation, and drops filler and short words.
pub fn clean_description(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let spaced = NON_WORD.replace_all(&lowered, " ");
    spaced
        .split_whitespace()
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy)]
enum FieldOrder {
    YearMonthDay,
    DayMonthYear,
    MonthDayYear,
}

// Tried top to bottom; first valid calendar date wins.
static DATE_FORMATS: Lazy<Vec<(Regex, FieldOrder)>> = Lazy::new(|| {
    [
        (r"^(\d{4})-(\d{1,2})-(\d{1,2})$", FieldOrder::YearMonthDay),
        (r"^(\d{1,2})/(\d{1,2})/(\d{4})$", FieldOrder::DayMonthYear),
        (r"^(\d{1,2})/(\d{1,2})/(\d{4})$", FieldOrder::MonthDayYear),
        (r"^(\d{1,2})-(\d{1,2})-(\d{4})$", FieldOrder::DayMonthYear),
        (r"^(\d{4})(\d{2})(\d{2})$", FieldOrder::YearMonthDay),
        (r"^(\d{1,2})/(\d{1,2})/(\d{2})$", FieldOrder::DayMonthYear),
    ]
    .into_iter()
    .map(|(pattern, order)| (Regex::new(pattern).expect("static regex"), order))
    .collect()
});

// `%y` goes first: `%Y` would read `24` as year 24.
const MONTH_NAME_FORMATS: &[&str] = &[
    "%d-%B-%y",
    "%d-%B-%Y",
    "%d %B %y",
    "%d %B %Y",
    "%B %d, %Y",
    "%B %d %Y",
];

static DIGIT_GROUPS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

/// Parses the heterogeneous date text found in imported ledgers.
///
/// Known formats are tried in a fixed order (`YYYY-MM-DD`, `DD/MM/YYYY`,
/// `MM/DD/YYYY`, `DD-MM-YYYY`, `YYYYMMDD`, `DD/MM/YY`). Statement-style dates
/// with a month name (`15-Nov-2024`, `Nov 15, 2024`) come next. Anything else
/// gets a permissive day-first read of its leading digit groups, which also
/// covers timestamps such as `2024-11-15 00:00:00`. Returns `None` instead of
/// failing.
pub fn parse_movement_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    for (pattern, order) in DATE_FORMATS.iter() {
        let Some(caps) = pattern.captures(raw) else {
            continue;
        };
        if let Some(date) = build_date(&caps[1], &caps[2], &caps[3], *order) {
            return Some(date);
        }
    }

    parse_month_name(raw).or_else(|| parse_day_first(raw))
}

fn parse_month_name(raw: &str) -> Option<NaiveDate> {
    if !raw.chars().any(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    MONTH_NAME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn parse_day_first(raw: &str) -> Option<NaiveDate> {
    let groups: Vec<&str> = DIGIT_GROUPS.find_iter(raw).map(|m| m.as_str()).take(3).collect();
    let [a, b, c] = groups[..] else {
        return None;
    };

    if a.len() == 4 {
        return build_date(a, b, c, FieldOrder::YearMonthDay);
    }
    build_date(a, b, c, FieldOrder::DayMonthYear)
        .or_else(|| build_date(a, b, c, FieldOrder::MonthDayYear))
}

fn build_date(first: &str, second: &str, third: &str, order: FieldOrder) -> Option<NaiveDate> {
    let (year, month, day) = match order {
        FieldOrder::YearMonthDay => (first, second, third),
        FieldOrder::DayMonthYear => (third, second, first),
        FieldOrder::MonthDayYear => (third, first, second),
    };
    let year = expand_year(year)?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn expand_year(raw: &str) -> Option<i32> {
    let year: i32 = raw.parse().ok()?;
    match raw.len() {
        4 => Some(year),
        // POSIX %y pivot: 69-99 -> 19xx, 00-68 -> 20xx.
        1 | 2 if year >= 69 => Some(1900 + year),
        1 | 2 => Some(2000 + year),
        _ => None,
    }
}
