//! Panel frequencies and their calendar arithmetic.
//!
//! Every frequency tag maps dates onto an integer *period index*. Two
//! observations are adjacent when their indices differ by exactly one, which
//! is how gap filling and the train/test adjacency contract are expressed.

use std::fmt;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Canonical frequency tag of a panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Frequency {
    /// Business day (Monday–Friday).
    B,
    /// Calendar day.
    D,
    W,
    M,
    Q,
    Y,
}

/// Monday used as the anchor for day/week/business-day indices.
fn anchor_monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 5).unwrap_or_default()
}

impl Frequency {
    pub const ALL: [Frequency; 6] = [
        Frequency::B,
        Frequency::D,
        Frequency::W,
        Frequency::M,
        Frequency::Q,
        Frequency::Y,
    ];

    /// Parse a frequency tag, accepting the usual pandas offset aliases.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_uppercase();
        let head = tag.split('-').next().unwrap_or("");
        match head {
            "B" | "BD" => Some(Frequency::B),
            "D" => Some(Frequency::D),
            "W" => Some(Frequency::W),
            "M" | "ME" | "MS" | "BM" | "BME" | "BMS" => Some(Frequency::M),
            "Q" | "QE" | "QS" | "BQ" | "BQE" => Some(Frequency::Q),
            "Y" | "YE" | "YS" | "A" | "AS" | "BA" | "BY" => Some(Frequency::Y),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Frequency::B => "B",
            Frequency::D => "D",
            Frequency::W => "W",
            Frequency::M => "M",
            Frequency::Q => "Q",
            Frequency::Y => "Y",
        }
    }

    /// Seasonality used when the catalog entry does not declare one.
    pub fn default_seasonality(self) -> usize {
        match self {
            Frequency::B => 5,
            Frequency::D => 7,
            Frequency::W => 52,
            Frequency::M => 12,
            Frequency::Q => 4,
            Frequency::Y => 1,
        }
    }

    /// Test horizon used when the caller does not pass one.
    pub fn default_horizon(self) -> usize {
        match self {
            Frequency::B | Frequency::D => 60,
            Frequency::W => 26,
            Frequency::M => 24,
            Frequency::Q => 8,
            Frequency::Y => 5,
        }
    }

    /// Business-day and calendar-day panels (the ones `--skip-daily` excludes).
    pub fn is_daily(self) -> bool {
        matches!(self, Frequency::B | Frequency::D)
    }

    /// Integer index of the period containing `date`.
    ///
    /// Weekend dates of a business-day panel share Friday's index.
    pub fn period_index(self, date: NaiveDate) -> i64 {
        let days = (date - anchor_monday()).num_days();
        match self {
            Frequency::B => {
                let week = days.div_euclid(7);
                let weekday = days.rem_euclid(7).min(4);
                week * 5 + weekday
            }
            Frequency::D => days,
            Frequency::W => days.div_euclid(7),
            Frequency::M => i64::from(date.year()) * 12 + i64::from(date.month0()),
            Frequency::Q => i64::from(date.year()) * 4 + i64::from(date.month0() / 3),
            Frequency::Y => i64::from(date.year()),
        }
    }

    /// Timestamp of the period following the one containing `date`.
    ///
    /// Month-end dates stay at month end for monthly and coarser steps.
    pub fn advance(self, date: NaiveDate) -> NaiveDate {
        match self {
            Frequency::B => {
                let mut next = date + Days::new(1);
                while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
                    next = next + Days::new(1);
                }
                next
            }
            Frequency::D => date + Days::new(1),
            Frequency::W => date + Days::new(7),
            Frequency::M => add_months_keep_end(date, 1),
            Frequency::Q => add_months_keep_end(date, 3),
            Frequency::Y => add_months_keep_end(date, 12),
        }
    }

    /// Number of period steps from `a` to `b` (negative when `b` precedes `a`).
    pub fn periods_between(self, a: NaiveDate, b: NaiveDate) -> i64 {
        self.period_index(b) - self.period_index(a)
    }
}

fn is_month_end(date: NaiveDate) -> bool {
    (date + Days::new(1)).month() != date.month()
}

fn add_months_keep_end(date: NaiveDate, months: u32) -> NaiveDate {
    let shifted = date
        .checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX);
    if !is_month_end(date) {
        return shifted;
    }
    // Jump to the first day of the following month, then step back one day.
    let first_of_month = shifted.with_day(1).unwrap_or(shifted);
    first_of_month
        .checked_add_months(Months::new(1))
        .and_then(|d| d.pred_opt())
        .unwrap_or(shifted)
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for Frequency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for Frequency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Frequency::from_tag(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognized frequency tag '{raw}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_pandas_aliases() {
        assert_eq!(Frequency::from_tag("ME"), Some(Frequency::M));
        assert_eq!(Frequency::from_tag("qe"), Some(Frequency::Q));
        assert_eq!(Frequency::from_tag("W-FRI"), Some(Frequency::W));
        assert_eq!(Frequency::from_tag("A-DEC"), Some(Frequency::Y));
        assert_eq!(Frequency::from_tag("H"), None);
    }

    #[test]
    fn business_days_skip_weekends() {
        // 2024-03-08 is a Friday.
        let friday = d(2024, 3, 8);
        let monday = Frequency::B.advance(friday);
        assert_eq!(monday, d(2024, 3, 11));
        assert_eq!(Frequency::B.periods_between(friday, monday), 1);
    }

    #[test]
    fn month_end_stays_at_month_end() {
        assert_eq!(Frequency::M.advance(d(2024, 1, 31)), d(2024, 2, 29));
        assert_eq!(Frequency::M.advance(d(2024, 2, 29)), d(2024, 3, 31));
        assert_eq!(Frequency::M.advance(d(2024, 2, 1)), d(2024, 3, 1));
        assert_eq!(Frequency::Q.advance(d(2023, 12, 31)), d(2024, 3, 31));
        assert_eq!(Frequency::Y.advance(d(2023, 12, 31)), d(2024, 12, 31));
    }

    #[test]
    fn advance_is_one_period_for_every_frequency() {
        let start = d(2021, 6, 30);
        for freq in Frequency::ALL {
            let mut date = start;
            for _ in 0..40 {
                let next = freq.advance(date);
                assert_eq!(freq.periods_between(date, next), 1, "{freq} from {date}");
                date = next;
            }
        }
    }
}
