//! Recurrence rules and next-occurrence calculation
//!
//! Models the Outlook/Google-style recurring schedule carried by records in
//! the `recurrence` property: Daily, Weekly, Monthly and Yearly patterns
//! with a repeat interval and an optional end date. The wire form
//! ([`RecurrenceRule`]) mirrors the stored JSON exactly; the validated form
//! ([`Schedule`]) is a tagged variant that makes invalid field combinations
//! unrepresentable.
//!
//! All calculations are UTC calendar arithmetic on whole days. The
//! time-of-day of every produced occurrence comes from the rule's start
//! timestamp; time zones and daylight saving are deliberately ignored.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::from_unix;

/// Search bound applied when a rule has no `endbydate`, keeping
/// enumeration finite (days past "now")
pub const DEFAULT_LOOKAHEAD_DAYS: i64 = 30;

/// Weekly day mask bits: Sunday is the high bit, Saturday the low bit
///
/// e.g. 42 = 0101010 = Monday + Wednesday + Friday.
pub fn weekday_bit(day: Weekday) -> u16 {
    1 << (6 - day.num_days_from_sunday())
}

/// Recurrence rule as stored in record JSON
///
/// Optional fields are nullable on the wire; absent means "not applicable"
/// for the pattern, never zero. Validation happens in [`Schedule::from_rule`],
/// not during deserialization, so a structurally-broken rule surfaces as a
/// recoverable error instead of a serde failure deep in a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceRule {
    /// Unix seconds; the date anchors the pattern, the time-of-day is
    /// applied to every produced occurrence
    #[serde(rename = "startdate")]
    pub start_date: i64,

    /// Occurrence length in seconds (zero-length occurrences are valid)
    #[serde(rename = "duration", default)]
    pub duration: i64,

    /// "D" daily, "W" weekly, "M" monthly, "Y" yearly
    #[serde(rename = "recurrencepatterncode")]
    pub pattern_code: String,

    /// Days/weeks/months/years between occurrences, at least 1
    #[serde(rename = "recurevery")]
    pub recur_every: u32,

    /// Month of the year to recur in (Yearly only, 1 = January)
    #[serde(rename = "yearlymonth", default)]
    pub yearly_month: Option<u32>,

    /// Week of the month, used together with `monthlydayofweek`
    #[serde(rename = "monthlyweekofmonth", default)]
    pub monthly_week_of_month: Option<u32>,

    /// Day of the week (0 = Sunday), used together with `monthlyweekofmonth`
    #[serde(rename = "monthlydayofweek", default)]
    pub monthly_day_of_week: Option<u32>,

    /// Fixed day of the month, mutually exclusive with the pair above
    #[serde(rename = "monthlyday", default)]
    pub monthly_day: Option<u32>,

    /// Weekly day mask, see [`weekday_bit`]
    #[serde(rename = "weeklydaysincluded", default)]
    pub weekly_days_included: Option<u16>,

    /// Daily only: skip Saturday/Sunday occurrences without shifting cadence
    #[serde(rename = "dailyisonlyweekday", default)]
    pub daily_is_only_weekday: Option<bool>,

    /// Unix seconds; no occurrence may start after this date
    #[serde(rename = "endbydate", default)]
    pub end_by_date: Option<i64>,
}

impl RecurrenceRule {
    /// Parse the stored JSON form
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate into the typed schedule form
    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::from_rule(self)
    }
}

/// Day-of-month selector for Monthly and Yearly patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthlyBy {
    /// The same numeric day each month; months without that day are skipped
    MonthDay(u32),
    /// The Nth given weekday of the month (e.g. week 4, Thursday);
    /// months without an Nth such weekday are skipped
    NthWeekday { week: u32, weekday: Weekday },
}

impl MonthlyBy {
    fn matches(&self, date: NaiveDate) -> bool {
        match self {
            MonthlyBy::MonthDay(day) => date.day() == *day,
            MonthlyBy::NthWeekday { week, weekday } => {
                date.weekday() == *weekday && (date.day() - 1) / 7 + 1 == *week
            }
        }
    }
}

/// Validated recurrence pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Daily { weekdays_only: bool },
    Weekly { day_mask: u16 },
    Monthly { by: MonthlyBy },
    Yearly { month: u32, by: MonthlyBy },
}

/// A recurrence rule in validated, directly-evaluable form
#[derive(Debug, Clone)]
pub struct Schedule {
    start: NaiveDateTime,
    duration_secs: i64,
    every: i64,
    pattern: Pattern,
    end_by: Option<DateTime<Utc>>,
}

/// One concrete occurrence produced by a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

fn weekday_from_num(n: u32) -> Result<Weekday> {
    match n {
        0 => Ok(Weekday::Sun),
        1 => Ok(Weekday::Mon),
        2 => Ok(Weekday::Tue),
        3 => Ok(Weekday::Wed),
        4 => Ok(Weekday::Thu),
        5 => Ok(Weekday::Fri),
        6 => Ok(Weekday::Sat),
        _ => Err(Error::Recurrence(format!("day of week {} out of range", n))),
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// The Sunday on or before `date`; weekly cadence is counted in
/// Sunday-anchored weeks, matching the day-mask bit order
fn week_anchor(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_sunday() as i64)
}

fn months_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to.year() as i64 - from.year() as i64) * 12 + to.month() as i64 - from.month() as i64
}

fn monthly_by(rule: &RecurrenceRule) -> Result<MonthlyBy> {
    match (
        rule.monthly_week_of_month,
        rule.monthly_day_of_week,
        rule.monthly_day,
    ) {
        (Some(week), Some(dow), None) => {
            if !(1..=5).contains(&week) {
                return Err(Error::Recurrence(format!(
                    "week of month {} out of range",
                    week
                )));
            }
            Ok(MonthlyBy::NthWeekday {
                week,
                weekday: weekday_from_num(dow)?,
            })
        }
        (None, None, Some(day)) => {
            if !(1..=31).contains(&day) {
                return Err(Error::Recurrence(format!("day of month {} out of range", day)));
            }
            Ok(MonthlyBy::MonthDay(day))
        }
        _ => Err(Error::Recurrence(
            "exactly one of week-of-month + day-of-week or day-of-month must be set".to_string(),
        )),
    }
}

impl Schedule {
    /// Validate a wire rule into evaluable form
    pub fn from_rule(rule: &RecurrenceRule) -> Result<Self> {
        if rule.recur_every < 1 {
            return Err(Error::Recurrence("recurrence interval must be at least 1".to_string()));
        }
        if rule.duration < 0 {
            return Err(Error::Recurrence("occurrence duration cannot be negative".to_string()));
        }

        let start = from_unix(rule.start_date).naive_utc();

        let pattern = match rule.pattern_code.as_str() {
            "D" => Pattern::Daily {
                weekdays_only: rule.daily_is_only_weekday.unwrap_or(false),
            },
            "W" => {
                let day_mask = rule.weekly_days_included.unwrap_or(0);
                if day_mask == 0 || day_mask > 0x7f {
                    return Err(Error::Recurrence(format!(
                        "weekly day mask {} does not select any day",
                        day_mask
                    )));
                }
                Pattern::Weekly { day_mask }
            }
            "M" => Pattern::Monthly {
                by: monthly_by(rule)?,
            },
            "Y" => {
                let month = rule.yearly_month.unwrap_or(start.month());
                if !(1..=12).contains(&month) {
                    return Err(Error::Recurrence(format!("month {} out of range", month)));
                }
                Pattern::Yearly {
                    month,
                    by: monthly_by(rule)?,
                }
            }
            other => {
                return Err(Error::Recurrence(format!(
                    "unknown recurrence pattern code {:?}",
                    other
                )))
            }
        };

        Ok(Schedule {
            start,
            duration_secs: rule.duration,
            every: rule.recur_every as i64,
            pattern,
            end_by: rule.end_by_date.map(from_unix),
        })
    }

    /// Whether `date` is a calendar occurrence of this schedule
    ///
    /// Pure pattern membership; the `endbydate` bound and the "strictly
    /// after now" selection live in [`Schedule::next_after`].
    pub fn matches(&self, date: NaiveDate) -> bool {
        let anchor = self.start.date();
        if date < anchor {
            return false;
        }
        match self.pattern {
            Pattern::Daily { weekdays_only } => {
                let days = date.signed_duration_since(anchor).num_days();
                // Skipped weekend days do not shift the cadence
                days % self.every == 0 && !(weekdays_only && is_weekend(date))
            }
            Pattern::Weekly { day_mask } => {
                let weeks = week_anchor(date)
                    .signed_duration_since(week_anchor(anchor))
                    .num_days()
                    / 7;
                weeks % self.every == 0 && day_mask & weekday_bit(date.weekday()) != 0
            }
            Pattern::Monthly { by } => {
                let months = months_between(anchor, date);
                months % self.every == 0 && by.matches(date)
            }
            Pattern::Yearly { month, by } => {
                let years = date.year() as i64 - anchor.year() as i64;
                date.month() == month && years % self.every == 0 && by.matches(date)
            }
        }
    }

    /// First occurrence whose start instant is strictly after `now`
    ///
    /// Enumeration is bounded by `endbydate` when present, otherwise by
    /// `now` + [`DEFAULT_LOOKAHEAD_DAYS`]. Returns `None` when the rule has
    /// no further occurrence inside that window ("no more occurrences").
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<Occurrence> {
        // An end date already behind us means the rule is spent, full stop
        if self.end_by.is_some_and(|end_by| end_by < now) {
            return None;
        }
        let window_end = match self.end_by {
            Some(end_by) => end_by.date_naive(),
            None => now.date_naive() + Duration::days(DEFAULT_LOOKAHEAD_DAYS),
        };

        // Days before today cannot produce a start instant after `now`
        let mut date = self.start.date().max(now.date_naive());
        while date <= window_end {
            if self.matches(date) {
                let start = date.and_time(self.start.time()).and_utc();
                if start > now {
                    return Some(Occurrence {
                        start,
                        end: start + Duration::seconds(self.duration_secs),
                    });
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}
