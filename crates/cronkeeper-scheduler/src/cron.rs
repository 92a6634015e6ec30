//! Cron expression evaluator.
//!
//! Accepts the classic five-field form `minute hour day-of-month month
//! day-of-week` and the `@` shortcuts. Each field supports `*`, single values,
//! comma lists, ranges (`a-b`) and steps (`*/n`, `a-b/n`, `a/n`). Months and
//! weekdays also accept three-letter English names; weekday `7` is Sunday.
//!
//! When both day-of-month and day-of-week are restricted (their text does not
//! start with `*`) a day matches if *either* field matches, as in Vixie cron:
//! `0 0 13 * 5` fires on every 13th and on every Friday.
//!
//! All evaluation is at minute granularity in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far ahead `next_after` searches before concluding an expression can
/// never match (e.g. `0 0 30 2 *`). Covers the longest leap-day gap.
const SEARCH_HORIZON_YEARS: i32 = 8;

const SHORTCUTS: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// One of the five positional cron fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronField {
    const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    fn bounds(self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            // 7 is accepted as an alias for Sunday and folded to 0.
            CronField::DayOfWeek => (0, 7),
        }
    }

    fn value_of(self, token: &str) -> Option<u32> {
        if let Ok(n) = token.parse::<u32>() {
            return Some(n);
        }
        let names = match self {
            CronField::Month => MONTH_NAMES,
            CronField::DayOfWeek => WEEKDAY_NAMES,
            _ => return None,
        };
        let lower = token.to_ascii_lowercase();
        let idx = names.iter().position(|n| *n == lower)? as u32;
        // Months are 1-based, weekdays 0-based.
        Some(if self == CronField::Month { idx + 1 } else { idx })
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day-of-month",
            CronField::Month => "month",
            CronField::DayOfWeek => "day-of-week",
        };
        write!(f, "{s}")
    }
}

/// Why an expression was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("empty cron expression")]
    Empty,

    #[error("unknown shortcut `{0}`")]
    UnknownShortcut(String),

    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field `{value}`: {reason}")]
    Field {
        field: CronField,
        value: String,
        reason: String,
    },
}

/// A parsed five-field expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut masks = [0u64; 5];
        for (i, field) in CronField::ALL.iter().enumerate() {
            masks[i] = parse_field(*field, fields[i])?;
        }

        // Fold weekday 7 onto Sunday.
        let mut days_of_week = masks[4];
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes: masks[0],
            hours: masks[1],
            days_of_month: masks[2],
            months: masks[3],
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn matches(&self, t: &NaiveDateTime) -> bool {
        bit(self.minutes, t.minute())
            && bit(self.hours, t.hour())
            && bit(self.months, t.month())
            && self.matches_day(t.date())
    }

    fn next_after(&self, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = floor_minute_naive(at) + Duration::minutes(1);
        let last_year = t.year() + SEARCH_HORIZON_YEARS;

        while t.year() <= last_year {
            if !bit(self.months, t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.matches_day(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

/// A parsed trigger expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// `@reboot`: fires once when the trigger loop starts, never on the clock.
    Reboot,
    Cron(CronSchedule),
}

impl Trigger {
    /// Parse a trigger expression. No partially valid trigger is ever built.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(CronError::Empty);
        }

        if expr.starts_with('@') {
            let lower = expr.to_ascii_lowercase();
            if lower == "@reboot" {
                return Ok(Trigger::Reboot);
            }
            let canonical = SHORTCUTS
                .iter()
                .find(|(name, _)| *name == lower)
                .map(|(_, canonical)| *canonical)
                .ok_or_else(|| CronError::UnknownShortcut(expr.to_string()))?;
            return CronSchedule::parse(canonical).map(Trigger::Cron);
        }

        CronSchedule::parse(expr).map(Trigger::Cron)
    }

    pub fn is_reboot(&self) -> bool {
        matches!(self, Trigger::Reboot)
    }

    /// Whether the calendar minute containing `at` matches. Seconds are ignored.
    ///
    /// This does not remember previous firings; callers guard against firing
    /// twice in the same minute.
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        match self {
            Trigger::Reboot => false,
            Trigger::Cron(schedule) => schedule.matches(&at.naive_utc()),
        }
    }

    /// The first matching minute strictly after the minute containing `at`.
    ///
    /// `None` for `@reboot` and for expressions that can never match
    /// (such as February 30th).
    pub fn next_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Reboot => None,
            Trigger::Cron(schedule) => schedule
                .next_after(at.naive_utc())
                .map(|t| Utc.from_utc_datetime(&t)),
        }
    }
}

impl FromStr for Trigger {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Trigger::parse(s)
    }
}

/// Truncate an instant to the start of its calendar minute.
pub fn floor_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&floor_minute_naive(at.naive_utc()))
}

fn floor_minute_naive(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(field: CronField, text: &str) -> Result<u64, CronError> {
    let err = |reason: String| CronError::Field {
        field,
        value: text.to_string(),
        reason,
    };
    let (min, max) = field.bounds();
    let value = |token: &str| -> Result<u32, CronError> {
        let n = field
            .value_of(token)
            .ok_or_else(|| err(format!("`{token}` is not a number")))?;
        if n < min || n > max {
            return Err(err(format!("{n} is outside {min}-{max}")));
        }
        Ok(n)
    };

    let mut mask = 0u64;
    for item in text.split(',') {
        if item.is_empty() {
            return Err(err("empty list item".to_string()));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| err(format!("step `{step}` is not a number")))?;
                if step == 0 || step > max {
                    return Err(err(format!("step {step} is outside 1-{max}")));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (value(a)?, value(b)?);
            if a > b {
                return Err(err(format!("range {a}-{b} is reversed")));
            }
            (a, b)
        } else {
            let a = value(range)?;
            // `a/n` means "from a to the end of the field, every n".
            if step.is_some() {
                (a, max)
            } else {
                (a, a)
            }
        };

        let step = step.unwrap_or(1);
        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }
    Ok(mask)
}
