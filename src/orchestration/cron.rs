//! Cron expression parser.
//!
//! Supports the classic 5-field form `MIN HOUR DOM MON DOW` and a 6-field
//! form with a leading seconds field. Each field accepts `*`, `N`, `A-B`,
//! `*/S`, `A-B/S`, `A/S` and comma-separated lists of those. Month and
//! weekday fields also accept three-letter names. `@hourly`, `@daily`,
//! `@weekly`, `@monthly` and `@yearly` are shorthands.
//!
//! As in standard cron, when both day-of-month and day-of-week are
//! restricted a day matches if either one does.

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_after` searches before giving up (e.g. `0 0 30 2 *`).
const SEARCH_YEARS: i32 = 5;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (second_field, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(invalid(
                    expression,
                    format!("expected 5 or 6 fields, found {}", n),
                ))
            }
        };

        let field = |spec: &str, min: u32, max: u32, names: &[&str]| {
            parse_field(spec, min, max, names).map_err(|reason| invalid(expression, reason))
        };

        let seconds = field(second_field, 0, 59, &[])?;
        let minutes = field(rest[0], 0, 59, &[])?;
        let hours = field(rest[1], 0, 23, &[])?;
        let days_of_month = field(rest[2], 1, 31, &[])?;
        let months = field(rest[3], 1, 12, &MONTHS)?;
        let mut days_of_week = field(rest[4], 0, 7, &WEEKDAYS)?;
        // 7 is an alias for Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: trimmed.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: rest[2] != "*",
            dow_restricted: rest[4] != "*",
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        has(self.months, time.month())
            && self.day_matches(time.date_naive())
            && has(self.hours, time.hour())
            && has(self.minutes, time.minute())
            && has(self.seconds, time.second())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// The first matching instant strictly after `after`, at whole-second
    /// resolution. `None` when nothing matches within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = DateTime::<Utc>::from_timestamp(after.timestamp() + 1, 0)?;
        let horizon = after.year() + SEARCH_YEARS;

        while t.year() <= horizon {
            if !has(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                let next_day = t.date_naive().checked_add_days(Days::new(1))?;
                t = next_day.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + chrono::Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t = t.with_second(0)? + chrono::Duration::minutes(1);
                continue;
            }
            if !has(self.seconds, t.second()) {
                t += chrono::Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl std::str::FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

fn invalid(expression: &str, reason: String) -> Error {
    Error::InvalidCron {
        expression: expression.to_string(),
        reason,
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

/// Parse one field into a bitmask over `min..=max`.
fn parse_field(spec: &str, min: u32, max: u32, names: &[&str]) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for part in spec.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in '{}'", spec));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, min, max, names)?, value(b, min, max, names)?)
        } else {
            let start = value(range, min, max, names)?;
            // `N/S` runs from N to the end of the range
            (start, if step.is_some() { max } else { start })
        };
        if start > end {
            return Err(format!("range {}-{} is reversed", start, end));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (start..=end).step_by(step) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn value(token: &str, min: u32, max: u32, names: &[&str]) -> std::result::Result<u32, String> {
    let lower = token.to_ascii_lowercase();
    if let Some(index) = names.iter().position(|name| *name == lower) {
        // Month names are 1-based, weekday names 0-based
        let offset = if names.len() == 12 { 1 } else { 0 };
        return Ok(index as u32 + offset);
    }
    let v: u32 = token
        .parse()
        .map_err(|_| format!("invalid value '{}'", token))?;
    if v < min || v > max {
        return Err(format!("{} is outside {}..={}", v, min, max));
    }
    Ok(v)
}
