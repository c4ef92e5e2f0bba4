//! Cron expression parsing and next-fire computation.
//!
//! Supports the classic five-field format (`minute hour day-of-month month
//! day-of-week`) with `*`, single values, ranges (`a-b`), steps (`*/n`,
//! `a-b/n`, `a/n`), comma lists, month and weekday names, and the macros
//! `@hourly`, `@daily`, `@midnight`, `@weekly`, `@monthly`, `@yearly` and
//! `@annually`. All times are UTC.
//!
//! Day matching follows Vixie cron: when both day-of-month and day-of-week are
//! restricted a day matches if either field matches, otherwise both must.

use std::fmt;
use std::str::FromStr;

use jiff::civil::DateTime;
use jiff::tz::TimeZone;
use jiff::{Timestamp, ToSpan};
use thiserror::Error;

/// Upper bound on search steps in [`CronSchedule::next_after`].
/// Covers the eight-year gap between leap days with plenty of headroom.
const MAX_SEARCH_STEPS: usize = 100_000;

/// Longest month length for each month, leap years included.
const MAX_DAYS_IN_MONTH: [u8; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Errors produced while parsing a cron expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression is empty")]
    Empty,

    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown macro {0}")]
    UnknownMacro(String),

    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid {field} step '{value}'")]
    InvalidStep { field: &'static str, value: String },

    #[error("{field} range {start}-{end} is reversed")]
    ReversedRange {
        field: &'static str,
        start: u32,
        end: u32,
    },

    #[error("schedule '{0}' never fires")]
    NeverFires(String),
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// First entry of `names` maps to this value.
    names_offset: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_offset: 0,
};

const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_offset: 0,
};

const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_offset: 0,
};

const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_offset: 1,
};

// 7 is accepted as an alias for Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_offset: 0,
};

/// A parsed cron schedule. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_star: bool,
    day_of_week_star: bool,
}

impl CronSchedule {
    /// Parse an expression, rejecting schedules that can never fire
    /// (for example `0 0 30 2 *`).
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(CronError::Empty);
        }

        let expanded = if trimmed.starts_with('@') {
            expand_macro(trimmed)?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(CronError::FieldCount(fields.len()));
        };

        let mut days_of_week = parse_field(dow, DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        let schedule = Self {
            source: trimmed.to_string(),
            minutes: parse_field(minute, MINUTE)?,
            hours: parse_field(hour, HOUR)?,
            days_of_month: parse_field(dom, DAY_OF_MONTH)?,
            months: parse_field(month, MONTH)?,
            days_of_week,
            day_of_month_star: dom.starts_with('*'),
            day_of_week_star: dow.starts_with('*'),
        };

        if !schedule.can_fire() {
            return Err(CronError::NeverFires(trimmed.to_string()));
        }
        Ok(schedule)
    }

    /// The expression this schedule was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, at minute granularity.
    pub fn next_after(&self, after: Timestamp) -> Option<Timestamp> {
        let now = after.to_zoned(TimeZone::UTC).datetime();
        let mut candidate = now
            .date()
            .at(now.hour(), now.minute(), 0, 0)
            .checked_add(1.minute())
            .ok()?;

        for _ in 0..MAX_SEARCH_STEPS {
            if !bit(self.months, candidate.month()) {
                candidate = candidate
                    .date()
                    .first_of_month()
                    .checked_add(1.month())
                    .ok()?
                    .at(0, 0, 0, 0);
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = candidate.date().tomorrow().ok()?.at(0, 0, 0, 0);
                continue;
            }
            if !bit(self.hours, candidate.hour()) {
                candidate = candidate
                    .date()
                    .at(candidate.hour(), 0, 0, 0)
                    .checked_add(1.hour())
                    .ok()?;
                continue;
            }
            if !bit(self.minutes, candidate.minute()) {
                candidate = candidate.checked_add(1.minute()).ok()?;
                continue;
            }
            return candidate
                .to_zoned(TimeZone::UTC)
                .ok()
                .map(|zoned| zoned.timestamp());
        }
        None
    }

    fn day_matches(&self, candidate: DateTime) -> bool {
        let dom = bit(self.days_of_month, candidate.day());
        let dow = bit(
            self.days_of_week,
            candidate.weekday().to_sunday_zero_offset(),
        );
        if self.day_of_month_star || self.day_of_week_star {
            dom && dow
        } else {
            dom || dow
        }
    }

    fn can_fire(&self) -> bool {
        if self.minutes == 0 || self.hours == 0 || self.months == 0 {
            return false;
        }
        let dom_fires = (1..=12u8).any(|month| {
            bit(self.months, month as i8)
                && MAX_DAYS_IN_MONTH
                    .get(usize::from(month - 1))
                    .is_some_and(|&max| (1..=max).any(|day| bit(self.days_of_month, day as i8)))
        });
        let dow_fires = self.days_of_week != 0;

        match (self.day_of_month_star, self.day_of_week_star) {
            (false, false) => dom_fires || dow_fires,
            _ => dom_fires && dow_fires,
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn bit(set: u64, value: i8) -> bool {
    u32::try_from(value).is_ok_and(|v| v < 64 && set & (1 << v) != 0)
}

fn expand_macro(expression: &str) -> Result<&'static str, CronError> {
    match expression.to_ascii_lowercase().as_str() {
        "@hourly" => Ok("0 * * * *"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@monthly" => Ok("0 0 1 * *"),
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        _ => Err(CronError::UnknownMacro(expression.to_string())),
    }
}

fn parse_field(field: &str, spec: FieldSpec) -> Result<u64, CronError> {
    let mut set = 0u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| CronError::InvalidStep {
                        field: spec.name,
                        value: item.to_string(),
                    })?;
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (start, end) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if start > end {
                return Err(CronError::ReversedRange {
                    field: spec.name,
                    start,
                    end,
                });
            }
            (start, end)
        } else {
            let value = parse_value(range, spec)?;
            // `a/n` runs from a to the end of the field.
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            set |= 1 << value;
        }
    }
    Ok(set)
}

fn parse_value(token: &str, spec: FieldSpec) -> Result<u32, CronError> {
    let lower = token.to_ascii_lowercase();
    let value = match spec.names.iter().position(|name| *name == lower) {
        Some(idx) => idx as u32 + spec.names_offset,
        None => lower.parse::<u32>().map_err(|_| CronError::InvalidValue {
            field: spec.name,
            value: token.to_string(),
        })?,
    };
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}
