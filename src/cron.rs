//! Crontab expression parsing and matching.
//!
//! Supports the standard five-field grammar (`minute hour day month weekday`)
//! plus the usual nicknames (`@hourly`, `@daily`, ...). Month and weekday
//! fields accept uppercase three-letter aliases (`JAN`..`DEC`, `MON`..`SUN`,
//! Monday = 1, Sunday = 7). Parsing is strict: out-of-range values and
//! unrecognized tokens (including lowercase aliases) are errors.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::BTreeSet;

const NICKNAMES: &[(&str, &str)] = &[
    ("@annually", "0 0 1 1 *"),
    ("@yearly", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 7"),
    ("@midnight", "0 0 * * *"),
    ("@daily", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

const MONTH_ALIASES: &[(&str, &str)] = &[
    ("JAN", "1"),
    ("FEB", "2"),
    ("MAR", "3"),
    ("APR", "4"),
    ("MAY", "5"),
    ("JUN", "6"),
    ("JUL", "7"),
    ("AUG", "8"),
    ("SEP", "9"),
    ("OCT", "10"),
    ("NOV", "11"),
    ("DEC", "12"),
];

const WEEKDAY_ALIASES: &[(&str, &str)] = &[
    ("MON", "1"),
    ("TUE", "2"),
    ("WED", "3"),
    ("THU", "4"),
    ("FRI", "5"),
    ("SAT", "6"),
    ("SUN", "7"),
];

/// A parsed crontab expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    input: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
}

impl Expression {
    /// Parse a crontab expression or nickname.
    pub fn parse(input: &str) -> Result<Expression> {
        let expanded = NICKNAMES
            .iter()
            .find(|(nick, _)| *nick == input)
            .map(|(_, expr)| *expr)
            .unwrap_or(input);

        let fields: Vec<&str> = expanded.split_whitespace().collect();

        let [minute, hour, day, month, weekday] = fields.as_slice() else {
            return Err(Error::InvalidCron(format!(
                "incorrect number of fields: {input}"
            )));
        };

        let month = translate(month, MONTH_ALIASES);
        let weekday = translate(weekday, WEEKDAY_ALIASES);

        Ok(Expression {
            input: expanded.to_owned(),
            minutes: parse_field(minute, 0, 59)?,
            hours: parse_field(hour, 0, 23)?,
            days: parse_field(day, 1, 31)?,
            months: parse_field(&month, 1, 12)?,
            weekdays: parse_field(&weekday, 1, 7)?,
        })
    }

    /// Whether the expression matches the given instant, to minute precision.
    pub fn is_now(&self, time: DateTime<Utc>) -> bool {
        self.months.contains(&time.month())
            && self.weekdays.contains(&time.weekday().number_from_monday())
            && self.days.contains(&time.day())
            && self.hours.contains(&time.hour())
            && self.minutes.contains(&time.minute())
    }

    /// The normalized source expression (nicknames expanded).
    pub fn input(&self) -> &str {
        &self.input
    }
}

fn translate(field: &str, aliases: &[(&str, &str)]) -> String {
    let mut out = field.to_owned();

    for (alias, value) in aliases {
        if out.contains(alias) {
            out = out.replace(alias, value);
        }
    }

    out
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>> {
    let mut parsed = BTreeSet::new();

    for part in field.split(',') {
        parsed.extend(parse_part(part.trim(), min, max)?);
    }

    if parsed.iter().any(|value| *value < min || *value > max) {
        return Err(Error::InvalidCron(format!(
            "field {field} is out of range: {min}..={max}"
        )));
    }

    Ok(parsed)
}

fn parse_part(part: &str, min: u32, max: u32) -> Result<BTreeSet<u32>> {
    if part == "*" {
        Ok((min..=max).collect())
    } else if is_literal(part) {
        Ok(BTreeSet::from([parse_number(part)?]))
    } else if let Some(step) = part.strip_prefix("*/") {
        Ok(stepped(min, max, parse_step(part, step)?))
    } else if let Some((range, step)) = part.split_once('/') {
        match parse_range(range, max)? {
            Some((lo, hi)) => Ok(stepped(lo, hi, parse_step(part, step)?)),
            None => Err(unrecognized(part)),
        }
    } else if part.contains('-') {
        match parse_range(part, max)? {
            Some((lo, hi)) => Ok((lo..=hi).collect()),
            None => Err(unrecognized(part)),
        }
    } else {
        Err(unrecognized(part))
    }
}

fn is_literal(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

fn parse_number(part: &str) -> Result<u32> {
    part.parse::<u32>().map_err(|_| unrecognized(part))
}

/// Steps must be 1..=99 with no leading zero, matching classic cron.
fn parse_step(part: &str, step: &str) -> Result<usize> {
    let valid = matches!(step.len(), 1 | 2)
        && step.bytes().all(|b| b.is_ascii_digit())
        && !step.starts_with('0');

    if valid {
        Ok(step.parse::<usize>().expect("validated digits"))
    } else {
        Err(unrecognized(part))
    }
}

/// Parse `N` (open-ended, up to the field maximum) or `N-M` into bounds.
fn parse_range(range: &str, field_max: u32) -> Result<Option<(u32, u32)>> {
    match range.split_once('-') {
        None if is_literal(range) => Ok(Some((parse_number(range)?, field_max))),
        Some((lo, hi)) if is_literal(lo) && is_literal(hi) => {
            let lo = parse_number(lo)?;
            let hi = parse_number(hi)?;

            if lo > hi {
                return Err(Error::InvalidCron(format!(
                    "min of range ({lo}) must be less than or equal to max ({hi})"
                )));
            }

            Ok(Some((lo, hi)))
        }
        _ => Ok(None),
    }
}

fn stepped(lo: u32, hi: u32, step: usize) -> BTreeSet<u32> {
    (lo..=hi).step_by(step).collect()
}

fn unrecognized(part: &str) -> Error {
    Error::InvalidCron(format!("unrecognized expression: {part}"))
}
