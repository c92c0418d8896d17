//! Five-field cron expressions at minute resolution: minute, hour,
//! day-of-month, month, day-of-week. Supports `*`, lists, ranges, and
//! step values; named months/days are not.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid cron field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

#[derive(Debug, Clone)]
struct Field {
    /// Allowed values; empty set encodes `*`
    values: BTreeSet<u8>,
    is_wildcard: bool,
}

impl Field {
    fn contains(&self, value: u8) -> bool {
        self.is_wildcard || self.values.contains(&value)
    }
}

#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 7)?,
        })
    }

    /// True when the expression fires at this minute. Standard cron rule
    /// for the two day fields: when both are restricted, matching either
    /// is enough.
    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        if !self.minute.contains(at.minute() as u8)
            || !self.hour.contains(at.hour() as u8)
            || !self.month.contains(at.month() as u8)
        {
            return false;
        }

        // Sunday is both 0 and 7
        let weekday = (at.weekday().num_days_from_sunday() % 7) as u8;
        let dow_match = self.day_of_week.contains(weekday)
            || (weekday == 0 && self.day_of_week.contains(7));
        let dom_match = self.day_of_month.contains(at.day() as u8);

        match (self.day_of_month.is_wildcard, self.day_of_week.is_wildcard) {
            (true, true) => true,
            (false, true) => dom_match,
            (true, false) => dow_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// The next firing strictly after `from`, scanning at most a year.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (from + Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .expect("truncating to the minute cannot fail");

        for _ in 0..(366 * 24 * 60) {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate = candidate + Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u8, max: u8) -> Result<Field, CronError> {
    let invalid = |reason: &str| CronError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    };

    if field == "*" {
        return Ok(Field {
            values: BTreeSet::new(),
            is_wildcard: true,
        });
    }

    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step.parse().map_err(|_| invalid("step is not a number"))?;
                if step == 0 {
                    return Err(invalid("step of zero"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((low, high)) = range_part.split_once('-') {
            let low: u8 = low.parse().map_err(|_| invalid("range start is not a number"))?;
            let high: u8 = high.parse().map_err(|_| invalid("range end is not a number"))?;
            if low > high {
                return Err(invalid("range start after range end"));
            }
            (low, high)
        } else {
            let value: u8 = range_part.parse().map_err(|_| invalid("not a number"))?;
            (value, value)
        };

        if start < min || end > max {
            return Err(invalid(&format!("values must be within {}-{}", min, max)));
        }

        let mut value = start;
        while value <= end {
            values.insert(value);
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }

    Ok(Field {
        values,
        is_wildcard: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_minute_matches_everything() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        assert!(cron.matches(&at(2025, 6, 15, 3, 47)));
    }

    #[test]
    fn fixed_time_matches_only_that_minute() {
        let cron = CronExpr::parse("30 2 * * *").unwrap();
        assert!(cron.matches(&at(2025, 6, 15, 2, 30)));
        assert!(!cron.matches(&at(2025, 6, 15, 2, 31)));
        assert!(!cron.matches(&at(2025, 6, 15, 3, 30)));
    }

    #[test]
    fn step_values_fire_on_the_step() {
        let cron = CronExpr::parse("*/15 * * * *").unwrap();
        assert!(cron.matches(&at(2025, 1, 1, 0, 0)));
        assert!(cron.matches(&at(2025, 1, 1, 0, 45)));
        assert!(!cron.matches(&at(2025, 1, 1, 0, 20)));
    }

    #[test]
    fn ranges_and_lists_combine() {
        let cron = CronExpr::parse("0 9-17 * * 1-5").unwrap();
        // 2025-06-16 is a Monday
        assert!(cron.matches(&at(2025, 6, 16, 9, 0)));
        assert!(!cron.matches(&at(2025, 6, 15, 9, 0)), "Sunday is excluded");
        assert!(!cron.matches(&at(2025, 6, 16, 18, 0)));

        let cron = CronExpr::parse("0 0 1,15 * *").unwrap();
        assert!(cron.matches(&at(2025, 6, 15, 0, 0)));
        assert!(!cron.matches(&at(2025, 6, 14, 0, 0)));
    }

    #[test]
    fn sunday_is_zero_and_seven() {
        let zero = CronExpr::parse("0 0 * * 0").unwrap();
        let seven = CronExpr::parse("0 0 * * 7").unwrap();
        let sunday = at(2025, 6, 15, 0, 0);
        assert!(zero.matches(&sunday));
        assert!(seven.matches(&sunday));
    }

    #[test]
    fn restricted_dom_and_dow_match_either() {
        // Day 13 OR Friday, the classic cron union rule
        let cron = CronExpr::parse("0 0 13 * 5").unwrap();
        assert!(cron.matches(&at(2025, 6, 13, 0, 0)), "the 13th, a Friday");
        assert!(cron.matches(&at(2025, 6, 20, 0, 0)), "a Friday, not the 13th");
        assert!(cron.matches(&at(2025, 7, 13, 0, 0)), "the 13th, a Sunday");
        assert!(!cron.matches(&at(2025, 6, 14, 0, 0)));
    }

    #[test]
    fn next_after_advances_to_the_coming_fire() {
        let cron = CronExpr::parse("0 3 * * *").unwrap();
        let next = cron.next_after(at(2025, 6, 15, 3, 0)).unwrap();
        assert_eq!(next, at(2025, 6, 16, 3, 0), "strictly after, never the same minute");

        let next = cron.next_after(at(2025, 6, 15, 1, 30)).unwrap();
        assert_eq!(next, at(2025, 6, 15, 3, 0));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert_eq!(CronExpr::parse("* * * *").unwrap_err(), CronError::FieldCount(4));
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * *").is_err());
    }
}
