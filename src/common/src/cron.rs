//! Five-field cron patterns (`minute hour day month day-of-week`).
//!
//! Patterns are evaluated with [`cron::Schedule`], which expects a leading
//! seconds field and numbers days of the week from Sunday = 1. The
//! five-field form is kept in config, so it is translated once at parse
//! time: seconds are pinned to `0` and day-of-week numbers (`0`-`7`, both
//! `0` and `7` meaning Sunday) become day names.
//!
//! When both day-of-month and day-of-week are restricted, a minute fires if
//! either one matches.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("Cron pattern '{0}' must have exactly five fields")]
    FieldCount(String),

    #[error("Invalid cron pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

const WEEKDAYS: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

fn is_wildcard(field: &str) -> bool {
    field == "*" || field == "?"
}

/// Rewrite numeric day-of-week values as names, leaving `*`, steps and
/// names untouched.
fn weekday_names(field: &str) -> Result<String, String> {
    let translate = |token: &str| -> Result<String, String> {
        match token.parse::<usize>() {
            Ok(n) => WEEKDAYS
                .get(n)
                .map(|name| name.to_string())
                .ok_or_else(|| format!("day-of-week {n} is out of range")),
            Err(_) => Ok(token.to_string()),
        }
    };

    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                Some((start, end)) => format!("{}-{}", translate(start)?, translate(end)?),
                None => translate(range)?,
            };
            Ok(match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            })
        })
        .collect::<Result<Vec<_>, String>>()
        .map(|parts| parts.join(","))
}

/// A parsed cron pattern, matched against UTC wall-clock minutes.
#[derive(Clone)]
pub struct CronPattern {
    source: String,
    /// One schedule normally; two when day-of-month and day-of-week are both
    /// restricted (matching either fires).
    schedules: Vec<Schedule>,
}

impl CronPattern {
    pub fn parse(pattern: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        let [minute, hour, day, month, day_of_week] = fields.as_slice() else {
            return Err(CronError::FieldCount(pattern.to_string()));
        };

        let invalid = |reason: String| CronError::Invalid {
            pattern: pattern.to_string(),
            reason,
        };
        if fields.iter().any(|field| field.split(',').any(|part| part.ends_with("/0"))) {
            return Err(invalid("step must be greater than zero".to_string()));
        }
        let day_of_week = weekday_names(day_of_week).map_err(invalid)?;

        let expressions = if !is_wildcard(day) && !is_wildcard(&day_of_week) {
            vec![
                format!("0 {minute} {hour} {day} {month} *"),
                format!("0 {minute} {hour} * {month} {day_of_week}"),
            ]
        } else {
            vec![format!("0 {minute} {hour} {day} {month} {day_of_week}")]
        };
        let schedules = expressions
            .iter()
            .map(|expression| Schedule::from_str(expression).map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: fields.join(" "),
            schedules,
        })
    }

    /// Whether the pattern fires during the minute containing `at`.
    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        let minute = at.duration_trunc(TimeDelta::minutes(1)).unwrap_or(*at);
        let just_before = minute - TimeDelta::seconds(1);
        self.schedules
            .iter()
            .any(|schedule| schedule.after(&just_before).next() == Some(minute))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for CronPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronPattern").field(&self.source).finish()
    }
}

impl PartialEq for CronPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronPattern {}

impl fmt::Display for CronPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronPattern {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CronPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_pattern() {
        let daily = CronPattern::parse("0 2 * * *").unwrap();
        assert!(daily.matches(&at(2024, 3, 5, 2, 0)));
        assert!(daily.matches(&(at(2024, 3, 5, 2, 0) + TimeDelta::seconds(42))));
        assert!(!daily.matches(&at(2024, 3, 5, 2, 1)));
        assert!(!daily.matches(&at(2024, 3, 5, 3, 0)));
    }

    #[test]
    fn test_weekly_and_monthly_patterns() {
        let weekly = CronPattern::parse("0 3 * * 0").unwrap();
        // 2024-03-03 is a Sunday
        assert!(weekly.matches(&at(2024, 3, 3, 3, 0)));
        assert!(!weekly.matches(&at(2024, 3, 4, 3, 0)));

        let sunday_as_seven = CronPattern::parse("0 3 * * 7").unwrap();
        assert!(sunday_as_seven.matches(&at(2024, 3, 3, 3, 0)));

        let monthly = CronPattern::parse("0 4 1 * *").unwrap();
        assert!(monthly.matches(&at(2024, 4, 1, 4, 0)));
        assert!(!monthly.matches(&at(2024, 4, 2, 4, 0)));
    }

    #[test]
    fn test_lists_ranges_and_steps() {
        let pattern = CronPattern::parse("*/15 9-17 * 1,6 1-5").unwrap();
        // 2024-01-08 is a Monday
        assert!(pattern.matches(&at(2024, 1, 8, 9, 45)));
        assert!(!pattern.matches(&at(2024, 1, 8, 9, 50)));
        assert!(!pattern.matches(&at(2024, 2, 5, 9, 45)));
        assert!(!pattern.matches(&at(2024, 1, 7, 9, 45)));
    }

    #[test]
    fn test_restricted_day_and_weekday_fire_on_either() {
        let pattern = CronPattern::parse("0 0 1 * 1").unwrap();
        // 2026-10-19 is a Monday, 2026-10-01 a Thursday
        assert!(pattern.matches(&at(2026, 10, 19, 0, 0)));
        assert!(pattern.matches(&at(2026, 10, 1, 0, 0)));
        assert!(!pattern.matches(&at(2026, 10, 20, 0, 0)));
        assert!(!pattern.matches(&at(2026, 10, 19, 0, 1)));
    }

    #[test]
    fn test_serde_keeps_five_field_form() {
        let pattern: CronPattern = serde_json::from_str("\"30 1 * * 1-5\"").unwrap();
        assert_eq!(serde_json::to_string(&pattern).unwrap(), "\"30 1 * * 1-5\"");
        assert_eq!(pattern, CronPattern::parse("30  1 * * 1-5").unwrap());
    }

    #[test]
    fn test_rejects_invalid_patterns() {
        assert!(matches!(
            CronPattern::parse("0 2 * *"),
            Err(CronError::FieldCount(_))
        ));
        assert!(CronPattern::parse("60 * * * *").is_err());
        assert!(CronPattern::parse("* 24 * * *").is_err());
        assert!(CronPattern::parse("* * 0 * *").is_err());
        assert!(CronPattern::parse("*/0 * * * *").is_err());
        assert!(CronPattern::parse("* * * * 8").is_err());
        assert!(CronPattern::parse("a * * * *").is_err());
    }
}
