//! Five-field cron schedules.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron schedule in standard five-field form
/// (`minute hour day-of-month month day-of-week`), evaluated in UTC.
///
/// Day-of-week accepts `0-7` with both `0` and `7` meaning Sunday, as well
/// as three-letter day names.
///
/// When both day-of-month and day-of-week are restricted, a day must match
/// both of them. `0 0 1 * 1` fires only on a Monday that is the first of the
/// month, unlike Vixie cron which fires when either field matches.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parses a five-field expression.
    ///
    /// Fails on malformed expressions and on expressions that never fire.
    pub fn parse(expression: &str) -> JobResult<Self> {
        let normalized = normalize(expression)?;

        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| JobError::Schedule(format!("Invalid cron '{}': {}", expression, e)))?;

        let parsed = Self {
            expression: expression.trim().to_string(),
            schedule,
        };

        if parsed.next_after(Utc::now()).is_none() {
            return Err(JobError::Schedule(format!(
                "Cron '{}' has no upcoming occurrence",
                expression
            )));
        }

        Ok(parsed)
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The next `count` occurrences after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&after).take(count).collect()
    }

    /// The expression as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronSchedule {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rewrites a five-field expression into the seconds-first form the
/// `cron` crate parses.
fn normalize(expression: &str) -> JobResult<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(JobError::Schedule(format!(
            "Cron '{}' must have 5 fields, found {}",
            expression,
            fields.len()
        )));
    }

    let day_of_week = normalize_day_of_week(fields[4])?;

    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    ))
}

/// Numeric day-of-week values are expanded to day names, since the `cron`
/// crate numbers days from 1 (Sunday).
fn normalize_day_of_week(field: &str) -> JobResult<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        expand_day_item(item, &mut days)?;
    }

    if days.is_empty() {
        return Err(JobError::Schedule(format!("Empty day-of-week '{}'", field)));
    }

    Ok(days
        .into_iter()
        .map(|d| DAY_NAMES[d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

fn expand_day_item(item: &str, days: &mut BTreeSet<u8>) -> JobResult<()> {
    let invalid = || JobError::Schedule(format!("Invalid day-of-week '{}'", item));

    let (base, step) = match item.split_once('/') {
        Some((base, step)) => {
            let step: u8 = step.parse().map_err(|_| invalid())?;
            if step == 0 {
                return Err(invalid());
            }
            (base, Some(step))
        }
        None => (item, None),
    };

    let (start, end) = if base == "*" {
        (0, 6)
    } else if let Some((a, b)) = base.split_once('-') {
        (parse_day(a).ok_or_else(invalid)?, parse_day(b).ok_or_else(invalid)?)
    } else {
        let day = parse_day(base).ok_or_else(invalid)?;
        match step {
            Some(_) => (day, 7),
            None => (day, day),
        }
    };

    if start > end {
        return Err(invalid());
    }

    let step = step.unwrap_or(1) as usize;
    for day in (start..=end).step_by(step) {
        days.insert(day % 7);
    }

    Ok(())
}

fn parse_day(value: &str) -> Option<u8> {
    value.parse::<u8>().ok().filter(|d| *d <= 7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, TimeZone, Timelike, Weekday};

    #[test]
    fn test_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert!(next <= now + Duration::seconds(60));
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_monday_morning() {
        let schedule = CronSchedule::parse("0 8 * * 1").unwrap();
        // 2024-01-03 is a Wednesday.
        let from = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 8, 8, 0, 0).unwrap());
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_day_of_month_and_weekday_must_both_match() {
        let schedule = CronSchedule::parse("0 0 1 * 1").unwrap();
        // 2024-01-02 is a Tuesday; the next Monday the 1st is in April.
        let from = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        let from = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        for expr in ["30 9 * * 0", "30 9 * * 7"] {
            let next = CronSchedule::parse(expr).unwrap().next_after(from).unwrap();
            assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 7, 9, 30, 0).unwrap());
        }
    }

    #[test]
    fn test_weekday_range() {
        let schedule = CronSchedule::parse("0 0 * * 1-5").unwrap();
        // Saturday.
        let from = Utc.with_ymd_and_hms(2024, 1, 6, 1, 0, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_day_of_week_expansion() {
        assert_eq!(normalize_day_of_week("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(normalize_day_of_week("0,7").unwrap(), "SUN");
        assert_eq!(normalize_day_of_week("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(normalize_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert!(normalize_day_of_week("8").is_err());
        assert!(normalize_day_of_week("5-2").is_err());
    }

    #[test]
    fn test_upcoming_is_increasing() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let times = schedule.upcoming(from, 4);
        assert_eq!(times.len(), 4);
        assert_eq!(times[0], Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap());
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_rejects_wrong_field_count() {
        assert!(CronSchedule::parse("0 * * * * *").is_err());
        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("").is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let err = CronSchedule::parse("61 * * * *").unwrap_err();
        assert!(matches!(err, JobError::Schedule(_)));
    }
}
