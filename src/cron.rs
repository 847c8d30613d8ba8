use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{ConfigError, CronvaultError};

/// A cron expression in the five-field crontab dialect (minute, hour,
/// day-of-month, month, day-of-week with Sunday = 0). Six and seven field
/// expressions with a leading seconds column are accepted unchanged.
#[derive(Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => format!(
                "0 {} {} {} {} {}",
                fields[0],
                fields[1],
                fields[2],
                fields[3],
                translate_day_of_week(fields[4])
            ),
            6 | 7 => fields.join(" "),
            n => {
                return Err(ConfigError::Invalid(format!(
                    "cron expression {:?} has {} fields; expected 5",
                    expr, n
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| ConfigError::Invalid(format!("cron expression {:?}: {}", expr, e)))?;
        Ok(Self {
            source: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl FromStr for CronExpression {
    type Err = CronvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpression::parse(s).map_err(CronvaultError::from)
    }
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// crontab numbers days 0-7 from Sunday, the cron crate numbers them 1-7.
// A range reaching 7 wraps back to Sunday, so it is spelled out day by day.
fn translate_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (part, None),
            };
            if let Some(days) = range_to_sunday(base, step) {
                return days;
            }
            let base = base
                .split('-')
                .map(|value| match value.parse::<u8>() {
                    Ok(n) => shift_day(n).to_string(),
                    Err(_) => value.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", base, step),
                None => base,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day(n: u8) -> u8 {
    if n == 7 {
        1
    } else {
        n + 1
    }
}

fn range_to_sunday(base: &str, step: Option<&str>) -> Option<String> {
    let (start, end) = base.split_once('-')?;
    let (start, end) = (start.parse::<u8>().ok()?, end.parse::<u8>().ok()?);
    if end != 7 || start > end {
        return None;
    }
    let step = match step {
        Some(step) => step.parse::<usize>().ok().filter(|s| *s > 0)?,
        None => 1,
    };
    let mut days: Vec<u8> = (start..=end).step_by(step).map(shift_day).collect();
    days.sort_unstable();
    days.dedup();
    Some(
        days.iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}
