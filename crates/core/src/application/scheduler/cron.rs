// Cron expressions for recurring jobs

use crate::domain::DomainError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

/// Parsed cron expression.
///
/// Accepts the standard 5-field form (`min hour dom month dow`) as well as the
/// 6/7-field form with seconds (and year) understood by the `cron` crate.
/// In the 5-field form day-of-week numbers are standard cron numbers (0 and 7
/// are Sunday, 1 is Monday); the 6/7-field form uses the crate's numbering
/// (1 is Sunday).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: ::cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, DomainError> {
        let trimmed = expr.trim();
        let invalid = |reason: String| DomainError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [min, hour, dom, month, dow] => {
                let dow = translate_day_of_week(dow).map_err(invalid)?;
                format!("0 {min} {hour} {dom} {month} {dow}")
            }
            _ => trimmed.to_string(),
        };

        let schedule =
            ::cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `now_millis` (epoch ms).
    pub fn next_after(&self, now_millis: i64) -> Option<i64> {
        let now = DateTime::<Utc>::from_timestamp_millis(now_millis)?;
        self.schedule
            .after(&now)
            .map(|t| t.timestamp_millis())
            .find(|t| *t > now_millis)
    }
}

/// Rewrite a standard day-of-week field (0-7, Sunday = 0 or 7) into the
/// `cron` crate's numbering (1-7, Sunday = 1).
///
/// Numeric items become an explicit list of days so ranges that end on
/// Sunday (`5-7`) and steps (`*/2`, `1-5/2`) keep their meaning. Named days
/// and `*` / `?` are the same in both dialects and pass through.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(translate_day_of_week_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn translate_day_of_week_item(item: &str) -> Result<String, String> {
    if item == "*" || item == "?" || item.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(item.to_string());
    }

    let day = |s: &str| {
        s.parse::<u8>()
            .ok()
            .filter(|d| *d <= 7)
            .ok_or_else(|| format!("invalid day of week: {s}"))
    };

    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step = step
                .parse::<usize>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| format!("invalid day of week step: {step}"))?;
            (range, Some(step))
        }
        None => (item, None),
    };

    let (start, end) = match range.split_once('-') {
        _ if range == "*" => (0, 6),
        Some((a, b)) => (day(a)?, day(b)?),
        // `a/n` runs from `a` to the end of the week
        None if step.is_some() => (day(range)?, 6),
        None => {
            let d = day(range)?;
            (d, d)
        }
    };
    if start > end {
        return Err(format!("invalid day of week range: {range}"));
    }

    let days: BTreeSet<u8> = (start..=end)
        .step_by(step.unwrap_or(1))
        .map(|d| d % 7 + 1)
        .collect();
    Ok(days
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Parsed schedules keyed by expression, so each expression is parsed once.
#[derive(Default)]
pub struct CronCache {
    schedules: Mutex<HashMap<String, Arc<CronSchedule>>>,
}

impl CronCache {
    pub fn get_or_parse(&self, expr: &str) -> Result<Arc<CronSchedule>, DomainError> {
        let key = expr.trim();
        let mut schedules = self
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(schedule) = schedules.get(key) {
            return Ok(Arc::clone(schedule));
        }

        let schedule = Arc::new(CronSchedule::parse(key)?);
        schedules.insert(key.to_string(), Arc::clone(&schedule));
        Ok(schedule)
    }

    /// Next fire time of `expr` strictly after `now_millis`.
    pub fn next_after(&self, expr: &str, now_millis: i64) -> Result<i64, DomainError> {
        self.get_or_parse(expr)?
            .next_after(now_millis)
            .ok_or_else(|| DomainError::InvalidCron {
                expr: expr.to_string(),
                reason: "schedule has no upcoming fire time".to_string(),
            })
    }
}
