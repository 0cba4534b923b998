//! Cron expressions for backup schedules.
//!
//! Accepts the classic five-field form (`min hour dom mon dow`), the
//! six/seven-field form with leading seconds (and optional year), and the
//! named shorthands `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::{OrchestratorError, Result};

/// A parsed, validated cron schedule.
#[derive(Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

fn expand_named(input: &str) -> Option<&'static str> {
    match input.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * SUN"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

impl CronSchedule {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Config` for empty, unknown or malformed input.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(OrchestratorError::Config(
                "cron expression cannot be empty".to_string(),
            ));
        }

        let normalized = if trimmed.starts_with('@') {
            expand_named(trimmed)
                .ok_or_else(|| {
                    OrchestratorError::Config(format!("unknown named schedule '{trimmed}'"))
                })?
                .to_string()
        } else {
            match trimmed.split_whitespace().count() {
                5 => format!("0 {trimmed}"),
                6 | 7 => trimmed.to_string(),
                n => {
                    return Err(OrchestratorError::Config(format!(
                        "cron expression '{trimmed}' has {n} fields, expected 5, 6 or 7"
                    )))
                }
            }
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            OrchestratorError::Config(format!("invalid cron expression '{trimmed}': {e}"))
        })?;

        Ok(Self {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as written.
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// The first fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expr).finish()
    }
}

impl FromStr for CronSchedule {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ErrorKind;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn five_field_daily() {
        let cron = CronSchedule::parse("0 2 * * *").unwrap();
        assert_eq!(cron.next_after(at(0, 0, 0)), Some(at(2, 0, 0)));
        assert_eq!(
            cron.next_after(at(2, 0, 0)),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn five_field_step() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(cron.next_after(at(10, 1, 0)), Some(at(10, 15, 0)));
    }

    #[test]
    fn six_field_with_seconds() {
        let cron = CronSchedule::parse("30 0 * * * *").unwrap();
        assert_eq!(cron.next_after(at(5, 0, 0)), Some(at(5, 0, 30)));
    }

    #[test]
    fn named_shorthand() {
        let cron = CronSchedule::parse("@hourly").unwrap();
        assert_eq!(cron.next_after(at(5, 10, 0)), Some(at(6, 0, 0)));
        assert_eq!(cron.expr(), "@hourly");
    }

    #[test]
    fn malformed_is_config_error() {
        for bad in ["", "   ", "* *", "61 * * * *", "@fortnightly", "a b c d e"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "input {bad:?}");
        }
    }
}
