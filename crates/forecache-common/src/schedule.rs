//! Check schedule for a model
//!
//! The model schema carries `checkInterval` either as a cron expression or
//! as a number of milliseconds. Both are resolved once, at load time, into
//! [`CheckSchedule`]; the scheduler only ever asks for the equivalent cron
//! expression.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MINUTE_MS: u64 = 60_000;

/// How often a model's status document is polled
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSchedule", into = "RawSchedule")]
pub enum CheckSchedule {
    /// Cron expression, normalized to the six-field form (seconds first)
    Periodic(String),
    /// Fixed interval, floored to whole minutes
    FixedInterval(Duration),
}

/// Wire form of `checkInterval`
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSchedule {
    Millis(u64),
    Expression(String),
}

impl TryFrom<RawSchedule> for CheckSchedule {
    type Error = String;

    fn try_from(raw: RawSchedule) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawSchedule::Millis(ms) => Ok(Self::from_millis(ms)),
            RawSchedule::Expression(expr) => {
                let trimmed = expr.trim();
                if trimmed.is_empty() {
                    return Err("empty checkInterval".to_string());
                }
                // A numeric string is an interval, not an expression
                if let Ok(ms) = trimmed.parse::<u64>() {
                    return Ok(Self::from_millis(ms));
                }
                Ok(Self::periodic(trimmed))
            }
        }
    }
}

impl From<CheckSchedule> for RawSchedule {
    fn from(schedule: CheckSchedule) -> Self {
        match schedule {
            CheckSchedule::Periodic(expr) => Self::Expression(expr),
            CheckSchedule::FixedInterval(d) => {
                Self::Millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            }
        }
    }
}

impl CheckSchedule {
    /// Build a fixed interval from milliseconds, dropping sub-minute precision
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        let minutes = ms / MINUTE_MS;
        Self::FixedInterval(Duration::from_secs(minutes * 60))
    }

    /// Build a periodic schedule, accepting five-field (minute-first) cron
    #[must_use]
    pub fn periodic(expr: &str) -> Self {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = if fields.len() == 5 {
            format!("0 {}", fields.join(" "))
        } else {
            fields.join(" ")
        };
        Self::Periodic(normalized)
    }

    /// The cron expression this schedule fires on
    ///
    /// Fixed intervals map onto a minute step (`0 */N * * * *`) or, for
    /// whole hours, an hour step. Anything else cannot be expressed and is
    /// rejected, as is a zero-minute interval.
    pub fn to_cron_expression(&self, model: &str) -> Result<String> {
        match self {
            Self::Periodic(expr) => Ok(expr.clone()),
            Self::FixedInterval(interval) => {
                let minutes = interval.as_secs() / 60;
                let invalid = |reason: String| Error::InvalidSchedule {
                    model: model.to_string(),
                    reason,
                };
                match minutes {
                    0 => Err(invalid("interval is shorter than one minute".into())),
                    1..=59 => Ok(format!("0 */{minutes} * * * *")),
                    m if m % 60 == 0 && m / 60 < 24 => Ok(format!("0 0 */{} * * *", m / 60)),
                    m => Err(invalid(format!(
                        "interval of {m} minutes has no cron equivalent"
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> std::result::Result<CheckSchedule, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn test_millis_floor_to_minutes() {
        assert_eq!(
            parse("300000").unwrap(),
            CheckSchedule::FixedInterval(Duration::from_secs(300))
        );
        assert_eq!(
            parse("119999").unwrap(),
            CheckSchedule::FixedInterval(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_numeric_string_is_interval() {
        assert_eq!(
            parse("\"600000\"").unwrap(),
            CheckSchedule::FixedInterval(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_five_field_expression_normalized() {
        assert_eq!(
            parse("\"*/1 * * * *\"").unwrap(),
            CheckSchedule::Periodic("0 */1 * * * *".into())
        );
        assert_eq!(
            parse("\"30  */5 * * * *\"").unwrap(),
            CheckSchedule::Periodic("30 */5 * * * *".into())
        );
    }

    #[test]
    fn test_empty_expression_rejected() {
        assert!(parse("\"  \"").is_err());
    }

    #[test]
    fn test_interval_to_cron() {
        assert_eq!(
            CheckSchedule::from_millis(5 * 60_000)
                .to_cron_expression("m")
                .unwrap(),
            "0 */5 * * * *"
        );
        assert_eq!(
            CheckSchedule::from_millis(3 * 3_600_000)
                .to_cron_expression("m")
                .unwrap(),
            "0 0 */3 * * *"
        );
    }

    #[test]
    fn test_unrepresentable_interval() {
        assert!(CheckSchedule::from_millis(30_000).to_cron_expression("m").is_err());
        assert!(CheckSchedule::from_millis(90 * 60_000).to_cron_expression("m").is_err());
    }
}
