//! Task schedules: cron expressions and fixed periods.

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};

use rill_common::{Result, RillError};

/// Persisted schedule description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSpec {
    /// A cron expression, 5 or 6 fields.
    Cron(String),
    /// A fixed period, aligned to unix-epoch multiples.
    Every {
        /// Period in seconds.
        seconds: i64,
    },
}

/// A parsed, evaluatable schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Cron-driven fires.
    Cron(Box<CronSchedule>),
    /// Fixed-period fires on epoch-aligned boundaries.
    Every(i64),
}

impl Schedule {
    /// Parse a schedule spec. 5-field cron expressions are normalized to
    /// 6 fields with a zero seconds column.
    pub fn parse(spec: &ScheduleSpec) -> Result<Self> {
        match spec {
            ScheduleSpec::Cron(expression) => {
                let field_count = expression.split_whitespace().count();
                let normalized = match field_count {
                    5 => format!("0 {expression}"),
                    6 => expression.clone(),
                    _ => {
                        return Err(RillError::InvalidArgument(format!(
                            "cron expression must have 5 or 6 fields: {expression}"
                        )))
                    }
                };
                let schedule = CronSchedule::from_str(&normalized).map_err(|e| {
                    RillError::InvalidArgument(format!("invalid cron expression: {e}"))
                })?;
                Ok(Schedule::Cron(Box::new(schedule)))
            }
            ScheduleSpec::Every { seconds } => {
                if *seconds <= 0 {
                    return Err(RillError::InvalidArgument(format!(
                        "every period must be positive, got {seconds}s"
                    )));
                }
                Ok(Schedule::Every(*seconds))
            }
        }
    }

    /// First fire strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&after).next(),
            Schedule::Every(seconds) => {
                let next = (after.timestamp().div_euclid(*seconds) + 1) * seconds;
                Utc.timestamp_opt(next, 0).single()
            }
        }
    }

    /// Distance between consecutive fires at `from`; drives run deadlines.
    pub fn period(&self, from: DateTime<Utc>) -> Duration {
        match self {
            Schedule::Every(seconds) => Duration::seconds(*seconds),
            Schedule::Cron(_) => {
                let Some(a) = self.next_fire(from) else {
                    return Duration::hours(1);
                };
                match self.next_fire(a) {
                    Some(b) => b - a,
                    None => Duration::hours(1),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn every_aligns_to_epoch_multiples() {
        let s = Schedule::parse(&ScheduleSpec::Every { seconds: 60 }).unwrap();
        assert_eq!(
            s.next_fire(at("2020-01-01T00:00:30Z")).unwrap(),
            at("2020-01-01T00:01:00Z")
        );
        // Strictly after: a fire boundary advances to the next one.
        assert_eq!(
            s.next_fire(at("2020-01-01T00:01:00Z")).unwrap(),
            at("2020-01-01T00:02:00Z")
        );
    }

    #[test]
    fn five_field_cron_normalizes_and_fires() {
        let s = Schedule::parse(&ScheduleSpec::Cron("*/15 * * * *".into())).unwrap();
        assert_eq!(
            s.next_fire(at("2020-01-01T00:07:00Z")).unwrap(),
            at("2020-01-01T00:15:00Z")
        );
    }

    #[test]
    fn cron_period_is_the_gap_between_fires() {
        let s = Schedule::parse(&ScheduleSpec::Cron("0 * * * *".into())).unwrap();
        assert_eq!(s.period(at("2020-01-01T00:30:00Z")), Duration::hours(1));
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(Schedule::parse(&ScheduleSpec::Cron("bogus".into())).is_err());
        assert!(Schedule::parse(&ScheduleSpec::Every { seconds: 0 }).is_err());
    }

    #[test]
    fn successive_fires_are_strictly_increasing() {
        let s = Schedule::parse(&ScheduleSpec::Every { seconds: 10 }).unwrap();
        let mut t = at("2020-01-01T00:00:00Z");
        for _ in 0..5 {
            let next = s.next_fire(t).unwrap();
            assert!(next > t);
            t = next;
        }
        assert_eq!(t, at("2020-01-01T00:00:50Z"));
    }
}
