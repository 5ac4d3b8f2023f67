//! Recurring job definitions.

use crate::error::{JobError, JobResult};
use crate::job::JobPayload;
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Template that materializes a new job on every cron slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringDefinition {
    /// Unique definition id.
    pub id: String,

    /// Cron expression (seconds first, 6 or 7 fields).
    pub cron: String,

    /// Payload copied into every materialized job.
    pub payload: JobPayload,

    /// Queue the materialized jobs are routed to.
    pub queue: String,

    /// Offset from UTC the expression is evaluated in.
    pub utc_offset_secs: i32,

    /// Next slot to fire; `None` once the expression has no future slots.
    pub next_fire_at: Option<DateTime<Utc>>,

    /// Last slot that was materialized.
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl RecurringDefinition {
    /// Creates a definition whose first slot is the first one after `now`.
    pub fn new(
        id: impl Into<String>,
        cron: impl Into<String>,
        payload: JobPayload,
        queue: impl Into<String>,
        utc_offset_secs: i32,
        now: DateTime<Utc>,
    ) -> JobResult<Self> {
        let mut definition = Self {
            id: id.into(),
            cron: cron.into(),
            payload,
            queue: queue.into(),
            utc_offset_secs,
            next_fire_at: None,
            last_fired_at: None,
        };
        definition.next_fire_at = definition.next_after(now)?;
        Ok(definition)
    }

    /// First slot strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> JobResult<Option<DateTime<Utc>>> {
        let schedule = parse_cron(&self.cron)?;
        let offset = FixedOffset::east_opt(self.utc_offset_secs).ok_or_else(|| {
            JobError::Configuration(format!(
                "invalid UTC offset {}s for recurring job {}",
                self.utc_offset_secs, self.id
            ))
        })?;
        Ok(schedule
            .after(&after.with_timezone(&offset))
            .next()
            .map(|slot| slot.with_timezone(&Utc)))
    }

    /// Returns true if a slot is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at.is_some_and(|at| at <= now)
    }
}

/// Parses a cron expression, mapping failures to `InvalidCron`.
pub fn parse_cron(expression: &str) -> JobResult<Schedule> {
    Schedule::from_str(expression).map_err(|e| JobError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Common cron expressions.
pub mod cron_expressions {
    /// Every minute.
    pub const MINUTELY: &str = "0 * * * * *";

    /// Every 5 minutes.
    pub const EVERY_5_MINUTES: &str = "0 */5 * * * *";

    /// Every 15 minutes.
    pub const EVERY_15_MINUTES: &str = "0 */15 * * * *";

    /// Every hour.
    pub const HOURLY: &str = "0 0 * * * *";

    /// Every day at midnight.
    pub const DAILY: &str = "0 0 0 * * *";

    /// Every Monday at midnight.
    pub const WEEKLY: &str = "0 0 0 * * MON";

    /// First day of every month at midnight.
    pub const MONTHLY: &str = "0 0 0 1 * *";
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_first_slot_is_after_creation() {
        let def = RecurringDefinition::new(
            "minutely",
            cron_expressions::MINUTELY,
            JobPayload::kind("noop"),
            "default",
            0,
            t0(),
        )
        .unwrap();
        assert_eq!(def.next_fire_at, Some(t0() + ChronoDuration::minutes(1)));
        assert!(!def.is_due(t0()));
        assert!(def.is_due(t0() + ChronoDuration::minutes(1)));
    }

    #[test]
    fn test_offset_shifts_daily_slot() {
        // Midnight at UTC+02:00 is 22:00 UTC the previous day.
        let def = RecurringDefinition::new(
            "nightly",
            cron_expressions::DAILY,
            JobPayload::kind("noop"),
            "default",
            2 * 3600,
            t0(),
        )
        .unwrap();
        assert_eq!(
            def.next_fire_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let result = RecurringDefinition::new(
            "broken",
            "not a cron",
            JobPayload::kind("noop"),
            "default",
            0,
            t0(),
        );
        assert!(matches!(result, Err(JobError::InvalidCron { .. })));
    }

    #[test]
    fn test_invalid_offset_rejected() {
        let result = RecurringDefinition::new(
            "far-east",
            cron_expressions::HOURLY,
            JobPayload::kind("noop"),
            "default",
            48 * 3600,
            t0(),
        );
        assert!(matches!(result, Err(JobError::Configuration(_))));
    }
}
