// Schedule parsing and fire time calculation
//
// Fire times for all schedule types: Cron, Interval and OneTime. The
// per-trigger bounds (end time, repeat count) are applied on `Trigger`.

use crate::errors::ScheduleError;
use crate::models::{Schedule, Trigger};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// ScheduleTrigger defines how a schedule rule produces fire times
pub trait ScheduleTrigger {
    /// First fire time at or after `start`
    fn first_fire_time(&self, start: DateTime<Utc>)
        -> Result<Option<DateTime<Utc>>, ScheduleError>;

    /// First fire time strictly after `after`, for a schedule anchored at `anchor`
    fn fire_time_after(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError>;
}

impl ScheduleTrigger for Schedule {
    fn first_fire_time(
        &self,
        start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Schedule::Cron {
                expression,
                timezone,
            } => cron_fire_time_after(expression, *timezone, start - Duration::seconds(1)),

            Schedule::Interval {
                interval_seconds, ..
            } => {
                check_interval(*interval_seconds)?;
                Ok(Some(start))
            }

            Schedule::OneTime { execute_at } => Ok(Some(*execute_at)),
        }
    }

    fn fire_time_after(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Schedule::Cron {
                expression,
                timezone,
            } => cron_fire_time_after(expression, *timezone, after),

            Schedule::Interval {
                interval_seconds, ..
            } => interval_fire_time_after(*interval_seconds, anchor, after),

            Schedule::OneTime { execute_at } => {
                if *execute_at > after {
                    Ok(Some(*execute_at))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Reject schedules that can never produce a sane fire time
pub fn validate_schedule(schedule: &Schedule) -> Result<(), ScheduleError> {
    match schedule {
        Schedule::Cron { expression, .. } => parse_cron_expression(expression).map(|_| ()),
        Schedule::Interval {
            interval_seconds, ..
        } => check_interval(*interval_seconds),
        Schedule::OneTime { .. } => Ok(()),
    }
}

fn check_interval(interval_seconds: u64) -> Result<(), ScheduleError> {
    if interval_seconds == 0 {
        return Err(ScheduleError::InvalidConfiguration(
            "interval_seconds must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn cron_fire_time_after(
    expression: &str,
    timezone: Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_expression(expression)?;

    // Evaluate in the trigger's timezone, report in UTC
    let after_in_tz = after.with_timezone(&timezone);
    Ok(schedule
        .after(&after_in_tz)
        .next()
        .map(|next| next.with_timezone(&Utc)))
}

fn interval_fire_time_after(
    interval_seconds: u64,
    anchor: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    check_interval(interval_seconds)?;

    if after < anchor {
        return Ok(Some(anchor));
    }

    let interval_ms = i64::try_from(interval_seconds)
        .ok()
        .and_then(|s| s.checked_mul(1000))
        .ok_or_else(|| {
            ScheduleError::InvalidConfiguration(format!(
                "interval of {} seconds is out of range",
                interval_seconds
            ))
        })?;
    let elapsed = (after - anchor).num_milliseconds();
    let periods = elapsed / interval_ms + 1;

    Ok(periods
        .checked_mul(interval_ms)
        .map(|offset| anchor + Duration::milliseconds(offset)))
}

impl Trigger {
    /// First fire time for this trigger, honoring its start and end time
    pub fn first_fire_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let start = self.start_time.unwrap_or(now);
        let first = self.schedule.first_fire_time(start)?;
        Ok(self.within_end_time(first))
    }

    /// Next fire time strictly after `after`, or `None` once the schedule is exhausted
    pub fn fire_time_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        if let Schedule::Interval {
            repeat_count: Some(repeats),
            ..
        } = self.schedule
        {
            if self.times_triggered > repeats {
                return Ok(None);
            }
        }

        // Interval schedules keep their phase across restarts through the last known fire time
        let anchor = self
            .start_time
            .or(self.previous_fire_time)
            .or(self.next_fire_time)
            .unwrap_or(after);
        let next = self.schedule.fire_time_after(anchor, after)?;
        Ok(self.within_end_time(next))
    }

    fn within_end_time(&self, fire_time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match (fire_time, self.end_time) {
            (Some(t), Some(end)) if t > end => None,
            (t, _) => t,
        }
    }
}
