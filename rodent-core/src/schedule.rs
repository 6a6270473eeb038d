//! `ScheduleSpec`, the tagged timing rule shared by snapshot and transfer
//! policies, and its translation into the scheduler's job kinds.

use crate::scheduler::{CronExpr, JobKind, SingleInflight, TimeOfDay};
use chrono::{DateTime, Utc};
use rodent_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    OneTime,
    Duration,
    Random,
    Cron,
}

/// One of up to five timing rules attached to a policy. Fields unused by
/// `kind` are simply ignored by validation and translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    #[serde(default = "default_interval")]
    pub interval: u32,
    pub at_time: Option<String>,
    pub week_day: Option<u8>,
    pub day_of_month: Option<u8>,
    pub month: Option<u8>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub duration: Option<Duration>,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub min_duration: Option<Duration>,
    #[serde(default, with = "crate::serde_util::duration_secs_opt")]
    pub max_duration: Option<Duration>,
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub limited_runs: u32,
    #[serde(default = "crate::serde_util::default_true")]
    pub enabled: bool,
}

fn default_interval() -> u32 {
    1
}

impl ScheduleSpec {
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            ScheduleKind::Weekly => {
                let wd = self
                    .week_day
                    .ok_or_else(|| Error::request_validation("weekly schedule requires week_day"))?;
                if wd > 6 {
                    return Err(Error::request_validation("week_day must be 0..=6"));
                }
            }
            ScheduleKind::Monthly | ScheduleKind::Yearly => {
                let dom = self.day_of_month.ok_or_else(|| {
                    Error::request_validation("monthly/yearly schedule requires day_of_month")
                })?;
                if !(1..=31).contains(&dom) {
                    return Err(Error::request_validation("day_of_month must be 1..=31"));
                }
                if self.kind == ScheduleKind::Yearly {
                    let month = self
                        .month
                        .ok_or_else(|| Error::request_validation("yearly schedule requires month"))?;
                    if !(1..=12).contains(&month) {
                        return Err(Error::request_validation("month must be 1..=12"));
                    }
                }
            }
            ScheduleKind::Cron => {
                let expr = self
                    .cron_expr
                    .as_deref()
                    .ok_or_else(|| Error::request_validation("cron schedule requires cron_expr"))?;
                CronExpr::parse(expr)?;
            }
            ScheduleKind::Duration => {
                if self.duration.is_none() {
                    return Err(Error::request_validation("duration schedule requires duration"));
                }
            }
            ScheduleKind::Random => {
                let (min, max) = (self.min_duration, self.max_duration);
                match (min, max) {
                    (Some(min), Some(max)) if min <= max => {}
                    _ => {
                        return Err(Error::request_validation(
                            "random schedule requires min_duration <= max_duration",
                        ))
                    }
                }
            }
            ScheduleKind::OneTime => {
                if self.start_time.is_none() {
                    return Err(Error::request_validation("one_time schedule requires start_time"));
                }
            }
            ScheduleKind::Secondly | ScheduleKind::Minutely | ScheduleKind::Hourly => {
                if self.interval == 0 {
                    return Err(Error::request_validation("interval must be >= 1"));
                }
            }
            ScheduleKind::Daily | ScheduleKind::Weekly => {
                if self.interval == 0 {
                    return Err(Error::request_validation("interval must be >= 1"));
                }
            }
        }
        Ok(())
    }

    fn at_time_parsed(&self) -> Result<TimeOfDay> {
        let raw = self
            .at_time
            .as_deref()
            .ok_or_else(|| Error::request_validation("schedule requires at_time"))?;
        TimeOfDay::parse(raw)
    }

    /// Translates this spec into a `(JobKind, SingleInflight)` pair, per
    /// the scheduling translation table. Returns `None` when the spec is
    /// disabled — disabled specs materialize no job.
    pub fn translate(&self, force_wait: bool) -> Result<Option<(JobKind, SingleInflight)>> {
        if !self.enabled {
            return Ok(None);
        }
        self.validate()?;

        let inflight = |reschedule: bool| {
            if force_wait || !reschedule {
                SingleInflight::Wait
            } else {
                SingleInflight::Reschedule
            }
        };

        let kind = match self.kind {
            ScheduleKind::Secondly => (
                JobKind::Duration { period: Duration::from_secs(self.interval as u64) },
                inflight(true),
            ),
            ScheduleKind::Minutely => (
                JobKind::Duration { period: Duration::from_secs(self.interval as u64 * 60) },
                inflight(false),
            ),
            ScheduleKind::Hourly => (
                JobKind::Duration { period: Duration::from_secs(self.interval as u64 * 3600) },
                inflight(false),
            ),
            ScheduleKind::Daily => (
                JobKind::Daily { interval: self.interval, at: self.at_time_parsed()? },
                inflight(false),
            ),
            ScheduleKind::Weekly => (
                JobKind::Weekly {
                    interval: self.interval,
                    week_day: self.week_day.unwrap(),
                    at: self.at_time_parsed()?,
                },
                inflight(false),
            ),
            ScheduleKind::Monthly => (
                JobKind::Monthly {
                    interval: self.interval,
                    day_of_month: self.day_of_month.unwrap(),
                    at: self.at_time_parsed()?,
                },
                inflight(false),
            ),
            ScheduleKind::Yearly => (
                JobKind::Yearly {
                    interval: self.interval,
                    month: self.month.unwrap(),
                    day_of_month: self.day_of_month.unwrap(),
                    at: self.at_time_parsed()?,
                },
                inflight(false),
            ),
            ScheduleKind::OneTime => {
                (JobKind::OneTime { at: self.start_time.unwrap() }, inflight(false))
            }
            ScheduleKind::Duration => {
                (JobKind::Duration { period: self.duration.unwrap() }, inflight(false))
            }
            ScheduleKind::Random => (
                JobKind::Random { min: self.min_duration.unwrap(), max: self.max_duration.unwrap() },
                inflight(false),
            ),
            ScheduleKind::Cron => (
                JobKind::Cron { expr: CronExpr::parse(self.cron_expr.as_deref().unwrap())? },
                inflight(false),
            ),
        };
        Ok(Some(kind))
    }
}
