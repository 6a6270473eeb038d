//! Cooperative job scheduler. One task per job; cancellation is
//! cooperative (a job finishes its current fire before a `Stop` takes
//! effect), matching the graceful-shutdown requirement both managers
//! place on their scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use rand::Rng;
use rodent_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// A parsed `"HH"`, `"HH:MM"`, or `"HH:MM:SS"` time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        let parse_part = |s: &str| -> Result<u32> {
            s.parse::<u32>().map_err(|_| Error::request_validation(format!("invalid time component: {s}")))
        };
        let (hour, minute, second) = match parts.as_slice() {
            [h] => (parse_part(h)?, 0, 0),
            [h, m] => (parse_part(h)?, parse_part(m)?, 0),
            [h, m, s] => (parse_part(h)?, parse_part(m)?, parse_part(s)?),
            _ => return Err(Error::request_validation(format!("invalid at_time: {raw}"))),
        };
        if hour > 23 || minute > 59 || second > 59 {
            return Err(Error::request_validation(format!("at_time out of range: {raw}")));
        }
        Ok(Self { hour, minute, second })
    }

    fn naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second).expect("validated range")
    }
}

/// A single cron field matcher: the set of accepted values for that position.
#[derive(Debug, Clone)]
struct CronField(Vec<u32>);

impl CronField {
    fn parse(raw: &str, min: u32, max: u32) -> Result<Self> {
        if raw == "*" {
            return Ok(Self((min..=max).collect()));
        }
        let mut values = Vec::new();
        for part in raw.split(',') {
            if let Some((range, step)) = part.split_once('/') {
                let step: u32 = step
                    .parse()
                    .map_err(|_| Error::request_validation(format!("invalid cron step: {part}")))?;
                let (lo, hi) = if range == "*" {
                    (min, max)
                } else if let Some((a, b)) = range.split_once('-') {
                    (a.parse().unwrap_or(min), b.parse().unwrap_or(max))
                } else {
                    (min, max)
                };
                let mut v = lo;
                while v <= hi {
                    values.push(v);
                    v += step;
                }
            } else if let Some((a, b)) = part.split_once('-') {
                let lo: u32 = a
                    .parse()
                    .map_err(|_| Error::request_validation(format!("invalid cron range: {part}")))?;
                let hi: u32 = b
                    .parse()
                    .map_err(|_| Error::request_validation(format!("invalid cron range: {part}")))?;
                values.extend(lo..=hi);
            } else {
                let v: u32 = part
                    .parse()
                    .map_err(|_| Error::request_validation(format!("invalid cron field: {part}")))?;
                values.push(v);
            }
        }
        if values.iter().any(|v| *v < min || *v > max) {
            return Err(Error::request_validation(format!("cron field out of range: {raw}")));
        }
        values.sort_unstable();
        values.dedup();
        Ok(Self(values))
    }

    fn contains(&self, v: u32) -> bool {
        self.0.contains(&v)
    }
}

/// A 6-field cron expression: `second minute hour day-of-month month day-of-week`.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    second: CronField,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(Error::request_validation(format!(
                "cron_expr must have 6 fields (with seconds), got {}: {raw}",
                fields.len()
            )));
        }
        Ok(Self {
            source: fields.join(" "),
            second: CronField::parse(fields[0], 0, 59)?,
            minute: CronField::parse(fields[1], 0, 59)?,
            hour: CronField::parse(fields[2], 0, 23)?,
            day_of_month: CronField::parse(fields[3], 1, 31)?,
            month: CronField::parse(fields[4], 1, 12)?,
            day_of_week: CronField::parse(fields[5], 0, 6)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn matches(&self, dt: DateTime<Utc>) -> bool {
        self.second.contains(dt.second())
            && self.minute.contains(dt.minute())
            && self.hour.contains(dt.hour())
            && self.day_of_month.contains(dt.day())
            && self.month.contains(dt.month())
            && self.day_of_week.contains(dt.weekday().num_days_from_sunday())
    }

    /// First matching instant strictly after `after`, searching at most
    /// five years ahead.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after + ChronoDuration::days(366 * 5);
        let mut candidate = after + ChronoDuration::seconds(1);
        while candidate <= limit {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += ChronoDuration::seconds(1);
        }
        None
    }
}

fn next_time_of_day_after(after: DateTime<Utc>, at: TimeOfDay) -> DateTime<Utc> {
    let candidate = after.date_naive().and_time(at.naive()).and_utc();
    if candidate > after {
        candidate
    } else {
        (after.date_naive() + ChronoDuration::days(1)).and_time(at.naive()).and_utc()
    }
}

fn next_weekly_after(after: DateTime<Utc>, week_day: u8, at: TimeOfDay) -> DateTime<Utc> {
    let mut candidate = next_time_of_day_after(after, at);
    while candidate.weekday().num_days_from_sunday() != week_day as u32 {
        candidate += ChronoDuration::days(1);
    }
    candidate
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first_of_next = if month == 12 {
        chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month");
    let first_of_this = chrono::NaiveDate::from_ymd_opt(year, month, 1).expect("valid month");
    (first_of_next - first_of_this).num_days() as u32
}

/// Computes the next occurrence of `day_of_month` (clamped to the last
/// day of short months, per the monthly clamp decision) strictly after
/// `after`.
fn next_monthly_after(after: DateTime<Utc>, day_of_month: u8, at: TimeOfDay) -> DateTime<Utc> {
    let mut year = after.year();
    let mut month = after.month();
    loop {
        let clamped_day = day_of_month.min(days_in_month(year, month) as u8);
        let date = chrono::NaiveDate::from_ymd_opt(year, month, clamped_day as u32).expect("clamped");
        let candidate = date.and_time(at.naive()).and_utc();
        if candidate > after {
            return candidate;
        }
        if month == 12 {
            month = 1;
            year += 1;
        } else {
            month += 1;
        }
    }
}

fn add_months(dt: DateTime<Utc>, months: u32, day_of_month: u8, at: TimeOfDay) -> DateTime<Utc> {
    let total = dt.year() as i64 * 12 + (dt.month() as i64 - 1) + months as i64;
    let year = (total / 12) as i32;
    let month = (total % 12) as u32 + 1;
    let clamped_day = day_of_month.min(days_in_month(year, month) as u8);
    chrono::NaiveDate::from_ymd_opt(year, month, clamped_day as u32)
        .expect("clamped")
        .and_time(at.naive())
        .and_utc()
}

/// Computes the next occurrence of `day_of_month` in `month` (clamped to
/// the last day of that month, per the same clamp decision as
/// `next_monthly_after`) strictly after `after`. Unlike a cron expression
/// with an impossible day/month combination (e.g. `day_of_month=31` in
/// April), this always has a next fire.
fn next_yearly_after(after: DateTime<Utc>, month: u8, day_of_month: u8, at: TimeOfDay) -> DateTime<Utc> {
    let mut year = after.year();
    loop {
        let clamped_day = day_of_month.min(days_in_month(year, month as u32) as u8);
        let date = chrono::NaiveDate::from_ymd_opt(year, month as u32, clamped_day as u32).expect("clamped");
        let candidate = date.and_time(at.naive()).and_utc();
        if candidate > after {
            return candidate;
        }
        year += 1;
    }
}

/// One of the scheduler's recurrence kinds, as translated from a
/// `ScheduleSpec` (see `schedule.rs`).
#[derive(Debug, Clone)]
pub enum JobKind {
    Duration { period: Duration },
    Daily { interval: u32, at: TimeOfDay },
    Weekly { interval: u32, week_day: u8, at: TimeOfDay },
    Monthly { interval: u32, day_of_month: u8, at: TimeOfDay },
    Yearly { interval: u32, month: u8, day_of_month: u8, at: TimeOfDay },
    Cron { expr: CronExpr },
    OneTime { at: DateTime<Utc> },
    Random { min: Duration, max: Duration },
}

impl JobKind {
    /// Computes the next fire strictly after `after`. For recurring
    /// kinds with `interval > 1`, anchors the cadence to `after` itself
    /// — callers pass the previous scheduled fire (not necessarily the
    /// completion time) so the spacing accumulates correctly across
    /// fires.
    fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobKind::Duration { period } => {
                Some(after + ChronoDuration::from_std(*period).ok()?)
            }
            JobKind::Daily { interval, at } => {
                let base = next_time_of_day_after(after, *at);
                Some(base + ChronoDuration::days((*interval as i64).saturating_sub(1)))
            }
            JobKind::Weekly { interval, week_day, at } => {
                let base = next_weekly_after(after, *week_day, *at);
                Some(base + ChronoDuration::weeks((*interval as i64).saturating_sub(1)))
            }
            JobKind::Monthly { interval, day_of_month, at } => {
                let base = next_monthly_after(after, *day_of_month, *at);
                if *interval <= 1 {
                    Some(base)
                } else {
                    Some(add_months(base, *interval - 1, *day_of_month, *at))
                }
            }
            JobKind::Yearly { interval, month, day_of_month, at } => {
                let base = next_yearly_after(after, *month, *day_of_month, *at);
                if *interval <= 1 {
                    Some(base)
                } else {
                    // 12 * interval months forward lands on the same
                    // month, so `add_months` clamps per target year
                    // exactly the way `next_yearly_after` does for the
                    // first occurrence.
                    Some(add_months(base, 12 * (*interval - 1), *day_of_month, *at))
                }
            }
            JobKind::Cron { expr } => expr.next_run_after(after),
            JobKind::OneTime { at } => {
                if *at > after {
                    Some(*at)
                } else {
                    None
                }
            }
            JobKind::Random { min, max } => {
                let (min_s, max_s) = (min.as_secs(), max.as_secs().max(min.as_secs()));
                let delay = if max_s > min_s {
                    rand::thread_rng().gen_range(min_s..=max_s)
                } else {
                    min_s
                };
                Some(after + ChronoDuration::seconds(delay as i64))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleInflight {
    Wait,
    Reschedule,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub kind: JobKind,
    pub single_inflight: SingleInflight,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limited_runs: u32,
}

/// Callback invoked on every fire. `before_run`/`after_run` update a
/// monitor; `run` performs the actual work (`createSnapshot`,
/// `executeTransferForPolicy`, ...).
#[async_trait]
pub trait JobCallback: Send + Sync {
    async fn before_run(&self, job_id: &str);
    async fn run(&self, job_id: &str) -> Result<()>;
    async fn after_run(&self, job_id: &str, result: &Result<()>);
}

struct JobHandle {
    cancel: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Runs jobs on independent tasks with cooperative cancellation. Each
/// manager owns exactly one `Scheduler`.
pub struct Scheduler {
    jobs: RwLock<HashMap<String, JobHandle>>,
    running: AtomicBool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { jobs: RwLock::new(HashMap::new()), running: AtomicBool::new(false) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Marks the scheduler running. Idempotent.
    pub async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Cancels every job, letting an in-flight fire finish, then joins
    /// all job tasks.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut jobs = self.jobs.write().await;
        for (id, handle) in jobs.drain() {
            let _ = handle.cancel.send(true);
            if let Err(err) = handle.task.await {
                warn!(job_id = %id, error = %err, "scheduler job task panicked during stop");
            }
        }
    }

    pub async fn remove_job(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(handle) = jobs.remove(id) {
            let _ = handle.cancel.send(true);
            let _ = handle.task.await;
        }
        Ok(())
    }

    pub async fn add_job(&self, spec: JobSpec, callback: Arc<dyn JobCallback>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&spec.id) {
            return Err(Error::scheduler(format!("job {} already scheduled", spec.id)));
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let job_id = spec.id.clone();
        let task = tokio::spawn(run_job_loop(spec, callback, cancel_rx));
        jobs.insert(job_id, JobHandle { cancel: cancel_tx, task });
        Ok(())
    }
}

async fn sleep_until_or_cancelled(target: DateTime<Utc>, cancel: &mut watch::Receiver<bool>) -> bool {
    let now = Utc::now();
    let delay = (target - now).to_std().unwrap_or(Duration::from_secs(0));
    tokio::select! {
        _ = tokio::time::sleep(delay) => *cancel.borrow(),
        _ = cancel.changed() => true,
    }
}

async fn run_job_loop(spec: JobSpec, callback: Arc<dyn JobCallback>, mut cancel: watch::Receiver<bool>) {
    let JobSpec { id, kind, single_inflight, start_time, end_time, limited_runs } = spec;

    if let Some(start) = start_time {
        if Utc::now() < start && sleep_until_or_cancelled(start, &mut cancel).await {
            return;
        }
    }

    let mut scheduled_at = start_time.unwrap_or_else(Utc::now);
    let mut run_count: u32 = 0;

    loop {
        if *cancel.borrow() {
            return;
        }
        let next = match kind.next_fire(scheduled_at) {
            Some(next) => next,
            None => {
                debug!(job_id = %id, "job has no further fires");
                return;
            }
        };
        if let Some(end) = end_time {
            if next > end {
                debug!(job_id = %id, "job reached its end_time");
                return;
            }
        }

        if sleep_until_or_cancelled(next, &mut cancel).await {
            return;
        }

        match single_inflight {
            SingleInflight::Wait => {
                scheduled_at = next;
            }
            SingleInflight::Reschedule => {
                let mut anchor = next;
                while let Some(candidate) = kind.next_fire(anchor) {
                    if candidate > Utc::now() {
                        break;
                    }
                    anchor = candidate;
                }
                scheduled_at = anchor.max(next);
            }
        }

        callback.before_run(&id).await;
        let result = callback.run(&id).await;
        if let Err(err) = &result {
            warn!(job_id = %id, error = %err.message, "scheduled job failed");
        }
        callback.after_run(&id, &result).await;

        run_count += 1;
        if limited_runs != 0 && run_count >= limited_runs {
            info!(job_id = %id, run_count, "job reached limited_runs, stopping");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_of_day_parses_all_three_forms() {
        assert_eq!(TimeOfDay::parse("5").unwrap(), TimeOfDay { hour: 5, minute: 0, second: 0 });
        assert_eq!(TimeOfDay::parse("5:30").unwrap(), TimeOfDay { hour: 5, minute: 30, second: 0 });
        assert_eq!(TimeOfDay::parse("5:30:15").unwrap(), TimeOfDay { hour: 5, minute: 30, second: 15 });
    }

    #[test]
    fn time_of_day_rejects_out_of_range() {
        assert!(TimeOfDay::parse("24:00").is_err());
        assert!(TimeOfDay::parse("10:60").is_err());
    }

    #[test]
    fn cron_field_parses_ranges_lists_and_steps() {
        let f = CronField::parse("0,15,30,45", 0, 59).unwrap();
        assert!(f.contains(15));
        assert!(!f.contains(20));
        let f = CronField::parse("*/15", 0, 59).unwrap();
        assert!(f.contains(45));
        assert!(!f.contains(50));
        let f = CronField::parse("1-5", 0, 59).unwrap();
        assert!(f.contains(3));
        assert!(!f.contains(6));
    }

    #[test]
    fn cron_expr_requires_six_fields() {
        assert!(CronExpr::parse("0 0 * * *").is_err());
        assert!(CronExpr::parse("0 0 0 * * *").is_ok());
    }

    #[test]
    fn cron_expr_next_run_after_matches_exact_second() {
        let expr = CronExpr::parse("30 15 3 1 6 *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 3, 15, 30).unwrap() - ChronoDuration::seconds(1);
        let next = expr.next_run_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 3, 15, 30).unwrap());
    }

    #[test]
    fn daily_job_kind_spaces_by_interval() {
        let at = TimeOfDay { hour: 0, minute: 0, second: 0 };
        let kind = JobKind::Daily { interval: 3, at };
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let first = kind.next_fire(t0).unwrap();
        let second = kind.next_fire(first).unwrap();
        assert_eq!((second - first).num_days(), 3);
    }

    #[test]
    fn monthly_day_31_clamps_in_short_months() {
        let at = TimeOfDay { hour: 0, minute: 0, second: 0 };
        let kind = JobKind::Monthly { interval: 1, day_of_month: 31, at };
        let after = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 1).unwrap();
        let next = kind.next_fire(after).unwrap();
        // February has no 31st: clamp to the 28th (2025 is not a leap year).
        assert_eq!(next.month(), 2);
        assert_eq!(next.day(), 28);
    }

    #[test]
    fn yearly_day_31_clamps_in_a_30_day_month() {
        let at = TimeOfDay { hour: 0, minute: 0, second: 0 };
        let kind = JobKind::Yearly { interval: 1, month: 4, day_of_month: 31, at };
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let next = kind.next_fire(after).unwrap();
        // April has no 31st: clamp to the 30th.
        assert_eq!(next.month(), 4);
        assert_eq!(next.day(), 30);
        assert_eq!(next.year(), 2025);
    }

    #[test]
    fn yearly_feb_29_clamps_in_non_leap_years() {
        let at = TimeOfDay { hour: 0, minute: 0, second: 0 };
        let kind = JobKind::Yearly { interval: 1, month: 2, day_of_month: 29, at };
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let next = kind.next_fire(after).unwrap();
        // 2026 is not a leap year: clamp to the 28th. This also proves
        // the job has a reachable next fire instead of exhausting like
        // an impossible cron expression would.
        assert_eq!(next.year(), 2026);
        assert_eq!(next.month(), 2);
        assert_eq!(next.day(), 28);
    }

    #[test]
    fn one_time_job_fires_once_then_exhausts() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let kind = JobKind::OneTime { at };
        assert_eq!(kind.next_fire(at - ChronoDuration::seconds(1)), Some(at));
        assert_eq!(kind.next_fire(at), None);
    }
}
