/// Cron scheduler
///
/// One periodic tick walks every armed cron entry, compares the current UTC minute
/// against its schedule and fires at most once per matching minute. User expressions
/// have five fields; they are normalized to the six-plus-year form the `cron` crate
/// parses. Persistence problems are logged and never stop the loop.

use crate::error::{SchedulerError, TriggerError};
use crate::runtime::TriggerPayload;
use crate::store::Trigger;
use crate::trigger::config::{CatchUpPolicy, CronConfig};
use crate::trigger::dispatch::{Dispatcher, FireMode};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const DAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Parse a 5-field expression into a schedule
pub fn compile_expression(expression: &str) -> Result<Schedule, SchedulerError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::UnsupportedFieldCount(fields.len()));
    }
    let invalid = |message: String| SchedulerError::InvalidExpression {
        expression: expression.to_string(),
        message,
    };
    // the cron crate requires both day fields to match, Unix cron accepts either
    if is_restricted(fields[2]) && is_restricted(fields[4]) {
        return Err(invalid(
            "day-of-month and day-of-week cannot both be restricted; leave one as '*'".to_string(),
        ));
    }
    let day_of_week = normalize_day_of_week(fields[4]).map_err(invalid)?;
    let normalized = format!(
        "0 {} {} {} {} {} *",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    );
    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

fn is_restricted(field: &str) -> bool {
    !matches!(field, "*" | "?")
}

/// Rewrite Unix day numbers (0-7, Sunday = 0 or 7) as day names
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let step_suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

        if let Some((start, end)) = range.split_once('-') {
            match (start.parse::<usize>(), end.parse::<usize>()) {
                (Ok(a), Ok(b)) => {
                    let (a_name, b_name) = (day_name(a)?, day_name(b)?);
                    if a == 0 && b == 7 {
                        items.push(format!("Sun-Sat{}", step_suffix));
                    } else if b == 7 && a == 7 {
                        items.push("Sun".to_string());
                    } else if b == 7 {
                        items.push(format!("{}-Sat{}", a_name, step_suffix));
                        let step_len = step.and_then(|s| s.parse::<usize>().ok()).unwrap_or(1).max(1);
                        if (7 - a) % step_len == 0 {
                            items.push("Sun".to_string());
                        }
                    } else {
                        items.push(format!("{}-{}{}", a_name, b_name, step_suffix));
                    }
                }
                _ => items.push(item.to_string()),
            }
        } else if let Ok(n) = range.parse::<usize>() {
            items.push(format!("{}{}", day_name(n)?, step_suffix));
        } else {
            items.push(item.to_string());
        }
    }
    Ok(items.join(","))
}

fn day_name(n: usize) -> Result<&'static str, String> {
    DAY_NAMES
        .get(n)
        .copied()
        .ok_or_else(|| format!("day of week {} out of range 0-7", n))
}

/// Start of the UTC minute containing `t`
pub fn minute_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(t)
}

/// Whether `schedule` fires in the minute starting at `minute`
pub fn matches_minute(schedule: &Schedule, minute: DateTime<Utc>) -> bool {
    schedule
        .after(&(minute - chrono::Duration::seconds(1)))
        .next()
        .is_some_and(|next| next == minute)
}

struct CronEntry {
    trigger_id: String,
    workflow_id: String,
    config: CronConfig,
    schedule: Schedule,
    last_fired_minute: Option<DateTime<Utc>>,
    fire_count: i64,
    active: Arc<AtomicUsize>,
    /// Minute to replay missed fires from, consumed by the first tick
    catch_up_from: Option<DateTime<Utc>>,
}

impl CronEntry {
    fn payload(&self, minute: DateTime<Utc>, iteration: i64, catch_up: bool) -> TriggerPayload {
        TriggerPayload::Cron {
            timestamp: minute,
            iteration,
            schedule: self.config.expression.clone(),
            input: self.config.input.clone(),
            catch_up,
        }
    }
}

/// Holds one slot of an entry's concurrency ceiling until dropped
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Job {
    Fire {
        trigger_id: String,
        workflow_id: String,
        minute: DateTime<Utc>,
        payload: TriggerPayload,
        guard: ActiveGuard,
    },
    CatchUp {
        trigger_id: String,
        workflow_id: String,
        /// Replays run beside live fires and hold no slot of the ceiling
        replays: Vec<(DateTime<Utc>, TriggerPayload)>,
    },
}

/// What one tick started
#[derive(Default)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub catch_up: Vec<String>,
    /// Tasks that finish when the started runs finish
    pub tasks: Vec<JoinHandle<()>>,
}

impl TickReport {
    /// Wait for every run this tick started
    pub async fn settle(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct CronScheduler {
    entries: Mutex<HashMap<String, CronEntry>>,
    dispatcher: Arc<Dispatcher>,
    max_catch_up: usize,
}

impl CronScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, max_catch_up: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dispatcher,
            max_catch_up,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CronEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace the entry for an armed cron trigger. The dedup minute comes
    /// from the persisted `last_fired`, so a restart inside a fired minute stays quiet.
    pub fn register(&self, trigger: &Trigger, config: CronConfig) -> Result<(), TriggerError> {
        let schedule = compile_expression(&config.expression)
            .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        let last_fired_minute = trigger.last_fired.map(minute_floor);
        let catch_up_from = match config.catch_up {
            CatchUpPolicy::Skip => None,
            _ => last_fired_minute,
        };
        let entry = CronEntry {
            trigger_id: trigger.id.clone(),
            workflow_id: trigger.workflow_id.clone(),
            config,
            schedule,
            last_fired_minute,
            fire_count: trigger.fire_count,
            active: Arc::new(AtomicUsize::new(0)),
            catch_up_from,
        };
        tracing::info!("⏰ Cron trigger {} scheduled: {}", trigger.id, entry.config.expression);
        self.lock().insert(trigger.id.clone(), entry);
        Ok(())
    }

    pub fn unregister(&self, trigger_id: &str) -> bool {
        let removed = self.lock().remove(trigger_id).is_some();
        if removed {
            tracing::info!("⏹️ Cron trigger {} unscheduled", trigger_id);
        }
        removed
    }

    pub fn is_registered(&self, trigger_id: &str) -> bool {
        self.lock().contains_key(trigger_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs currently counted against a trigger's ceiling
    pub fn active_runs(&self, trigger_id: &str) -> usize {
        self.lock()
            .get(trigger_id)
            .map(|entry| entry.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Run one tick as if the clock read `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let minute = minute_floor(now);
        let jobs = self.collect_jobs(minute);
        let mut report = TickReport::default();

        for job in jobs {
            match job {
                Job::Fire { trigger_id, workflow_id, minute, payload, guard } => {
                    match self
                        .dispatcher
                        .fire(&trigger_id, &workflow_id, payload, minute, FireMode::Live)
                        .await
                    {
                        Ok(fired) => {
                            report.fired.push(trigger_id);
                            report.tasks.push(tokio::spawn(async move {
                                let _guard = guard;
                                let _ = fired.completion.await;
                            }));
                        }
                        Err(e) => tracing::error!("❌ Cron trigger {} failed to fire: {}", trigger_id, e),
                    }
                }
                Job::CatchUp { trigger_id, workflow_id, replays } => {
                    tracing::info!("⏪ Cron trigger {} replaying {} missed fire(s)", trigger_id, replays.len());
                    report.catch_up.push(trigger_id.clone());
                    let dispatcher = Arc::clone(&self.dispatcher);
                    report.tasks.push(tokio::spawn(async move {
                        for (minute, payload) in replays {
                            match dispatcher
                                .fire(&trigger_id, &workflow_id, payload, minute, FireMode::Live)
                                .await
                            {
                                Ok(fired) => {
                                    let _ = fired.completion.await;
                                }
                                Err(e) => {
                                    tracing::error!("❌ Cron catch-up for {} failed: {}", trigger_id, e);
                                    break;
                                }
                            }
                        }
                    }));
                }
            }
        }
        report
    }

    fn collect_jobs(&self, minute: DateTime<Utc>) -> Vec<Job> {
        let mut jobs = Vec::new();
        let mut entries = self.lock();

        for entry in entries.values_mut() {
            if let Some(from) = entry.catch_up_from.take() {
                let limit = match entry.config.catch_up {
                    CatchUpPolicy::Skip => 0,
                    CatchUpPolicy::RunOnce => 1,
                    CatchUpPolicy::RunAll => self.max_catch_up,
                };
                let missed: Vec<DateTime<Utc>> = entry
                    .schedule
                    .after(&from)
                    .take_while(|t| *t < minute)
                    .take(limit)
                    .collect();
                if !missed.is_empty() {
                    let mut replays = Vec::with_capacity(missed.len());
                    for at in missed {
                        replays.push((at, entry.payload(at, entry.fire_count, true)));
                        entry.fire_count += 1;
                    }
                    jobs.push(Job::CatchUp {
                        trigger_id: entry.trigger_id.clone(),
                        workflow_id: entry.workflow_id.clone(),
                        replays,
                    });
                }
            }

            if !matches_minute(&entry.schedule, minute) || entry.last_fired_minute == Some(minute) {
                continue;
            }
            entry.last_fired_minute = Some(minute);

            let active = entry.active.load(Ordering::SeqCst);
            if active >= entry.config.max_concurrent {
                tracing::warn!(
                    "⏭️ Cron trigger {} skipped {}: {} run(s) still active",
                    entry.trigger_id,
                    minute,
                    active
                );
                continue;
            }

            let payload = entry.payload(minute, entry.fire_count, false);
            entry.fire_count += 1;
            jobs.push(Job::Fire {
                trigger_id: entry.trigger_id.clone(),
                workflow_id: entry.workflow_id.clone(),
                minute,
                payload,
                guard: ActiveGuard::acquire(&entry.active),
            });
        }
        jobs
    }

    /// Start the periodic tick loop
    pub fn spawn(self: &Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("⏰ Cron loop started ({}ms tick)", period.as_millis());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.tick_at(Utc::now()).await;
                    }
                }
            }
            tracing::info!("⏰ Cron loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn five_fields_are_required() {
        assert!(compile_expression("*/5 * * * *").is_ok());
        assert!(matches!(
            compile_expression("0 */5 * * * *"),
            Err(SchedulerError::UnsupportedFieldCount(6))
        ));
        assert!(matches!(
            compile_expression("* * *"),
            Err(SchedulerError::UnsupportedFieldCount(3))
        ));
        assert!(matches!(
            compile_expression("61 * * * *"),
            Err(SchedulerError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn restricting_both_day_fields_is_rejected() {
        assert!(matches!(
            compile_expression("0 9 1 * 1"),
            Err(SchedulerError::InvalidExpression { .. })
        ));
        assert!(compile_expression("0 9 1 * *").is_ok());
        assert!(compile_expression("0 9 * * 1").is_ok());
        assert!(compile_expression("0 9 ? * 1-5").is_ok());
    }

    #[test]
    fn day_numbers_follow_unix_convention() {
        assert_eq!(normalize_day_of_week("1-5").unwrap(), "Mon-Fri");
        assert_eq!(normalize_day_of_week("0").unwrap(), "Sun");
        assert_eq!(normalize_day_of_week("7").unwrap(), "Sun");
        assert_eq!(normalize_day_of_week("5-7").unwrap(), "Fri-Sat,Sun");
        assert_eq!(normalize_day_of_week("0-7").unwrap(), "Sun-Sat");
        assert_eq!(normalize_day_of_week("*").unwrap(), "*");
        assert_eq!(normalize_day_of_week("Mon,3").unwrap(), "Mon,Wed");
        assert!(normalize_day_of_week("8").is_err());
    }

    #[test]
    fn monday_and_sunday_schedules_match_the_right_days() {
        // 2026-10-18 is a Sunday, 2026-10-19 a Monday
        let monday = compile_expression("0 9 * * 1").unwrap();
        assert!(matches_minute(&monday, at(2026, 10, 19, 9, 0, 0)));
        assert!(!matches_minute(&monday, at(2026, 10, 18, 9, 0, 0)));

        for expr in ["0 9 * * 0", "0 9 * * 7"] {
            let sunday = compile_expression(expr).unwrap();
            assert!(matches_minute(&sunday, at(2026, 10, 18, 9, 0, 0)), "{expr}");
            assert!(!matches_minute(&sunday, at(2026, 10, 19, 9, 0, 0)), "{expr}");
        }
    }

    #[test]
    fn every_minute_matches_each_minute_start() {
        let schedule = compile_expression("*/1 * * * *").unwrap();
        assert!(matches_minute(&schedule, at(2026, 10, 17, 12, 0, 0)));
        assert!(matches_minute(&schedule, at(2026, 10, 17, 12, 1, 0)));

        let quarter = compile_expression("*/15 * * * *").unwrap();
        assert!(matches_minute(&quarter, at(2026, 10, 17, 12, 15, 0)));
        assert!(!matches_minute(&quarter, at(2026, 10, 17, 12, 16, 0)));
    }

    #[test]
    fn minute_floor_drops_seconds() {
        assert_eq!(minute_floor(at(2026, 10, 17, 12, 3, 59)), at(2026, 10, 17, 12, 3, 0));
        assert_eq!(minute_floor(at(2026, 10, 17, 12, 3, 0)), at(2026, 10, 17, 12, 3, 0));
    }

    #[test]
    fn active_guard_releases_its_slot() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = ActiveGuard::acquire(&counter);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(guard);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
