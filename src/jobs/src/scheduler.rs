//! Recurring maintenance jobs.
//!
//! Every definition gets its own timer task. On each tick the task checks
//! the definition's cron pattern against the current UTC minute and enqueues
//! a job on a match. A minute that already fired is never fired again, so a
//! tick interval shorter than a minute does not produce duplicates.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use common::config::{RecurringJobConfig, SchedulerConfig};
use tokio::task::JoinHandle;

use crate::job::{JobPayload, JobSpec};
use crate::queue::JobQueue;

/// Source of wall-clock time for cron matching.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Scheduler {
    queue: JobQueue,
    definitions: Vec<RecurringJobConfig>,
    tick_interval: Duration,
    clock: Clock,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("definitions", &self.definitions.len())
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(queue: JobQueue, config: &SchedulerConfig) -> Self {
        Self {
            queue,
            definitions: config.recurring.clone(),
            tick_interval: config.tick_interval,
            clock: Arc::new(Utc::now),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Start one timer per definition. Calling `start` again restarts them.
    pub fn start(&self) {
        self.stop();
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for definition in &self.definitions {
            let Some(payload) = JobPayload::maintenance(definition.job_type) else {
                tracing::warn!(
                    name = %definition.name,
                    job_type = %definition.job_type,
                    "Skipping recurring job that cannot be scheduled"
                );
                continue;
            };
            let spec = JobSpec::new(payload)
                .with_priority(definition.priority())
                .with_max_retries(definition.max_retries())
                .with_timeout(definition.timeout());

            tracing::info!(
                name = %definition.name,
                cron = %definition.cron.as_str(),
                job_type = %definition.job_type,
                "Scheduled recurring job"
            );
            timers.push(tokio::spawn(run_timer(
                definition.clone(),
                spec,
                self.queue.clone(),
                self.clock.clone(),
                self.tick_interval,
            )));
        }
    }

    /// Abort every timer.
    pub fn stop(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for timer in timers.drain(..) {
            timer.abort();
        }
    }

    pub fn running_timers(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|timer| !timer.is_finished())
            .count()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_timer(
    definition: RecurringJobConfig,
    spec: JobSpec,
    queue: JobQueue,
    clock: Clock,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        ticker.tick().await;
        let now = clock();
        let minute = now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now);
        if last_fired == Some(minute) || !definition.cron.matches(&now) {
            continue;
        }
        last_fired = Some(minute);

        match queue.enqueue(spec.clone()) {
            Ok(job_id) => tracing::info!(
                name = %definition.name,
                job_id = %job_id,
                "Recurring job fired"
            ),
            Err(e) => tracing::warn!(
                name = %definition.name,
                "Failed to enqueue recurring job: {e}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::config::{CircuitBreakerConfig, QueueConfig};
    use common::job::{JobType, Priority};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn queue() -> JobQueue {
        JobQueue::new(
            &QueueConfig::default(),
            &CircuitBreakerConfig::default(),
            Arc::new(messaging::NullSink),
        )
    }

    fn manual_clock(start: DateTime<Utc>) -> (Arc<AtomicI64>, Clock) {
        let seconds = Arc::new(AtomicI64::new(start.timestamp()));
        let source = seconds.clone();
        let clock: Clock = Arc::new(move || {
            DateTime::from_timestamp(source.load(Ordering::SeqCst), 0).unwrap_or_default()
        });
        (seconds, clock)
    }

    fn config(cron: &str, job_type: JobType) -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            tick_interval: Duration::from_secs(10),
            recurring: vec![RecurringJobConfig::new("nightly", cron, job_type).unwrap()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_matching_minute() {
        let at_two = Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap();
        let (seconds, clock) = manual_clock(at_two);
        let queue = queue();
        let scheduler = Scheduler::new(queue.clone(), &config("0 2 * * *", JobType::OrphanedReferenceCleanup))
            .with_clock(clock);
        scheduler.start();

        // Six ticks inside 02:00 enqueue a single job
        tokio::time::sleep(Duration::from_secs(55)).await;
        let jobs = queue.active_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::OrphanedReferenceCleanup);
        assert_eq!(jobs[0].priority, Priority::Low);
        assert_eq!(jobs[0].max_retries, 1);

        // 02:01 does not match
        seconds.fetch_add(60, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.active_jobs().len(), 1);

        // The next day matches again
        seconds.store((at_two + TimeDelta::days(1)).timestamp(), Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(queue.active_jobs().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_timers() {
        let at_two = Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap();
        let (_seconds, clock) = manual_clock(at_two);
        let queue = queue();
        let scheduler =
            Scheduler::new(queue.clone(), &config("* * * * *", JobType::IntegrityValidation))
                .with_clock(clock);
        scheduler.start();
        assert_eq!(scheduler.running_timers(), 1);

        scheduler.stop();
        assert_eq!(scheduler.running_timers(), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(queue.active_jobs().is_empty());
    }
}
