//! The single job processing loop.
//!
//! One job runs at a time. Each attempt is spawned onto its own task and
//! raced against the job's timeout; on timeout the loop stops waiting but the
//! task keeps running, so a cascade transaction still commits or rolls back
//! on its own.

use std::sync::Arc;
use std::time::Duration;

use common::config::QueueConfig;
use messaging::{Event, Severity};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{JobError, Result};
use crate::handlers::HandlerRegistry;
use crate::job::Job;
use crate::queue::JobQueue;

/// Delay before retrying after the given attempt:
/// `min(base * 2^(attempt - 1), max)`.
pub fn backoff_delay(config: &QueueConfig, attempt: u32) -> Duration {
    let factor = 2u32
        .checked_pow(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    config
        .base_retry_delay
        .saturating_mul(factor)
        .min(config.max_retry_delay)
}

#[derive(Debug)]
pub struct Processor {
    queue: JobQueue,
    handlers: Arc<HandlerRegistry>,
    config: QueueConfig,
}

impl Processor {
    pub fn new(queue: JobQueue, handlers: Arc<HandlerRegistry>, config: &QueueConfig) -> Self {
        Self {
            queue,
            handlers,
            config: config.clone(),
        }
    }

    /// Run the loop on a background task until `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            throttle = ?self.config.throttle,
            idle_poll = ?self.config.idle_poll,
            "Job processor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            if let Some(resume_at) = self.queue.paused_until(now) {
                tracing::debug!(
                    paused_for = ?resume_at.duration_since(now),
                    "Circuit breaker open, not dequeuing"
                );
                tokio::select! {
                    _ = tokio::time::sleep_until(resume_at) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
                continue;
            }

            let Some(job) = self.queue.next_ready(now) else {
                tokio::select! {
                    _ = self.queue.wait_for_work(self.config.idle_poll) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
                continue;
            };

            self.process(job).await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.throttle) => {}
                changed = shutdown.changed() => if changed.is_err() { break },
            }
        }

        tracing::info!("Job processor stopped");
    }

    async fn process(&self, job: Job) {
        let events = self.queue.events();
        let metrics = self.queue.metrics();

        metrics.record_started();
        events.publish(Event::JobStarted {
            job_id: job.id,
            job_type: job.job_type,
            attempt: job.attempts,
        });
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            max_retries = job.max_retries,
            "Job started"
        );

        let started = Instant::now();
        let outcome = self.attempt(&job).await;
        let elapsed = started.elapsed();
        let now = Instant::now();

        let error = match outcome {
            Ok(value) => {
                metrics.record_completed(elapsed);
                events.publish(Event::JobCompleted {
                    job_id: job.id,
                    job_type: job.job_type,
                    attempts: job.attempts,
                    duration_ms: elapsed.as_millis() as u64,
                });
                tracing::info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                self.queue.complete(job, value);
                return;
            }
            Err(error) => error,
        };

        if matches!(error, JobError::JobTimeout(_)) {
            metrics.record_timeout();
        }

        if error.is_retryable() && job.attempts <= job.max_retries {
            let delay = backoff_delay(&self.config, job.attempts);
            metrics.record_retry();
            events.publish(Event::JobRetry {
                job_id: job.id,
                job_type: job.job_type,
                attempt: job.attempts,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                delay = ?delay,
                "Job attempt failed, retrying: {error}"
            );
            self.queue.retry(job, &error, delay, now);
            return;
        }

        metrics.record_failed();
        events.publish(Event::JobFailed {
            job_id: job.id,
            job_type: job.job_type,
            attempts: job.attempts,
            error: error.to_string(),
        });
        tracing::error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "Job failed permanently: {error}"
        );
        if job.job_type.is_deletion() {
            events.publish(Event::SystemAlert {
                severity: Severity::High,
                alert: "deletionJobFailed".to_string(),
                message: format!(
                    "{} job {} failed after {} attempts: {error}",
                    job.job_type, job.id, job.attempts
                ),
            });
        }
        self.queue.fail(job, &error, now);
    }

    async fn attempt(&self, job: &Job) -> Result<Value> {
        let handler = self.handlers.get(job.job_type)?;
        let task_job = job.clone();
        let task = tokio::spawn(async move { handler.handle(&task_job).await });

        match tokio::time::timeout(job.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(JobError::Handler(format!(
                "job task did not finish: {join_error}"
            ))),
            Err(_) => Err(JobError::JobTimeout(job.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::JobHandler;
    use crate::job::{JobId, JobPayload, JobSpec, JobStatus};
    use async_trait::async_trait;
    use cascade::{CascadeOptions, EntityKind};
    use common::config::{CircuitBreakerConfig, EventsConfig};
    use common::job::{JobType, Priority};
    use messaging::EventBus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(JobId, Priority, Instant)>>,
        fail: bool,
        stall: Option<Duration>,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(JobId, Priority, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((job.id, job.priority, Instant::now()));
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.fail {
                Err(JobError::Handler("storage unavailable".to_string()))
            } else {
                Ok(Value::Null)
            }
        }
    }

    struct Harness {
        queue: JobQueue,
        bus: EventBus,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    fn start(job_type: JobType, handler: Arc<Recorder>) -> Harness {
        let bus = EventBus::new(&EventsConfig::default());
        let config = QueueConfig::default();
        let queue = JobQueue::new(
            &config,
            &CircuitBreakerConfig::default(),
            Arc::new(bus.clone()),
        );
        let handlers = HandlerRegistry::new().with(job_type, handler);
        let (shutdown, rx) = watch::channel(false);
        let task = Processor::new(queue.clone(), Arc::new(handlers), &config).spawn(rx);
        Harness {
            queue,
            bus,
            shutdown,
            task,
        }
    }

    fn validation(priority: Priority, max_retries: u32) -> JobSpec {
        JobSpec::new(JobPayload::IntegrityValidation)
            .with_priority(priority)
            .with_max_retries(max_retries)
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let config = QueueConfig::default();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| backoff_delay(&config, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(backoff_delay(&config, 100), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_in_priority_order() {
        let recorder = Arc::new(Recorder::default());
        let bus = EventBus::new(&EventsConfig::default());
        let config = QueueConfig::default();
        let queue = JobQueue::new(
            &config,
            &CircuitBreakerConfig::default(),
            Arc::new(bus.clone()),
        );
        for priority in [Priority::Low, Priority::High, Priority::Medium, Priority::High] {
            queue.enqueue(validation(priority, 0)).unwrap();
        }

        let handlers = HandlerRegistry::new().with(JobType::IntegrityValidation, recorder.clone());
        let (_shutdown, rx) = watch::channel(false);
        let _task = Processor::new(queue.clone(), Arc::new(handlers), &config).spawn(rx);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let order: Vec<Priority> = recorder.calls().iter().map(|c| c.1).collect();
        assert_eq!(
            order,
            vec![Priority::High, Priority::High, Priority::Medium, Priority::Low]
        );
        assert_eq!(queue.metrics().completed(), 4);
        assert_eq!(queue.status().backlog(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_is_retried_with_backoff_then_failed() {
        let recorder = Arc::new(Recorder::failing());
        let h = start(JobType::IntegrityValidation, recorder.clone());
        let id = h.queue.enqueue(validation(Priority::Low, 3)).unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;

        let calls = recorder.calls();
        assert_eq!(calls.len(), 4, "initial attempt plus three retries");
        let gaps: Vec<u64> = calls
            .windows(2)
            .map(|w| w[1].2.duration_since(w[0].2).as_millis() as u64)
            .collect();
        for (gap, expected) in gaps.iter().zip([1000u64, 2000, 4000]) {
            assert!(
                gap.abs_diff(expected) <= 10,
                "gap {gap}ms, expected {expected}ms"
            );
        }

        let job = h.queue.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 4);
        assert_eq!(h.queue.metrics().retried(), 3);
        assert_eq!(h.queue.metrics().failed(), 1);

        let names: Vec<&str> = h.bus.recent(None).iter().map(|e| e.event.name()).collect();
        assert_eq!(names.iter().filter(|n| **n == "jobRetry").count(), 3);
        assert_eq!(names.last(), Some(&"jobFailed"));
        // Maintenance jobs do not raise alerts
        assert!(h.bus.critical().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_pauses_dequeuing() {
        let recorder = Arc::new(Recorder::failing());
        let h = start(JobType::IntegrityValidation, recorder.clone());
        for _ in 0..7 {
            h.queue.enqueue(validation(Priority::Medium, 0)).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(recorder.calls().len(), 5);
        let status = h.queue.status();
        assert!(status.circuit_open);
        assert_eq!(status.queued, 2);

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(recorder.calls().len(), 5, "still paused at 29s");

        tokio::time::sleep(Duration::from_secs(6)).await;
        let calls = recorder.calls();
        assert_eq!(calls.len(), 7);
        assert!(calls[5].2.duration_since(calls[4].2) >= Duration::from_secs(30));
        assert!(!h.queue.status().circuit_open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_deletion_job_raises_alert() {
        let recorder = Arc::new(Recorder {
            stall: Some(Duration::from_secs(600)),
            ..Recorder::default()
        });
        let h = start(JobType::CascadeDeletion, recorder.clone());
        let spec = JobSpec::new(JobPayload::CascadeDeletion {
            entity_kind: EntityKind::Student,
            entity_id: "64b7f0c2a1d3e4f5a6b7c8d9".to_string(),
            actor_id: "admin".to_string(),
            reason: None,
            options: CascadeOptions::default(),
        })
        .with_max_retries(0)
        .with_timeout(Duration::from_secs(1));
        let id = h.queue.enqueue(spec).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        let job = h.queue.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("timeout"));
        assert_eq!(h.queue.metrics().timed_out(), 1);

        let critical = h.bus.critical();
        assert_eq!(critical.len(), 1);
        assert!(matches!(
            &critical[0].event,
            Event::SystemAlert { severity: Severity::High, alert, .. } if alert == "deletionJobFailed"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_enqueued_while_idle_are_picked_up() {
        let recorder = Arc::new(Recorder::default());
        let h = start(JobType::IntegrityValidation, recorder.clone());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.calls().is_empty());

        let id = h.queue.enqueue(validation(Priority::Low, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.queue.job(id).map(|j| j.status), Some(JobStatus::Completed));

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }
}
